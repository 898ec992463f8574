//! Closed error taxonomy shared by every layer of the orchestrator.
//!
//! A [`ClassifiedError`] is produced once, at the layer that first
//! observes a failure, and carries its [`Category`] unchanged up through
//! every wrapping layer. Intermediate layers may only add context frames
//! via [`ClassifiedError::wrap`] — they must never construct a new
//! category for an error they didn't originate.

use std::fmt;

/// Closed set of failure categories. See spec §4.1 for the status-code
/// mapping and the cancellation-dominance rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Auth,
    RateLimit,
    InsufficientCredits,
    InvalidRequest,
    NotFound,
    Server,
    Network,
    Cancelled,
    InputLimit,
    ContentFiltered,
    Unknown,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::InsufficientCredits => "insufficient_credits",
            Self::InvalidRequest => "invalid_request",
            Self::NotFound => "not_found",
            Self::Server => "server",
            Self::Network => "network",
            Self::Cancelled => "cancelled",
            Self::InputLimit => "input_limit",
            Self::ContentFiltered => "content_filtered",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

impl Category {
    /// Total mapping from an HTTP-like status code to a [`Category`].
    ///
    /// `0` (no status available, e.g. a transport-level failure) and
    /// `200` both fall through to `Unknown`, matching spec §4.1.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Auth,
            402 => Self::InsufficientCredits,
            404 => Self::NotFound,
            429 => Self::RateLimit,
            400 => Self::InvalidRequest,
            500 | 502 | 503 => Self::Server,
            _ => Self::Unknown,
        }
    }
}

/// Which layer of the system first observed or last wrapped an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    ApiClient,
    ModelProcessor,
    Orchestrator,
    Cli,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ApiClient => "api-client",
            Self::ModelProcessor => "model-processor",
            Self::Orchestrator => "orchestrator",
            Self::Cli => "cli",
        };
        write!(f, "{s}")
    }
}

/// A classified error value, carrying a closed-set category plus
/// structured context, propagated by value up the layer chain.
///
/// `ClassifiedError` implements [`std::error::Error`] by hand (rather
/// than via `#[derive(thiserror::Error)]`) because its `source` field is
/// a boxed trait object chosen at construction time, not a fixed variant
/// set — wrapping needs to nest arbitrarily deep without growing an enum.
pub struct ClassifiedError {
    category: Category,
    layer: Layer,
    provider: String,
    model: Option<String>,
    message: String,
    status_code: Option<u16>,
    suggestion: Option<String>,
    request_id: Option<String>,
    source: Option<Box<ClassifiedError>>,
}

impl ClassifiedError {
    pub fn new(
        category: Category,
        layer: Layer,
        provider: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            layer,
            provider: provider.into(),
            model: None,
            message: message.into(),
            status_code: None,
            suggestion: None,
            request_id: None,
            source: None,
        }
    }

    /// Build a `ClassifiedError` from an HTTP-like status code using the
    /// total status→category map.
    pub fn from_status(
        status: u16,
        layer: Layer,
        provider: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let mut err = Self::new(Category::from_status(status), layer, provider, message);
        err.status_code = Some(status);
        err
    }

    /// A cancellation observed anywhere always classifies `Cancelled`,
    /// per spec §4.1's cancellation-dominance rule — this is the only
    /// constructor allowed to produce that category directly.
    pub fn cancelled(layer: Layer, provider: impl Into<String>) -> Self {
        Self::new(Category::Cancelled, layer, provider, "operation cancelled")
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Wrap this error with a new context frame (layer + operation name).
    /// The category is carried through unchanged — wrapping adds context,
    /// it never reclassifies. Idempotent in the sense that the returned
    /// error's `.category()` equals `self.category()`.
    pub fn wrap(self, layer: Layer, operation: &str) -> Self {
        let category = self.category();
        let provider = self.provider.clone();
        let message = format!("{operation}: {}", self.message);
        Self {
            category,
            layer,
            provider,
            model: self.model.clone(),
            message,
            status_code: self.status_code,
            suggestion: self.suggestion.clone(),
            request_id: self.request_id.clone(),
            source: Some(Box::new(self)),
        }
    }

    /// Walk the cause chain and return the innermost category. A chain
    /// with no cause returns this error's own category, since every
    /// `ClassifiedError` carries one at construction — there is no
    /// "uncategorized" state to default out of here.
    pub fn category(&self) -> Category {
        match &self.source {
            Some(inner) => inner.category(),
            None => self.category,
        }
    }

    pub fn layer(&self) -> Layer {
        self.layer
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    pub fn suggestion(&self) -> Option<&str> {
        self.suggestion.as_deref()
    }
}

impl fmt::Debug for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassifiedError")
            .field("category", &self.category())
            .field("layer", &self.layer)
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("message", &self.message)
            .field("status_code", &self.status_code)
            .finish()
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ClassifiedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_map_is_total_on_spec_inputs() {
        assert_eq!(Category::from_status(401), Category::Auth);
        assert_eq!(Category::from_status(403), Category::Auth);
        assert_eq!(Category::from_status(402), Category::InsufficientCredits);
        assert_eq!(Category::from_status(404), Category::NotFound);
        assert_eq!(Category::from_status(429), Category::RateLimit);
        assert_eq!(Category::from_status(400), Category::InvalidRequest);
        assert_eq!(Category::from_status(500), Category::Server);
        assert_eq!(Category::from_status(502), Category::Server);
        assert_eq!(Category::from_status(503), Category::Server);
        assert_eq!(Category::from_status(0), Category::Unknown);
        assert_eq!(Category::from_status(200), Category::Unknown);
    }

    #[test]
    fn wrapping_preserves_category_through_four_layers() {
        let origin = ClassifiedError::from_status(
            401,
            Layer::ApiClient,
            "openai",
            "Invalid API key",
        );
        let l2 = origin.wrap(Layer::ModelProcessor, "generate");
        let l3 = l2.wrap(Layer::Orchestrator, "run_task");
        let l4 = l3.wrap(Layer::Cli, "execute");

        assert_eq!(l4.category(), Category::Auth);
        assert!(l4.message().contains("execute"));
        assert!(l4.message().contains("run_task"));
        assert!(l4.message().contains("generate"));
        assert!(l4.message().contains("Invalid API key"));
    }

    #[test]
    fn cancellation_dominates_any_wrapping() {
        let cancelled = ClassifiedError::cancelled(Layer::ApiClient, "anthropic");
        let wrapped = cancelled
            .wrap(Layer::ModelProcessor, "generate")
            .wrap(Layer::Orchestrator, "run_task");
        assert_eq!(wrapped.category(), Category::Cancelled);
    }

    #[test]
    fn classification_is_idempotent() {
        let err = ClassifiedError::from_status(429, Layer::ApiClient, "p1", "rate limited");
        let cat1 = err.category();
        let cat2 = err.category();
        assert_eq!(cat1, cat2);
        assert_eq!(cat1, Category::RateLimit);
    }

    #[test]
    fn source_chain_is_queryable_via_std_error() {
        use std::error::Error as _;
        let origin = ClassifiedError::from_status(500, Layer::ApiClient, "p1", "boom");
        let wrapped = origin.wrap(Layer::Orchestrator, "run_task");
        assert!(wrapped.source().is_some());
    }
}
