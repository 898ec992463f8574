//! Concrete `ProviderClient` implementations, one per wire format.
//! `query-core` never speaks HTTP; these are the only place in the repo
//! that construct a `reqwest::Client` or know a provider's JSON shape.

mod anthropic;
mod openai;

pub use anthropic::AnthropicClient;
pub use openai::OpenAiCompatibleClient;
