//! Joins user instructions and gathered context files into the final
//! prompt string sent to every selected model. Pure and synchronous —
//! no I/O, no provider awareness.

use crate::context::GatheredContext;

pub fn assemble(instructions: &str, context: &[GatheredContext]) -> String {
    if context.is_empty() {
        return instructions.to_string();
    }

    let mut out = String::new();
    out.push_str(instructions);
    out.push_str("\n\n---\n\n");
    out.push_str("The following files are provided as context:\n\n");
    for file in context {
        out.push_str(&format!("### {}\n\n```\n{}\n```\n\n", file.path.display(), file.content));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn no_context_returns_instructions_unchanged() {
        let result = assemble("do the thing", &[]);
        assert_eq!(result, "do the thing");
    }

    #[test]
    fn context_files_are_appended_in_given_order() {
        let context = vec![
            GatheredContext { path: PathBuf::from("a.rs"), content: "fn a() {}".into() },
            GatheredContext { path: PathBuf::from("b.rs"), content: "fn b() {}".into() },
        ];
        let result = assemble("summarize", &context);
        assert!(result.starts_with("summarize"));
        let a_pos = result.find("a.rs").unwrap();
        let b_pos = result.find("b.rs").unwrap();
        assert!(a_pos < b_pos);
        assert!(result.contains("fn a() {}"));
        assert!(result.contains("fn b() {}"));
    }
}
