//! Writes a model's generated content to disk, creating the parent
//! directory on demand (mirrors the teacher's `create_dir_all` +
//! `write` pairing, made async and error-classified).

use std::path::Path;

use async_trait::async_trait;
use query_core::error::Layer;
use query_core::{ClassifiedError, Category, OutputWriter};

pub struct FileOutputWriter;

#[async_trait]
impl OutputWriter for FileOutputWriter {
    async fn save(&self, content: &str, output_file: &str) -> Result<(), ClassifiedError> {
        let path = Path::new(output_file);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    ClassifiedError::new(
                        Category::Unknown,
                        Layer::Orchestrator,
                        "output-writer",
                        format!("creating directory {}: {e}", parent.display()),
                    )
                })?;
            }
        }

        tokio::fs::write(path, content).await.map_err(|e| {
            ClassifiedError::new(
                Category::Unknown,
                Layer::Orchestrator,
                "output-writer",
                format!("writing {output_file}: {e}"),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_parent_directories_and_writes_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("out.md");
        let writer = FileOutputWriter;
        writer.save("hello", target.to_str().unwrap()).await.unwrap();

        let written = tokio::fs::read_to_string(&target).await.unwrap();
        assert_eq!(written, "hello");
    }
}
