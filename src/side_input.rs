//! Line-oriented side-input loading.

use crate::event::MessageBatch;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

pub const DEFAULT_SIDE_INPUT_LIMIT: usize = 1000;

#[derive(thiserror::Error, Debug)]
pub enum SideInputError {
    #[error("open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct SideInputSource {
    path: PathBuf,
    limit: usize,
}

impl SideInputSource {
    pub fn new(path: impl Into<PathBuf>, limit: usize) -> Self {
        Self {
            path: path.into(),
            limit,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Up to `limit` non-blank lines, in file order. A short file yields
    /// whatever it has.
    pub async fn load(&self) -> Result<MessageBatch, SideInputError> {
        let file = File::open(&self.path)
            .await
            .map_err(|source| SideInputError::Open {
                path: self.path.clone(),
                source,
            })?;
        let mut lines = BufReader::new(file).lines();
        let mut records = Vec::with_capacity(self.limit.min(4096));
        while records.len() < self.limit {
            let line = lines
                .next_line()
                .await
                .map_err(|source| SideInputError::Read {
                    path: self.path.clone(),
                    source,
                })?;
            let Some(line) = line else { break };
            let record = line.trim_end_matches('\r');
            if record.trim().is_empty() {
                continue;
            }
            records.push(record.to_string());
        }
        tracing::info!(
            path = %self.path.display(),
            requested = self.limit,
            loaded = records.len(),
            "side input loaded"
        );
        Ok(MessageBatch::new(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_temp(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("side-input-{}.txt", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, contents).await.unwrap();
        path
    }

    #[tokio::test]
    async fn bounded_by_availability() {
        let body: String = (0..500).map(|i| format!("{i},name-{i}\n")).collect();
        let path = write_temp(&body).await;
        let batch = SideInputSource::new(&path, 1000).load().await.unwrap();
        assert_eq!(batch.len(), 500);
        assert_eq!(batch.messages()[499], "499,name-499");
        tokio::fs::remove_file(path).await.ok();
    }

    #[tokio::test]
    async fn bounded_by_limit_and_skips_blank_lines() {
        let path = write_temp("a\r\n\n  \nb\nc\nd\n").await;
        let batch = SideInputSource::new(&path, 3).load().await.unwrap();
        assert_eq!(batch.into_messages(), vec!["a", "b", "c"]);
        tokio::fs::remove_file(path).await.ok();
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let path = std::env::temp_dir().join(format!("missing-{}.txt", uuid::Uuid::new_v4()));
        let err = SideInputSource::new(&path, 10).load().await.unwrap_err();
        assert!(matches!(err, SideInputError::Open { .. }));
    }
}
