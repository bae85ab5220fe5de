use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::debug;

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::types::{Receipt, RunId, TranscriptEntry};

/// Per-run artifact directory: receipts and step transcripts.
///
/// Layout under `runs_dir`:
/// `{run_id}/receipts/{seq}-{node}.json` and
/// `{run_id}/transcripts/{seq}-{node}.jsonl`.
/// Receipts are written once and never overwritten.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    runs_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir.join(run_id.as_str())
    }

    /// Write a transcript as JSONL, one entry per line, flushed per line.
    /// Returns the path relative to the run directory.
    pub async fn write_transcript(
        &self,
        run_id: &RunId,
        step_seq: u64,
        node_id: &str,
        entries: &[TranscriptEntry],
    ) -> Result<String> {
        let rel = format!("transcripts/{}.jsonl", file_stem(step_seq, node_id));
        let path = self.run_dir(run_id).join(&rel);
        create_parent(&path).await?;

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let mut writer = tokio::io::BufWriter::new(file);
        for entry in entries {
            let line = format!("{}\n", serde_json::to_string(entry)?);
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
        }
        writer.flush().await?;

        debug!(run_id = %run_id, path = %path.display(), lines = entries.len(), "Transcript written");
        Ok(rel)
    }

    pub fn receipt_path(&self, run_id: &RunId, step_seq: u64, node_id: &str) -> PathBuf {
        self.run_dir(run_id)
            .join("receipts")
            .join(format!("{}.json", file_stem(step_seq, node_id)))
    }

    /// The receipt already on disk for a step, if any.
    pub async fn existing_receipt(
        &self,
        run_id: &RunId,
        step_seq: u64,
        node_id: &str,
    ) -> Result<Option<(Receipt, PathBuf)>> {
        let path = self.receipt_path(run_id, step_seq, node_id);
        match tokio::fs::try_exists(&path).await? {
            true => Ok(Some((read_receipt(&path).await?, path))),
            false => Ok(None),
        }
    }

    /// Relative path of a step's transcript if one was written.
    pub async fn existing_transcript(
        &self,
        run_id: &RunId,
        step_seq: u64,
        node_id: &str,
    ) -> Result<Option<String>> {
        let rel = format!("transcripts/{}.jsonl", file_stem(step_seq, node_id));
        let found = tokio::fs::try_exists(self.run_dir(run_id).join(&rel)).await?;
        Ok(found.then_some(rel))
    }

    /// Persist a receipt. Fails if a receipt for the same step already exists.
    pub async fn write_receipt(&self, receipt: &Receipt) -> Result<PathBuf> {
        let path = self.receipt_path(&receipt.run_id, receipt.step_seq, &receipt.step_id);
        create_parent(&path).await?;

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| {
                StepflowError::Io(std::io::Error::new(
                    e.kind(),
                    format!("receipt {}: {}", path.display(), e),
                ))
            })?;
        let body = serde_json::to_vec_pretty(receipt)?;
        file.write_all(&body).await?;
        file.sync_all().await?;

        debug!(run_id = %receipt.run_id, path = %path.display(), "Receipt written");
        Ok(path)
    }

    /// Every receipt of a run, in step order.
    pub async fn list_receipts(&self, run_id: &RunId) -> Result<Vec<Receipt>> {
        let dir = self.run_dir(run_id).join("receipts");
        let mut paths = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut receipts = Vec::with_capacity(paths.len());
        for path in paths {
            receipts.push(read_receipt(&path).await?);
        }
        Ok(receipts)
    }

    pub async fn read_transcript(&self, run_id: &RunId, rel: &str) -> Result<Vec<TranscriptEntry>> {
        let content = tokio::fs::read_to_string(self.run_dir(run_id).join(rel)).await?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(StepflowError::from))
            .collect()
    }
}

pub async fn read_receipt(path: &Path) -> Result<Receipt> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn file_stem(step_seq: u64, node_id: &str) -> String {
    let safe: String = node_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{:04}-{}", step_seq, safe)
}

async fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}
