//! Merge summaries from an external tool
//!
//! The tool receives one candidate per stdin line and must print the merged text on stdout.
//! Every other intelligence call goes to the wrapped service.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::collab::intelligence::{IntelligenceService, QueryIntent, Verification};
use crate::error::{MemtierError, Result};
use crate::exec::ToolCommand;
use crate::memory::types::MemoryItem;

pub struct ExternalSummarizer {
    inner: Arc<dyn IntelligenceService>,
    tool: ToolCommand,
}

impl ExternalSummarizer {
    pub fn new(inner: Arc<dyn IntelligenceService>, tool: ToolCommand) -> Self {
        Self { inner, tool }
    }
}

#[async_trait]
impl IntelligenceService for ExternalSummarizer {
    async fn extract_entities(&self, text: &str) -> Result<Vec<String>> {
        self.inner.extract_entities(text).await
    }

    async fn verify(&self, item: &MemoryItem) -> Result<Verification> {
        self.inner.verify(item).await
    }

    async fn classify_intent(&self, query: &str) -> Result<QueryIntent> {
        self.inner.classify_intent(query).await
    }

    async fn summarize_merge(&self, candidates: &[MemoryItem]) -> Result<String> {
        let input: String = candidates
            .iter()
            .map(|c| format!("{}\n", c.content.replace('\n', " ")))
            .collect();

        let output = self.tool.run(Some(&input)).await?;
        if output.truncated {
            return Err(MemtierError::PermanentCollaborator(
                "summarizer output exceeded the byte cap".to_string(),
            ));
        }

        let merged = output.stdout.trim().to_string();
        if merged.is_empty() {
            return Err(MemtierError::PermanentCollaborator(
                "summarizer produced no output".to_string(),
            ));
        }

        debug!(candidates = candidates.len(), bytes = merged.len(), "External merge summary");
        Ok(merged)
    }

    async fn debate(&self, item: &MemoryItem) -> Result<f32> {
        self.inner.debate(item).await
    }
}
