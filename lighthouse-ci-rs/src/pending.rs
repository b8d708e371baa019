//! Remote test id to pull request mapping, held for the server lifetime

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::github::PrInfo;
use crate::RunConfig;

/// What a pingback needs to finish a run
#[derive(Debug, Clone)]
pub struct PendingRun {
    pub pr: PrInfo,
    pub config: RunConfig,
}

#[derive(Debug, Default)]
pub struct PendingRuns {
    runs: RwLock<HashMap<String, PendingRun>>,
}

impl PendingRuns {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, test_id: impl Into<String>, run: PendingRun) {
        self.runs.write().await.insert(test_id.into(), run);
    }

    pub async fn remove(&self, test_id: &str) -> Option<PendingRun> {
        self.runs.write().await.remove(test_id)
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }
}
