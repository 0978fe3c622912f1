//! 按模型维度的请求成败计数，供 /stats 查询。

use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default, Clone, Serialize)]
pub struct ModelStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
pub struct RequestStats {
    inner: RwLock<HashMap<String, ModelStats>>,
}

impl RequestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, model: &str, success: bool) {
        let mut inner = self.inner.write().await;
        let entry = inner.entry(model.to_string()).or_default();
        entry.total += 1;
        if success {
            entry.success += 1;
        } else {
            entry.failed += 1;
        }
    }

    pub async fn snapshot(&self) -> HashMap<String, ModelStats> {
        self.inner.read().await.clone()
    }
}
