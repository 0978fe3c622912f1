use crate::token::types::TokenRecord;
use anyhow::Context;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// 持久化协作方：token 池的加载/保存，以及多写者协调用的命名锁。
#[async_trait]
pub trait TokenStorage: Send + Sync {
    async fn load_tokens(&self) -> anyhow::Result<HashMap<String, Vec<TokenRecord>>>;

    async fn save_tokens(&self, pools: &HashMap<String, Vec<TokenRecord>>) -> anyhow::Result<()>;

    /// 获取命名互斥锁，guard 析构即释放。
    async fn acquire_lock(&self, name: &str) -> OwnedMutexGuard<()>;
}

/// 文件实现：`<data_dir>/tokens.json`，按池名分组的 JSON 映射。
#[derive(Debug)]
pub struct FileTokenStore {
    file_path: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileTokenStore {
    pub fn new(data_dir: &str) -> Self {
        Self {
            file_path: PathBuf::from(data_dir).join("tokens.json"),
            locks: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl TokenStorage for FileTokenStore {
    async fn load_tokens(&self) -> anyhow::Result<HashMap<String, Vec<TokenRecord>>> {
        let data = match tokio::fs::read(&self.file_path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HashMap::new());
            }
            Err(e) => return Err(e).context("读取 tokens.json 失败"),
        };

        sonic_rs::from_slice(&data).context("解析 tokens.json 失败")
    }

    async fn save_tokens(&self, pools: &HashMap<String, Vec<TokenRecord>>) -> anyhow::Result<()> {
        ensure_parent_dir(&self.file_path).await?;
        let data = sonic_rs::to_vec_pretty(pools).context("序列化 tokens.json 失败")?;
        tokio::fs::write(&self.file_path, data)
            .await
            .context("写入 tokens.json 失败")
    }

    async fn acquire_lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

async fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    tokio::fs::create_dir_all(dir)
        .await
        .context("创建数据目录失败")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::types::{POOL_BASIC, TokenRecord};

    #[tokio::test]
    async fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().to_str().unwrap());
        let pools = store.load_tokens().await.unwrap();
        assert!(pools.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips_pools() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().to_str().unwrap());

        let mut pools = HashMap::new();
        pools.insert(
            POOL_BASIC.to_string(),
            vec![
                TokenRecord::new("tok-a").with_quota(10),
                TokenRecord::new("tok-b"),
            ],
        );
        store.save_tokens(&pools).await.unwrap();

        let loaded = store.load_tokens().await.unwrap();
        let basic = &loaded[POOL_BASIC];
        assert_eq!(basic.len(), 2);
        assert_eq!(basic[0].token, "tok-a");
        assert_eq!(basic[0].quota, 10);
    }

    #[tokio::test]
    async fn named_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileTokenStore::new(dir.path().to_str().unwrap()));

        let guard = store.acquire_lock("tokens").await;
        let store2 = store.clone();
        let pending = tokio::spawn(async move {
            let _g = store2.acquire_lock("tokens").await;
        });
        // 未释放前，第二个获取方不应完成。
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        drop(guard);
        pending.await.unwrap();
    }
}
