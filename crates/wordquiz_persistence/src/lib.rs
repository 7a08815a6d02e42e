mod blob;
mod migration;
mod mistakes;
mod records;
mod schema;
mod settings;
mod snapshot;

pub use blob::{BlobStore, FileBlobStore, MemoryBlobStore};
pub use migration::{MigrationReport, MigrationStatus, StepOutcome};
pub use records::ExportBundle;

use log::{debug, error, info};
use rusqlite::Connection;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Store is not initialized, call init() first")]
    NotInitialized,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Snapshot persistence failed: {0}")]
    Snapshot(String),

    #[error("Blob store error: {0}")]
    BlobStore(String),

    #[error("Migration error: {0}")]
    Migration(String),
}

/// 存储键配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    /// 数据库快照
    pub snapshot: String,
    /// 旧版设置（JSON 对象）
    pub legacy_settings: String,
    /// 旧版测试记录（JSON 数组）
    pub legacy_records: String,
    /// 旧版错题（JSON 数组）
    pub legacy_mistakes: String,
    /// 迁移完成标记
    pub migration_flag: String,
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self {
            snapshot: "wordQuizDatabase_sqlite".to_string(),
            legacy_settings: "wordQuizSettings".to_string(),
            legacy_records: "wordQuizTestRecords".to_string(),
            legacy_mistakes: "wordQuizWrongQuestions".to_string(),
            migration_flag: "migration_completed_v1".to_string(),
        }
    }
}

/// 测验数据存储：内存中的 SQLite，每次修改后把整库快照写入 [`BlobStore`]。
///
/// 创建后处于未初始化状态，除 [`QuizStore::init`] 外的操作都会返回
/// [`PersistenceError::NotInitialized`]。修改类操作是 `async` 的，
/// 只有在快照写入完成后才返回。
pub struct QuizStore {
    conn: Option<Connection>,
    blobs: Arc<dyn BlobStore>,
    legacy: Arc<dyn BlobStore>,
    keys: StorageKeys,
}

impl QuizStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            conn: None,
            legacy: blobs.clone(),
            blobs,
            keys: StorageKeys::default(),
        }
    }

    /// 旧版扁平数据所在的存储（默认与快照存储相同）
    pub fn with_legacy_source(mut self, legacy: Arc<dyn BlobStore>) -> Self {
        self.legacy = legacy;
        self
    }

    pub fn with_keys(mut self, keys: StorageKeys) -> Self {
        self.keys = keys;
        self
    }

    pub fn keys(&self) -> &StorageKeys {
        &self.keys
    }

    pub fn is_ready(&self) -> bool {
        self.conn.is_some()
    }

    /// 打开或创建数据库。已初始化时直接返回。
    pub async fn init(&mut self) -> Result<(), PersistenceError> {
        if self.conn.is_some() {
            debug!("数据库已初始化，跳过");
            return Ok(());
        }

        let existing = self
            .blobs
            .get(&self.keys.snapshot)
            .await
            .map_err(|e| PersistenceError::BlobStore(format!("{:#}", e)))?
            .filter(|bytes| !bytes.is_empty());

        match existing {
            Some(image) => {
                let conn = snapshot::restore_image(&image)?;
                schema::create_tables(&conn)?;
                info!("从快照加载数据库 ({} 字节)", image.len());
                self.conn = Some(conn);
            }
            None => {
                let conn = Connection::open_in_memory()?;
                schema::create_tables(&conn)?;
                info!("✅ 新建数据库");
                self.conn = Some(conn);
                self.persist_snapshot().await?;
            }
        }

        let inserted = schema::ensure_default_settings(self.conn()?)?;
        debug!("补齐默认设置 {} 项", inserted);
        self.persist_snapshot().await
    }

    /// 序列化整个数据库并写入快照存储。
    ///
    /// 写入失败不会回滚内存中的修改。
    pub async fn persist_snapshot(&mut self) -> Result<(), PersistenceError> {
        let image = snapshot::export_image(self.conn()?)?;
        let size = image.len();
        self.blobs
            .put(&self.keys.snapshot, image)
            .await
            .map_err(|e| {
                error!("保存数据库快照失败: {:#}", e);
                PersistenceError::Snapshot(format!("{:#}", e))
            })?;
        debug!("数据库快照已保存 ({} 字节)", size);
        Ok(())
    }

    /// 导出数据库镜像
    pub fn export_snapshot(&self) -> Result<Vec<u8>, PersistenceError> {
        snapshot::export_image(self.conn()?)
    }

    /// 用镜像替换当前数据库并保存为新快照。未保存的状态会丢失。
    ///
    /// 镜像无效时当前数据库保持不变。
    pub async fn import_snapshot(&mut self, image: &[u8]) -> Result<(), PersistenceError> {
        let conn = snapshot::restore_image(image)?;
        schema::create_tables(&conn)?;
        let seeded = schema::ensure_default_settings(&conn)?;
        if seeded > 0 {
            debug!("导入的镜像缺少默认设置，补齐 {} 项", seeded);
        }
        self.conn = Some(conn);
        info!("已导入数据库镜像 ({} 字节)", image.len());
        self.persist_snapshot().await
    }

    fn conn(&self) -> Result<&Connection, PersistenceError> {
        self.conn.as_ref().ok_or(PersistenceError::NotInitialized)
    }

    fn conn_mut(&mut self) -> Result<&mut Connection, PersistenceError> {
        self.conn.as_mut().ok_or(PersistenceError::NotInitialized)
    }
}

/// 把失败记录到日志并转换为布尔结果
fn succeeded(operation: &str, result: Result<(), PersistenceError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            error!("{} 失败: {}", operation, e);
            false
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;

    pub fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    pub async fn ready_store() -> (QuizStore, MemoryBlobStore) {
        init_logger();
        let blobs = MemoryBlobStore::new();
        let mut store = QuizStore::new(Arc::new(blobs.clone()));
        store.init().await.unwrap();
        (store, blobs)
    }

    /// 写入总是失败的存储
    pub struct FailingBlobStore;

    #[async_trait]
    impl BlobStore for FailingBlobStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }

        async fn put(&self, _key: &str, _bytes: Vec<u8>) -> Result<()> {
            anyhow::bail!("disk full")
        }

        async fn remove(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }
}
