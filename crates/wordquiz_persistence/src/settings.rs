use crate::{PersistenceError, QuizStore};
use log::{info, warn};
use rusqlite::{params, Connection};
use serde_json::Value;
use wordquiz_core::{default_settings, SettingsMap};

pub(crate) fn upsert_setting(conn: &Connection, key: &str, value: &Value) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value.to_string()],
    )
}

impl QuizStore {
    /// 已保存的设置覆盖在默认值之上
    pub fn get_settings(&self) -> Result<SettingsMap, PersistenceError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;

        let mut settings = default_settings();
        for row in rows {
            let (key, raw) = row?;
            let Some(raw) = raw else { continue };
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) => {
                    settings.insert(key, value);
                }
                Err(e) => warn!("设置项 {} 的值无法解析，使用默认值: {}", key, e),
            }
        }
        Ok(settings)
    }

    /// 逐项写入设置，返回合并后的完整设置
    pub async fn save_settings(
        &mut self,
        settings: &SettingsMap,
    ) -> Result<SettingsMap, PersistenceError> {
        let tx = self.conn_mut()?.transaction()?;
        for (key, value) in settings {
            upsert_setting(&tx, key, value)?;
        }
        tx.commit()?;
        info!("⚙️ 保存设置 {} 项", settings.len());

        self.persist_snapshot().await?;
        self.get_settings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ready_store;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_merges_over_defaults() {
        let (mut store, _) = ready_store().await;

        let mut changes = SettingsMap::new();
        changes.insert("questionsPerTest".into(), json!(10));
        changes.insert("customFlag".into(), json!({"nested": [1, 2]}));
        let merged = store.save_settings(&changes).await.unwrap();

        assert_eq!(merged["questionsPerTest"], json!(10));
        assert_eq!(merged["customFlag"], json!({"nested": [1, 2]}));
        assert_eq!(merged["theme"], json!("cute"));
        assert_eq!(merged.len(), 9);
        assert_eq!(store.get_settings().unwrap(), merged);
    }

    #[tokio::test]
    async fn test_unparseable_value_falls_back_to_default() {
        let (store, _) = ready_store().await;
        store
            .conn()
            .unwrap()
            .execute("UPDATE settings SET value = 'oops' WHERE key = 'theme'", [])
            .unwrap();

        assert_eq!(store.get_settings().unwrap()["theme"], json!("cute"));
    }
}
