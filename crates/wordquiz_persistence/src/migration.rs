use crate::records::{insert_record, iso_date};
use crate::settings::upsert_setting;
use crate::{now_millis, schema, BlobStore, PersistenceError, QuizStore};
use log::{info, warn};
use rusqlite::{params, Connection};
use serde_json::Value;
use wordquiz_core::{
    default_settings, parse_time_to_seconds, TestRecord, WrongAnswer, POINTS_PER_QUESTION,
};

/// 迁移整体状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    /// 标记已存在，本次什么都没做
    AlreadyCompleted,
    /// 各步骤已执行（可能有步骤失败）
    Completed,
}

/// 单个迁移步骤的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Migrated(usize),
    /// 目标表已有数据
    Skipped,
    NoLegacyData,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub status: MigrationStatus,
    pub settings: StepOutcome,
    pub records: StepOutcome,
    pub mistakes: StepOutcome,
}

impl MigrationReport {
    fn already_completed() -> Self {
        Self {
            status: MigrationStatus::AlreadyCompleted,
            settings: StepOutcome::Skipped,
            records: StepOutcome::Skipped,
            mistakes: StepOutcome::Skipped,
        }
    }

    pub fn steps(&self) -> [(&'static str, &StepOutcome); 3] {
        [
            ("settings", &self.settings),
            ("records", &self.records),
            ("mistakes", &self.mistakes),
        ]
    }

    /// 迁移了多少行
    pub fn migrated_rows(&self) -> usize {
        self.steps()
            .iter()
            .map(|(_, outcome)| match outcome {
                StepOutcome::Migrated(n) => *n,
                _ => 0,
            })
            .sum()
    }

    /// 失败的步骤及原因
    pub fn failures(&self) -> Vec<(&'static str, &str)> {
        self.steps()
            .into_iter()
            .filter_map(|(name, outcome)| match outcome {
                StepOutcome::Failed(reason) => Some((name, reason.as_str())),
                _ => None,
            })
            .collect()
    }
}

type StepFn = fn(&mut Connection, Value, bool) -> Result<StepOutcome, PersistenceError>;

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// 按顺序查找第一个有值的字段
fn lookup<'a>(obj: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|name| obj.get(*name))
        .find(|v| is_truthy(v))
}

fn str_field(obj: &Value, names: &[&str]) -> String {
    match lookup(obj, names) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn int_field(obj: &Value, names: &[&str]) -> Option<i64> {
    let value = lookup(obj, names)?;
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f.round() as i64))
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn count_field(obj: &Value, names: &[&str]) -> u32 {
    int_field(obj, names)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0)
}

/// 旧版用时是 "MM:SS" 字符串，数字按秒处理
fn legacy_seconds(obj: &Value) -> i64 {
    match lookup(obj, &["timeTaken", "timeTakenSeconds"]) {
        Some(Value::String(s)) => parse_time_to_seconds(s),
        Some(Value::Number(n)) => n.as_f64().map_or(0, |f| f.round() as i64),
        _ => 0,
    }
}

fn legacy_record(obj: &Value) -> TestRecord {
    let timestamp = int_field(obj, &["timestamp"]).unwrap_or_else(now_millis);
    let total_questions = count_field(obj, &["totalQuestions"]);
    let mut iso = str_field(obj, &["date", "isoDate"]);
    if iso.is_empty() {
        iso = iso_date(timestamp);
    }
    let id = str_field(obj, &["id"]);

    TestRecord {
        id: if id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            id
        },
        timestamp,
        iso_date: iso,
        score: count_field(obj, &["score"]),
        max_score: int_field(obj, &["maxScore"])
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or_else(|| {
                total_questions
                    .checked_mul(POINTS_PER_QUESTION)
                    .unwrap_or(0)
            }),
        correct_answers: count_field(obj, &["correctAnswers"]),
        total_questions,
        time_taken_seconds: legacy_seconds(obj),
        percentage: count_field(obj, &["percentage"]),
        wrong_answers: obj
            .get("wrongAnswers")
            .cloned()
            .and_then(|v| serde_json::from_value::<Vec<WrongAnswer>>(v).ok())
            .unwrap_or_default(),
    }
}

fn legacy_array(data: Value, what: &str) -> Result<Vec<Value>, PersistenceError> {
    match data {
        Value::Array(items) => Ok(items),
        _ => Err(PersistenceError::Migration(format!(
            "legacy {} is not a JSON array",
            what
        ))),
    }
}

/// 设置表只包含未改动的默认值时视为空表
fn settings_untouched(conn: &Connection) -> Result<bool, PersistenceError> {
    let defaults = default_settings();
    let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
    })?;
    for row in rows {
        let (key, raw) = row?;
        let stored = raw.and_then(|r| serde_json::from_str::<Value>(&r).ok());
        if stored.as_ref() != defaults.get(&key) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn migrate_settings(
    conn: &mut Connection,
    data: Value,
    force: bool,
) -> Result<StepOutcome, PersistenceError> {
    let Value::Object(map) = data else {
        return Err(PersistenceError::Migration(
            "legacy settings is not a JSON object".into(),
        ));
    };
    if map.is_empty() {
        return Ok(StepOutcome::NoLegacyData);
    }
    if !force && !settings_untouched(conn)? {
        return Ok(StepOutcome::Skipped);
    }

    let tx = conn.transaction()?;
    for (key, value) in &map {
        upsert_setting(&tx, key, value)?;
    }
    tx.commit()?;
    Ok(StepOutcome::Migrated(map.len()))
}

fn migrate_records(
    conn: &mut Connection,
    data: Value,
    force: bool,
) -> Result<StepOutcome, PersistenceError> {
    let items = legacy_array(data, "test records")?;
    if items.is_empty() {
        return Ok(StepOutcome::NoLegacyData);
    }
    if !force && schema::count_rows(conn, "test_records")? > 0 {
        return Ok(StepOutcome::Skipped);
    }

    let tx = conn.transaction()?;
    let mut inserted = 0;
    for item in items.iter().filter(|v| v.is_object()) {
        inserted += insert_record(&tx, "INSERT OR IGNORE", &legacy_record(item))?;
    }
    tx.commit()?;
    Ok(StepOutcome::Migrated(inserted))
}

fn migrate_mistakes(
    conn: &mut Connection,
    data: Value,
    force: bool,
) -> Result<StepOutcome, PersistenceError> {
    let items = legacy_array(data, "mistakes")?;
    if items.is_empty() {
        return Ok(StepOutcome::NoLegacyData);
    }
    if !force && schema::count_rows(conn, "mistake_pool")? > 0 {
        return Ok(StepOutcome::Skipped);
    }

    let tx = conn.transaction()?;
    let mut inserted = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO mistake_pool
             (word, correct_answer, user_answer, sentence, notes, timestamp, error_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for item in &items {
            let word = str_field(item, &["word"]);
            if word.is_empty() {
                warn!("跳过没有单词的旧版错题: {}", item);
                continue;
            }
            inserted += stmt.execute(params![
                word,
                str_field(item, &["correctAnswer", "correct_answer"]),
                str_field(item, &["userAnswer", "user_answer", "last_user_answer"]),
                str_field(item, &["sentence"]),
                str_field(item, &["notes"]),
                int_field(item, &["timestamp", "last_error_timestamp"]).unwrap_or_else(now_millis),
                int_field(item, &["errorCount", "error_count"]).unwrap_or(1).max(1),
            ])?;
        }
    }
    tx.commit()?;
    Ok(StepOutcome::Migrated(inserted))
}

async fn read_legacy(legacy: &dyn BlobStore, key: &str) -> Result<Option<Value>, PersistenceError> {
    let bytes = legacy
        .get(key)
        .await
        .map_err(|e| PersistenceError::BlobStore(format!("{:#}", e)))?;
    match bytes {
        Some(bytes) if !bytes.iter().all(u8::is_ascii_whitespace) => {
            Ok(Some(serde_json::from_slice(&bytes)?))
        }
        _ => Ok(None),
    }
}

impl QuizStore {
    /// 旧版迁移是否已完成
    pub async fn migration_completed(&mut self) -> Result<bool, PersistenceError> {
        let flag = self
            .legacy
            .get(&self.keys.migration_flag)
            .await
            .map_err(|e| PersistenceError::BlobStore(format!("{:#}", e)))?;
        Ok(flag.as_deref() == Some(b"true".as_slice()))
    }

    /// 把旧版扁平数据导入数据库。
    ///
    /// 每个步骤独立执行，失败的步骤记录在报告里，不影响其他步骤。
    /// 执行过后即写入完成标记，之后除非 `force` 否则不再执行。
    pub async fn migrate_legacy(&mut self, force: bool) -> Result<MigrationReport, PersistenceError> {
        self.conn()?;
        if !force && self.migration_completed().await? {
            info!("旧版数据已迁移，跳过");
            return Ok(MigrationReport::already_completed());
        }

        info!("开始迁移旧版数据 (force = {})", force);
        let keys = self.keys.clone();
        let report = MigrationReport {
            status: MigrationStatus::Completed,
            settings: self
                .run_step("settings", &keys.legacy_settings, force, migrate_settings)
                .await,
            records: self
                .run_step("records", &keys.legacy_records, force, migrate_records)
                .await,
            mistakes: self
                .run_step("mistakes", &keys.legacy_mistakes, force, migrate_mistakes)
                .await,
        };

        self.persist_snapshot().await?;
        self.legacy
            .put(&keys.migration_flag, b"true".to_vec())
            .await
            .map_err(|e| PersistenceError::BlobStore(format!("{:#}", e)))?;

        let failures = report.failures();
        if failures.is_empty() {
            info!("✅ 旧版数据迁移完成，共 {} 行", report.migrated_rows());
        } else {
            warn!("旧版数据迁移部分失败: {:?}", failures);
        }
        Ok(report)
    }

    async fn run_step(&mut self, name: &str, key: &str, force: bool, step: StepFn) -> StepOutcome {
        match self.try_step(key, force, step).await {
            Ok(outcome) => {
                info!("迁移 {}: {:?}", name, outcome);
                outcome
            }
            Err(e) => {
                warn!("迁移 {} 失败: {}", name, e);
                StepOutcome::Failed(e.to_string())
            }
        }
    }

    async fn try_step(
        &mut self,
        key: &str,
        force: bool,
        step: StepFn,
    ) -> Result<StepOutcome, PersistenceError> {
        let Some(data) = read_legacy(self.legacy.as_ref(), key).await? else {
            return Ok(StepOutcome::NoLegacyData);
        };
        step(self.conn_mut()?, data, force)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{init_logger, ready_store};
    use crate::MemoryBlobStore;
    use serde_json::json;
    use std::sync::Arc;

    fn seed_legacy(blobs: &MemoryBlobStore) {
        let keys = crate::StorageKeys::default();
        blobs.insert(
            keys.legacy_settings,
            json!({"theme": "dark", "questionsPerTest": 10}).to_string(),
        );
        blobs.insert(
            keys.legacy_records,
            json!([
                {
                    "id": "r1",
                    "timestamp": 1_700_000_000_000i64,
                    "score": 10,
                    "correctAnswers": 2,
                    "totalQuestions": 4,
                    "timeTaken": "01:30",
                    "percentage": 50,
                    "wrongAnswers": [{"word": "cat", "correctAnswer": "猫", "userAnswer": "狗"}]
                },
                {"score": 5, "totalQuestions": 1, "timeTaken": 42}
            ])
            .to_string(),
        );
        blobs.insert(
            keys.legacy_mistakes,
            json!([
                {"word": "cat", "correct_answer": "猫", "last_user_answer": "狗", "error_count": 3},
                {"word": "dog", "correctAnswer": "狗", "userAnswer": "猫", "timestamp": 5},
                {"correctAnswer": "无"}
            ])
            .to_string(),
        );
    }

    #[tokio::test]
    async fn test_migrates_all_three_sources() {
        let (mut store, blobs) = ready_store().await;
        seed_legacy(&blobs);

        let report = store.migrate_legacy(false).await.unwrap();
        assert_eq!(report.status, MigrationStatus::Completed);
        assert_eq!(report.settings, StepOutcome::Migrated(2));
        assert_eq!(report.records, StepOutcome::Migrated(2));
        assert_eq!(report.mistakes, StepOutcome::Migrated(2));
        assert!(report.failures().is_empty());
        assert!(store.migration_completed().await.unwrap());

        let settings = store.get_settings().unwrap();
        assert_eq!(settings["theme"], json!("dark"));
        assert_eq!(settings["questionsPerTest"], json!(10));

        let r1 = store.get_record_by_id("r1").unwrap().unwrap();
        assert_eq!(r1.time_taken_seconds, 90);
        assert_eq!(r1.max_score, 20);
        assert_eq!(r1.iso_date, "2023-11-14T22:13:20.000Z");
        assert_eq!(r1.wrong_answers[0].user_answer, "狗");

        let generated = store
            .get_test_records()
            .unwrap()
            .into_iter()
            .find(|r| r.id != "r1")
            .unwrap();
        assert_eq!(generated.time_taken_seconds, 42);
        assert_eq!(generated.max_score, 5);
        assert_eq!(generated.correct_answers, 0);

        let mistakes = store.get_mistakes().unwrap();
        assert_eq!(mistakes[0].word, "cat");
        assert_eq!(mistakes[0].error_count, 3);
        assert_eq!(mistakes[0].user_answer, "狗");
        assert_eq!(mistakes[1].word, "dog");
        assert_eq!(mistakes[1].error_count, 1);
        assert_eq!(mistakes[1].timestamp, 5);
    }

    #[tokio::test]
    async fn test_second_run_is_noop() {
        let (mut store, blobs) = ready_store().await;
        seed_legacy(&blobs);
        store.migrate_legacy(false).await.unwrap();
        store.clear_all_records().await;

        let report = store.migrate_legacy(false).await.unwrap();
        assert_eq!(report.status, MigrationStatus::AlreadyCompleted);
        assert_eq!(report.migrated_rows(), 0);
        assert!(store.get_test_records().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_existing_data_is_skipped_unless_forced() {
        let (mut store, blobs) = ready_store().await;
        seed_legacy(&blobs);
        store
            .add_mistake(&WrongAnswer {
                word: "cat".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let report = store.migrate_legacy(false).await.unwrap();
        assert_eq!(report.mistakes, StepOutcome::Skipped);
        assert_eq!(store.get_mistakes().unwrap().len(), 1);

        let forced = store.migrate_legacy(true).await.unwrap();
        assert_eq!(forced.status, MigrationStatus::Completed);
        // "cat" 已存在，只插入 "dog"
        assert_eq!(forced.mistakes, StepOutcome::Migrated(1));
        assert_eq!(forced.records, StepOutcome::Migrated(1));
        assert_eq!(store.get_mistakes().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_partial_failure_still_sets_flag() {
        let (mut store, blobs) = ready_store().await;
        seed_legacy(&blobs);
        blobs.insert(store.keys().legacy_records.clone(), "{broken");

        let report = store.migrate_legacy(false).await.unwrap();
        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "records");
        assert_eq!(report.mistakes, StepOutcome::Migrated(2));
        assert!(store.migration_completed().await.unwrap());
    }

    #[tokio::test]
    async fn test_no_legacy_data() {
        init_logger();
        let blobs = MemoryBlobStore::new();
        let legacy = MemoryBlobStore::new();
        let mut store = QuizStore::new(Arc::new(blobs.clone()))
            .with_legacy_source(Arc::new(legacy.clone()));
        store.init().await.unwrap();

        let report = store.migrate_legacy(false).await.unwrap();
        for (_, outcome) in report.steps() {
            assert_eq!(*outcome, StepOutcome::NoLegacyData);
        }
        assert!(legacy.contains(&store.keys().migration_flag));
        assert!(!blobs.contains(&store.keys().migration_flag));
    }

    #[tokio::test]
    async fn test_out_of_range_legacy_values_fall_back_to_zero() {
        let (mut store, blobs) = ready_store().await;
        blobs.insert(
            store.keys().legacy_records.clone(),
            json!([
                {"id": "x", "timeTaken": "999999999999999999:00"},
                {"id": "y", "totalQuestions": 4_000_000_000u64}
            ])
            .to_string(),
        );

        let report = store.migrate_legacy(false).await.unwrap();
        assert_eq!(report.records, StepOutcome::Migrated(2));

        let x = store.get_record_by_id("x").unwrap().unwrap();
        assert_eq!(x.time_taken_seconds, 0);
        let y = store.get_record_by_id("y").unwrap().unwrap();
        assert_eq!(y.total_questions, 4_000_000_000);
        assert_eq!(y.max_score, 0);
    }

    #[tokio::test]
    async fn test_migrate_before_init_fails() {
        let mut store = QuizStore::new(Arc::new(MemoryBlobStore::new()));
        assert!(matches!(
            store.migrate_legacy(false).await,
            Err(PersistenceError::NotInitialized)
        ));
    }

    #[test]
    fn test_fallback_lookups_skip_empty_values() {
        let obj = json!({"userAnswer": "", "user_answer": null, "last_user_answer": "x", "error_count": 0});
        assert_eq!(str_field(&obj, &["userAnswer", "user_answer", "last_user_answer"]), "x");
        assert_eq!(int_field(&obj, &["errorCount", "error_count"]), None);
        assert_eq!(str_field(&obj, &["missing"]), "");
    }
}
