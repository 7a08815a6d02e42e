use crate::{now_millis, succeeded, PersistenceError, QuizStore};
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info, warn};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use wordquiz_core::{
    format_time, SettingsMap, TestRecord, TestRecordDraft, TestStats, Trend,
    WordCount, WrongAnswer, WrongAnswerSummary,
};

const RECORD_COLUMNS: &str = "id, timestamp, iso_date, score, max_score, correct_answers, \
     total_questions, time_taken_seconds, percentage, wrong_answers_json";

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// 导出的 JSON 数据包
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportBundle {
    pub records: Vec<TestRecord>,
    pub settings: SettingsMap,
    pub export_date: String,
    pub version: String,
}

impl ExportBundle {
    pub fn to_json(&self) -> Result<String, PersistenceError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// 毫秒时间戳转 ISO 日期
pub(crate) fn iso_date(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn to_u32(value: Option<i64>) -> u32 {
    value.and_then(|v| u32::try_from(v).ok()).unwrap_or(0)
}

fn record_from_row(row: &Row) -> rusqlite::Result<TestRecord> {
    let id: String = row.get(0)?;
    let wrong_json: Option<String> = row.get(9)?;
    let wrong_answers = match wrong_json.as_deref() {
        None | Some("") => Vec::new(),
        Some(json) => serde_json::from_str::<Vec<WrongAnswer>>(json).unwrap_or_else(|e| {
            warn!("测试记录 {} 的错题数据无法解析: {}", id, e);
            Vec::new()
        }),
    };

    Ok(TestRecord {
        timestamp: row.get::<_, Option<i64>>(1)?.unwrap_or_default(),
        iso_date: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        score: to_u32(row.get(3)?),
        max_score: to_u32(row.get(4)?),
        correct_answers: to_u32(row.get(5)?),
        total_questions: to_u32(row.get(6)?),
        time_taken_seconds: row.get::<_, Option<i64>>(7)?.unwrap_or_default(),
        percentage: to_u32(row.get(8)?),
        wrong_answers,
        id,
    })
}

pub(crate) fn insert_record(
    conn: &rusqlite::Connection,
    verb: &str,
    record: &TestRecord,
) -> Result<usize, PersistenceError> {
    let sql = format!(
        "{} INTO test_records ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        verb, RECORD_COLUMNS
    );
    let wrong_json = serde_json::to_string(&record.wrong_answers)?;
    Ok(conn.execute(
        &sql,
        params![
            record.id,
            record.timestamp,
            record.iso_date,
            record.score,
            record.max_score,
            record.correct_answers,
            record.total_questions,
            record.time_taken_seconds,
            record.percentage,
            wrong_json,
        ],
    )?)
}

/// 最近 5 次和之前 5 次的平均正确率比较，记录按时间倒序
fn improvement_trend(percentages: &[u32]) -> Trend {
    if percentages.len() < 6 {
        return Trend::None;
    }
    let recent = &percentages[..5];
    let previous = &percentages[5..percentages.len().min(10)];
    if previous.len() != 5 {
        return Trend::None;
    }

    let avg = |xs: &[u32]| xs.iter().map(|&p| f64::from(p)).sum::<f64>() / 5.0;
    let (recent_avg, previous_avg) = (avg(recent), avg(previous));
    if recent_avg > previous_avg + 5.0 {
        Trend::Improving
    } else if recent_avg < previous_avg - 5.0 {
        Trend::Declining
    } else {
        Trend::Stable
    }
}

fn rounded_average(sum: u64, count: usize) -> u64 {
    if count == 0 {
        0
    } else {
        (sum as f64 / count as f64).round() as u64
    }
}

impl QuizStore {
    /// 保存一条测试记录，缺省的 id 和时间在这里生成
    pub async fn save_test_record(
        &mut self,
        draft: TestRecordDraft,
    ) -> Result<TestRecord, PersistenceError> {
        let conn = self.conn()?;

        let timestamp = draft.timestamp.unwrap_or_else(now_millis);
        let record = TestRecord {
            id: draft
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            iso_date: draft.iso_date.unwrap_or_else(|| iso_date(timestamp)),
            timestamp,
            score: draft.score,
            max_score: draft.max_score,
            correct_answers: draft.correct_answers,
            total_questions: draft.total_questions,
            time_taken_seconds: draft.time_taken_seconds,
            percentage: draft.percentage,
            wrong_answers: draft.wrong_answers,
        };

        insert_record(conn, "INSERT", &record)?;
        info!(
            "💾 保存测试记录 {}: {}/{} ({}%)",
            record.id, record.score, record.max_score, record.percentage
        );
        self.persist_snapshot().await?;
        Ok(record)
    }

    /// 全部测试记录，最新的在前
    pub fn get_test_records(&self) -> Result<Vec<TestRecord>, PersistenceError> {
        self.query_records(-1)
    }

    pub fn get_recent_records(&self, limit: usize) -> Result<Vec<TestRecord>, PersistenceError> {
        self.query_records(i64::try_from(limit).unwrap_or(i64::MAX))
    }

    pub fn get_record_by_id(&self, id: &str) -> Result<Option<TestRecord>, PersistenceError> {
        let sql = format!("SELECT {} FROM test_records WHERE id = ?1", RECORD_COLUMNS);
        Ok(self
            .conn()?
            .query_row(&sql, [id], record_from_row)
            .optional()?)
    }

    fn query_records(&self, limit: i64) -> Result<Vec<TestRecord>, PersistenceError> {
        let sql = format!(
            "SELECT {} FROM test_records ORDER BY timestamp DESC LIMIT ?1",
            RECORD_COLUMNS
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map([limit], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// 删除一条记录，失败或不存在时返回 false
    pub async fn delete_test_record(&mut self, id: &str) -> bool {
        match self.try_delete_record(id).await {
            Ok(removed) => removed,
            Err(e) => succeeded("删除测试记录", Err(e)),
        }
    }

    async fn try_delete_record(&mut self, id: &str) -> Result<bool, PersistenceError> {
        let removed = self
            .conn()?
            .execute("DELETE FROM test_records WHERE id = ?1", [id])?;
        if removed == 0 {
            debug!("测试记录 {} 不存在", id);
            return Ok(false);
        }
        self.persist_snapshot().await?;
        Ok(true)
    }

    pub async fn clear_all_records(&mut self) -> bool {
        let result = self.try_clear_records().await;
        succeeded("清空测试记录", result)
    }

    async fn try_clear_records(&mut self) -> Result<(), PersistenceError> {
        let removed = self.conn()?.execute("DELETE FROM test_records", [])?;
        info!("🗑️ 清空测试记录 {} 条", removed);
        self.persist_snapshot().await
    }

    /// 删除早于 `days` 天前的记录，返回删除的条数
    pub async fn prune_records_older_than(&mut self, days: u32) -> Result<usize, PersistenceError> {
        let cutoff = now_millis() - i64::from(days) * DAY_MILLIS;
        let removed = self.conn()?.execute(
            "DELETE FROM test_records WHERE COALESCE(timestamp, 0) <= ?1",
            [cutoff],
        )?;
        info!("清理完成，删除了 {} 条旧记录", removed);
        if removed > 0 {
            self.persist_snapshot().await?;
        }
        Ok(removed)
    }

    pub fn get_test_stats(&self) -> Result<TestStats, PersistenceError> {
        let records = self.get_test_records()?;
        if records.is_empty() {
            return Ok(TestStats::default());
        }

        let total_tests = records.len();
        let sum_scores: u64 = records.iter().map(|r| u64::from(r.score)).sum();
        let sum_percentages: u64 = records.iter().map(|r| u64::from(r.percentage)).sum();
        let sum_times = records
            .iter()
            .fold(0i64, |acc, r| acc.saturating_add(r.time_taken_seconds.max(0)));
        let total_correct: u64 = records.iter().map(|r| u64::from(r.correct_answers)).sum();
        let total_questions: u64 = records.iter().map(|r| u64::from(r.total_questions)).sum();
        let overall_accuracy = if total_questions == 0 {
            0
        } else {
            (total_correct as f64 / total_questions as f64 * 100.0).round() as u32
        };

        let average_time = (sum_times as f64 / total_tests as f64).round() as i64;
        let best_time = records
            .iter()
            .map(|r| r.time_taken_seconds)
            .filter(|&t| t > 0)
            .min()
            .map(format_time)
            .unwrap_or_else(|| "N/A".to_string());

        let percentages: Vec<u32> = records.iter().map(|r| r.percentage).collect();

        Ok(TestStats {
            total_tests,
            average_score: rounded_average(sum_scores, total_tests) as u32,
            average_percentage: rounded_average(sum_percentages, total_tests) as u32,
            best_score: records.iter().map(|r| r.score).max().unwrap_or(0),
            best_percentage: percentages.iter().copied().max().unwrap_or(0),
            average_time: format_time(average_time),
            best_time,
            total_correct_answers: u32::try_from(total_correct).unwrap_or(u32::MAX),
            total_questions: u32::try_from(total_questions).unwrap_or(u32::MAX),
            overall_accuracy,
            improvement_trend: improvement_trend(&percentages),
            recent_records: records.into_iter().take(5).collect(),
        })
    }

    /// 汇总所有测试记录里的错题
    pub fn get_wrong_answer_summary(&self) -> Result<WrongAnswerSummary, PersistenceError> {
        let records = self.get_test_records()?;

        let mut counts: HashMap<String, u32> = HashMap::new();
        let mut total = 0usize;
        for wrong in records.iter().flat_map(|r| r.wrong_answers.iter()) {
            total += 1;
            *counts.entry(wrong.word.to_lowercase()).or_default() += 1;
        }

        let unique_wrong_words = counts.len();
        let mut most_wrong_words: Vec<WordCount> = counts
            .into_iter()
            .map(|(word, count)| WordCount { word, count })
            .collect();
        most_wrong_words.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.word.cmp(&b.word)));
        most_wrong_words.truncate(10);

        let average_wrong_per_test = if records.is_empty() {
            0.0
        } else {
            (total as f64 / records.len() as f64 * 10.0).round() / 10.0
        };

        Ok(WrongAnswerSummary {
            total_wrong_answers: total,
            unique_wrong_words,
            most_wrong_words,
            average_wrong_per_test,
        })
    }

    /// 导出测试记录和设置
    pub fn export_bundle(&self) -> Result<ExportBundle, PersistenceError> {
        Ok(ExportBundle {
            records: self.get_test_records()?,
            settings: self.get_settings()?,
            export_date: iso_date(now_millis()),
            version: "1.0".to_string(),
        })
    }

    /// 导入 JSON 数据包。已有 id 的记录保留不动，设置逐项覆盖。
    /// 返回新插入的记录数。
    pub async fn import_bundle(&mut self, json: &str) -> Result<usize, PersistenceError> {
        let bundle: ExportBundle = serde_json::from_str(json)?;

        let tx = self.conn_mut()?.transaction()?;
        let mut inserted = 0;
        for record in &bundle.records {
            inserted += insert_record(&tx, "INSERT OR IGNORE", record)?;
        }
        for (key, value) in &bundle.settings {
            crate::settings::upsert_setting(&tx, key, value)?;
        }
        tx.commit()?;

        info!(
            "导入数据包: {} 条记录中新增 {} 条, {} 项设置",
            bundle.records.len(),
            inserted,
            bundle.settings.len()
        );
        self.persist_snapshot().await?;
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ready_store;

    fn draft(timestamp: i64, percentage: u32, time: i64) -> TestRecordDraft {
        TestRecordDraft {
            timestamp: Some(timestamp),
            score: percentage / 20,
            max_score: 5,
            correct_answers: percentage / 20,
            total_questions: 5,
            time_taken_seconds: time,
            percentage,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_save_generates_id_and_date() {
        let (mut store, _) = ready_store().await;
        let saved = store
            .save_test_record(TestRecordDraft {
                timestamp: Some(0),
                score: 15,
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(!saved.id.is_empty());
        assert_eq!(saved.iso_date, "1970-01-01T00:00:00.000Z");
        assert_eq!(store.get_record_by_id(&saved.id).unwrap(), Some(saved));
        assert_eq!(store.get_record_by_id("missing").unwrap(), None);
    }

    #[tokio::test]
    async fn test_records_are_newest_first() {
        let (mut store, _) = ready_store().await;
        for ts in [1_000, 3_000, 2_000] {
            store.save_test_record(draft(ts, 60, 30)).await.unwrap();
        }

        let stamps: Vec<i64> = store
            .get_test_records()
            .unwrap()
            .iter()
            .map(|r| r.timestamp)
            .collect();
        assert_eq!(stamps, vec![3_000, 2_000, 1_000]);
        assert_eq!(store.get_recent_records(2).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_null_columns_and_bad_json_are_backfilled() {
        let (store, _) = ready_store().await;
        store
            .conn()
            .unwrap()
            .execute(
                "INSERT INTO test_records (id, wrong_answers_json) VALUES ('legacy', '{not json')",
                [],
            )
            .unwrap();

        let record = store.get_record_by_id("legacy").unwrap().unwrap();
        assert_eq!(record.score, 0);
        assert_eq!(record.iso_date, "");
        assert!(record.wrong_answers.is_empty());
    }

    #[tokio::test]
    async fn test_stats_with_no_records() {
        let (store, _) = ready_store().await;
        let stats = store.get_test_stats().unwrap();
        assert_eq!(stats.total_tests, 0);
        assert_eq!(stats.average_time, "00:00");
        assert_eq!(stats.best_time, "N/A");
        assert_eq!(stats.improvement_trend, Trend::None);
        assert!(stats.recent_records.is_empty());
    }

    #[tokio::test]
    async fn test_stats_aggregates() {
        let (mut store, _) = ready_store().await;
        store.save_test_record(draft(1, 40, 0)).await.unwrap();
        store.save_test_record(draft(2, 100, 90)).await.unwrap();
        store.save_test_record(draft(3, 60, 45)).await.unwrap();

        let stats = store.get_test_stats().unwrap();
        assert_eq!(stats.total_tests, 3);
        assert_eq!(stats.average_percentage, 67);
        assert_eq!(stats.best_percentage, 100);
        assert_eq!(stats.best_score, 5);
        assert_eq!(stats.average_time, "00:45");
        assert_eq!(stats.best_time, "00:45");
        assert_eq!(stats.total_correct_answers, 2 + 5 + 3);
        assert_eq!(stats.total_questions, 15);
        assert_eq!(stats.overall_accuracy, 67);
        assert_eq!(stats.improvement_trend, Trend::None);
    }

    #[tokio::test]
    async fn test_saving_an_existing_id_fails() {
        let (mut store, _) = ready_store().await;
        let first = store.save_test_record(draft(1, 100, 30)).await.unwrap();

        let again = store
            .save_test_record(TestRecordDraft {
                id: Some(first.id.clone()),
                ..draft(2, 0, 10)
            })
            .await;
        assert!(matches!(again, Err(PersistenceError::Database(_))));

        let stored = store.get_record_by_id(&first.id).unwrap().unwrap();
        assert_eq!(stored, first);
        assert_eq!(store.get_test_records().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stats_with_huge_counts() {
        let (mut store, _) = ready_store().await;
        for ts in [1, 2] {
            store
                .save_test_record(TestRecordDraft {
                    timestamp: Some(ts),
                    correct_answers: 3_000_000_000,
                    total_questions: 3_000_000_000,
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let stats = store.get_test_stats().unwrap();
        assert_eq!(stats.total_correct_answers, u32::MAX);
        assert_eq!(stats.total_questions, u32::MAX);
        assert_eq!(stats.overall_accuracy, 100);
    }

    #[test]
    fn test_trend_needs_two_full_groups() {
        assert_eq!(improvement_trend(&[90; 6]), Trend::None);
        assert_eq!(improvement_trend(&[90; 9]), Trend::None);
        assert_eq!(improvement_trend(&[80; 10]), Trend::Stable);

        let improving = [90, 90, 90, 90, 90, 50, 50, 50, 50, 50, 0];
        assert_eq!(improvement_trend(&improving), Trend::Improving);

        let declining = [50, 50, 50, 50, 50, 90, 90, 90, 90, 90];
        assert_eq!(improvement_trend(&declining), Trend::Declining);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let (mut store, _) = ready_store().await;
        let saved = store.save_test_record(draft(1, 60, 10)).await.unwrap();
        store.save_test_record(draft(2, 60, 10)).await.unwrap();

        assert!(store.delete_test_record(&saved.id).await);
        assert!(!store.delete_test_record(&saved.id).await);
        assert_eq!(store.get_test_records().unwrap().len(), 1);

        assert!(store.clear_all_records().await);
        assert!(store.get_test_records().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prune_old_records() {
        let (mut store, _) = ready_store().await;
        let old = now_millis() - 40 * DAY_MILLIS;
        store.save_test_record(draft(old, 60, 10)).await.unwrap();
        store.save_test_record(TestRecordDraft::default()).await.unwrap();

        assert_eq!(store.prune_records_older_than(30).await.unwrap(), 1);
        assert_eq!(store.get_test_records().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_wrong_answer_summary() {
        let (mut store, _) = ready_store().await;
        let wrong = |word: &str| WrongAnswer {
            word: word.into(),
            ..Default::default()
        };
        store
            .save_test_record(TestRecordDraft {
                wrong_answers: vec![wrong("Cat"), wrong("dog")],
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .save_test_record(TestRecordDraft {
                wrong_answers: vec![wrong("cat")],
                ..Default::default()
            })
            .await
            .unwrap();
        store.save_test_record(TestRecordDraft::default()).await.unwrap();

        let summary = store.get_wrong_answer_summary().unwrap();
        assert_eq!(summary.total_wrong_answers, 3);
        assert_eq!(summary.unique_wrong_words, 2);
        assert_eq!(
            summary.most_wrong_words[0],
            WordCount {
                word: "cat".into(),
                count: 2
            }
        );
        assert_eq!(summary.average_wrong_per_test, 1.0);
    }

    #[tokio::test]
    async fn test_bundle_roundtrip_skips_existing_ids() {
        let (mut store, _) = ready_store().await;
        store.save_test_record(draft(1, 60, 10)).await.unwrap();
        let json = store.export_bundle().unwrap().to_json().unwrap();
        assert!(json.contains("\"exportDate\""));
        assert!(json.contains("\"version\": \"1.0\""));

        let (mut fresh, _) = ready_store().await;
        assert_eq!(fresh.import_bundle(&json).await.unwrap(), 1);
        assert_eq!(fresh.import_bundle(&json).await.unwrap(), 0);
        assert_eq!(fresh.get_test_records().unwrap(), store.get_test_records().unwrap());

        assert!(fresh.import_bundle("{\"records\": 3}").await.is_err());
    }
}
