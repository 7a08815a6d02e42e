use crate::records::to_u32;
use crate::{now_millis, succeeded, PersistenceError, QuizStore};
use log::{debug, info};
use rusqlite::{params, Row};
use wordquiz_core::{MistakePoolEntry, MistakeStats, MistakeStrategy, WordCount, WrongAnswer};

const MISTAKE_COLUMNS: &str =
    "word, correct_answer, user_answer, sentence, notes, timestamp, error_count";

fn mistake_from_row(row: &Row) -> rusqlite::Result<MistakePoolEntry> {
    Ok(MistakePoolEntry {
        word: row.get(0)?,
        correct_answer: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        user_answer: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        sentence: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        notes: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        timestamp: row.get::<_, Option<i64>>(5)?.unwrap_or_default(),
        error_count: to_u32(row.get(6)?).max(1),
    })
}

fn order_clause(strategy: MistakeStrategy) -> &'static str {
    match strategy {
        MistakeStrategy::Default => "ORDER BY error_count DESC, timestamp DESC",
        MistakeStrategy::Random => "ORDER BY RANDOM()",
        MistakeStrategy::OldestErrors => "ORDER BY timestamp ASC, error_count DESC",
        MistakeStrategy::LeastFrequentErrors => "ORDER BY error_count ASC, timestamp DESC",
    }
}

impl QuizStore {
    /// 记录一次答错。同一个单词只有一行，再次答错时次数加一。
    pub async fn add_mistake(
        &mut self,
        wrong: &WrongAnswer,
    ) -> Result<MistakePoolEntry, PersistenceError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO mistake_pool (word, correct_answer, user_answer, sentence, notes, timestamp, error_count)
             VALUES (?1, ?2, ?3, NULLIF(?4, ''), NULLIF(?5, ''), ?6, 1)
             ON CONFLICT(word) DO UPDATE SET
                 user_answer = excluded.user_answer,
                 timestamp = excluded.timestamp,
                 sentence = excluded.sentence,
                 notes = excluded.notes,
                 error_count = COALESCE(mistake_pool.error_count, 0) + 1",
            params![
                wrong.word,
                wrong.correct_answer,
                wrong.user_answer,
                wrong.sentence,
                wrong.notes,
                now_millis(),
            ],
        )?;
        let entry = conn.query_row(
            &format!("SELECT {} FROM mistake_pool WHERE word = ?1", MISTAKE_COLUMNS),
            [&wrong.word],
            mistake_from_row,
        )?;
        debug!("错题 {} 累计 {} 次", entry.word, entry.error_count);

        self.persist_snapshot().await?;
        Ok(entry)
    }

    /// 错题池，错误次数多的在前，其次最近的在前
    pub fn get_mistakes(&self) -> Result<Vec<MistakePoolEntry>, PersistenceError> {
        self.query_mistakes(MistakeStrategy::Default, -1)
    }

    /// 按策略取出至多 `count` 道错题
    pub fn get_mistakes_for_quiz(
        &self,
        count: usize,
        strategy: MistakeStrategy,
    ) -> Result<Vec<MistakePoolEntry>, PersistenceError> {
        let limit = i64::try_from(count).unwrap_or(i64::MAX);
        let mistakes = self.query_mistakes(strategy, limit)?;
        debug!(
            "按 {} 策略取出 {} 道错题",
            strategy.as_str(),
            mistakes.len()
        );
        Ok(mistakes)
    }

    fn query_mistakes(
        &self,
        strategy: MistakeStrategy,
        limit: i64,
    ) -> Result<Vec<MistakePoolEntry>, PersistenceError> {
        let sql = format!(
            "SELECT {} FROM mistake_pool {} LIMIT ?1",
            MISTAKE_COLUMNS,
            order_clause(strategy)
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let mistakes = stmt
            .query_map([limit], mistake_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(mistakes)
    }

    pub async fn remove_mistake(&mut self, word: &str) -> bool {
        let result = self.try_remove_mistake(word).await;
        succeeded("移除错题", result)
    }

    async fn try_remove_mistake(&mut self, word: &str) -> Result<(), PersistenceError> {
        let removed = self
            .conn()?
            .execute("DELETE FROM mistake_pool WHERE word = ?1", [word])?;
        debug!("移除错题 {} ({} 行)", word, removed);
        self.persist_snapshot().await
    }

    pub async fn clear_mistakes(&mut self) -> bool {
        let result = self.try_clear_mistakes().await;
        succeeded("清空错题池", result)
    }

    async fn try_clear_mistakes(&mut self) -> Result<(), PersistenceError> {
        let removed = self.conn()?.execute("DELETE FROM mistake_pool", [])?;
        info!("🗑️ 清空错题池 {} 条", removed);
        self.persist_snapshot().await
    }

    pub fn get_mistake_stats(&self) -> Result<MistakeStats, PersistenceError> {
        let mistakes = self.get_mistakes()?;
        if mistakes.is_empty() {
            return Ok(MistakeStats::default());
        }

        let to_count = |m: &MistakePoolEntry| WordCount {
            word: m.word.clone(),
            count: m.error_count,
        };
        let sum: u64 = mistakes.iter().map(|m| u64::from(m.error_count)).sum();

        Ok(MistakeStats {
            total_wrong: mistakes.len(),
            most_frequent: mistakes.first().map(to_count),
            least_frequent: mistakes.last().map(to_count),
            average_error_count: (sum as f64 / mistakes.len() as f64).round() as u32,
        })
    }
}
