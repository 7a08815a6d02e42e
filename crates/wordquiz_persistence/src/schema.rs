use rusqlite::{params, Connection};
use wordquiz_core::default_settings;

/// 建表（可重复执行）
pub fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT
        );

        CREATE TABLE IF NOT EXISTS test_records (
            id TEXT PRIMARY KEY,
            timestamp INTEGER,
            iso_date TEXT,
            score INTEGER,
            max_score INTEGER,
            correct_answers INTEGER,
            total_questions INTEGER,
            time_taken_seconds INTEGER,
            percentage INTEGER,
            wrong_answers_json TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_test_records_timestamp ON test_records (timestamp DESC);

        CREATE TABLE IF NOT EXISTS mistake_pool (
            word TEXT PRIMARY KEY,
            correct_answer TEXT,
            user_answer TEXT,
            sentence TEXT,
            notes TEXT,
            timestamp INTEGER,
            error_count INTEGER DEFAULT 1
        );
        CREATE INDEX IF NOT EXISTS idx_mistake_pool_error_count ON mistake_pool (error_count DESC);
        CREATE INDEX IF NOT EXISTS idx_mistake_pool_timestamp ON mistake_pool (timestamp DESC);",
    )
}

/// 补齐缺失的默认设置，已有的值不覆盖。返回新插入的行数。
pub fn ensure_default_settings(conn: &Connection) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare("INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)")?;
    let mut inserted = 0;
    for (key, value) in default_settings() {
        inserted += stmt.execute(params![key, value.to_string()])?;
    }
    Ok(inserted)
}

pub fn count_rows(conn: &Connection, table: &str) -> rusqlite::Result<i64> {
    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
}
