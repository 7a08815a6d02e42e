use crate::PersistenceError;
use rusqlite::backup::Progress;
use rusqlite::{Connection, DatabaseName};
use std::fs;

const SNAPSHOT_FILE: &str = "snapshot.sqlite";

/// 把整个数据库序列化为 SQLite 文件镜像
pub fn export_image(conn: &Connection) -> Result<Vec<u8>, PersistenceError> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join(SNAPSHOT_FILE);
    conn.backup(DatabaseName::Main, &path, None::<fn(Progress)>)?;
    Ok(fs::read(&path)?)
}

/// 从文件镜像恢复出一个新的内存数据库
pub fn restore_image(image: &[u8]) -> Result<Connection, PersistenceError> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join(SNAPSHOT_FILE);
    fs::write(&path, image)?;

    let mut conn = Connection::open_in_memory()?;
    conn.restore(DatabaseName::Main, &path, None::<fn(Progress)>)?;
    // 镜像不是有效数据库时，这里会失败
    conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_roundtrip() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (42);")
            .unwrap();

        let image = export_image(&conn).unwrap();
        assert!(image.starts_with(b"SQLite format 3\0"));

        let restored = restore_image(&image).unwrap();
        let x: i64 = restored.query_row("SELECT x FROM t", [], |row| row.get(0)).unwrap();
        assert_eq!(x, 42);
    }

    #[test]
    fn test_garbage_image_is_rejected() {
        assert!(restore_image(&[0xAB; 4096]).is_err());
    }
}
