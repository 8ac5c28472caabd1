use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("rubricd.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

// `title` is the column id. Weekly records never share identity with rubric ones.
// Score records are never deleted here.
const SCORE_RECORDS_TABLE: &str = "CREATE TABLE IF NOT EXISTS score_records(
    id TEXT PRIMARY KEY,
    class_id TEXT NOT NULL,
    student_id TEXT NOT NULL,
    mode TEXT NOT NULL DEFAULT 'structured',
    title TEXT NOT NULL,
    score REAL NOT NULL,
    max_score REAL NOT NULL,
    type TEXT,
    week_number INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY(class_id) REFERENCES classes(id),
    UNIQUE(class_id, student_id, mode, title, week_number)
)";

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            score_revision INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            display_name TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_id, sort_order)",
        [],
    )?;

    // One rubric document per class; the fingerprint is recomputed on load.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS rubrics(
            class_id TEXT PRIMARY KEY,
            document TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;

    migrate_score_records_mode(conn)?;
    conn.execute(SCORE_RECORDS_TABLE, [])?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_score_records_class ON score_records(class_id, week_number)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_score_records_student ON score_records(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn class_exists(conn: &Connection, class_id: &str) -> anyhow::Result<bool> {
    let hit: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| r.get(0))
        .optional()?;
    Ok(hit.is_some())
}

pub fn student_in_class(conn: &Connection, class_id: &str, student_id: &str) -> anyhow::Result<bool> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM students WHERE id = ? AND class_id = ?",
            [student_id, class_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

pub fn score_revision(conn: &Connection, class_id: &str) -> anyhow::Result<i64> {
    let rev: Option<i64> = conn
        .query_row(
            "SELECT score_revision FROM classes WHERE id = ?",
            [class_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(rev.unwrap_or(0))
}

pub fn bump_score_revision(conn: &Connection, class_id: &str) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE classes SET score_revision = score_revision + 1 WHERE id = ?",
        [class_id],
    )?;
    Ok(())
}

pub fn rubric_get(conn: &Connection, class_id: &str) -> anyhow::Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT document FROM rubrics WHERE class_id = ?",
            [class_id],
            |r| r.get(0),
        )
        .optional()?)
}

pub fn rubric_put(
    conn: &Connection,
    class_id: &str,
    document: &str,
    fingerprint: &str,
) -> anyhow::Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO rubrics(class_id, document, fingerprint, updated_at) VALUES(?, ?, ?, ?)
         ON CONFLICT(class_id) DO UPDATE SET
           document = excluded.document,
           fingerprint = excluded.fingerprint,
           updated_at = excluded.updated_at",
        (class_id, document, fingerprint, &now),
    )?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct StudentRow {
    pub id: String,
    pub display_name: String,
    pub sort_order: i64,
}

pub fn students_list(conn: &Connection, class_id: &str) -> anyhow::Result<Vec<StudentRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, display_name, sort_order
         FROM students
         WHERE class_id = ?
         ORDER BY sort_order",
    )?;
    let rows = stmt
        .query_map([class_id], |r| {
            Ok(StudentRow {
                id: r.get(0)?,
                display_name: r.get(1)?,
                sort_order: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Workspaces created before records carried a mode keep the old unique key,
/// which SQLite cannot alter in place, so the table is rebuilt. Rubric scores
/// were always week 1 without a type; anything else came from weekly grading.
fn migrate_score_records_mode(conn: &Connection) -> anyhow::Result<()> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'score_records'",
            [],
            |r| r.get(0),
        )
        .optional()?;
    if exists.is_none() || table_has_column(conn, "score_records", "mode")? {
        return Ok(());
    }

    let tx = conn.unchecked_transaction()?;
    tx.execute("ALTER TABLE score_records RENAME TO score_records_legacy", [])?;
    tx.execute(SCORE_RECORDS_TABLE, [])?;
    let moved = tx.execute(
        "INSERT INTO score_records(
            id, class_id, student_id, mode, title, score, max_score, type, week_number,
            created_at, updated_at
         )
         SELECT id, class_id, student_id,
                CASE WHEN week_number = 1 AND type IS NULL THEN 'structured' ELSE 'weekly' END,
                title, score, max_score, type, week_number, created_at, updated_at
         FROM score_records_legacy",
        [],
    )?;
    tx.execute("DROP TABLE score_records_legacy", [])?;
    tx.commit()?;
    tracing::info!(records = moved, "score records migrated to per-mode identity");
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
