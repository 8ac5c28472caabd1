use crate::db;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

/// Which grading surface wrote a record. Rubric tables only read `Structured`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordMode {
    Structured,
    Weekly,
}

impl RecordMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordMode::Structured => "structured",
            RecordMode::Weekly => "weekly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "structured" => Some(RecordMode::Structured),
            "weekly" => Some(RecordMode::Weekly),
            _ => None,
        }
    }
}

impl ToSql for RecordMode {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RecordMode {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        RecordMode::parse(raw)
            .ok_or_else(|| FromSqlError::Other(format!("unknown score mode: {}", raw).into()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreRecord {
    pub id: String,
    pub class_id: String,
    pub student_id: String,
    pub mode: RecordMode,
    /// Column id the score was entered against.
    pub title: String,
    pub score: f64,
    pub max_score: f64,
    #[serde(rename = "type")]
    pub category: Option<String>,
    pub week_number: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewScoreRecord {
    pub class_id: String,
    pub student_id: String,
    pub mode: RecordMode,
    pub title: String,
    pub score: f64,
    pub max_score: f64,
    pub category: Option<String>,
    pub week_number: i64,
}

/// The persistence collaborator behind score edits and table reads.
pub trait ScoreStore {
    fn find(
        &self,
        class_id: &str,
        student_id: &str,
        mode: RecordMode,
        title: &str,
        week_number: i64,
    ) -> anyhow::Result<Option<ScoreRecord>>;

    fn insert(&mut self, record: NewScoreRecord) -> anyhow::Result<ScoreRecord>;

    fn update(
        &mut self,
        id: &str,
        score: f64,
        category: Option<&str>,
    ) -> anyhow::Result<ScoreRecord>;

    fn list(
        &self,
        class_id: &str,
        mode: Option<RecordMode>,
        week_number: Option<i64>,
    ) -> anyhow::Result<Vec<ScoreRecord>>;
}

pub struct SqliteScoreStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteScoreStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn by_id(&self, id: &str) -> anyhow::Result<ScoreRecord> {
        let record = self.conn.query_row(
            &format!("{} WHERE id = ?", SELECT_RECORD),
            [id],
            record_from_row,
        )?;
        Ok(record)
    }
}

const SELECT_RECORD: &str = "SELECT id, class_id, student_id, mode, title, score, max_score, type,
        week_number, created_at, updated_at
     FROM score_records";

fn record_from_row(r: &Row<'_>) -> rusqlite::Result<ScoreRecord> {
    Ok(ScoreRecord {
        id: r.get(0)?,
        class_id: r.get(1)?,
        student_id: r.get(2)?,
        mode: r.get(3)?,
        title: r.get(4)?,
        score: r.get(5)?,
        max_score: r.get(6)?,
        category: r.get(7)?,
        week_number: r.get(8)?,
        created_at: r.get(9)?,
        updated_at: r.get(10)?,
    })
}

impl ScoreStore for SqliteScoreStore<'_> {
    fn find(
        &self,
        class_id: &str,
        student_id: &str,
        mode: RecordMode,
        title: &str,
        week_number: i64,
    ) -> anyhow::Result<Option<ScoreRecord>> {
        let record = self
            .conn
            .query_row(
                &format!(
                    "{} WHERE class_id = ? AND student_id = ? AND mode = ? AND title = ?
                       AND week_number = ?",
                    SELECT_RECORD
                ),
                (class_id, student_id, mode, title, week_number),
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn insert(&mut self, record: NewScoreRecord) -> anyhow::Result<ScoreRecord> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO score_records(
                id, class_id, student_id, mode, title, score, max_score, type, week_number,
                created_at, updated_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                &id,
                &record.class_id,
                &record.student_id,
                record.mode,
                &record.title,
                record.score,
                record.max_score,
                &record.category,
                record.week_number,
                &now,
                &now
            ],
        )?;
        db::bump_score_revision(&tx, &record.class_id)?;
        tx.commit()?;
        self.by_id(&id)
    }

    fn update(
        &mut self,
        id: &str,
        score: f64,
        category: Option<&str>,
    ) -> anyhow::Result<ScoreRecord> {
        let now = chrono::Utc::now().to_rfc3339();
        let tx = self.conn.unchecked_transaction()?;
        let changed = tx.execute(
            "UPDATE score_records
             SET score = ?, type = COALESCE(?, type), updated_at = ?
             WHERE id = ?",
            (score, category, &now, id),
        )?;
        if changed == 0 {
            anyhow::bail!("score record {} no longer exists", id);
        }
        let class_id: String = tx.query_row(
            "SELECT class_id FROM score_records WHERE id = ?",
            [id],
            |r| r.get(0),
        )?;
        db::bump_score_revision(&tx, &class_id)?;
        tx.commit()?;
        self.by_id(id)
    }

    fn list(
        &self,
        class_id: &str,
        mode: Option<RecordMode>,
        week_number: Option<i64>,
    ) -> anyhow::Result<Vec<ScoreRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE class_id = ?1
               AND (?2 IS NULL OR mode = ?2)
               AND (?3 IS NULL OR week_number = ?3)
             ORDER BY student_id, mode, week_number, title",
            SELECT_RECORD
        ))?;
        let rows = stmt
            .query_map((class_id, mode, week_number), record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// Immutable `(student, column) -> score` view taken for one evaluation.
#[derive(Debug, Clone, Default)]
pub struct ScoreSnapshot {
    scores: HashMap<String, HashMap<String, f64>>,
}

impl ScoreSnapshot {
    pub fn from_records<'r, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'r ScoreRecord>,
    {
        let mut snapshot = ScoreSnapshot::default();
        for r in records {
            snapshot.insert(&r.student_id, &r.title, r.score);
        }
        snapshot
    }

    pub fn insert(&mut self, student_id: &str, column_id: &str, score: f64) {
        self.scores
            .entry(student_id.to_string())
            .or_default()
            .insert(column_id.to_string(), score);
    }

    pub fn get(&self, student_id: &str, column_id: &str) -> Option<f64> {
        self.scores
            .get(student_id)
            .and_then(|row| row.get(column_id))
            .copied()
    }
}
