use crate::store::{NewScoreRecord, RecordMode, ScoreRecord, ScoreStore};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("score is not a number: {raw}")]
    InvalidInput { raw: String },
    #[error("score {value} is outside 0..={max_score}")]
    OutOfRange { value: f64, max_score: f64 },
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::InvalidInput { .. } => "invalid_input",
            ValidationError::OutOfRange { .. } => "out_of_range",
        }
    }

    pub fn details(&self) -> Value {
        match self {
            ValidationError::InvalidInput { raw } => serde_json::json!({ "value": raw }),
            ValidationError::OutOfRange { value, max_score } => {
                serde_json::json!({ "value": value, "maxScore": max_score })
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("failed to write score for student {student_id}, column {column_id}: {source}")]
    Store {
        student_id: String,
        column_id: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum GradingMode {
    /// Rubric-driven grading; every record lives in week 1.
    Structured,
    Weekly {
        week_number: i64,
        category: Option<String>,
    },
}

impl GradingMode {
    fn record_mode(&self) -> RecordMode {
        match self {
            GradingMode::Structured => RecordMode::Structured,
            GradingMode::Weekly { .. } => RecordMode::Weekly,
        }
    }

    fn week_number(&self) -> i64 {
        match self {
            GradingMode::Structured => 1,
            GradingMode::Weekly { week_number, .. } => *week_number,
        }
    }

    fn category(&self) -> Option<&str> {
        match self {
            GradingMode::Structured => None,
            GradingMode::Weekly { category, .. } => category.as_deref(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmitRequest<'a> {
    pub class_id: &'a str,
    pub student_id: &'a str,
    pub group_id: &'a str,
    pub column_id: &'a str,
    pub raw_value: &'a Value,
    pub max_score: f64,
    pub mode: GradingMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteAction {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    pub action: WriteAction,
    pub record: ScoreRecord,
}

/// Accepts a JSON number or a numeric string as typed into a grade cell.
pub fn parse_score(raw: &Value) -> Result<f64, ValidationError> {
    let parsed = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => Ok(if v == 0.0 { 0.0 } else { v }),
        _ => Err(ValidationError::InvalidInput {
            raw: match raw {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        }),
    }
}

pub fn check_range(value: f64, max_score: f64) -> Result<f64, ValidationError> {
    if value < 0.0 || value > max_score {
        return Err(ValidationError::OutOfRange { value, max_score });
    }
    Ok(value)
}

/// Validates one cell edit and writes it as an insert or an update. Exactly
/// one write is attempted; nothing is written when validation fails.
pub fn submit_score<S: ScoreStore + ?Sized>(
    store: &mut S,
    req: &SubmitRequest<'_>,
) -> Result<SubmitOutcome, SubmitError> {
    let value = check_range(parse_score(req.raw_value)?, req.max_score)?;
    let week_number = req.mode.week_number();
    let mode = req.mode.record_mode();

    let store_err = |source: anyhow::Error| SubmitError::Store {
        student_id: req.student_id.to_string(),
        column_id: req.column_id.to_string(),
        source,
    };

    let existing = store
        .find(req.class_id, req.student_id, mode, req.column_id, week_number)
        .map_err(store_err)?;

    let outcome = match existing {
        Some(current) => SubmitOutcome {
            action: WriteAction::Updated,
            record: store
                .update(&current.id, value, req.mode.category())
                .map_err(store_err)?,
        },
        None => SubmitOutcome {
            action: WriteAction::Inserted,
            record: store
                .insert(NewScoreRecord {
                    class_id: req.class_id.to_string(),
                    student_id: req.student_id.to_string(),
                    mode,
                    title: req.column_id.to_string(),
                    score: value,
                    max_score: req.max_score,
                    category: req.mode.category().map(str::to_string),
                    week_number,
                })
                .map_err(store_err)?,
        },
    };

    tracing::info!(
        class_id = req.class_id,
        student_id = req.student_id,
        group_id = req.group_id,
        column_id = req.column_id,
        week_number,
        mode = mode.as_str(),
        action = ?outcome.action,
        "score written"
    );
    Ok(outcome)
}
