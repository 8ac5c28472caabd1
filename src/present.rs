use crate::resolve::{ResolveError, Resolver};
use crate::rubric::{ColumnAddr, Group, Rubric};
use crate::store::ScoreSnapshot;
use serde::Serialize;
use std::collections::BTreeSet;

pub fn group_max_score(group: &Group) -> f64 {
    match group.total_column {
        Some(ci) => group.columns[ci].max_score,
        None => group.score_columns().map(|c| c.max_score).sum(),
    }
}

fn score_sum(group: &Group, scores: &ScoreSnapshot, student_id: &str) -> f64 {
    group
        .score_columns()
        .map(|c| scores.get(student_id, &c.id).unwrap_or(0.0))
        .sum()
}

/// The group's total column when it has one, otherwise the plain sum of its
/// score columns.
pub fn group_value(
    resolver: &mut Resolver<'_>,
    student_id: &str,
    group: usize,
) -> Result<f64, ResolveError> {
    let g = resolver.rubric().group(group);
    match g.total_column {
        Some(column) => resolver.resolve(student_id, ColumnAddr { group, column }),
        None => Ok(score_sum(g, resolver.scores(), student_id)),
    }
}

/// Score columns only: composite columns would count the same marks twice.
pub fn student_total(rubric: &Rubric, scores: &ScoreSnapshot, student_id: &str) -> f64 {
    rubric
        .groups()
        .iter()
        .map(|g| score_sum(g, scores, student_id))
        .sum()
}

pub fn total_max_score(rubric: &Rubric) -> f64 {
    rubric
        .groups()
        .iter()
        .flat_map(|g| g.score_columns())
        .map(|c| c.max_score)
        .sum()
}

#[derive(Debug, Clone, Copy)]
pub struct TableStudent<'s> {
    pub id: &'s str,
    pub display_name: Option<&'s str>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeTable {
    pub fingerprint: String,
    pub show_grand_total: bool,
    pub groups: Vec<HeaderGroup>,
    pub rows: Vec<TableRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_max_score: Option<f64>,
    pub cache: CacheStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderGroup {
    pub group_id: String,
    pub name_display: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub collapsed: bool,
    pub max_score: f64,
    pub columns: Vec<HeaderColumn>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderColumn {
    /// `None` for the summary column of a collapsed group.
    pub column_id: Option<String>,
    pub name_display: String,
    pub max_score: f64,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub editable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRow {
    pub student_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub cells: Vec<Cell>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cell {
    pub group_id: String,
    pub column_id: Option<String>,
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CellError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CellError {
    pub code: &'static str,
    pub message: String,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

fn cell(group_id: &str, column_id: Option<&str>, value: Result<f64, ResolveError>) -> Cell {
    match value {
        Ok(v) => Cell {
            group_id: group_id.to_string(),
            column_id: column_id.map(str::to_string),
            value: Some(v),
            error: None,
        },
        Err(e) => Cell {
            group_id: group_id.to_string(),
            column_id: column_id.map(str::to_string),
            value: None,
            error: Some(CellError {
                code: e.code(),
                message: e.to_string(),
                details: e.details(),
            }),
        },
    }
}

fn header(rubric: &Rubric, collapsed: &BTreeSet<String>) -> Vec<HeaderGroup> {
    rubric
        .groups()
        .iter()
        .map(|g| {
            let is_collapsed = collapsed.contains(&g.id);
            let columns = if is_collapsed {
                vec![HeaderColumn {
                    column_id: None,
                    name_display: g.name_display.clone(),
                    max_score: group_max_score(g),
                    kind: "summary",
                    editable: false,
                    color: g.color.clone(),
                }]
            } else {
                g.columns
                    .iter()
                    .map(|c| HeaderColumn {
                        column_id: Some(c.id.clone()),
                        name_display: c.name_display.clone(),
                        max_score: c.max_score,
                        kind: c.kind.as_str(),
                        editable: c.kind.is_editable(),
                        color: if c.use_group_color {
                            g.color.clone()
                        } else {
                            None
                        },
                    })
                    .collect()
            };
            HeaderGroup {
                group_id: g.id.clone(),
                name_display: g.name_display.clone(),
                color: g.color.clone(),
                collapsed: is_collapsed,
                max_score: group_max_score(g),
                columns,
            }
        })
        .collect()
}

/// Builds the full grade table. Group ids in `collapsed` that the rubric does
/// not know are ignored.
pub fn build_table(
    resolver: &mut Resolver<'_>,
    students: &[TableStudent<'_>],
    collapsed: &BTreeSet<String>,
) -> GradeTable {
    let rubric = resolver.rubric();
    let scores = resolver.scores();
    let show_grand_total = rubric.settings().show_grand_total;

    let mut rows = Vec::with_capacity(students.len());
    let mut failed_cells = 0_usize;
    for student in students {
        let mut cells = Vec::new();
        for (gi, g) in rubric.groups().iter().enumerate() {
            if collapsed.contains(&g.id) {
                cells.push(cell(&g.id, None, group_value(resolver, student.id, gi)));
                continue;
            }
            for (ci, c) in g.columns.iter().enumerate() {
                let value = resolver.resolve(
                    student.id,
                    ColumnAddr {
                        group: gi,
                        column: ci,
                    },
                );
                cells.push(cell(&g.id, Some(&c.id), value));
            }
        }
        failed_cells += cells.iter().filter(|c| c.error.is_some()).count();
        rows.push(TableRow {
            student_id: student.id.to_string(),
            display_name: student.display_name.map(str::to_string),
            cells,
            total: show_grand_total.then(|| student_total(rubric, scores, student.id)),
        });
    }

    let memo = resolver.memo();
    let cache = CacheStats {
        hits: memo.hits(),
        misses: memo.misses(),
        entries: memo.len(),
    };
    tracing::debug!(
        rows = rows.len(),
        failed_cells,
        cache_hits = cache.hits,
        cache_misses = cache.misses,
        "grade table built"
    );

    GradeTable {
        fingerprint: rubric.fingerprint().to_string(),
        show_grand_total,
        groups: header(rubric, collapsed),
        rows,
        total_max_score: show_grand_total.then(|| total_max_score(rubric)),
        cache,
    }
}
