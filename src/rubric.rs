use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RubricSettings {
    #[serde(default = "default_true")]
    pub show_grand_total: bool,
}

impl Default for RubricSettings {
    fn default() -> Self {
        Self {
            show_grand_total: true,
        }
    }
}

/// The rubric document exactly as authored by the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RubricDoc {
    #[serde(default)]
    pub groups: Vec<GroupDoc>,
    #[serde(default)]
    pub settings: RubricSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupDoc {
    pub id: String,
    #[serde(default)]
    pub name_display: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub columns: Vec<ColumnDoc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDoc {
    pub id: String,
    #[serde(default)]
    pub name_display: String,
    #[serde(default)]
    pub max_score: f64,
    #[serde(rename = "type")]
    pub kind: ColumnKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_column_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_group_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_source_columns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_group_color: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    #[serde(alias = "Score")]
    Score,
    #[serde(alias = "Total")]
    Total,
    #[serde(alias = "GroupSum", alias = "groupSum")]
    GroupSum,
    #[serde(alias = "GrandTotal", alias = "grandTotal")]
    GrandTotal,
    #[serde(alias = "ExternalSum", alias = "externalSum")]
    ExternalSum,
    #[serde(other)]
    Unknown,
}

impl ColumnKind {
    pub fn is_editable(self) -> bool {
        matches!(self, ColumnKind::Score)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ColumnKind::Score => "score",
            ColumnKind::Total => "total",
            ColumnKind::GroupSum => "group_sum",
            ColumnKind::GrandTotal => "grand_total",
            ColumnKind::ExternalSum => "external_sum",
            ColumnKind::Unknown => "unknown",
        }
    }
}

/// A dependency reference, parsed once when the rubric is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SourceRef {
    #[serde(rename_all = "camelCase")]
    Column { group_id: String, column_id: String },
    #[serde(rename_all = "camelCase")]
    Group { group_id: String },
}

impl SourceRef {
    /// `"group:column"` addresses one column (split at the first `:`); a bare
    /// id addresses the group's total column.
    pub fn parse(raw: &str) -> SourceRef {
        match raw.split_once(':') {
            Some((group_id, column_id)) => SourceRef::Column {
                group_id: group_id.trim().to_string(),
                column_id: column_id.trim().to_string(),
            },
            None => SourceRef::Group {
                group_id: raw.trim().to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnAddr {
    pub group: usize,
    pub column: usize,
}

/// How a column obtains its value, with every reference already bound.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnRule {
    Score,
    Sum(Vec<ColumnAddr>),
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub id: String,
    pub name_display: String,
    pub max_score: f64,
    pub kind: ColumnKind,
    pub use_group_color: bool,
    pub rule: ColumnRule,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub id: String,
    pub name_display: String,
    pub color: Option<String>,
    pub columns: Vec<Column>,
    pub total_column: Option<usize>,
}

impl Group {
    pub fn score_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns
            .iter()
            .filter(|c| matches!(c.kind, ColumnKind::Score))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub code: &'static str,
    pub group_id: String,
    pub column_id: String,
    pub reference: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RubricError {
    #[error("rubric document is not valid JSON: {0}")]
    Parse(String),
    #[error("group at position {position} has an empty id")]
    EmptyGroupId { position: usize },
    #[error("column at position {position} of group {group_id} has an empty id")]
    EmptyColumnId { group_id: String, position: usize },
    #[error("group id {group_id} is used more than once")]
    DuplicateGroupId { group_id: String },
    #[error("column id {column_id} is used by both group {first_group} and group {second_group}")]
    DuplicateColumnId {
        column_id: String,
        first_group: String,
        second_group: String,
    },
    #[error("column {group_id}:{column_id} has invalid maxScore {max_score}")]
    InvalidMaxScore {
        group_id: String,
        column_id: String,
        max_score: f64,
    },
}

impl RubricError {
    pub fn details(&self) -> serde_json::Value {
        match self {
            RubricError::Parse(_) => serde_json::Value::Null,
            RubricError::EmptyGroupId { position } => serde_json::json!({ "position": position }),
            RubricError::EmptyColumnId { group_id, position } => {
                serde_json::json!({ "groupId": group_id, "position": position })
            }
            RubricError::DuplicateGroupId { group_id } => serde_json::json!({ "groupId": group_id }),
            RubricError::DuplicateColumnId {
                column_id,
                first_group,
                second_group,
            } => serde_json::json!({
                "columnId": column_id,
                "groups": [first_group, second_group]
            }),
            RubricError::InvalidMaxScore {
                group_id,
                column_id,
                max_score,
            } => serde_json::json!({
                "groupId": group_id,
                "columnId": column_id,
                "maxScore": max_score
            }),
        }
    }
}

/// A validated rubric with all references bound to column addresses.
#[derive(Debug, Clone)]
pub struct Rubric {
    doc: RubricDoc,
    groups: Vec<Group>,
    group_index: HashMap<String, usize>,
    column_index: HashMap<String, ColumnAddr>,
    fingerprint: String,
    diagnostics: Vec<Diagnostic>,
}

impl Rubric {
    pub fn from_json(text: &str) -> Result<Rubric, RubricError> {
        let doc: RubricDoc =
            serde_json::from_str(text).map_err(|e| RubricError::Parse(e.to_string()))?;
        Rubric::from_doc(doc)
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Rubric, RubricError> {
        let doc = RubricDoc::deserialize(value).map_err(|e| RubricError::Parse(e.to_string()))?;
        Rubric::from_doc(doc)
    }

    pub fn from_doc(doc: RubricDoc) -> Result<Rubric, RubricError> {
        let mut group_index: HashMap<String, usize> = HashMap::new();
        let mut column_index: HashMap<String, ColumnAddr> = HashMap::new();

        for (gi, g) in doc.groups.iter().enumerate() {
            if g.id.trim().is_empty() {
                return Err(RubricError::EmptyGroupId { position: gi });
            }
            if group_index.insert(g.id.clone(), gi).is_some() {
                return Err(RubricError::DuplicateGroupId {
                    group_id: g.id.clone(),
                });
            }
            for (ci, c) in g.columns.iter().enumerate() {
                if c.id.trim().is_empty() {
                    return Err(RubricError::EmptyColumnId {
                        group_id: g.id.clone(),
                        position: ci,
                    });
                }
                if !c.max_score.is_finite() || c.max_score < 0.0 {
                    return Err(RubricError::InvalidMaxScore {
                        group_id: g.id.clone(),
                        column_id: c.id.clone(),
                        max_score: c.max_score,
                    });
                }
                // Score records carry the bare column id, so ids must not repeat
                // anywhere in the rubric.
                let addr = ColumnAddr {
                    group: gi,
                    column: ci,
                };
                if let Some(first) = column_index.insert(c.id.clone(), addr) {
                    return Err(RubricError::DuplicateColumnId {
                        column_id: c.id.clone(),
                        first_group: doc.groups[first.group].id.clone(),
                        second_group: g.id.clone(),
                    });
                }
            }
        }

        let total_columns: Vec<Option<usize>> = doc
            .groups
            .iter()
            .map(|g| {
                g.columns
                    .iter()
                    .position(|c| matches!(c.kind, ColumnKind::Total))
            })
            .collect();

        let mut binder = Binder {
            doc: &doc,
            group_index: &group_index,
            column_index: &column_index,
            total_columns: &total_columns,
            diagnostics: Vec::new(),
        };

        let mut groups = Vec::with_capacity(doc.groups.len());
        for (gi, g) in doc.groups.iter().enumerate() {
            let mut columns = Vec::with_capacity(g.columns.len());
            for c in &g.columns {
                let rule = binder.bind_column(gi, c);
                columns.push(Column {
                    id: c.id.clone(),
                    name_display: c.name_display.clone(),
                    max_score: c.max_score,
                    kind: c.kind,
                    use_group_color: c.use_group_color.unwrap_or(true),
                    rule,
                });
            }
            groups.push(Group {
                id: g.id.clone(),
                name_display: g.name_display.clone(),
                color: g.color.clone(),
                columns,
                total_column: total_columns[gi],
            });
        }
        let diagnostics = binder.diagnostics;

        let fingerprint = fingerprint_doc(&doc);
        Ok(Rubric {
            doc,
            groups,
            group_index,
            column_index,
            fingerprint,
            diagnostics,
        })
    }

    pub fn doc(&self) -> &RubricDoc {
        &self.doc
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn settings(&self) -> &RubricSettings {
        &self.doc.settings
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn group(&self, group: usize) -> &Group {
        &self.groups[group]
    }

    pub fn column(&self, addr: ColumnAddr) -> &Column {
        &self.groups[addr.group].columns[addr.column]
    }

    pub fn group_position(&self, group_id: &str) -> Option<usize> {
        self.group_index.get(group_id).copied()
    }

    pub fn locate(&self, group_id: &str, column_id: &str) -> Option<ColumnAddr> {
        let group = self.group_position(group_id)?;
        self.column_index
            .get(column_id)
            .copied()
            .filter(|addr| addr.group == group)
    }

    pub fn label(&self, addr: ColumnAddr) -> String {
        format!(
            "{}:{}",
            self.groups[addr.group].id,
            self.groups[addr.group].columns[addr.column].id
        )
    }

    /// Every column whose value is derived from other columns.
    pub fn composite_columns(&self) -> impl Iterator<Item = ColumnAddr> + '_ {
        self.groups.iter().enumerate().flat_map(|(gi, g)| {
            g.columns
                .iter()
                .enumerate()
                .filter(|(_, c)| matches!(c.rule, ColumnRule::Sum(_)))
                .map(move |(ci, _)| ColumnAddr {
                    group: gi,
                    column: ci,
                })
        })
    }
}

impl Default for Rubric {
    fn default() -> Self {
        let doc = RubricDoc::default();
        let fingerprint = fingerprint_doc(&doc);
        Rubric {
            doc,
            groups: Vec::new(),
            group_index: HashMap::new(),
            column_index: HashMap::new(),
            fingerprint,
            diagnostics: Vec::new(),
        }
    }
}

fn fingerprint_doc(doc: &RubricDoc) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(doc).unwrap_or_default());
    format!("{:x}", hasher.finalize())
}

struct Binder<'a> {
    doc: &'a RubricDoc,
    group_index: &'a HashMap<String, usize>,
    column_index: &'a HashMap<String, ColumnAddr>,
    total_columns: &'a [Option<usize>],
    diagnostics: Vec<Diagnostic>,
}

impl Binder<'_> {
    fn find_in(&self, group: usize, column_id: &str) -> Option<ColumnAddr> {
        self.column_index
            .get(column_id)
            .copied()
            .filter(|addr| addr.group == group)
    }

    fn bind_column(&mut self, gi: usize, c: &ColumnDoc) -> ColumnRule {
        let group = &self.doc.groups[gi];
        match c.kind {
            ColumnKind::Score => ColumnRule::Score,
            ColumnKind::Unknown => ColumnRule::Unknown,
            ColumnKind::Total => {
                let sources = match &c.source_column_ids {
                    Some(ids) => ids
                        .iter()
                        .filter_map(|id| self.bind_sibling(gi, c, id))
                        .collect(),
                    None => group
                        .columns
                        .iter()
                        .enumerate()
                        .filter(|(_, s)| matches!(s.kind, ColumnKind::Score))
                        .map(|(ci, _)| ColumnAddr {
                            group: gi,
                            column: ci,
                        })
                        .collect(),
                };
                ColumnRule::Sum(sources)
            }
            ColumnKind::GroupSum | ColumnKind::GrandTotal => {
                let mut sources = Vec::new();
                for raw in c.source_group_ids.iter().flatten() {
                    sources.extend(self.bind_ref(gi, c, raw, SourceRef::parse(raw)));
                }
                for id in c.source_column_ids.iter().flatten() {
                    if let Some(addr) = self.bind_sibling(gi, c, id) {
                        sources.push(addr);
                    }
                }
                ColumnRule::Sum(sources)
            }
            ColumnKind::ExternalSum => {
                let mut sources = Vec::new();
                for raw in c.external_source_columns.iter().flatten() {
                    let parsed = SourceRef::parse(raw);
                    if matches!(parsed, SourceRef::Group { .. }) {
                        self.note(
                            gi,
                            c,
                            "malformed_reference",
                            raw,
                            "external sources must be written as group:column",
                        );
                        continue;
                    }
                    sources.extend(self.bind_ref(gi, c, raw, parsed));
                }
                ColumnRule::Sum(sources)
            }
        }
    }

    fn bind_sibling(&mut self, gi: usize, c: &ColumnDoc, id: &str) -> Option<ColumnAddr> {
        let found = self.find_in(gi, id);
        if found.is_none() {
            self.note(
                gi,
                c,
                "unresolved_reference",
                id,
                "no column with this id in the same group",
            );
        }
        found
    }

    /// A bare group binds to its first total column, or to every score column
    /// of that group when it has none.
    fn bind_ref(
        &mut self,
        gi: usize,
        c: &ColumnDoc,
        raw: &str,
        parsed: SourceRef,
    ) -> Vec<ColumnAddr> {
        match parsed {
            SourceRef::Column {
                group_id,
                column_id,
            } => {
                let found = self
                    .group_index
                    .get(&group_id)
                    .and_then(|&target| self.find_in(target, &column_id));
                if found.is_none() {
                    self.note(gi, c, "unresolved_reference", raw, "no such group:column");
                }
                found.into_iter().collect()
            }
            SourceRef::Group { group_id } => {
                let Some(&target) = self.group_index.get(&group_id) else {
                    self.note(gi, c, "unresolved_reference", raw, "no such group");
                    return Vec::new();
                };
                if let Some(total) = self.total_columns[target] {
                    return vec![ColumnAddr {
                        group: target,
                        column: total,
                    }];
                }
                self.doc.groups[target]
                    .columns
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| matches!(s.kind, ColumnKind::Score))
                    .map(|(ci, _)| ColumnAddr {
                        group: target,
                        column: ci,
                    })
                    .collect()
            }
        }
    }

    fn note(&mut self, gi: usize, c: &ColumnDoc, code: &'static str, reference: &str, msg: &str) {
        self.diagnostics.push(Diagnostic {
            code,
            group_id: self.doc.groups[gi].id.clone(),
            column_id: c.id.clone(),
            reference: reference.to_string(),
            message: msg.to_string(),
        });
    }
}
