use crate::rubric::{ColumnAddr, ColumnRule, Rubric};
use crate::store::ScoreSnapshot;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("cycle detected while resolving {group_id}:{column_id} (via {})", path.join(" -> "))]
    CycleDetected {
        group_id: String,
        column_id: String,
        path: Vec<String>,
    },
}

impl ResolveError {
    pub fn code(&self) -> &'static str {
        match self {
            ResolveError::CycleDetected { .. } => "cycle_detected",
        }
    }

    pub fn details(&self) -> serde_json::Value {
        match self {
            ResolveError::CycleDetected {
                group_id,
                column_id,
                path,
            } => serde_json::json!({
                "groupId": group_id,
                "columnId": column_id,
                "path": path
            }),
        }
    }
}

/// Resolved values for one (rubric, score revision) pair.
#[derive(Debug, Clone, Default)]
pub struct Memo {
    fingerprint: String,
    revision: i64,
    values: HashMap<String, HashMap<ColumnAddr, Result<f64, ResolveError>>>,
    hits: u64,
    misses: u64,
}

impl Memo {
    pub fn new(fingerprint: &str, revision: i64) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            revision,
            ..Self::default()
        }
    }

    pub fn is_current(&self, fingerprint: &str, revision: i64) -> bool {
        self.fingerprint == fingerprint && self.revision == revision
    }

    pub fn len(&self) -> usize {
        self.values.values().map(HashMap::len).sum()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Counters cover one request; cached values are kept.
    pub fn reset_stats(&mut self) {
        self.hits = 0;
        self.misses = 0;
    }

    fn lookup(&mut self, student_id: &str, addr: ColumnAddr) -> Option<Result<f64, ResolveError>> {
        let found = self
            .values
            .get(student_id)
            .and_then(|row| row.get(&addr))
            .cloned();
        match found {
            Some(v) => {
                self.hits += 1;
                Some(v)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    fn store(&mut self, student_id: &str, addr: ColumnAddr, value: Result<f64, ResolveError>) {
        self.values
            .entry(student_id.to_string())
            .or_default()
            .insert(addr, value);
    }
}

/// Evaluates columns against one rubric and score snapshot, caching into `memo`.
pub struct Resolver<'a> {
    rubric: &'a Rubric,
    scores: &'a ScoreSnapshot,
    memo: &'a mut Memo,
}

impl<'a> Resolver<'a> {
    pub fn new(rubric: &'a Rubric, scores: &'a ScoreSnapshot, memo: &'a mut Memo) -> Self {
        Self {
            rubric,
            scores,
            memo,
        }
    }

    pub fn rubric(&self) -> &'a Rubric {
        self.rubric
    }

    pub fn scores(&self) -> &'a ScoreSnapshot {
        self.scores
    }

    pub fn memo(&self) -> &Memo {
        self.memo
    }

    /// Resolution by ids. Unknown groups or columns resolve to 0.
    pub fn resolve_by_id(
        &mut self,
        student_id: &str,
        group_id: &str,
        column_id: &str,
    ) -> Result<f64, ResolveError> {
        match self.rubric.locate(group_id, column_id) {
            Some(addr) => self.resolve(student_id, addr),
            None => Ok(0.0),
        }
    }

    /// Depth-first over bound sources with an explicit frame stack, so chain
    /// length is bounded by the heap rather than the thread stack.
    pub fn resolve(&mut self, student_id: &str, addr: ColumnAddr) -> Result<f64, ResolveError> {
        if let Some(v) = self.memo.lookup(student_id, addr) {
            return v;
        }
        let rubric = self.rubric;
        let mut stack = vec![Frame::new(addr)];
        let mut resolving: HashSet<ColumnAddr> = HashSet::from([addr]);

        while let Some(frame) = stack.last_mut() {
            let column = rubric.column(frame.addr);
            let step = match &column.rule {
                ColumnRule::Score => {
                    Step::Done(self.scores.get(student_id, &column.id).unwrap_or(0.0))
                }
                ColumnRule::Unknown => Step::Done(0.0),
                ColumnRule::Sum(sources) => match sources.get(frame.next) {
                    Some(&source) => {
                        frame.next += 1;
                        Step::Visit(source)
                    }
                    None => Step::Done(frame.sum),
                },
            };

            match step {
                Step::Visit(source) => {
                    if resolving.contains(&source) {
                        let e = self.cycle_error(student_id, &stack, source);
                        return Err(self.fail_all(student_id, &stack, e));
                    }
                    match self.memo.lookup(student_id, source) {
                        Some(Ok(v)) => {
                            if let Some(parent) = stack.last_mut() {
                                parent.sum += v;
                            }
                        }
                        Some(Err(e)) => return Err(self.fail_all(student_id, &stack, e)),
                        None => {
                            resolving.insert(source);
                            stack.push(Frame::new(source));
                        }
                    }
                }
                Step::Done(value) => {
                    let Some(done) = stack.pop() else { break };
                    resolving.remove(&done.addr);
                    self.memo.store(student_id, done.addr, Ok(value));
                    match stack.last_mut() {
                        Some(parent) => parent.sum += value,
                        None => return Ok(value),
                    }
                }
            }
        }
        Ok(0.0)
    }

    fn cycle_error(&self, student_id: &str, stack: &[Frame], addr: ColumnAddr) -> ResolveError {
        let pos = stack.iter().position(|f| f.addr == addr).unwrap_or(0);
        let mut path: Vec<String> = stack[pos..]
            .iter()
            .map(|f| self.rubric.label(f.addr))
            .collect();
        path.push(self.rubric.label(addr));
        tracing::warn!(
            student_id,
            path = %path.join(" -> "),
            "rubric reference cycle"
        );
        ResolveError::CycleDetected {
            group_id: self.rubric.group(addr.group).id.clone(),
            column_id: self.rubric.column(addr).id.clone(),
            path,
        }
    }

    /// Every column still waiting on its sources depends on the failure.
    fn fail_all(&mut self, student_id: &str, stack: &[Frame], e: ResolveError) -> ResolveError {
        for frame in stack {
            self.memo.store(student_id, frame.addr, Err(e.clone()));
        }
        e
    }
}

struct Frame {
    addr: ColumnAddr,
    next: usize,
    sum: f64,
}

impl Frame {
    fn new(addr: ColumnAddr) -> Self {
        Self {
            addr,
            next: 0,
            sum: 0.0,
        }
    }
}

enum Step {
    Visit(ColumnAddr),
    Done(f64),
}

/// Every composite column that cannot be evaluated because of a reference
/// cycle. Cycles are structural, so an empty snapshot is enough.
pub fn find_cycles(rubric: &Rubric) -> Vec<(ColumnAddr, ResolveError)> {
    let scores = ScoreSnapshot::default();
    let mut memo = Memo::new(rubric.fingerprint(), 0);
    let mut resolver = Resolver::new(rubric, &scores, &mut memo);
    rubric
        .composite_columns()
        .filter_map(|addr| resolver.resolve("", addr).err().map(|e| (addr, e)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rubric::tests::sample_rubric;
    use serde_json::json;

    fn resolve_column(
        rubric: &Rubric,
        scores: &ScoreSnapshot,
        student_id: &str,
        group_id: &str,
        column_id: &str,
    ) -> Result<f64, ResolveError> {
        let mut memo = Memo::new(rubric.fingerprint(), 0);
        Resolver::new(rubric, scores, &mut memo).resolve_by_id(student_id, group_id, column_id)
    }

    fn snapshot(entries: &[(&str, &str, f64)]) -> ScoreSnapshot {
        let mut s = ScoreSnapshot::default();
        for (student, column, score) in entries {
            s.insert(student, column, *score);
        }
        s
    }

    #[test]
    fn score_leaf_is_recorded_value_or_zero() {
        let r = sample_rubric();
        let s = snapshot(&[("ann", "hw1", 7.5)]);
        assert_eq!(resolve_column(&r, &s, "ann", "Homework", "hw1"), Ok(7.5));
        assert_eq!(resolve_column(&r, &s, "bob", "Homework", "hw1"), Ok(0.0));
    }

    #[test]
    fn unknown_cells_resolve_to_zero() {
        let r = sample_rubric();
        let s = snapshot(&[("ann", "hw1", 7.0)]);
        assert_eq!(resolve_column(&r, &s, "ann", "Nope", "hw1"), Ok(0.0));
        assert_eq!(resolve_column(&r, &s, "ann", "Homework", "nope"), Ok(0.0));
    }

    #[test]
    fn total_sums_explicit_sources() {
        let r = Rubric::from_value(&json!({
            "groups": [{ "id": "g", "columns": [
                { "id": "a", "maxScore": 10, "type": "score" },
                { "id": "b", "maxScore": 10, "type": "score" },
                { "id": "c", "maxScore": 10, "type": "score" },
                { "id": "t", "maxScore": 20, "type": "total", "sourceColumnIds": ["a", "b", "ghost"] }
            ]}]
        }))
        .expect("load");
        let s = snapshot(&[("ann", "a", 3.25), ("ann", "b", 4.5), ("ann", "c", 9.0)]);
        assert_eq!(resolve_column(&r, &s, "ann", "g", "t"), Ok(7.75));
    }

    #[test]
    fn total_defaults_to_every_score_sibling() {
        // The total is declared before its sources and next to a composite
        // sibling that must not be counted.
        let r = Rubric::from_value(&json!({
            "groups": [{ "id": "g", "columns": [
                { "id": "t", "maxScore": 30, "type": "total" },
                { "id": "a", "maxScore": 10, "type": "score" },
                { "id": "x", "maxScore": 10, "type": "group_sum", "sourceColumnIds": ["a"] },
                { "id": "b", "maxScore": 20, "type": "score" }
            ]}]
        }))
        .expect("load");
        let s = snapshot(&[("ann", "a", 4.0), ("ann", "b", 11.0)]);
        assert_eq!(resolve_column(&r, &s, "ann", "g", "t"), Ok(15.0));
    }

    #[test]
    fn total_may_reference_another_total() {
        let r = Rubric::from_value(&json!({
            "groups": [{ "id": "g", "columns": [
                { "id": "a", "maxScore": 10, "type": "score" },
                { "id": "t1", "maxScore": 10, "type": "total", "sourceColumnIds": ["a"] },
                { "id": "t2", "maxScore": 20, "type": "total", "sourceColumnIds": ["t1", "a"] }
            ]}]
        }))
        .expect("load");
        let s = snapshot(&[("ann", "a", 6.0)]);
        assert_eq!(resolve_column(&r, &s, "ann", "g", "t2"), Ok(12.0));
    }

    #[test]
    fn grand_total_mixes_compound_and_bare_group_sources() {
        let r = Rubric::from_value(&json!({
            "groups": [
                { "id": "g1", "columns": [
                    { "id": "c1", "maxScore": 10, "type": "score" }
                ]},
                { "id": "g2", "columns": [
                    { "id": "q1", "maxScore": 10, "type": "score" },
                    { "id": "q2", "maxScore": 10, "type": "score" },
                    { "id": "g2t", "maxScore": 20, "type": "total" }
                ]},
                { "id": "g3", "columns": [
                    { "id": "bonus", "maxScore": 5, "type": "score" },
                    { "id": "gt", "maxScore": 35, "type": "grand_total",
                      "sourceGroupIds": ["g1:c1", "g2"], "sourceColumnIds": ["bonus"] }
                ]}
            ]
        }))
        .expect("load");
        let s = snapshot(&[
            ("ann", "c1", 5.0),
            ("ann", "q1", 4.0),
            ("ann", "q2", 6.0),
            ("ann", "bonus", 1.5),
        ]);
        assert_eq!(resolve_column(&r, &s, "ann", "g3", "gt"), Ok(16.5));

        let s = snapshot(&[("ann", "c1", 5.0), ("ann", "q1", 4.0), ("ann", "q2", 6.0)]);
        assert_eq!(resolve_column(&r, &s, "ann", "g3", "gt"), Ok(15.0));
    }

    #[test]
    fn external_sum_reads_other_groups_only() {
        let r = Rubric::from_value(&json!({
            "groups": [
                { "id": "lab", "columns": [
                    { "id": "l1", "maxScore": 10, "type": "score" },
                    { "id": "l2", "maxScore": 10, "type": "score" }
                ]},
                { "id": "report", "columns": [
                    { "id": "r1", "maxScore": 10, "type": "score" },
                    { "id": "ext", "maxScore": 20, "type": "external_sum",
                      "externalSourceColumns": ["lab:l1", "lab:l2", "lab:missing", "lab"] }
                ]}
            ]
        }))
        .expect("load");
        let s = snapshot(&[("ann", "l1", 2.0), ("ann", "l2", 3.0), ("ann", "r1", 9.0)]);
        assert_eq!(resolve_column(&r, &s, "ann", "report", "ext"), Ok(5.0));
    }

    #[test]
    fn unknown_type_resolves_to_zero() {
        let r = Rubric::from_value(&json!({
            "groups": [{ "id": "g", "columns": [
                { "id": "a", "maxScore": 10, "type": "score" },
                { "id": "w", "maxScore": 10, "type": "weighted_average" }
            ]}]
        }))
        .expect("load");
        let s = snapshot(&[("ann", "a", 6.0), ("ann", "w", 4.0)]);
        assert_eq!(resolve_column(&r, &s, "ann", "g", "w"), Ok(0.0));
    }

    /// A's total depends on B's grand total, which sums A's total back.
    fn cyclic_rubric() -> Rubric {
        Rubric::from_value(&json!({
            "groups": [
                { "id": "A", "columns": [
                    { "id": "a1", "maxScore": 10, "type": "score" },
                    { "id": "aLink", "maxScore": 10, "type": "group_sum",
                      "sourceGroupIds": ["B:bGrand"] },
                    { "id": "aTotal", "maxScore": 20, "type": "total",
                      "sourceColumnIds": ["a1", "aLink"] }
                ]},
                { "id": "B", "columns": [
                    { "id": "bGrand", "maxScore": 20, "type": "grand_total",
                      "sourceGroupIds": ["A"] }
                ]},
                { "id": "C", "columns": [
                    { "id": "onTop", "maxScore": 20, "type": "external_sum",
                      "externalSourceColumns": ["B:bGrand"] },
                    { "id": "fine", "maxScore": 10, "type": "external_sum",
                      "externalSourceColumns": ["A:a1"] }
                ]}
            ]
        }))
        .expect("load")
    }

    #[test]
    fn mutual_references_report_a_cycle() {
        let r = cyclic_rubric();
        let s = snapshot(&[("ann", "a1", 4.0)]);

        let e = resolve_column(&r, &s, "ann", "A", "aTotal").unwrap_err();
        assert_eq!(
            e,
            ResolveError::CycleDetected {
                group_id: "A".into(),
                column_id: "aTotal".into(),
                path: vec![
                    "A:aTotal".into(),
                    "A:aLink".into(),
                    "B:bGrand".into(),
                    "A:aTotal".into()
                ],
            }
        );
        assert_eq!(e.code(), "cycle_detected");

        let e = resolve_column(&r, &s, "ann", "B", "bGrand").unwrap_err();
        assert!(
            matches!(e, ResolveError::CycleDetected { ref column_id, .. } if column_id == "bGrand")
        );

        // Dependents of a cycle fail too; independent cells keep resolving.
        assert!(resolve_column(&r, &s, "ann", "C", "onTop").is_err());
        assert_eq!(resolve_column(&r, &s, "ann", "C", "fine"), Ok(4.0));
        assert_eq!(resolve_column(&r, &s, "ann", "A", "a1"), Ok(4.0));
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let r = Rubric::from_value(&json!({
            "groups": [{ "id": "g", "columns": [
                { "id": "t", "maxScore": 10, "type": "total", "sourceColumnIds": ["t"] }
            ]}]
        }))
        .expect("load");
        let e = resolve_column(&r, &ScoreSnapshot::default(), "ann", "g", "t").unwrap_err();
        assert_eq!(
            e,
            ResolveError::CycleDetected {
                group_id: "g".into(),
                column_id: "t".into(),
                path: vec!["g:t".into(), "g:t".into()],
            }
        );
    }

    #[test]
    fn find_cycles_lists_every_affected_column() {
        let r = cyclic_rubric();
        let columns: Vec<String> = find_cycles(&r)
            .iter()
            .map(|(addr, _)| r.label(*addr))
            .collect();
        assert_eq!(columns, vec!["A:aLink", "A:aTotal", "B:bGrand", "C:onTop"]);
        assert!(find_cycles(&sample_rubric()).is_empty());
    }

    /// `c{i}` totals `c{i-1}`; with `closed` the first link points at the last.
    fn chain_rubric(len: usize, closed: bool) -> Rubric {
        let first = if closed {
            json!({ "id": "c0", "maxScore": 1, "type": "total",
                    "sourceColumnIds": [format!("c{}", len - 1)] })
        } else {
            json!({ "id": "c0", "maxScore": 1, "type": "score" })
        };
        let mut columns = vec![first];
        for i in 1..len {
            columns.push(json!({
                "id": format!("c{}", i),
                "maxScore": 1,
                "type": "total",
                "sourceColumnIds": [format!("c{}", i - 1)]
            }));
        }
        Rubric::from_value(&json!({ "groups": [{ "id": "g", "columns": columns }] }))
            .expect("load")
    }

    fn on_small_stack<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
        std::thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(f)
            .expect("spawn")
            .join()
            .expect("resolver thread overflowed")
    }

    #[test]
    fn deep_chain_resolves_on_a_small_stack() {
        let r = chain_rubric(20_000, false);
        let (value, cycles, entries) = on_small_stack(move || {
            let s = snapshot(&[("ann", "c0", 1.0)]);
            let mut memo = Memo::new(r.fingerprint(), 0);
            let value = Resolver::new(&r, &s, &mut memo).resolve_by_id("ann", "g", "c19999");
            (value, find_cycles(&r).len(), memo.len())
        });
        assert_eq!(value, Ok(1.0));
        assert_eq!(cycles, 0);
        assert_eq!(entries, 20_000);
    }

    #[test]
    fn long_cycle_is_reported_on_a_small_stack() {
        let r = chain_rubric(5_000, true);
        let (err, cycles) = on_small_stack(move || {
            let e = resolve_column(&r, &ScoreSnapshot::default(), "ann", "g", "c4999");
            (e.err(), find_cycles(&r).len())
        });
        let Some(ResolveError::CycleDetected { column_id, path, .. }) = err else {
            panic!("expected a cycle");
        };
        assert_eq!(column_id, "c4999");
        assert_eq!(path.len(), 5_001);
        assert_eq!(path.first(), path.last());
        assert_eq!(cycles, 5_000);
    }

    #[test]
    fn memo_serves_repeated_lookups() {
        let r = sample_rubric();
        let s = snapshot(&[("ann", "hw1", 7.0), ("ann", "exam1", 15.0)]);
        let grand = r.locate("Summary", "grand").expect("grand");

        let mut memo = Memo::new(r.fingerprint(), 3);
        let mut resolver = Resolver::new(&r, &s, &mut memo);
        assert_eq!(resolver.resolve("ann", grand), Ok(22.0));
        let misses = resolver.memo().misses();
        assert_eq!(resolver.resolve("ann", grand), Ok(22.0));
        assert_eq!(resolver.memo().misses(), misses);
        assert_eq!(resolver.memo().hits(), 1);

        assert!(memo.is_current(r.fingerprint(), 3));
        assert!(!memo.is_current(r.fingerprint(), 4));
        assert!(!memo.is_current("other", 3));
        assert_eq!(memo.len(), 3);
    }
}
