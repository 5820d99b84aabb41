#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use qc_types::{CellValue, Slice};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A full row as seen by filter evaluation: column name to value.
pub type Row = BTreeMap<String, CellValue>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("invalid pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },
}

/// Predicate over a single column value. `matches` is pure and total;
/// null handling is fixed per variant: `Equals`, `In`, `Like`, `Regex`
/// and `Comparing` never match null, `Null` matches only null, and
/// `Same` is plain total equality (null matches null).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueMatcher {
    Equals { operand: CellValue },
    In { operands: BTreeSet<CellValue> },
    Null,
    Like { pattern: String },
    Regex { pattern: String },
    Comparing {
        operand: CellValue,
        greater_than: bool,
        match_if_equal: bool,
    },
    Same { operand: CellValue },
    And { operands: Vec<ValueMatcher> },
    Or { operands: Vec<ValueMatcher> },
    Not { negated: Box<ValueMatcher> },
}

impl ValueMatcher {
    pub fn equals(operand: impl Into<CellValue>) -> Self {
        Self::Equals {
            operand: operand.into(),
        }
    }

    pub fn is_in<I, V>(operands: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<CellValue>,
    {
        Self::In {
            operands: operands.into_iter().map(Into::into).collect(),
        }
    }

    pub fn like(pattern: impl Into<String>) -> Self {
        Self::Like {
            pattern: pattern.into(),
        }
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self::Regex {
            pattern: pattern.into(),
        }
    }

    pub fn greater_than(operand: impl Into<CellValue>) -> Self {
        Self::Comparing {
            operand: operand.into(),
            greater_than: true,
            match_if_equal: false,
        }
    }

    pub fn at_least(operand: impl Into<CellValue>) -> Self {
        Self::Comparing {
            operand: operand.into(),
            greater_than: true,
            match_if_equal: true,
        }
    }

    pub fn lower_than(operand: impl Into<CellValue>) -> Self {
        Self::Comparing {
            operand: operand.into(),
            greater_than: false,
            match_if_equal: false,
        }
    }

    pub fn at_most(operand: impl Into<CellValue>) -> Self {
        Self::Comparing {
            operand: operand.into(),
            greater_than: false,
            match_if_equal: true,
        }
    }

    pub fn same(operand: impl Into<CellValue>) -> Self {
        Self::Same {
            operand: operand.into(),
        }
    }

    #[must_use]
    pub fn and(operands: Vec<ValueMatcher>) -> Self {
        Self::And { operands }
    }

    #[must_use]
    pub fn or(operands: Vec<ValueMatcher>) -> Self {
        Self::Or { operands }
    }

    #[must_use]
    pub fn negate(self) -> Self {
        match self {
            Self::Not { negated } => *negated,
            other => Self::Not {
                negated: Box::new(other),
            },
        }
    }

    pub fn matches(&self, value: &CellValue) -> Result<bool, FilterError> {
        match self {
            Self::Equals { operand } => {
                Ok(!value.is_null() && !operand.is_null() && value == operand)
            }
            Self::In { operands } => Ok(!value.is_null() && operands.contains(value)),
            Self::Null => Ok(value.is_null()),
            Self::Like { pattern } => match value {
                CellValue::Utf8(text) => Ok(compile_like(pattern)?.is_match(text)),
                _ => Ok(false),
            },
            Self::Regex { pattern } => match value {
                CellValue::Utf8(text) => Ok(compile_regex(pattern)?.is_match(text)),
                _ => Ok(false),
            },
            Self::Comparing {
                operand,
                greater_than,
                match_if_equal,
            } => Ok(match value.compare_loose(operand) {
                None => false,
                Some(std::cmp::Ordering::Equal) => *match_if_equal,
                Some(std::cmp::Ordering::Greater) => *greater_than,
                Some(std::cmp::Ordering::Less) => !*greater_than,
            }),
            Self::Same { operand } => Ok(value == operand),
            Self::And { operands } => {
                for operand in operands {
                    if !operand.matches(value)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Or { operands } => {
                for operand in operands {
                    if operand.matches(value)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Not { negated } => Ok(!negated.matches(value)?),
        }
    }
}

/// Translate a SQL-style LIKE pattern (`%` any run, `_` one character)
/// into an anchored regex.
fn compile_like(pattern: &str) -> Result<Regex, FilterError> {
    let mut translated = String::with_capacity(pattern.len() + 4);
    translated.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => translated.push_str(".*"),
            '_' => translated.push('.'),
            other => translated.push_str(&regex::escape(&other.to_string())),
        }
    }
    translated.push('$');
    compile_regex(&translated)
}

fn compile_regex(pattern: &str) -> Result<Regex, FilterError> {
    Regex::new(pattern).map_err(|err| FilterError::InvalidPattern {
        pattern: pattern.to_owned(),
        message: err.to_string(),
    })
}

/// One column constrained by a [`ValueMatcher`]. `null_if_absent`
/// (default true) makes a missing row column evaluate as null.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnFilter {
    pub column: String,
    pub matcher: ValueMatcher,
    pub null_if_absent: bool,
}

/// Boolean predicate over a full row. Constructed only through the
/// normalizing `and` / `or` / `not` constructors, so two filters with
/// the same meaning built from operands in a different order compare
/// equal (operand lists are sorted and deduplicated, absorption and
/// flattening applied, same-column Equals/In constraints intersected).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SliceFilter {
    MatchAll,
    MatchNone,
    Column(ColumnFilter),
    And { operands: Vec<SliceFilter> },
    Or { operands: Vec<SliceFilter> },
    Not { negated: Box<SliceFilter> },
}

impl Default for SliceFilter {
    fn default() -> Self {
        Self::MatchAll
    }
}

impl SliceFilter {
    pub fn column(column: impl Into<String>, matcher: ValueMatcher) -> Self {
        Self::Column(ColumnFilter {
            column: column.into(),
            matcher,
            null_if_absent: true,
        })
    }

    pub fn column_strict_absent(column: impl Into<String>, matcher: ValueMatcher) -> Self {
        Self::Column(ColumnFilter {
            column: column.into(),
            matcher,
            null_if_absent: false,
        })
    }

    pub fn equals(column: impl Into<String>, value: impl Into<CellValue>) -> Self {
        Self::column(column, ValueMatcher::equals(value))
    }

    pub fn is_in<I, V>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<CellValue>,
    {
        Self::column(column, ValueMatcher::is_in(values))
    }

    /// Conjunction. `and([]) == MatchAll`; any `MatchNone` operand
    /// absorbs; nested `And`s flatten; same-column Equals/In constraints
    /// intersect eagerly, with other matchers on a packed column applied
    /// by literal evaluation to narrow the intersection further.
    pub fn and(operands: impl IntoIterator<Item = SliceFilter>) -> Self {
        let mut flat = Vec::new();
        if flatten_and(operands, &mut flat).is_none() {
            return Self::MatchNone;
        }

        let mut packs: BTreeMap<String, ColumnPack> = BTreeMap::new();
        let mut rest = Vec::new();

        for operand in flat {
            match operand {
                Self::Column(cf) => packs.entry(cf.column.clone()).or_default().push(cf),
                other => rest.push(other),
            }
        }

        let mut out = rest;
        for (column, pack) in packs {
            match pack.settle(&column) {
                Settled::None => return Self::MatchNone,
                Settled::Filters(filters) => out.extend(filters),
            }
        }

        out.sort();
        out.dedup();

        match out.len() {
            0 => Self::MatchAll,
            1 => out.pop().unwrap_or(Self::MatchAll),
            _ => Self::And { operands: out },
        }
    }

    /// Disjunction, dual of [`SliceFilter::and`]. `or([]) == MatchNone`;
    /// any `MatchAll` operand absorbs; nested `Or`s flatten.
    pub fn or(operands: impl IntoIterator<Item = SliceFilter>) -> Self {
        let mut flat = Vec::new();
        if flatten_or(operands, &mut flat).is_none() {
            return Self::MatchAll;
        }

        flat.sort();
        flat.dedup();

        match flat.len() {
            0 => Self::MatchNone,
            1 => flat.pop().unwrap_or(Self::MatchNone),
            _ => Self::Or { operands: flat },
        }
    }

    /// Negation with double-negation elimination.
    #[must_use]
    pub fn not(filter: SliceFilter) -> Self {
        match filter {
            Self::MatchAll => Self::MatchNone,
            Self::MatchNone => Self::MatchAll,
            Self::Not { negated } => *negated,
            other => Self::Not {
                negated: Box::new(other),
            },
        }
    }

    #[must_use]
    pub fn is_match_all(&self) -> bool {
        matches!(self, Self::MatchAll)
    }

    #[must_use]
    pub fn is_match_none(&self) -> bool {
        matches!(self, Self::MatchNone)
    }

    pub fn matches(&self, row: &Row) -> Result<bool, FilterError> {
        self.matches_with(&|column| row.get(column))
    }

    pub fn matches_slice(&self, slice: &Slice) -> Result<bool, FilterError> {
        self.matches_with(&|column| slice.coordinate(column))
    }

    fn matches_with<'v>(
        &self,
        lookup: &dyn Fn(&str) -> Option<&'v CellValue>,
    ) -> Result<bool, FilterError> {
        match self {
            Self::MatchAll => Ok(true),
            Self::MatchNone => Ok(false),
            Self::Column(cf) => match lookup(&cf.column) {
                Some(value) => cf.matcher.matches(value),
                None if cf.null_if_absent => cf.matcher.matches(&CellValue::Null),
                None => Ok(false),
            },
            Self::And { operands } => {
                for operand in operands {
                    if !operand.matches_with(lookup)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Or { operands } => {
                for operand in operands {
                    if operand.matches_with(lookup)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Not { negated } => Ok(!negated.matches_with(lookup)?),
        }
    }

    /// All column names mentioned anywhere in the tree.
    #[must_use]
    pub fn constrained_columns(&self) -> BTreeSet<String> {
        let mut columns = BTreeSet::new();
        self.collect_columns(&mut columns);
        columns
    }

    fn collect_columns(&self, columns: &mut BTreeSet<String>) {
        match self {
            Self::MatchAll | Self::MatchNone => {}
            Self::Column(cf) => {
                columns.insert(cf.column.clone());
            }
            Self::And { operands } | Self::Or { operands } => {
                for operand in operands {
                    operand.collect_columns(columns);
                }
            }
            Self::Not { negated } => negated.collect_columns(columns),
        }
    }

    /// The exact-match value a conjunctive context pins `column` to, if
    /// any. Only top-level `And`/`Column` positions count; values under
    /// `Or` or `Not` do not pin anything.
    #[must_use]
    pub fn equality_value(&self, column: &str) -> Option<&CellValue> {
        match self {
            Self::Column(cf) if cf.column == column => match &cf.matcher {
                ValueMatcher::Equals { operand } => Some(operand),
                _ => None,
            },
            Self::And { operands } => operands
                .iter()
                .find_map(|operand| operand.equality_value(column)),
            _ => None,
        }
    }

    /// The finite value set a conjunctive context restricts `column` to
    /// (Equals or In), if any.
    #[must_use]
    pub fn enumerable_values(&self, column: &str) -> Option<Vec<CellValue>> {
        match self {
            Self::Column(cf) if cf.column == column => match &cf.matcher {
                ValueMatcher::Equals { operand } => Some(vec![operand.clone()]),
                ValueMatcher::In { operands } => Some(operands.iter().cloned().collect()),
                _ => None,
            },
            Self::And { operands } => operands
                .iter()
                .find_map(|operand| operand.enumerable_values(column)),
            _ => None,
        }
    }

    /// Widen the filter by removing every constraint on the named
    /// columns. Removal respects polarity: a dropped constraint becomes
    /// `MatchAll` in positive position and `MatchNone` under a `Not`,
    /// so the result only ever widens.
    #[must_use]
    pub fn without_columns(&self, columns: &BTreeSet<String>) -> Self {
        self.strip(&|column| columns.contains(column), true)
    }

    /// Keep only constraints on the named columns; everything else is
    /// removed under the same polarity rules as `without_columns`.
    #[must_use]
    pub fn retain_columns(&self, columns: &BTreeSet<String>) -> Self {
        self.strip(&|column| !columns.contains(column), true)
    }

    fn strip(&self, dropped: &dyn Fn(&str) -> bool, positive: bool) -> Self {
        match self {
            Self::MatchAll | Self::MatchNone => self.clone(),
            Self::Column(cf) => {
                if dropped(&cf.column) {
                    if positive {
                        Self::MatchAll
                    } else {
                        Self::MatchNone
                    }
                } else {
                    self.clone()
                }
            }
            Self::And { operands } => Self::and(
                operands
                    .iter()
                    .map(|operand| operand.strip(dropped, positive)),
            ),
            Self::Or { operands } => Self::or(
                operands
                    .iter()
                    .map(|operand| operand.strip(dropped, positive)),
            ),
            Self::Not { negated } => Self::not(negated.strip(dropped, !positive)),
        }
    }

    /// Replace all constraints on `column` by a single equality.
    #[must_use]
    pub fn pin(&self, column: &str, value: CellValue) -> Self {
        let mut dropped = BTreeSet::new();
        dropped.insert(column.to_owned());
        Self::and([
            self.without_columns(&dropped),
            Self::equals(column, value),
        ])
    }
}

/// Flattens into `out`; `None` signals a `MatchNone` operand (caller
/// short-circuits the whole conjunction).
fn flatten_and(
    operands: impl IntoIterator<Item = SliceFilter>,
    out: &mut Vec<SliceFilter>,
) -> Option<()> {
    for operand in operands {
        match operand {
            SliceFilter::MatchNone => return None,
            SliceFilter::MatchAll => {}
            SliceFilter::And { operands } => flatten_and(operands, out)?,
            other => out.push(other),
        }
    }
    Some(())
}

/// Dual of `flatten_and`; `None` signals a `MatchAll` operand.
fn flatten_or(
    operands: impl IntoIterator<Item = SliceFilter>,
    out: &mut Vec<SliceFilter>,
) -> Option<()> {
    for operand in operands {
        match operand {
            SliceFilter::MatchAll => return None,
            SliceFilter::MatchNone => {}
            SliceFilter::Or { operands } => flatten_or(operands, out)?,
            other => out.push(other),
        }
    }
    Some(())
}

/// All conjunctive constraints gathered for one column during `and`
/// normalization.
#[derive(Default)]
struct ColumnPack {
    candidates: Option<BTreeSet<CellValue>>,
    others: Vec<ColumnFilter>,
}

enum Settled {
    None,
    Filters(Vec<SliceFilter>),
}

impl ColumnPack {
    fn push(&mut self, cf: ColumnFilter) {
        match &cf.matcher {
            ValueMatcher::Equals { operand } => {
                let mut set = BTreeSet::new();
                set.insert(operand.clone());
                self.intersect(set);
            }
            ValueMatcher::In { operands } => self.intersect(operands.clone()),
            _ => self.others.push(cf),
        }
    }

    fn intersect(&mut self, set: BTreeSet<CellValue>) {
        self.candidates = Some(match self.candidates.take() {
            None => set,
            Some(current) => current.intersection(&set).cloned().collect(),
        });
    }

    fn settle(self, column: &str) -> Settled {
        let Some(mut candidates) = self.candidates else {
            // No packable constraint on this column; keep the rest verbatim.
            return Settled::Filters(
                self.others.into_iter().map(SliceFilter::Column).collect(),
            );
        };

        // Non-packable matchers on a packed column narrow the candidate
        // set by literal evaluation. A matcher that fails to evaluate
        // (bad pattern) is retained instead, deferring the error to
        // evaluation time.
        let mut retained = Vec::new();
        for cf in self.others {
            let mut narrowed = BTreeSet::new();
            let mut evaluable = true;
            for value in &candidates {
                match cf.matcher.matches(value) {
                    Ok(true) => {
                        narrowed.insert(value.clone());
                    }
                    Ok(false) => {}
                    Err(_) => {
                        evaluable = false;
                        break;
                    }
                }
            }
            if evaluable {
                candidates = narrowed;
            } else {
                retained.push(SliceFilter::Column(cf));
            }
        }

        if candidates.is_empty() {
            return Settled::None;
        }

        let packed = if candidates.len() == 1 {
            SliceFilter::equals(
                column,
                candidates.into_iter().next().unwrap_or(CellValue::Null),
            )
        } else {
            SliceFilter::column(column, ValueMatcher::In {
                operands: candidates,
            })
        };

        retained.push(packed);
        Settled::Filters(retained)
    }
}
