#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One column value. `Null` is the single missing marker; equality,
/// ordering and hashing are total so values can key sets and maps
/// (floats compare via `total_cmp` and hash via their bit pattern).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

/// The variant tag of a [`CellValue`], used as schema metadata for
/// discovery tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Null,
    Bool,
    Int64,
    Float64,
    Utf8,
}

impl CellValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::Int64(_) => ValueKind::Int64,
            Self::Float64(_) => ValueKind::Float64,
            Self::Utf8(_) => ValueKind::Utf8,
        }
    }

    pub fn to_f64(&self) -> Result<f64, ValueError> {
        match self {
            Self::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
            Self::Int64(v) => Ok(*v as f64),
            Self::Float64(v) => Ok(*v),
            Self::Null => Err(ValueError::ValueIsMissing),
            Self::Utf8(v) => Err(ValueError::NonNumericValue { value: v.clone() }),
        }
    }

    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int64(_) | Self::Float64(_))
    }

    /// Domain comparison: numeric values compare across `Int64`/`Float64`,
    /// strings lexicographically, booleans as false < true. Null and
    /// mixed-domain pairs are incomparable. NaN is incomparable here even
    /// though the total `Ord` places it.
    #[must_use]
    pub fn compare_loose(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, _) | (_, Self::Null) => None,
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Utf8(a), Self::Utf8(b)) => Some(a.cmp(b)),
            (a, b) if a.is_numeric() && b.is_numeric() => {
                let (a, b) = (a.to_f64().ok()?, b.to_f64().ok()?);
                a.partial_cmp(&b)
            }
            _ => None,
        }
    }

    fn variant_rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int64(_) => 2,
            Self::Float64(_) => 3,
            Self::Utf8(_) => 4,
        }
    }
}

impl PartialEq for CellValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int64(a), Self::Int64(b)) => a == b,
            (Self::Float64(a), Self::Float64(b)) => a.total_cmp(b) == Ordering::Equal,
            (Self::Utf8(a), Self::Utf8(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for CellValue {}

impl PartialOrd for CellValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CellValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int64(a), Self::Int64(b)) => a.cmp(b),
            (Self::Float64(a), Self::Float64(b)) => a.total_cmp(b),
            (Self::Utf8(a), Self::Utf8(b)) => a.cmp(b),
            _ => self.variant_rank().cmp(&other.variant_rank()),
        }
    }
}

impl Hash for CellValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.variant_rank().hash(state);
        match self {
            Self::Null => {}
            Self::Bool(v) => v.hash(state),
            Self::Int64(v) => v.hash(state),
            Self::Float64(v) => v.to_bits().hash(state),
            Self::Utf8(v) => v.hash(state),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "<null>"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Utf8(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_owned())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("value {value:?} is not numeric")]
    NonNumericValue { value: String },
    #[error("value is missing")]
    ValueIsMissing,
    #[error("unknown aggregation key: {key}")]
    UnknownAggregation { key: String },
}

/// One distinct combination of group-by column values, the identity of
/// an output row. Coordinates are kept sorted by column name so slices
/// have a canonical form for hashing and ordering.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Slice {
    coordinates: BTreeMap<String, CellValue>,
}

impl Slice {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, C>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (C, CellValue)>,
        C: Into<String>,
    {
        Self {
            coordinates: pairs
                .into_iter()
                .map(|(column, value)| (column.into(), value))
                .collect(),
        }
    }

    #[must_use]
    pub fn coordinate(&self, column: &str) -> Option<&CellValue> {
        self.coordinates.get(column)
    }

    #[must_use]
    pub fn with_coordinate(mut self, column: impl Into<String>, value: CellValue) -> Self {
        self.coordinates.insert(column.into(), value);
        self
    }

    pub fn set_coordinate(&mut self, column: impl Into<String>, value: CellValue) {
        self.coordinates.insert(column.into(), value);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.coordinates.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.coordinates.is_empty()
    }

    #[must_use]
    pub fn columns(&self) -> BTreeSet<String> {
        self.coordinates.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CellValue)> {
        self.coordinates.iter()
    }

    /// Keep only coordinates for the named columns.
    #[must_use]
    pub fn restrict(&self, columns: &BTreeSet<String>) -> Self {
        Self {
            coordinates: self
                .coordinates
                .iter()
                .filter(|(column, _)| columns.contains(*column))
                .map(|(column, value)| (column.clone(), value.clone()))
                .collect(),
        }
    }

    /// Union of both coordinate maps; `other` wins on shared columns.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut coordinates = self.coordinates.clone();
        for (column, value) in &other.coordinates {
            coordinates.insert(column.clone(), value.clone());
        }
        Self { coordinates }
    }
}

// Renders as `{a=a1, b=b2}`; the grand-total slice renders as `{}`.
impl fmt::Display for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (idx, (column, value)) in self.coordinates.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{column}={value}")?;
        }
        write!(f, "}}")
    }
}

/// Closed set of leaf aggregations. Each is commutative and associative
/// over the values it folds, so evaluation order never matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    Sum,
    Min,
    Max,
    Count,
    Average,
    First,
}

impl AggregationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Count => "count",
            Self::Average => "average",
            Self::First => "first",
        }
    }
}

impl FromStr for AggregationKind {
    type Err = ValueError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        match key.to_ascii_lowercase().as_str() {
            "sum" => Ok(Self::Sum),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "count" => Ok(Self::Count),
            "average" | "avg" => Ok(Self::Average),
            "first" => Ok(Self::First),
            _ => Err(ValueError::UnknownAggregation {
                key: key.to_owned(),
            }),
        }
    }
}

impl fmt::Display for AggregationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Folding state for one [`AggregationKind`]. Null contributions are
/// skipped; non-numeric contributions to numeric folds are skipped the
/// same way a failed coercion is skipped during group-by.
#[derive(Debug, Clone)]
pub struct Accumulator {
    kind: AggregationKind,
    state: AccumState,
}

#[derive(Debug, Clone)]
enum AccumState {
    Sum {
        int_total: i64,
        float_total: f64,
        all_int: bool,
        seen: bool,
    },
    Extreme {
        current: Option<CellValue>,
    },
    Count {
        n: i64,
    },
    Average {
        total: f64,
        n: i64,
    },
    First {
        value: Option<CellValue>,
    },
}

impl Accumulator {
    #[must_use]
    pub fn new(kind: AggregationKind) -> Self {
        let state = match kind {
            AggregationKind::Sum => AccumState::Sum {
                int_total: 0,
                float_total: 0.0,
                all_int: true,
                seen: false,
            },
            AggregationKind::Min | AggregationKind::Max => {
                AccumState::Extreme { current: None }
            }
            AggregationKind::Count => AccumState::Count { n: 0 },
            AggregationKind::Average => AccumState::Average { total: 0.0, n: 0 },
            AggregationKind::First => AccumState::First { value: None },
        };
        Self { kind, state }
    }

    #[must_use]
    pub fn kind(&self) -> AggregationKind {
        self.kind
    }

    pub fn update(&mut self, value: &CellValue) {
        if value.is_null() {
            return;
        }

        match &mut self.state {
            AccumState::Sum {
                int_total,
                float_total,
                all_int,
                seen,
            } => {
                let Ok(v) = value.to_f64() else { return };
                *float_total += v;
                *seen = true;
                if *all_int {
                    match value {
                        CellValue::Int64(i) => match int_total.checked_add(*i) {
                            Some(next) => *int_total = next,
                            None => *all_int = false,
                        },
                        _ => *all_int = false,
                    }
                }
            }
            AccumState::Extreme { current } => {
                let keep_current = match (current.as_ref(), self.kind) {
                    (None, _) => false,
                    (Some(best), AggregationKind::Min) => {
                        best.compare_loose(value).unwrap_or_else(|| best.cmp(value))
                            != Ordering::Greater
                    }
                    (Some(best), _) => {
                        best.compare_loose(value).unwrap_or_else(|| best.cmp(value))
                            != Ordering::Less
                    }
                };
                if !keep_current {
                    *current = Some(value.clone());
                }
            }
            AccumState::Count { n } => *n += 1,
            AccumState::Average { total, n } => {
                if let Ok(v) = value.to_f64() {
                    *total += v;
                    *n += 1;
                }
            }
            AccumState::First { value: first } => {
                if first.is_none() {
                    *first = Some(value.clone());
                }
            }
        }
    }

    /// Final value, or `None` when nothing non-null was folded in.
    /// An absent result is absence, never a zero.
    #[must_use]
    pub fn finish(self) -> Option<CellValue> {
        match self.state {
            AccumState::Sum {
                int_total,
                float_total,
                all_int,
                seen,
            } => {
                if !seen {
                    None
                } else if all_int {
                    Some(CellValue::Int64(int_total))
                } else {
                    Some(CellValue::Float64(float_total))
                }
            }
            AccumState::Extreme { current } => current,
            AccumState::Count { n } => (n > 0).then_some(CellValue::Int64(n)),
            AccumState::Average { total, n } => {
                (n > 0).then(|| CellValue::Float64(total / n as f64))
            }
            AccumState::First { value } => value,
        }
    }
}
