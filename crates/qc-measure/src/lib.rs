#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use qc_filter::{SliceFilter, ValueMatcher};
use qc_types::{Accumulator, AggregationKind, CellValue, Slice, ValueKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MeasureError {
    #[error("unknown measure: {0}")]
    UnknownMeasure(String),
    #[error("duplicate measure name: {0}")]
    DuplicateMeasure(String),
    #[error("measure {measure} references unknown underlying {underlying}")]
    DanglingUnderlying { measure: String, underlying: String },
    #[error("cyclic measure graph involving: {names}")]
    CyclicGraph { names: String },
    #[error("unknown combination function: {0}")]
    UnknownCombination(String),
    #[error("unknown filter editor: {0}")]
    UnknownEditor(String),
    #[error("unknown decomposition: {0}")]
    UnknownDecomposition(String),
    #[error("unknown bucketer: {0}")]
    UnknownBucketer(String),
    #[error("decomposition {key} synthetic column {column} collides with a physical column it reads")]
    SyntheticColumnCollision { key: String, column: String },
}

/// Gate mode for a Columnator measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnatorMode {
    /// Evaluate only when every gate column has an exact-match constraint.
    HideIfMissing,
    /// Evaluate only when no gate column has an exact-match constraint.
    HideIfPresent,
}

/// Filter rewrite applied by a Shiftor before its underlying step is
/// built. `Pin` replaces all constraints on one column by an equality;
/// `Named` defers to a registered editor closure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SliceEditor {
    Pin { column: String, value: CellValue },
    Named { key: String },
}

/// A named node of the measure forest. `kind` is the closed variant
/// union; underlying measures are referenced by name and resolved
/// eagerly when the forest is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    pub name: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub kind: MeasureKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeasureKind {
    /// Leaf: fold one table column per slice.
    Aggregator {
        column: String,
        aggregation: AggregationKind,
    },
    /// Pure n-ary function of sibling values at one slice.
    Combinator {
        underlyings: Vec<String>,
        combination_key: String,
    },
    /// Expand each underlying value into zero-or-more synthetic
    /// coordinates, re-aggregating collisions.
    Dispatchor {
        underlying: String,
        decomposition_key: String,
        aggregation: AggregationKind,
    },
    /// Combine underlyings at a finer group-by (parent group-by plus the
    /// partition columns), then aggregate back up to the parent slices.
    Partitionor {
        underlyings: Vec<String>,
        partition_columns: BTreeSet<String>,
        aggregation: AggregationKind,
        combination_key: String,
    },
    /// Like Partitionor, but the finer coordinates are produced by a
    /// registered bucketer mapping source columns to bucket columns.
    Bucketor {
        underlyings: Vec<String>,
        bucketer_key: String,
        aggregation: AggregationKind,
        combination_key: String,
    },
    /// AND a fixed extra filter into the step before the underlying runs.
    Filtrator {
        underlying: String,
        filter: SliceFilter,
    },
    /// Rewrite the step's filter context via an editor; values are
    /// reported at the parent's original slice.
    Shiftor {
        underlying: String,
        editor: SliceEditor,
    },
    /// Drop (or with `inverse` keep only) the named columns' constraints
    /// from the filter; values pass through unchanged.
    Unfiltrator {
        underlying: String,
        columns: BTreeSet<String>,
        inverse: bool,
    },
    /// Gate evaluation on exact-match constraints of the named columns.
    Columnator {
        underlying: String,
        columns: BTreeSet<String>,
        mode: ColumnatorMode,
    },
    /// Contributes no slices and no values; also the resolution target
    /// for unknown measure names when the caller opts in.
    Empty,
}

impl Measure {
    pub fn new(name: impl Into<String>, kind: MeasureKind) -> Self {
        Self {
            name: name.into(),
            tags: BTreeSet::new(),
            kind,
        }
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Names of directly referenced underlying measures, in declared order.
    #[must_use]
    pub fn underlying_names(&self) -> Vec<&str> {
        match &self.kind {
            MeasureKind::Aggregator { .. } | MeasureKind::Empty => Vec::new(),
            MeasureKind::Combinator { underlyings, .. }
            | MeasureKind::Partitionor { underlyings, .. }
            | MeasureKind::Bucketor { underlyings, .. } => {
                underlyings.iter().map(String::as_str).collect()
            }
            MeasureKind::Dispatchor { underlying, .. }
            | MeasureKind::Filtrator { underlying, .. }
            | MeasureKind::Shiftor { underlying, .. }
            | MeasureKind::Unfiltrator { underlying, .. }
            | MeasureKind::Columnator { underlying, .. } => vec![underlying.as_str()],
        }
    }
}

/// Validated DAG of named measures. Building the forest checks name
/// uniqueness, resolves every underlying edge and topologically sorts
/// the graph, so step expansion can assume acyclicity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasureForest {
    measures: BTreeMap<String, Measure>,
}

impl MeasureForest {
    #[must_use]
    pub fn builder() -> MeasureForestBuilder {
        MeasureForestBuilder::default()
    }

    pub fn resolve(&self, name: &str) -> Result<&Measure, MeasureError> {
        self.measures
            .get(name)
            .ok_or_else(|| MeasureError::UnknownMeasure(name.to_owned()))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.measures.contains_key(name)
    }

    pub fn measures(&self) -> impl Iterator<Item = &Measure> {
        self.measures.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.measures.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.measures.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct MeasureForestBuilder {
    measures: Vec<Measure>,
}

impl MeasureForestBuilder {
    #[must_use]
    pub fn add_measure(mut self, measure: Measure) -> Self {
        self.measures.push(measure);
        self
    }

    pub fn build(self) -> Result<MeasureForest, MeasureError> {
        let mut measures = BTreeMap::new();
        for measure in self.measures {
            if measures.contains_key(&measure.name) {
                return Err(MeasureError::DuplicateMeasure(measure.name));
            }
            measures.insert(measure.name.clone(), measure);
        }

        for measure in measures.values() {
            for underlying in measure.underlying_names() {
                if !measures.contains_key(underlying) {
                    return Err(MeasureError::DanglingUnderlying {
                        measure: measure.name.clone(),
                        underlying: underlying.to_owned(),
                    });
                }
            }
        }

        topological_check(&measures)?;
        Ok(MeasureForest { measures })
    }
}

/// Kahn's algorithm over underlying-name edges; cycles are a
/// configuration error reported with the residual node names.
fn topological_check(measures: &BTreeMap<String, Measure>) -> Result<(), MeasureError> {
    let mut out_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for measure in measures.values() {
        let underlyings = measure.underlying_names();
        out_degree.insert(measure.name.as_str(), underlyings.len());
        for underlying in underlyings {
            dependents
                .entry(underlying)
                .or_default()
                .push(measure.name.as_str());
        }
    }

    let mut queue: VecDeque<&str> = out_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();

    let mut settled = 0usize;
    while let Some(name) = queue.pop_front() {
        settled += 1;
        if let Some(parents) = dependents.get(name) {
            for parent in parents {
                if let Some(degree) = out_degree.get_mut(parent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(parent);
                    }
                }
            }
        }
    }

    if settled == measures.len() {
        Ok(())
    } else {
        let names = out_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(", ");
        Err(MeasureError::CyclicGraph { names })
    }
}

/// Opaque caller context threaded through one execution; visible to
/// combination functions and named filter editors, never interpreted by
/// the engine.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    pub custom_marker: Option<serde_json::Value>,
}

impl QueryContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_marker(marker: serde_json::Value) -> Self {
        Self {
            custom_marker: Some(marker),
        }
    }
}

pub type CombinationFn =
    Arc<dyn Fn(&[Option<CellValue>], &QueryContext) -> Option<CellValue> + Send + Sync>;
pub type EditorFn = Arc<dyn Fn(&SliceFilter, &QueryContext) -> SliceFilter + Send + Sync>;

/// Expands one (slice, value) pair of its underlying into zero-or-more
/// (coordinate-overrides, value) entries carrying synthetic columns the
/// table never sees.
pub trait Decomposition: Send + Sync {
    /// Physical columns that must be present on the input slice, i.e.
    /// added to the underlying step's group-by.
    fn required_columns(&self) -> BTreeSet<String>;

    /// Columns this decomposition generates. Stripped from underlying
    /// filters and group-bys before the table is queried.
    fn synthetic_columns(&self) -> BTreeSet<String>;

    fn decompose(&self, slice: &Slice, value: &CellValue) -> Vec<(Slice, CellValue)>;

    /// Value kinds of the synthetic columns, for discovery tooling. The
    /// default declares nothing.
    fn column_types(&self) -> BTreeMap<String, ValueKind> {
        BTreeMap::new()
    }

    /// Discovery metadata for one synthetic column: a matcher-filtered
    /// value sample and an estimated cardinality (`-1` when not
    /// estimated). The default says "not estimated, no sample".
    fn coordinates(
        &self,
        _column: &str,
        _matcher: &ValueMatcher,
        _limit: usize,
    ) -> (Vec<CellValue>, i64) {
        (Vec::new(), -1)
    }
}

/// Maps a fine slice to coarser bucket coordinates for a Bucketor.
pub trait SliceBucketer: Send + Sync {
    /// Physical columns the bucketer reads from the fine slice.
    fn source_columns(&self) -> BTreeSet<String>;

    /// Bucket columns the bucketer produces (synthetic).
    fn bucket_columns(&self) -> BTreeSet<String>;

    fn bucket(&self, fine: &Slice) -> Slice;
}

/// Broadcast each input value to a fixed set of coordinates of one
/// synthetic column, the degenerate many-to-many grouping.
pub struct DuplicatingDecomposition {
    pub column: String,
    pub values: Vec<CellValue>,
}

impl Decomposition for DuplicatingDecomposition {
    fn required_columns(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    fn synthetic_columns(&self) -> BTreeSet<String> {
        BTreeSet::from([self.column.clone()])
    }

    fn decompose(&self, _slice: &Slice, value: &CellValue) -> Vec<(Slice, CellValue)> {
        self.values
            .iter()
            .map(|coordinate| {
                (
                    Slice::from_pairs([(self.column.clone(), coordinate.clone())]),
                    value.clone(),
                )
            })
            .collect()
    }

    fn column_types(&self) -> BTreeMap<String, ValueKind> {
        let kind = self
            .values
            .iter()
            .map(CellValue::kind)
            .find(|kind| *kind != ValueKind::Null)
            .unwrap_or(ValueKind::Null);
        BTreeMap::from([(self.column.clone(), kind)])
    }

    fn coordinates(
        &self,
        column: &str,
        matcher: &ValueMatcher,
        limit: usize,
    ) -> (Vec<CellValue>, i64) {
        if column != self.column {
            return (Vec::new(), -1);
        }
        let matching: Vec<CellValue> = self
            .values
            .iter()
            .filter(|value| matcher.matches(value).unwrap_or(false))
            .cloned()
            .collect();
        let cardinality = matching.len() as i64;
        let sample = if limit < 1 {
            matching
        } else {
            matching.into_iter().take(limit).collect()
        };
        (sample, cardinality)
    }
}

/// Split a value between the floor and ceiling integer bins of a
/// fractional source coordinate, with complementary weights.
pub struct LinearBinDecomposition {
    pub source_column: String,
    pub bin_column: String,
}

impl Decomposition for LinearBinDecomposition {
    fn required_columns(&self) -> BTreeSet<String> {
        BTreeSet::from([self.source_column.clone()])
    }

    fn synthetic_columns(&self) -> BTreeSet<String> {
        BTreeSet::from([self.bin_column.clone()])
    }

    fn column_types(&self) -> BTreeMap<String, ValueKind> {
        BTreeMap::from([(self.bin_column.clone(), ValueKind::Int64)])
    }

    fn decompose(&self, slice: &Slice, value: &CellValue) -> Vec<(Slice, CellValue)> {
        let Some(source) = slice.coordinate(&self.source_column) else {
            return Vec::new();
        };
        let Ok(x) = source.to_f64() else {
            return Vec::new();
        };
        let Ok(v) = value.to_f64() else {
            return Vec::new();
        };

        let floor = x.floor();
        let fraction = x - floor;
        let lower_bin = floor as i64;

        let mut out = Vec::with_capacity(2);
        if fraction < 1.0 {
            let weighted = if fraction == 0.0 {
                value.clone()
            } else {
                CellValue::Float64(v * (1.0 - fraction))
            };
            out.push((
                Slice::from_pairs([(self.bin_column.clone(), CellValue::Int64(lower_bin))]),
                weighted,
            ));
        }
        if fraction > 0.0 {
            out.push((
                Slice::from_pairs([(
                    self.bin_column.clone(),
                    CellValue::Int64(lower_bin + 1),
                )]),
                CellValue::Float64(v * fraction),
            ));
        }
        out
    }
}

/// Integer bucketing: `bucket = source mod modulus`. Non-integer source
/// coordinates bucket to null.
pub struct ModuloBucketer {
    pub source_column: String,
    pub bucket_column: String,
    pub modulus: i64,
}

impl SliceBucketer for ModuloBucketer {
    fn source_columns(&self) -> BTreeSet<String> {
        BTreeSet::from([self.source_column.clone()])
    }

    fn bucket_columns(&self) -> BTreeSet<String> {
        BTreeSet::from([self.bucket_column.clone()])
    }

    fn bucket(&self, fine: &Slice) -> Slice {
        let bucket = match fine.coordinate(&self.source_column) {
            Some(CellValue::Int64(v)) if self.modulus != 0 => {
                CellValue::Int64(v.rem_euclid(self.modulus))
            }
            _ => CellValue::Null,
        };
        Slice::from_pairs([(self.bucket_column.clone(), bucket)])
    }
}

/// Named operator store shared by all executions: combination functions,
/// filter editors, decompositions and bucketers. Lookups are
/// case-insensitive on the key.
#[derive(Default, Clone)]
pub struct OperatorRegistry {
    combinations: HashMap<String, CombinationFn>,
    editors: HashMap<String, EditorFn>,
    decompositions: HashMap<String, Arc<dyn Decomposition>>,
    bucketers: HashMap<String, Arc<dyn SliceBucketer>>,
}

impl OperatorRegistry {
    /// Registry pre-loaded with the built-in combination functions:
    /// `sum`, `product`, `subtract`, `divide`, `coalesce`, `min`, `max`.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();

        registry.register_combination("sum", |values, _ctx| {
            fold_aggregation(values, AggregationKind::Sum)
        });
        registry.register_combination("min", |values, _ctx| {
            fold_aggregation(values, AggregationKind::Min)
        });
        registry.register_combination("max", |values, _ctx| {
            fold_aggregation(values, AggregationKind::Max)
        });
        registry.register_combination("product", |values, _ctx| {
            let mut product = 1.0;
            let mut seen = false;
            for value in values.iter().flatten() {
                let v = value.to_f64().ok()?;
                product *= v;
                seen = true;
            }
            seen.then_some(CellValue::Float64(product))
        });
        registry.register_combination("subtract", |values, _ctx| {
            let head = values.first()?.as_ref()?;
            let mut out = head.to_f64().ok()?;
            for value in values.iter().skip(1).flatten() {
                out -= value.to_f64().ok()?;
            }
            Some(CellValue::Float64(out))
        });
        registry.register_combination("divide", |values, _ctx| {
            let numerator = values.first()?.as_ref()?.to_f64().ok()?;
            let denominator = values.get(1)?.as_ref()?.to_f64().ok()?;
            (denominator != 0.0).then(|| CellValue::Float64(numerator / denominator))
        });
        registry.register_combination("coalesce", |values, _ctx| {
            values.iter().flatten().next().cloned()
        });

        registry
    }

    pub fn register_combination<F>(&mut self, key: impl Into<String>, function: F)
    where
        F: Fn(&[Option<CellValue>], &QueryContext) -> Option<CellValue> + Send + Sync + 'static,
    {
        self.combinations
            .insert(normalize_key(&key.into()), Arc::new(function));
    }

    pub fn register_editor<F>(&mut self, key: impl Into<String>, editor: F)
    where
        F: Fn(&SliceFilter, &QueryContext) -> SliceFilter + Send + Sync + 'static,
    {
        self.editors
            .insert(normalize_key(&key.into()), Arc::new(editor));
    }

    /// Fails when a synthetic column collides with a physical column the
    /// decomposition also reads.
    pub fn register_decomposition(
        &mut self,
        key: impl Into<String>,
        decomposition: Arc<dyn Decomposition>,
    ) -> Result<(), MeasureError> {
        let key = normalize_key(&key.into());
        if let Some(collision) = decomposition
            .synthetic_columns()
            .intersection(&decomposition.required_columns())
            .next()
        {
            return Err(MeasureError::SyntheticColumnCollision {
                key,
                column: collision.clone(),
            });
        }
        self.decompositions.insert(key, decomposition);
        Ok(())
    }

    pub fn register_bucketer(&mut self, key: impl Into<String>, bucketer: Arc<dyn SliceBucketer>) {
        self.bucketers.insert(normalize_key(&key.into()), bucketer);
    }

    pub fn combination(&self, key: &str) -> Result<CombinationFn, MeasureError> {
        self.combinations
            .get(&normalize_key(key))
            .cloned()
            .ok_or_else(|| MeasureError::UnknownCombination(key.to_owned()))
    }

    pub fn editor(&self, key: &str) -> Result<EditorFn, MeasureError> {
        self.editors
            .get(&normalize_key(key))
            .cloned()
            .ok_or_else(|| MeasureError::UnknownEditor(key.to_owned()))
    }

    pub fn decomposition(&self, key: &str) -> Result<Arc<dyn Decomposition>, MeasureError> {
        self.decompositions
            .get(&normalize_key(key))
            .cloned()
            .ok_or_else(|| MeasureError::UnknownDecomposition(key.to_owned()))
    }

    pub fn bucketer(&self, key: &str) -> Result<Arc<dyn SliceBucketer>, MeasureError> {
        self.bucketers
            .get(&normalize_key(key))
            .cloned()
            .ok_or_else(|| MeasureError::UnknownBucketer(key.to_owned()))
    }
}

fn normalize_key(key: &str) -> String {
    key.to_ascii_lowercase()
}

fn fold_aggregation(values: &[Option<CellValue>], kind: AggregationKind) -> Option<CellValue> {
    let mut accumulator = Accumulator::new(kind);
    for value in values.iter().flatten() {
        accumulator.update(value);
    }
    accumulator.finish()
}

impl SliceEditor {
    /// Resolve and apply this editor to a filter.
    pub fn apply(
        &self,
        filter: &SliceFilter,
        registry: &OperatorRegistry,
        context: &QueryContext,
    ) -> Result<SliceFilter, MeasureError> {
        match self {
            Self::Pin { column, value } => Ok(filter.pin(column, value.clone())),
            Self::Named { key } => Ok(registry.editor(key)?(filter, context)),
        }
    }
}
