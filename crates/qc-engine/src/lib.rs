#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use qc_filter::{FilterError, SliceFilter};
use qc_measure::{
    ColumnatorMode, CombinationFn, Decomposition, MeasureError, MeasureForest, MeasureKind,
    OperatorRegistry, QueryContext, SliceBucketer, SliceEditor,
};
use qc_table::{AggregationRequest, TableError, TableQuery, TableSource};
use qc_types::{Accumulator, AggregationKind, CellValue, Slice};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown measure: {0}")]
    UnknownMeasure(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Table(#[from] TableError),
}

impl From<MeasureError> for EngineError {
    fn from(err: MeasureError) -> Self {
        match err {
            MeasureError::UnknownMeasure(name) => Self::UnknownMeasure(name),
            other => Self::Configuration(other.to_string()),
        }
    }
}

/// Named execution flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct QueryOptions {
    /// Resolve unknown top-level measure names to an empty measure
    /// instead of failing the query.
    pub unknown_measures_are_empty: bool,
    /// Diagnostic: one table query per aggregator leaf instead of
    /// merging leaves that share filter and group-by.
    pub disable_aggregator_induction: bool,
    /// Retain every intermediate step's sliced column in the output.
    pub return_underlying_measures: bool,
    /// Emit the expanded DAG and generated table queries as tracing
    /// debug events, and carry the table queries in the output.
    pub explain: bool,
}

/// One top-level ad-hoc query: requested measures, group-by columns and
/// a row filter, plus options and the opaque caller marker.
#[derive(Debug, Clone, Default)]
pub struct CubeQuery {
    pub measures: Vec<String>,
    pub group_by: BTreeSet<String>,
    pub filter: SliceFilter,
    pub options: QueryOptions,
    pub custom_marker: Option<serde_json::Value>,
}

impl CubeQuery {
    pub fn new<I, M>(measures: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<String>,
    {
        Self {
            measures: measures.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn grouped_by<I, C>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        self.group_by.extend(columns.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn filtered(mut self, filter: SliceFilter) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_marker(mut self, marker: serde_json::Value) -> Self {
        self.custom_marker = Some(marker);
        self
    }
}

/// Identity of one DAG node: (filter, group-by, measure name). Equal
/// steps are computed at most once per execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryStep {
    pub filter: SliceFilter,
    pub group_by: BTreeSet<String>,
    pub measure: String,
}

impl QueryStep {
    fn new(filter: SliceFilter, group_by: BTreeSet<String>, measure: impl Into<String>) -> Self {
        Self {
            filter,
            group_by,
            measure: measure.into(),
        }
    }

    /// Human-readable step identity, used as the key for retained
    /// underlying columns and in explain events.
    #[must_use]
    pub fn label(&self) -> String {
        let group_by = self.group_by.iter().cloned().collect::<Vec<_>>().join(",");
        format!("{} @ [{}] where {:?}", self.measure, group_by, self.filter)
    }
}

impl fmt::Display for QueryStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Slice-to-value mapping produced by exactly one step; shared read-only
/// by dependent steps within the execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlicedColumn {
    values: BTreeMap<Slice, CellValue>,
}

impl SlicedColumn {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, slice: Slice, value: CellValue) {
        self.values.insert(slice, value);
    }

    #[must_use]
    pub fn value(&self, slice: &Slice) -> Option<&CellValue> {
        self.values.get(slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Slice, &CellValue)> {
        self.values.iter()
    }

    pub fn slices(&self) -> impl Iterator<Item = &Slice> {
        self.values.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Final tabular view: one row per slice present for at least one
/// requested measure. A measure with no value at a slice is absent
/// there, never zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CubeView {
    measures: Vec<String>,
    cells: BTreeMap<Slice, BTreeMap<String, CellValue>>,
}

impl CubeView {
    #[must_use]
    pub fn measure_names(&self) -> &[String] {
        &self.measures
    }

    #[must_use]
    pub fn value(&self, slice: &Slice, measure: &str) -> Option<&CellValue> {
        self.cells.get(slice).and_then(|row| row.get(measure))
    }

    pub fn slices(&self) -> impl Iterator<Item = &Slice> {
        self.cells.keys()
    }

    pub fn rows(&self) -> impl Iterator<Item = (&Slice, &BTreeMap<String, CellValue>)> {
        self.cells.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Per-execution instrumentation; the evaluation-count hook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStats {
    /// Distinct steps in the expanded DAG.
    pub expanded_steps: usize,
    /// Steps whose column was materialized (each at most once).
    pub evaluated_steps: usize,
    /// Physical queries sent to the table boundary.
    pub table_queries: usize,
}

/// Everything one execution returns.
#[derive(Debug, Clone, Default)]
pub struct QueryOutput {
    pub view: CubeView,
    pub stats: ExecutionStats,
    /// Intermediate columns keyed by step label; populated only with
    /// `return_underlying_measures`.
    pub underlying: BTreeMap<String, SlicedColumn>,
    /// Generated table queries; populated only with `explain`.
    pub table_queries: Vec<TableQuery>,
}

/// The engine: a validated measure forest plus the operator registry.
/// Immutable during execution; independent executions may share it.
pub struct CubeEngine {
    forest: MeasureForest,
    registry: OperatorRegistry,
}

impl CubeEngine {
    #[must_use]
    pub fn new(forest: MeasureForest, registry: OperatorRegistry) -> Self {
        Self { forest, registry }
    }

    #[must_use]
    pub fn forest(&self) -> &MeasureForest {
        &self.forest
    }

    #[must_use]
    pub fn registry(&self) -> &OperatorRegistry {
        &self.registry
    }

    /// Run one query against a table boundary. All errors surface here;
    /// there is no partial-result mode.
    pub fn execute(
        &self,
        table: &dyn TableSource,
        query: &CubeQuery,
    ) -> Result<QueryOutput, EngineError> {
        let mut execution = Execution {
            engine: self,
            table,
            context: match &query.custom_marker {
                Some(marker) => QueryContext::with_marker(marker.clone()),
                None => QueryContext::new(),
            },
            options: query.options,
            plans: HashMap::new(),
            columns: HashMap::new(),
            leaves: Vec::new(),
            table_queries: Vec::new(),
            stats: ExecutionStats::default(),
        };

        // Re-running the constructor normalizes filters assembled from
        // raw enum variants.
        let filter = SliceFilter::and([query.filter.clone()]);

        let mut roots = Vec::with_capacity(query.measures.len());
        for measure in &query.measures {
            let step = QueryStep::new(filter.clone(), query.group_by.clone(), measure.clone());
            execution.expand_root(&step)?;
            roots.push((measure.clone(), step));
        }

        execution.run_table_phase()?;

        let mut cells: BTreeMap<Slice, BTreeMap<String, CellValue>> = BTreeMap::new();
        for (measure, step) in &roots {
            let column = execution.evaluate(step)?;
            for (slice, value) in column.iter() {
                cells
                    .entry(slice.clone())
                    .or_default()
                    .insert(measure.clone(), value.clone());
            }
        }

        let underlying = if query.options.return_underlying_measures {
            execution
                .columns
                .iter()
                .map(|(step, column)| (step.label(), (**column).clone()))
                .collect()
        } else {
            BTreeMap::new()
        };

        Ok(QueryOutput {
            view: CubeView {
                measures: query.measures.clone(),
                cells,
            },
            stats: execution.stats,
            underlying,
            table_queries: if query.options.explain {
                execution.table_queries
            } else {
                Vec::new()
            },
        })
    }
}

/// How one step turns its materialized underlyings into its own column.
#[derive(Clone)]
enum Transform {
    /// Aggregator leaf; materialized by the table phase.
    Leaf { request: AggregationRequest },
    /// Single underlying passed through unchanged.
    Identity,
    /// No slices, no values.
    Nothing,
    Combine {
        function: CombinationFn,
    },
    Dispatch {
        decomposition: Arc<dyn Decomposition>,
        aggregation: AggregationKind,
        parent_group_by: BTreeSet<String>,
        synthetic_filter: SliceFilter,
    },
    PartitionCombine {
        function: CombinationFn,
        aggregation: AggregationKind,
        parent_group_by: BTreeSet<String>,
    },
    BucketCombine {
        function: CombinationFn,
        aggregation: AggregationKind,
        bucketer: Arc<dyn SliceBucketer>,
        parent_group_by: BTreeSet<String>,
        bucket_filter: SliceFilter,
    },
    /// Shifted pin over a grouped column: re-attach the parent
    /// coordinate to every underlying slice.
    ShiftRemap {
        column: String,
        parent_values: Vec<CellValue>,
    },
}

#[derive(Clone)]
struct StepPlan {
    underlyings: Vec<QueryStep>,
    transform: Transform,
}

/// Per-query state: the deduplicated step plans, the append-only column
/// store, and instrumentation. Discarded when `execute` returns.
struct Execution<'a> {
    engine: &'a CubeEngine,
    table: &'a dyn TableSource,
    context: QueryContext,
    options: QueryOptions,
    plans: HashMap<QueryStep, StepPlan>,
    columns: HashMap<QueryStep, Arc<SlicedColumn>>,
    leaves: Vec<QueryStep>,
    table_queries: Vec<TableQuery>,
    stats: ExecutionStats,
}

impl Execution<'_> {
    /// Expand a directly requested step. Unknown names resolve to the
    /// empty measure only here, never for underlying references.
    fn expand_root(&mut self, step: &QueryStep) -> Result<(), EngineError> {
        if !self.engine.forest.contains(&step.measure) {
            if self.options.unknown_measures_are_empty {
                if !self.plans.contains_key(step) {
                    self.stats.expanded_steps += 1;
                    self.plans.insert(
                        step.clone(),
                        StepPlan {
                            underlyings: Vec::new(),
                            transform: Transform::Nothing,
                        },
                    );
                }
                return Ok(());
            }
            return Err(EngineError::UnknownMeasure(step.measure.clone()));
        }
        self.expand(step)
    }

    fn expand(&mut self, step: &QueryStep) -> Result<(), EngineError> {
        if self.plans.contains_key(step) {
            return Ok(());
        }
        self.stats.expanded_steps += 1;

        let plan = self.plan_step(step)?;
        if self.options.explain {
            tracing::debug!(
                target: "querycube::explain",
                step = %step,
                underlyings = plan.underlyings.len(),
                "expanded step"
            );
        }

        if matches!(plan.transform, Transform::Leaf { .. }) {
            self.leaves.push(step.clone());
        }

        let underlyings = plan.underlyings.clone();
        self.plans.insert(step.clone(), plan);
        for underlying in &underlyings {
            self.expand(underlying)?;
        }
        Ok(())
    }

    /// The per-variant expansion strategy: underlying steps (possibly at
    /// rewritten filter/group-by) plus the transform applied later.
    fn plan_step(&mut self, step: &QueryStep) -> Result<StepPlan, EngineError> {
        let measure = self.engine.forest.resolve(&step.measure)?;
        let registry = &self.engine.registry;

        let plan = match &measure.kind {
            MeasureKind::Aggregator {
                column,
                aggregation,
            } => StepPlan {
                underlyings: Vec::new(),
                transform: Transform::Leaf {
                    request: AggregationRequest::new(column.clone(), *aggregation),
                },
            },
            MeasureKind::Empty => StepPlan {
                underlyings: Vec::new(),
                transform: Transform::Nothing,
            },
            MeasureKind::Combinator {
                underlyings,
                combination_key,
            } => StepPlan {
                underlyings: underlyings
                    .iter()
                    .map(|name| {
                        QueryStep::new(step.filter.clone(), step.group_by.clone(), name.clone())
                    })
                    .collect(),
                transform: Transform::Combine {
                    function: registry.combination(combination_key)?,
                },
            },
            MeasureKind::Filtrator { underlying, filter } => StepPlan {
                underlyings: vec![QueryStep::new(
                    SliceFilter::and([step.filter.clone(), filter.clone()]),
                    step.group_by.clone(),
                    underlying.clone(),
                )],
                transform: Transform::Identity,
            },
            MeasureKind::Unfiltrator {
                underlying,
                columns,
                inverse,
            } => {
                let widened = if *inverse {
                    step.filter.retain_columns(columns)
                } else {
                    step.filter.without_columns(columns)
                };
                StepPlan {
                    underlyings: vec![QueryStep::new(
                        widened,
                        step.group_by.clone(),
                        underlying.clone(),
                    )],
                    transform: Transform::Identity,
                }
            }
            MeasureKind::Columnator {
                underlying,
                columns,
                mode,
            } => {
                let present = |column: &String| step.filter.equality_value(column).is_some();
                let open = match mode {
                    ColumnatorMode::HideIfMissing => columns.iter().all(present),
                    ColumnatorMode::HideIfPresent => !columns.iter().any(present),
                };
                if open {
                    StepPlan {
                        underlyings: vec![QueryStep::new(
                            step.filter.clone(),
                            step.group_by.clone(),
                            underlying.clone(),
                        )],
                        transform: Transform::Identity,
                    }
                } else {
                    StepPlan {
                        underlyings: Vec::new(),
                        transform: Transform::Nothing,
                    }
                }
            }
            MeasureKind::Shiftor { underlying, editor } => match editor {
                SliceEditor::Pin { column, value } if step.group_by.contains(column) => {
                    let shifted = step.filter.pin(column, value.clone());
                    let mut group_by = step.group_by.clone();
                    group_by.remove(column);
                    let parent_values = step
                        .filter
                        .enumerable_values(column)
                        .unwrap_or_else(|| vec![value.clone()]);
                    StepPlan {
                        underlyings: vec![QueryStep::new(shifted, group_by, underlying.clone())],
                        transform: Transform::ShiftRemap {
                            column: column.clone(),
                            parent_values,
                        },
                    }
                }
                editor => {
                    let shifted = editor.apply(&step.filter, registry, &self.context)?;
                    StepPlan {
                        underlyings: vec![QueryStep::new(
                            shifted,
                            step.group_by.clone(),
                            underlying.clone(),
                        )],
                        transform: Transform::Identity,
                    }
                }
            },
            MeasureKind::Dispatchor {
                underlying,
                decomposition_key,
                aggregation,
            } => {
                let decomposition = registry.decomposition(decomposition_key)?;
                let synthetic = decomposition.synthetic_columns();
                let required = decomposition.required_columns();

                let mut group_by: BTreeSet<String> = step
                    .group_by
                    .difference(&synthetic)
                    .cloned()
                    .collect();
                group_by.extend(required);

                let widened = step.filter.without_columns(&synthetic);
                let synthetic_filter = step.filter.retain_columns(&synthetic);
                check_column_split(&step.filter, &widened, &synthetic_filter, &step.measure)?;

                StepPlan {
                    underlyings: vec![QueryStep::new(widened, group_by, underlying.clone())],
                    transform: Transform::Dispatch {
                        synthetic_filter,
                        decomposition,
                        aggregation: *aggregation,
                        parent_group_by: step.group_by.clone(),
                    },
                }
            }
            MeasureKind::Partitionor {
                underlyings,
                partition_columns,
                aggregation,
                combination_key,
            } => {
                let mut fine = step.group_by.clone();
                fine.extend(partition_columns.iter().cloned());
                StepPlan {
                    underlyings: underlyings
                        .iter()
                        .map(|name| {
                            QueryStep::new(step.filter.clone(), fine.clone(), name.clone())
                        })
                        .collect(),
                    transform: Transform::PartitionCombine {
                        function: registry.combination(combination_key)?,
                        aggregation: *aggregation,
                        parent_group_by: step.group_by.clone(),
                    },
                }
            }
            MeasureKind::Bucketor {
                underlyings,
                bucketer_key,
                aggregation,
                combination_key,
            } => {
                let bucketer = registry.bucketer(bucketer_key)?;
                let bucket_columns = bucketer.bucket_columns();

                let mut fine: BTreeSet<String> = step
                    .group_by
                    .difference(&bucket_columns)
                    .cloned()
                    .collect();
                fine.extend(bucketer.source_columns());

                let widened = step.filter.without_columns(&bucket_columns);
                let bucket_filter = step.filter.retain_columns(&bucket_columns);
                check_column_split(&step.filter, &widened, &bucket_filter, &step.measure)?;

                StepPlan {
                    underlyings: underlyings
                        .iter()
                        .map(|name| QueryStep::new(widened.clone(), fine.clone(), name.clone()))
                        .collect(),
                    transform: Transform::BucketCombine {
                        function: registry.combination(combination_key)?,
                        aggregation: *aggregation,
                        bucket_filter,
                        bucketer,
                        parent_group_by: step.group_by.clone(),
                    },
                }
            }
        };
        Ok(plan)
    }

    /// Materialize every aggregator leaf. Leaves sharing filter and
    /// group-by are induced into one table query unless disabled.
    fn run_table_phase(&mut self) -> Result<(), EngineError> {
        // Keyed by (filter, group-by); induction-disabled runs also key
        // by measure name so every leaf stays in its own group.
        type InductionKey = (SliceFilter, BTreeSet<String>, Option<String>);
        let mut groups: BTreeMap<InductionKey, Vec<QueryStep>> = BTreeMap::new();
        for leaf in std::mem::take(&mut self.leaves) {
            let separator = self
                .options
                .disable_aggregator_induction
                .then(|| leaf.measure.clone());
            let key = (leaf.filter.clone(), leaf.group_by.clone(), separator);
            groups.entry(key).or_default().push(leaf);
        }

        for (_, leaves) in groups {
            let first = match leaves.first() {
                Some(step) => step,
                None => continue,
            };
            let filter = first.filter.clone();
            let group_by = first.group_by.clone();

            let mut aggregations: Vec<AggregationRequest> = Vec::new();
            for leaf in &leaves {
                let Some(StepPlan {
                    transform: Transform::Leaf { request },
                    ..
                }) = self.plans.get(leaf)
                else {
                    return Err(EngineError::Configuration(format!(
                        "step {leaf} is not an aggregator leaf"
                    )));
                };
                if !aggregations.contains(request) {
                    aggregations.push(request.clone());
                }
            }

            let query = TableQuery {
                filter,
                group_by,
                aggregations,
            };
            if self.options.explain {
                tracing::debug!(
                    target: "querycube::explain",
                    filter = ?query.filter,
                    group_by = ?query.group_by,
                    aggregations = query.aggregations.len(),
                    "table query"
                );
            }

            let rows = self.table.stream_slices(&query)?;
            self.stats.table_queries += 1;
            self.table_queries.push(query);

            for leaf in &leaves {
                let Some(StepPlan {
                    transform: Transform::Leaf { request },
                    ..
                }) = self.plans.get(leaf)
                else {
                    continue;
                };
                let output_name = request.output_name();
                let mut column = SlicedColumn::new();
                for row in &rows {
                    if let Some(value) = row.values.get(&output_name) {
                        column.insert(row.slice.clone(), value.clone());
                    }
                }
                self.stats.evaluated_steps += 1;
                self.columns.insert(leaf.clone(), Arc::new(column));
            }
        }
        Ok(())
    }

    /// Bottom-up evaluation with per-execution memoization: a step runs
    /// only after all its underlyings are materialized, and at most once.
    fn evaluate(&mut self, step: &QueryStep) -> Result<Arc<SlicedColumn>, EngineError> {
        if let Some(column) = self.columns.get(step) {
            return Ok(Arc::clone(column));
        }

        let plan = self
            .plans
            .get(step)
            .cloned()
            .ok_or_else(|| EngineError::Configuration(format!("step {step} was never expanded")))?;

        let mut inputs = Vec::with_capacity(plan.underlyings.len());
        for underlying in &plan.underlyings {
            inputs.push(self.evaluate(underlying)?);
        }

        let column = self.apply(&plan.transform, &inputs)?;
        self.stats.evaluated_steps += 1;
        let column = Arc::new(column);
        self.columns.insert(step.clone(), Arc::clone(&column));
        Ok(column)
    }

    fn apply(
        &self,
        transform: &Transform,
        inputs: &[Arc<SlicedColumn>],
    ) -> Result<SlicedColumn, EngineError> {
        match transform {
            Transform::Leaf { .. } => Err(EngineError::Configuration(
                "aggregator leaf was not materialized by the table phase".to_owned(),
            )),
            Transform::Nothing => Ok(SlicedColumn::new()),
            Transform::Identity => Ok(inputs
                .first()
                .map(|column| (**column).clone())
                .unwrap_or_default()),
            Transform::Combine { function } => {
                let mut out = SlicedColumn::new();
                for slice in union_slices(inputs) {
                    let args: Vec<Option<CellValue>> = inputs
                        .iter()
                        .map(|column| column.value(&slice).cloned())
                        .collect();
                    if let Some(value) = function(&args, &self.context) {
                        out.insert(slice, value);
                    }
                }
                Ok(out)
            }
            Transform::ShiftRemap {
                column,
                parent_values,
            } => {
                let mut out = SlicedColumn::new();
                if let Some(input) = inputs.first() {
                    for (slice, value) in input.iter() {
                        for parent_value in parent_values {
                            out.insert(
                                slice.clone().with_coordinate(column.clone(), parent_value.clone()),
                                value.clone(),
                            );
                        }
                    }
                }
                Ok(out)
            }
            Transform::Dispatch {
                decomposition,
                aggregation,
                parent_group_by,
                synthetic_filter,
            } => {
                let mut folds: BTreeMap<Slice, Accumulator> = BTreeMap::new();
                if let Some(input) = inputs.first() {
                    for (slice, value) in input.iter() {
                        for (overrides, decomposed) in decomposition.decompose(slice, value) {
                            let full = slice.merged(&overrides);
                            if !synthetic_filter.matches_slice(&full)? {
                                continue;
                            }
                            folds
                                .entry(full.restrict(parent_group_by))
                                .or_insert_with(|| Accumulator::new(*aggregation))
                                .update(&decomposed);
                        }
                    }
                }
                Ok(finish_folds(folds))
            }
            Transform::PartitionCombine {
                function,
                aggregation,
                parent_group_by,
            } => {
                let mut folds: BTreeMap<Slice, Accumulator> = BTreeMap::new();
                for fine in union_slices(inputs) {
                    let args: Vec<Option<CellValue>> = inputs
                        .iter()
                        .map(|column| column.value(&fine).cloned())
                        .collect();
                    if let Some(value) = function(&args, &self.context) {
                        folds
                            .entry(fine.restrict(parent_group_by))
                            .or_insert_with(|| Accumulator::new(*aggregation))
                            .update(&value);
                    }
                }
                Ok(finish_folds(folds))
            }
            Transform::BucketCombine {
                function,
                aggregation,
                bucketer,
                parent_group_by,
                bucket_filter,
            } => {
                let mut folds: BTreeMap<Slice, Accumulator> = BTreeMap::new();
                for fine in union_slices(inputs) {
                    let args: Vec<Option<CellValue>> = inputs
                        .iter()
                        .map(|column| column.value(&fine).cloned())
                        .collect();
                    let Some(value) = function(&args, &self.context) else {
                        continue;
                    };
                    let full = fine.merged(&bucketer.bucket(&fine));
                    if !bucket_filter.matches_slice(&full)? {
                        continue;
                    }
                    folds
                        .entry(full.restrict(parent_group_by))
                        .or_insert_with(|| Accumulator::new(*aggregation))
                        .update(&value);
                }
                Ok(finish_folds(folds))
            }
        }
    }
}

/// Splitting a filter between generated columns and the table is only
/// sound when the conjunction of the two halves reproduces the original;
/// a disjunction across the boundary widens both halves to `MatchAll`
/// and would silently admit excluded rows.
fn check_column_split(
    original: &SliceFilter,
    widened: &SliceFilter,
    retained: &SliceFilter,
    measure: &str,
) -> Result<(), EngineError> {
    if SliceFilter::and([widened.clone(), retained.clone()]) == *original {
        Ok(())
    } else {
        Err(EngineError::Configuration(format!(
            "filter on measure {measure} entangles generated columns with table columns \
             (for example under a disjunction) and cannot be split for evaluation"
        )))
    }
}

fn union_slices(inputs: &[Arc<SlicedColumn>]) -> BTreeSet<Slice> {
    let mut slices = BTreeSet::new();
    for column in inputs {
        for slice in column.slices() {
            slices.insert(slice.clone());
        }
    }
    slices
}

fn finish_folds(folds: BTreeMap<Slice, Accumulator>) -> SlicedColumn {
    let mut out = SlicedColumn::new();
    for (slice, accumulator) in folds {
        if let Some(value) = accumulator.finish() {
            out.insert(slice, value);
        }
    }
    out
}
