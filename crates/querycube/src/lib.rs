#![forbid(unsafe_code)]

//! Umbrella crate re-exporting the querycube surface: value and slice
//! primitives, the filter algebra, the measure forest and operator
//! registry, the table boundary and the engine itself.

pub use qc_engine::{
    CubeEngine, CubeQuery, CubeView, EngineError, ExecutionStats, QueryOptions, QueryOutput,
    QueryStep, SlicedColumn,
};
pub use qc_filter::{ColumnFilter, FilterError, Row, SliceFilter, ValueMatcher};
pub use qc_measure::{
    ColumnatorMode, CombinationFn, Decomposition, DuplicatingDecomposition, EditorFn,
    LinearBinDecomposition, Measure, MeasureError, MeasureForest, MeasureForestBuilder,
    MeasureKind, ModuloBucketer, OperatorRegistry, QueryContext, SliceBucketer, SliceEditor,
};
pub use qc_table::{
    AggregatedRow, AggregationRequest, ColumnTranscoder, CoordinateSample, IdentityTranscoder,
    InMemoryTable, MappingTranscoder, TableError, TableQuery, TableSource,
};
pub use qc_types::{Accumulator, AggregationKind, CellValue, Slice, ValueError, ValueKind};
