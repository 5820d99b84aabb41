#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use qc_filter::{FilterError, Row, SliceFilter, ValueMatcher};
use qc_types::{Accumulator, AggregationKind, CellValue, Slice};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("table boundary failure: {0}")]
    Boundary(String),
    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// One aggregation a [`TableQuery`] asks the boundary to compute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregationRequest {
    pub column: String,
    pub kind: AggregationKind,
}

impl AggregationRequest {
    pub fn new(column: impl Into<String>, kind: AggregationKind) -> Self {
        Self {
            column: column.into(),
            kind,
        }
    }

    /// Name of the result column carrying this aggregation, e.g. `sum:k1`.
    #[must_use]
    pub fn output_name(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.column)
    }
}

/// Minimal physical query sent to the table boundary: a filter, the
/// group-by columns and the aggregations to fold per group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableQuery {
    pub filter: SliceFilter,
    pub group_by: BTreeSet<String>,
    pub aggregations: Vec<AggregationRequest>,
}

/// One result row: a distinct group-by combination plus the requested
/// aggregation values keyed by [`AggregationRequest::output_name`].
/// Aggregations that folded nothing are absent from `values`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedRow {
    pub slice: Slice,
    pub values: BTreeMap<String, CellValue>,
}

/// Discovery answer for one column: a value sample plus an estimated
/// distinct cardinality (`-1` when not estimated).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinateSample {
    pub values: Vec<CellValue>,
    pub estimated_cardinality: i64,
}

impl CoordinateSample {
    pub const UNKNOWN_CARDINALITY: i64 = -1;
}

/// The external row source this engine queries. Implementations must
/// honor filter and group-by exactly, return one row per distinct
/// group-by combination carrying at least one non-null aggregation
/// (all-null rows are dropped on the boundary side), and apply column
/// transcoding consistently in both directions.
pub trait TableSource: Send + Sync {
    fn stream_slices(&self, query: &TableQuery) -> Result<Vec<AggregatedRow>, TableError>;

    /// Schema/UI discovery only, never used for query execution.
    /// `limit < 1` means unbounded.
    fn coordinates(
        &self,
        column: &str,
        matcher: &ValueMatcher,
        limit: usize,
    ) -> Result<CoordinateSample, TableError>;
}

/// Column-name translation between query space and table space.
pub trait ColumnTranscoder: Send + Sync {
    fn to_table(&self, column: &str) -> String;
    fn to_query(&self, column: &str) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTranscoder;

impl ColumnTranscoder for IdentityTranscoder {
    fn to_table(&self, column: &str) -> String {
        column.to_owned()
    }

    fn to_query(&self, column: &str) -> String {
        column.to_owned()
    }
}

/// Dictionary-backed transcoder; unmapped names pass through unchanged.
#[derive(Debug, Clone, Default)]
pub struct MappingTranscoder {
    query_to_table: BTreeMap<String, String>,
    table_to_query: BTreeMap<String, String>,
}

impl MappingTranscoder {
    #[must_use]
    pub fn new(query_to_table: BTreeMap<String, String>) -> Self {
        let table_to_query = query_to_table
            .iter()
            .map(|(query, table)| (table.clone(), query.clone()))
            .collect();
        Self {
            query_to_table,
            table_to_query,
        }
    }
}

impl ColumnTranscoder for MappingTranscoder {
    fn to_table(&self, column: &str) -> String {
        self.query_to_table
            .get(column)
            .cloned()
            .unwrap_or_else(|| column.to_owned())
    }

    fn to_query(&self, column: &str) -> String {
        self.table_to_query
            .get(column)
            .cloned()
            .unwrap_or_else(|| column.to_owned())
    }
}

/// Translate a table-space row into query space. When two table columns
/// collapse onto one query column with different values the collision is
/// logged and the later value wins.
pub fn transcode_row_to_query(transcoder: &dyn ColumnTranscoder, row: &Row) -> Row {
    let mut out = Row::new();
    for (table_column, value) in row {
        let query_column = transcoder.to_query(table_column);
        if let Some(previous) = out.insert(query_column.clone(), value.clone())
            && previous != *value
        {
            tracing::warn!(
                target: "querycube::table",
                column = %query_column,
                "transcoding ambiguity: multiple table columns map to one query column; last write wins"
            );
        }
    }
    out
}

/// Reference [`TableSource`] over an in-memory row list. Rows are plain
/// column→value maps in table space; a transcoder translates both the
/// incoming query and the outgoing rows.
pub struct InMemoryTable {
    rows: Vec<Row>,
    transcoder: Box<dyn ColumnTranscoder>,
}

impl InMemoryTable {
    #[must_use]
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows,
            transcoder: Box::new(IdentityTranscoder),
        }
    }

    #[must_use]
    pub fn with_transcoder(rows: Vec<Row>, transcoder: Box<dyn ColumnTranscoder>) -> Self {
        Self { rows, transcoder }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Build a row from `(column, value)` pairs; test and fixture helper.
pub fn row_from_pairs<I, C>(pairs: I) -> Row
where
    I: IntoIterator<Item = (C, CellValue)>,
    C: Into<String>,
{
    pairs
        .into_iter()
        .map(|(column, value)| (column.into(), value))
        .collect()
}

impl TableSource for InMemoryTable {
    fn stream_slices(&self, query: &TableQuery) -> Result<Vec<AggregatedRow>, TableError> {
        let mut groups: BTreeMap<Slice, Vec<Accumulator>> = BTreeMap::new();

        for table_row in &self.rows {
            let query_row = transcode_row_to_query(self.transcoder.as_ref(), table_row);
            if !query.filter.matches(&query_row)? {
                continue;
            }

            let slice = Slice::from_pairs(query.group_by.iter().map(|column| {
                (
                    column.clone(),
                    query_row.get(column).cloned().unwrap_or(CellValue::Null),
                )
            }));

            let accumulators = groups.entry(slice).or_insert_with(|| {
                query
                    .aggregations
                    .iter()
                    .map(|request| Accumulator::new(request.kind))
                    .collect()
            });

            for (accumulator, request) in accumulators.iter_mut().zip(&query.aggregations) {
                if let Some(value) = query_row.get(&request.column) {
                    accumulator.update(value);
                }
            }
        }

        let mut out = Vec::with_capacity(groups.len());
        for (slice, accumulators) in groups {
            let mut values = BTreeMap::new();
            for (accumulator, request) in accumulators.into_iter().zip(&query.aggregations) {
                if let Some(value) = accumulator.finish() {
                    values.insert(request.output_name(), value);
                }
            }
            // A group where every requested aggregation folded nothing is
            // dropped by the boundary.
            if !values.is_empty() {
                out.push(AggregatedRow { slice, values });
            }
        }
        Ok(out)
    }

    fn coordinates(
        &self,
        column: &str,
        matcher: &ValueMatcher,
        limit: usize,
    ) -> Result<CoordinateSample, TableError> {
        let mut distinct = BTreeSet::new();
        for table_row in &self.rows {
            let query_row = transcode_row_to_query(self.transcoder.as_ref(), table_row);
            let value = query_row.get(column).cloned().unwrap_or(CellValue::Null);
            if matcher.matches(&value)? {
                distinct.insert(value);
            }
        }

        let cardinality = distinct.len() as i64;
        let values: Vec<CellValue> = if limit < 1 {
            distinct.into_iter().collect()
        } else {
            distinct.into_iter().take(limit).collect()
        };

        Ok(CoordinateSample {
            values,
            estimated_cardinality: cardinality,
        })
    }
}
