//! End-to-end queries over the in-memory table boundary, covering every
//! measure kind and the slice arithmetic between them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use qc_engine::{CubeEngine, CubeQuery, EngineError, QueryOptions};
use qc_filter::SliceFilter;
use qc_measure::{
    ColumnatorMode, DuplicatingDecomposition, Measure, MeasureForest, MeasureKind, ModuloBucketer,
    OperatorRegistry, SliceEditor,
};
use qc_table::{InMemoryTable, MappingTranscoder, row_from_pairs};
use qc_types::{AggregationKind, CellValue, Slice};

fn fixture_table() -> InMemoryTable {
    InMemoryTable::new(vec![
        row_from_pairs([("a", CellValue::from("a1")), ("k1", CellValue::Int64(123))]),
        row_from_pairs([
            ("a", CellValue::from("a1")),
            ("k1", CellValue::Int64(345)),
            ("k2", CellValue::Int64(456)),
        ]),
        row_from_pairs([
            ("a", CellValue::from("a2")),
            ("b", CellValue::from("b1")),
            ("k2", CellValue::Int64(234)),
        ]),
        row_from_pairs([
            ("a", CellValue::from("a2")),
            ("b", CellValue::from("b2")),
            ("k1", CellValue::Int64(567)),
        ]),
    ])
}

fn aggregator(name: &str, column: &str, aggregation: AggregationKind) -> Measure {
    Measure::new(
        name,
        MeasureKind::Aggregator {
            column: column.to_owned(),
            aggregation,
        },
    )
}

fn sum_of(name: &str, underlyings: &[&str]) -> Measure {
    Measure::new(
        name,
        MeasureKind::Combinator {
            underlyings: underlyings.iter().map(|s| (*s).to_owned()).collect(),
            combination_key: "sum".to_owned(),
        },
    )
}

fn base_measures() -> Vec<Measure> {
    vec![
        aggregator("k1_sum", "k1", AggregationKind::Sum),
        aggregator("k2_sum", "k2", AggregationKind::Sum),
        sum_of("sumK1K2", &["k1_sum", "k2_sum"]),
    ]
}

fn engine_with(measures: Vec<Measure>) -> CubeEngine {
    engine_with_registry(measures, OperatorRegistry::with_builtins())
}

fn engine_with_registry(measures: Vec<Measure>, registry: OperatorRegistry) -> CubeEngine {
    let mut builder = MeasureForest::builder();
    for measure in measures {
        builder = builder.add_measure(measure);
    }
    CubeEngine::new(builder.build().expect("forest builds"), registry)
}

fn slice(pairs: &[(&str, &str)]) -> Slice {
    Slice::from_pairs(
        pairs
            .iter()
            .map(|(column, value)| ((*column).to_owned(), CellValue::from(*value))),
    )
}

#[test]
fn grand_total_combines_both_aggregators() {
    let engine = engine_with(base_measures());
    let output = engine
        .execute(&fixture_table(), &CubeQuery::new(["sumK1K2"]))
        .expect("execute");

    // k1: 123 + 345 + 567, k2: 456 + 234.
    assert_eq!(
        output.view.value(&Slice::empty(), "sumK1K2"),
        Some(&CellValue::Int64(1725))
    );
    assert_eq!(output.stats.table_queries, 1);
}

#[test]
fn group_by_yields_one_slice_per_coordinate() {
    let engine = engine_with(base_measures());
    let output = engine
        .execute(
            &fixture_table(),
            &CubeQuery::new(["sumK1K2"]).grouped_by(["a"]),
        )
        .expect("execute");

    assert_eq!(output.view.len(), 2);
    assert_eq!(
        output.view.value(&slice(&[("a", "a1")]), "sumK1K2"),
        Some(&CellValue::Int64(123 + 345 + 456))
    );
    assert_eq!(
        output.view.value(&slice(&[("a", "a2")]), "sumK1K2"),
        Some(&CellValue::Int64(234 + 567))
    );
}

#[test]
fn absent_values_stay_absent_in_the_view() {
    let engine = engine_with(base_measures());
    let output = engine
        .execute(
            &fixture_table(),
            &CubeQuery::new(["k1_sum", "k2_sum"]).grouped_by(["b"]),
        )
        .expect("execute");

    // The b=b2 row has no k2 value at all, so k2_sum is absent there
    // rather than zero.
    let b2 = slice(&[("b", "b2")]);
    assert_eq!(output.view.value(&b2, "k1_sum"), Some(&CellValue::Int64(567)));
    assert_eq!(output.view.value(&b2, "k2_sum"), None);
}

#[test]
fn query_filter_restricts_the_rows() {
    let engine = engine_with(base_measures());
    let output = engine
        .execute(
            &fixture_table(),
            &CubeQuery::new(["sumK1K2"]).filtered(SliceFilter::equals("a", "a1")),
        )
        .expect("execute");

    assert_eq!(
        output.view.value(&Slice::empty(), "sumK1K2"),
        Some(&CellValue::Int64(123 + 345 + 456))
    );
}

#[test]
fn filtrator_narrows_its_underlying() {
    let mut measures = base_measures();
    measures.push(Measure::new(
        "k1_a1",
        MeasureKind::Filtrator {
            underlying: "k1_sum".to_owned(),
            filter: SliceFilter::equals("a", "a1"),
        },
    ));

    let engine = engine_with(measures);
    let output = engine
        .execute(&fixture_table(), &CubeQuery::new(["k1_a1", "k1_sum"]))
        .expect("execute");

    assert_eq!(
        output.view.value(&Slice::empty(), "k1_a1"),
        Some(&CellValue::Int64(468))
    );
    assert_eq!(
        output.view.value(&Slice::empty(), "k1_sum"),
        Some(&CellValue::Int64(1035))
    );
}

#[test]
fn unfiltrator_widens_away_the_named_columns() {
    let mut measures = base_measures();
    measures.push(Measure::new(
        "k1_any_a",
        MeasureKind::Unfiltrator {
            underlying: "k1_sum".to_owned(),
            columns: BTreeSet::from(["a".to_owned()]),
            inverse: false,
        },
    ));

    let engine = engine_with(measures);
    let output = engine
        .execute(
            &fixture_table(),
            &CubeQuery::new(["k1_any_a", "k1_sum"]).filtered(SliceFilter::equals("a", "a1")),
        )
        .expect("execute");

    // The widened step sees every row; the plain one only a=a1.
    assert_eq!(
        output.view.value(&Slice::empty(), "k1_any_a"),
        Some(&CellValue::Int64(1035))
    );
    assert_eq!(
        output.view.value(&Slice::empty(), "k1_sum"),
        Some(&CellValue::Int64(468))
    );
}

#[test]
fn unfiltrator_inverse_keeps_only_the_named_columns() {
    let mut measures = base_measures();
    measures.push(Measure::new(
        "k1_only_a",
        MeasureKind::Unfiltrator {
            underlying: "k1_sum".to_owned(),
            columns: BTreeSet::from(["a".to_owned()]),
            inverse: true,
        },
    ));

    let engine = engine_with(measures);
    let output = engine
        .execute(
            &fixture_table(),
            &CubeQuery::new(["k1_only_a", "k1_sum"]).filtered(SliceFilter::and([
                SliceFilter::equals("a", "a2"),
                SliceFilter::equals("b", "b1"),
            ])),
        )
        .expect("execute");

    // Under the full filter the only a=a2,b=b1 row carries no k1, so the
    // plain measure is absent; keeping only the a constraint re-admits
    // the a=a2,b=b2 row.
    assert_eq!(
        output.view.value(&Slice::empty(), "k1_only_a"),
        Some(&CellValue::Int64(567))
    );
    assert_eq!(output.view.value(&Slice::empty(), "k1_sum"), None);
}

#[test]
fn shiftor_pin_reports_shifted_values_at_the_parent_slice() {
    let table = InMemoryTable::new(vec![
        row_from_pairs([
            ("ccy", CellValue::from("USD")),
            ("pnl", CellValue::Int64(100)),
        ]),
        row_from_pairs([
            ("ccy", CellValue::from("EUR")),
            ("pnl", CellValue::Int64(40)),
        ]),
    ]);

    let measures = vec![
        aggregator("pnl_sum", "pnl", AggregationKind::Sum),
        Measure::new(
            "pnl_in_eur_leg",
            MeasureKind::Shiftor {
                underlying: "pnl_sum".to_owned(),
                editor: SliceEditor::Pin {
                    column: "ccy".to_owned(),
                    value: CellValue::from("EUR"),
                },
            },
        ),
    ];

    let engine = engine_with(measures);
    let output = engine
        .execute(
            &table,
            &CubeQuery::new(["pnl_in_eur_leg", "pnl_sum"])
                .filtered(SliceFilter::equals("ccy", "USD")),
        )
        .expect("execute");

    // The shifted measure reads the EUR rows but reports under the
    // USD-filtered parent slice.
    assert_eq!(
        output.view.value(&Slice::empty(), "pnl_in_eur_leg"),
        Some(&CellValue::Int64(40))
    );
    assert_eq!(
        output.view.value(&Slice::empty(), "pnl_sum"),
        Some(&CellValue::Int64(100))
    );
}

#[test]
fn shiftor_pin_on_a_grouped_column_remaps_parent_coordinates() {
    let table = InMemoryTable::new(vec![
        row_from_pairs([
            ("ccy", CellValue::from("USD")),
            ("pnl", CellValue::Int64(100)),
        ]),
        row_from_pairs([
            ("ccy", CellValue::from("EUR")),
            ("pnl", CellValue::Int64(40)),
        ]),
        row_from_pairs([
            ("ccy", CellValue::from("GBP")),
            ("pnl", CellValue::Int64(7)),
        ]),
    ]);

    let measures = vec![
        aggregator("pnl_sum", "pnl", AggregationKind::Sum),
        Measure::new(
            "pnl_in_eur_leg",
            MeasureKind::Shiftor {
                underlying: "pnl_sum".to_owned(),
                editor: SliceEditor::Pin {
                    column: "ccy".to_owned(),
                    value: CellValue::from("EUR"),
                },
            },
        ),
    ];

    let engine = engine_with(measures);
    let output = engine
        .execute(
            &table,
            &CubeQuery::new(["pnl_in_eur_leg"])
                .grouped_by(["ccy"])
                .filtered(SliceFilter::is_in("ccy", ["USD", "GBP"])),
        )
        .expect("execute");

    // Every enumerated parent coordinate carries the EUR value.
    assert_eq!(output.view.len(), 2);
    assert_eq!(
        output.view.value(&slice(&[("ccy", "USD")]), "pnl_in_eur_leg"),
        Some(&CellValue::Int64(40))
    );
    assert_eq!(
        output.view.value(&slice(&[("ccy", "GBP")]), "pnl_in_eur_leg"),
        Some(&CellValue::Int64(40))
    );
}

#[test]
fn columnator_gates_on_exact_match_constraints() {
    let mut measures = base_measures();
    measures.push(Measure::new(
        "k1_when_a_fixed",
        MeasureKind::Columnator {
            underlying: "k1_sum".to_owned(),
            columns: BTreeSet::from(["a".to_owned()]),
            mode: ColumnatorMode::HideIfMissing,
        },
    ));

    let engine = engine_with(measures);

    let hidden = engine
        .execute(&fixture_table(), &CubeQuery::new(["k1_when_a_fixed"]))
        .expect("execute");
    assert!(hidden.view.is_empty());

    let shown = engine
        .execute(
            &fixture_table(),
            &CubeQuery::new(["k1_when_a_fixed"]).filtered(SliceFilter::equals("a", "a1")),
        )
        .expect("execute");
    assert_eq!(
        shown.view.value(&Slice::empty(), "k1_when_a_fixed"),
        Some(&CellValue::Int64(468))
    );
}

#[test]
fn dispatchor_broadcasts_and_honors_synthetic_filters() {
    let mut registry = OperatorRegistry::with_builtins();
    registry
        .register_decomposition(
            "region_groups",
            Arc::new(DuplicatingDecomposition {
                column: "region_group".to_owned(),
                values: vec![CellValue::from("emea"), CellValue::from("global")],
            }),
        )
        .expect("register");

    let mut measures = base_measures();
    measures.push(Measure::new(
        "k1_by_region_group",
        MeasureKind::Dispatchor {
            underlying: "k1_sum".to_owned(),
            decomposition_key: "region_groups".to_owned(),
            aggregation: AggregationKind::Sum,
        },
    ));

    let engine = engine_with_registry(measures, registry);

    let broadcast = engine
        .execute(
            &fixture_table(),
            &CubeQuery::new(["k1_by_region_group"]).grouped_by(["region_group"]),
        )
        .expect("execute");
    assert_eq!(broadcast.view.len(), 2);
    assert_eq!(
        broadcast
            .view
            .value(&slice(&[("region_group", "emea")]), "k1_by_region_group"),
        Some(&CellValue::Int64(1035))
    );

    // A synthetic-column constraint never reaches the table; it is
    // applied to the decomposed coordinates instead.
    let filtered = engine
        .execute(
            &fixture_table(),
            &CubeQuery::new(["k1_by_region_group"])
                .grouped_by(["region_group"])
                .filtered(SliceFilter::equals("region_group", "emea")),
        )
        .expect("execute");
    assert_eq!(filtered.view.len(), 1);
    assert_eq!(
        filtered
            .view
            .value(&slice(&[("region_group", "emea")]), "k1_by_region_group"),
        Some(&CellValue::Int64(1035))
    );
}

#[test]
fn dispatchor_rejects_filters_entangling_synthetic_and_physical_columns() {
    let table = InMemoryTable::new(vec![
        row_from_pairs([("a", CellValue::from("a1")), ("k1", CellValue::Int64(100))]),
        row_from_pairs([("a", CellValue::from("a2")), ("k1", CellValue::Int64(7))]),
    ]);

    let mut registry = OperatorRegistry::with_builtins();
    registry
        .register_decomposition(
            "region_groups",
            Arc::new(DuplicatingDecomposition {
                column: "g".to_owned(),
                values: vec![CellValue::from("emea"), CellValue::from("global")],
            }),
        )
        .expect("register");

    let measures = vec![
        aggregator("k1_sum", "k1", AggregationKind::Sum),
        Measure::new(
            "k1_by_g",
            MeasureKind::Dispatchor {
                underlying: "k1_sum".to_owned(),
                decomposition_key: "region_groups".to_owned(),
                aggregation: AggregationKind::Sum,
            },
        ),
    ];

    // A disjunction across the synthetic/physical boundary cannot be
    // split between the table and the decomposition; conjunctions can.
    let engine = engine_with_registry(measures, registry);
    let err = engine
        .execute(
            &table,
            &CubeQuery::new(["k1_by_g"])
                .grouped_by(["g"])
                .filtered(SliceFilter::or([
                    SliceFilter::equals("g", "emea"),
                    SliceFilter::equals("a", "a1"),
                ])),
        )
        .expect_err("entangled filter must be rejected");
    assert!(matches!(err, EngineError::Configuration(_)));

    let conjunctive = engine
        .execute(
            &table,
            &CubeQuery::new(["k1_by_g"])
                .grouped_by(["g"])
                .filtered(SliceFilter::and([
                    SliceFilter::equals("g", "global"),
                    SliceFilter::equals("a", "a1"),
                ])),
        )
        .expect("separable filter executes");
    assert_eq!(
        conjunctive
            .view
            .value(&slice(&[("g", "global")]), "k1_by_g"),
        Some(&CellValue::Int64(100))
    );
}

#[test]
fn partitionor_aggregates_a_finer_combination() {
    let mut measures = base_measures();
    measures.push(Measure::new(
        "max_total_by_a",
        MeasureKind::Partitionor {
            underlyings: vec!["k1_sum".to_owned(), "k2_sum".to_owned()],
            partition_columns: BTreeSet::from(["a".to_owned()]),
            aggregation: AggregationKind::Max,
            combination_key: "sum".to_owned(),
        },
    ));

    let engine = engine_with(measures);
    let output = engine
        .execute(&fixture_table(), &CubeQuery::new(["max_total_by_a"]))
        .expect("execute");

    // Per-a totals are 924 (a1) and 801 (a2); the max folds back up.
    assert_eq!(
        output.view.value(&Slice::empty(), "max_total_by_a"),
        Some(&CellValue::Int64(924))
    );
}

#[test]
fn bucketor_groups_fine_coordinates_into_buckets() {
    let table = InMemoryTable::new(vec![
        row_from_pairs([("day", CellValue::Int64(1)), ("k1", CellValue::Int64(10))]),
        row_from_pairs([("day", CellValue::Int64(8)), ("k1", CellValue::Int64(20))]),
        row_from_pairs([("day", CellValue::Int64(2)), ("k1", CellValue::Int64(5))]),
    ]);

    let mut registry = OperatorRegistry::with_builtins();
    registry.register_bucketer(
        "weekday",
        Arc::new(ModuloBucketer {
            source_column: "day".to_owned(),
            bucket_column: "day_mod".to_owned(),
            modulus: 7,
        }),
    );

    let measures = vec![
        aggregator("k1_sum", "k1", AggregationKind::Sum),
        Measure::new(
            "k1_by_weekday",
            MeasureKind::Bucketor {
                underlyings: vec!["k1_sum".to_owned()],
                bucketer_key: "weekday".to_owned(),
                aggregation: AggregationKind::Sum,
                combination_key: "sum".to_owned(),
            },
        ),
    ];

    let engine = engine_with_registry(measures, registry);
    let output = engine
        .execute(
            &table,
            &CubeQuery::new(["k1_by_weekday"]).grouped_by(["day_mod"]),
        )
        .expect("execute");

    // Days 1 and 8 land in bucket 1, day 2 in bucket 2.
    assert_eq!(output.view.len(), 2);
    assert_eq!(
        output.view.value(
            &Slice::from_pairs([("day_mod", CellValue::Int64(1))]),
            "k1_by_weekday"
        ),
        Some(&CellValue::Int64(30))
    );
    assert_eq!(
        output.view.value(
            &Slice::from_pairs([("day_mod", CellValue::Int64(2))]),
            "k1_by_weekday"
        ),
        Some(&CellValue::Int64(5))
    );
}

#[test]
fn empty_measure_contributes_nothing() {
    let mut measures = base_measures();
    measures.push(Measure::new("nothing", MeasureKind::Empty));

    let engine = engine_with(measures);
    let output = engine
        .execute(&fixture_table(), &CubeQuery::new(["nothing", "k1_sum"]))
        .expect("execute");

    assert_eq!(output.view.value(&Slice::empty(), "nothing"), None);
    assert_eq!(
        output.view.value(&Slice::empty(), "k1_sum"),
        Some(&CellValue::Int64(1035))
    );
}

#[test]
fn custom_marker_reaches_combination_functions() {
    let mut registry = OperatorRegistry::with_builtins();
    registry.register_combination("marker_echo", |_values, ctx| {
        ctx.custom_marker
            .as_ref()
            .and_then(|marker| marker.as_str())
            .map(CellValue::from)
    });

    let measures = vec![
        aggregator("k1_sum", "k1", AggregationKind::Sum),
        Measure::new(
            "echo",
            MeasureKind::Combinator {
                underlyings: vec!["k1_sum".to_owned()],
                combination_key: "marker_echo".to_owned(),
            },
        ),
    ];

    let engine = engine_with_registry(measures, registry);
    let output = engine
        .execute(
            &fixture_table(),
            &CubeQuery::new(["echo"]).with_marker(serde_json::json!("desk-7")),
        )
        .expect("execute");

    assert_eq!(
        output.view.value(&Slice::empty(), "echo"),
        Some(&CellValue::from("desk-7"))
    );
}

#[test]
fn transcoded_table_serves_query_space_columns() {
    let mapping = MappingTranscoder::new(BTreeMap::from([(
        "country".to_owned(),
        "cntry_cd".to_owned(),
    )]));
    let table = InMemoryTable::with_transcoder(
        vec![
            row_from_pairs([
                ("cntry_cd", CellValue::from("FR")),
                ("k1", CellValue::Int64(10)),
            ]),
            row_from_pairs([
                ("cntry_cd", CellValue::from("DE")),
                ("k1", CellValue::Int64(20)),
            ]),
        ],
        Box::new(mapping),
    );

    let engine = engine_with(vec![aggregator("k1_sum", "k1", AggregationKind::Sum)]);
    let output = engine
        .execute(
            &table,
            &CubeQuery::new(["k1_sum"])
                .grouped_by(["country"])
                .filtered(SliceFilter::equals("country", "DE")),
        )
        .expect("execute");

    assert_eq!(output.view.len(), 1);
    assert_eq!(
        output.view.value(&slice(&[("country", "DE")]), "k1_sum"),
        Some(&CellValue::Int64(20))
    );
}

#[test]
fn deep_measure_chains_compose() {
    // Filtrator over a Combinator over two Aggregators, then an
    // Unfiltrator on top restoring the full row set.
    let mut measures = base_measures();
    measures.push(Measure::new(
        "total_a1",
        MeasureKind::Filtrator {
            underlying: "sumK1K2".to_owned(),
            filter: SliceFilter::equals("a", "a1"),
        },
    ));
    measures.push(Measure::new(
        "total_anywhere",
        MeasureKind::Unfiltrator {
            underlying: "total_a1".to_owned(),
            columns: BTreeSet::from(["a".to_owned()]),
            inverse: false,
        },
    ));

    let engine = engine_with(measures);
    let output = engine
        .execute(
            &fixture_table(),
            &CubeQuery::new(["total_a1", "total_anywhere"]),
        )
        .expect("execute");

    assert_eq!(
        output.view.value(&Slice::empty(), "total_a1"),
        Some(&CellValue::Int64(924))
    );
    // Unfiltrator widens away "a" but the inner Filtrator re-narrows it,
    // so both agree here.
    assert_eq!(
        output.view.value(&Slice::empty(), "total_anywhere"),
        Some(&CellValue::Int64(924))
    );
}

#[test]
fn options_round_trip_with_identical_results() {
    let engine = engine_with(base_measures());
    let query = CubeQuery::new(["sumK1K2"]).grouped_by(["a"]);

    let plain = engine.execute(&fixture_table(), &query).expect("execute");
    let no_induction = engine
        .execute(
            &fixture_table(),
            &query.clone().with_options(QueryOptions {
                disable_aggregator_induction: true,
                ..QueryOptions::default()
            }),
        )
        .expect("execute");

    assert_eq!(plain.view, no_induction.view);
    assert!(plain.stats.table_queries < no_induction.stats.table_queries);
}
