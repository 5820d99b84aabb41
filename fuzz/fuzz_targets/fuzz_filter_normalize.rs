#![no_main]

use libfuzzer_sys::fuzz_target;
use qc_filter::{SliceFilter, ValueMatcher};
use qc_types::CellValue;

// Build a filter tree from the input bytes, then check the structural
// invariants of the normalizing constructors: double negation is
// identity, operand order never changes equality, and evaluation of the
// normalized and raw forms agrees on a probe row.
fuzz_target!(|data: &[u8]| {
    let mut cursor = Cursor { data, at: 0 };
    let filter = build_filter(&mut cursor, 3);

    let negated_twice = SliceFilter::not(SliceFilter::not(filter.clone()));
    assert_eq!(negated_twice, filter);

    let reordered = SliceFilter::and([
        build_filter(&mut Cursor { data, at: 0 }, 3),
        SliceFilter::MatchAll,
    ]);
    assert_eq!(reordered, SliceFilter::and([SliceFilter::MatchAll, filter.clone()]));

    let mut row = qc_filter::Row::new();
    row.insert("c0".to_owned(), scalar(cursor.next()));
    row.insert("c1".to_owned(), scalar(cursor.next()));
    let direct = filter.matches(&row);
    let renormalized = SliceFilter::and([filter]).matches(&row);
    match (direct, renormalized) {
        (Ok(a), Ok(b)) => assert_eq!(a, b),
        (Err(_), Err(_)) => {}
        // Normalization may fold an invalid-pattern branch away.
        (Ok(_), Err(_)) | (Err(_), Ok(_)) => {}
    }
});

struct Cursor<'a> {
    data: &'a [u8],
    at: usize,
}

impl Cursor<'_> {
    fn next(&mut self) -> u8 {
        let byte = self.data.get(self.at).copied().unwrap_or(0);
        self.at += 1;
        byte
    }
}

fn scalar(byte: u8) -> CellValue {
    match byte % 5 {
        0 => CellValue::Null,
        1 => CellValue::Bool(byte & 0x10 != 0),
        2 => CellValue::Int64(i64::from(byte) - 128),
        3 => CellValue::Float64(f64::from(byte) / 7.0),
        _ => CellValue::Utf8(format!("v{}", byte % 16)),
    }
}

fn build_filter(cursor: &mut Cursor<'_>, depth: u8) -> SliceFilter {
    let tag = cursor.next();
    if depth == 0 {
        return leaf(tag, cursor.next());
    }
    match tag % 6 {
        0 => SliceFilter::and([
            build_filter(cursor, depth - 1),
            build_filter(cursor, depth - 1),
        ]),
        1 => SliceFilter::or([
            build_filter(cursor, depth - 1),
            build_filter(cursor, depth - 1),
        ]),
        2 => SliceFilter::not(build_filter(cursor, depth - 1)),
        _ => leaf(tag, cursor.next()),
    }
}

fn leaf(tag: u8, operand: u8) -> SliceFilter {
    let column = format!("c{}", tag % 2);
    match tag % 5 {
        0 => SliceFilter::MatchAll,
        1 => SliceFilter::MatchNone,
        2 => SliceFilter::equals(column, scalar(operand)),
        3 => SliceFilter::is_in(column, [scalar(operand), scalar(operand.wrapping_add(1))]),
        _ => SliceFilter::column(column, ValueMatcher::at_least(scalar(operand))),
    }
}
