#![no_main]

use std::cmp::Ordering;

use libfuzzer_sys::fuzz_target;
use qc_types::CellValue;

// The total order over cell values backs slice keys, so it must be a
// genuine total order even across NaN and mixed variants: antisymmetry,
// consistency with equality, and transitivity over a small sample.
fuzz_target!(|data: &[u8]| {
    if data.len() < 6 {
        return;
    }
    let values: Vec<CellValue> = data.chunks(2).take(8).map(decode).collect();

    for a in &values {
        assert_eq!(a.cmp(a), Ordering::Equal);
        for b in &values {
            assert_eq!(a.cmp(b), b.cmp(a).reverse());
            assert_eq!(a.cmp(b) == Ordering::Equal, a == b);
            for c in &values {
                if a.cmp(b) != Ordering::Greater && b.cmp(c) != Ordering::Greater {
                    assert_ne!(a.cmp(c), Ordering::Greater);
                }
            }
        }
    }
});

fn decode(chunk: &[u8]) -> CellValue {
    let tag = chunk[0];
    let payload = chunk.get(1).copied().unwrap_or(0);
    match tag % 7 {
        0 => CellValue::Null,
        1 => CellValue::Bool(payload & 1 != 0),
        2 => CellValue::Int64(i64::from(payload) - 128),
        3 => CellValue::Float64(f64::from(payload) / 3.0),
        4 => CellValue::Float64(f64::NAN),
        5 => CellValue::Float64(if payload & 1 == 0 { 0.0 } else { -0.0 }),
        _ => CellValue::Utf8(format!("s{payload}")),
    }
}
