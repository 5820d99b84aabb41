#![no_main]

use libfuzzer_sys::fuzz_target;
use qc_filter::ValueMatcher;
use qc_types::CellValue;

// Matcher evaluation must never panic: invalid LIKE/regex patterns come
// back as errors, everything else as a clean boolean. Also checks the
// negation involution at the evaluation level.
fuzz_target!(|data: &[u8]| {
    if data.len() < 3 {
        return;
    }
    let (head, tail) = data.split_at(2);
    let matcher = build_matcher(head[0], head[1], tail);
    let value = scalar(head[1], tail);

    let outcome = matcher.matches(&value);
    if let Ok(hit) = outcome {
        let negated = matcher.clone().negate().matches(&value).expect("negation preserves validity");
        assert_eq!(negated, !hit);
    }
});

fn scalar(byte: u8, tail: &[u8]) -> CellValue {
    match byte % 6 {
        0 => CellValue::Null,
        1 => CellValue::Bool(byte & 1 != 0),
        2 => CellValue::Int64(i64::from(byte) * 3 - 300),
        3 => CellValue::Float64(f64::from(byte) - 0.5),
        4 => CellValue::Float64(f64::NAN),
        _ => CellValue::Utf8(String::from_utf8_lossy(&tail[..tail.len().min(8)]).into_owned()),
    }
}

fn build_matcher(tag: u8, operand: u8, tail: &[u8]) -> ValueMatcher {
    let text = String::from_utf8_lossy(&tail[..tail.len().min(12)]).into_owned();
    match tag % 9 {
        0 => ValueMatcher::equals(scalar(operand, tail)),
        1 => ValueMatcher::is_in([scalar(operand, tail), scalar(operand.wrapping_add(3), tail)]),
        2 => ValueMatcher::Null,
        3 => ValueMatcher::like(text),
        4 => ValueMatcher::regex(text),
        5 => ValueMatcher::at_least(scalar(operand, tail)),
        6 => ValueMatcher::lower_than(scalar(operand, tail)),
        7 => ValueMatcher::same(scalar(operand, tail)),
        _ => ValueMatcher::and(vec![
            ValueMatcher::equals(scalar(operand, tail)),
            ValueMatcher::Null,
        ]),
    }
}
