#![no_main]

use libfuzzer_sys::fuzz_target;
use statusexpr::{Row, Value, evaluate_expression};

fuzz_target!(|data: &[u8]| {
    let Ok(expr) = std::str::from_utf8(data) else {
        return;
    };
    let row = Row::from([
        ("a".to_owned(), Value::Number(1.5)),
        ("b".to_owned(), Value::Text("x".to_owned())),
        ("c".to_owned(), Value::Absent),
    ]);
    let table = vec![row.clone(), Row::new()];

    // The boundary must always return a string, never panic.
    let _ = evaluate_expression(expr, &row, &table);
});
