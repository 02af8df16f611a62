//! Scoped key/value reporting of run facts.
//!
//! While a reporting block is active, everything reported through
//! [`report`] is collected into one JSON object; otherwise values go
//! straight to stderr (gated on the `report-to-stderr` feature).

use scoped_tls::scoped_thread_local;
use serde::Serialize;
use serde_json::{Map, Value};
use std::cell::RefCell;

pub mod benchmark;

scoped_thread_local!(static REPORTER: RefCell<Map<String, Value>>);

/// Record a run fact under `key`.
pub fn report(key: &str, value: impl Serialize) {
    let value = serde_json::to_value(value).unwrap();
    if REPORTER.is_set() {
        REPORTER.with(|collected| {
            collected.borrow_mut().insert(key.to_string(), value);
        });
    } else {
        #[cfg(feature = "report-to-stderr")]
        eprintln!("{}: {}", key, value);
        #[cfg(not(feature = "report-to-stderr"))]
        let _ = value;
    }
}

pub fn report_time_ms(name: &str, ms: i64) {
    report(&format!("{}_ms", name), ms);
}

/// Run `f` with a fresh collection context and return its result together
/// with everything reported from inside.
pub fn block_reporting<Out>(f: impl FnOnce() -> Out) -> (Out, Value) {
    let collected = RefCell::new(Map::new());
    let res = REPORTER.set(&collected, f);
    (res, Value::Object(collected.into_inner()))
}

/// Like [`block_reporting`], but prints the collected object when
/// `report-to-stderr` is enabled.
pub fn with_run_report<Out>(name: &str, f: impl FnOnce() -> Out) -> Out {
    let (res, collected) = block_reporting(f);
    #[cfg(feature = "report-to-stderr")]
    eprintln!("{}: {}", name, collected);
    #[cfg(not(feature = "report-to-stderr"))]
    let _ = (name, collected);
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_reported_values() {
        let ((), facts) = block_reporting(|| {
            report("nr_tasks", 17);
            report("phase", "density");
        });
        assert_eq!(facts["nr_tasks"], 17);
        assert_eq!(facts["phase"], "density");
    }
}
