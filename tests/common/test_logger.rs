// Storage logs from the background threads that persist evicted and written-back cache entries.
// `testing_logger` keeps captured logs in a thread-local variable and cannot see those, so this
// logger stores them in a global, mutex-protected vector instead. Tests running at the same time
// share it; assertions should filter on something unique to the test.

use std::sync::{Mutex, Once};

use log::{Level, LevelFilter, Log, Metadata, Record};
use once_cell::sync::Lazy;

static INIT: Once = Once::new();
static TEST_LOGGER: TestLogger = TestLogger;
static CAPTURED_LOGS: Lazy<Mutex<Vec<CapturedLog>>> = Lazy::new(|| Mutex::new(Vec::new()));

pub fn init() {
    INIT.call_once(|| {
        log::set_logger(&TEST_LOGGER).unwrap();
        log::set_max_level(LevelFilter::Trace);
    });
}

pub fn validate<F>(asserter: F)
where
    F: Fn(&Vec<CapturedLog>),
{
    let guard = match CAPTURED_LOGS.lock() {
        Ok(guard) => guard,
        Err(e) => e.into_inner(),
    };
    asserter(&guard);
}

#[derive(Debug)]
pub struct CapturedLog {
    pub body: String,
    pub level: Level,
    pub target: String,
}

struct TestLogger;

impl Log for TestLogger {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let captured_log = CapturedLog {
            body: format!("{}", record.args()),
            level: record.level(),
            target: record.target().to_string(),
        };
        let mut guard = match CAPTURED_LOGS.lock() {
            Ok(guard) => guard,
            Err(e) => e.into_inner(),
        };
        guard.push(captured_log);
    }

    fn flush(&self) {}
}
