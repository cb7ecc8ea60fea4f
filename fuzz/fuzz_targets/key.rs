#![no_main]

use libfuzzer_sys::fuzz_target;
use pyroscope_storage::segment::Key;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(key) = Key::parse(s) {
            let _ = Key::parse(&key.normalized());
            let _ = key.tree_key(0, chrono::DateTime::UNIX_EPOCH);
        }
    }
});
