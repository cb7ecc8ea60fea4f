#![no_main]

use libfuzzer_sys::fuzz_target;
use pyroscope_storage::segment::Segment;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = Segment::from_bytes(data) {
        let again = Segment::from_bytes(&s.to_bytes()).unwrap();
        assert_eq!(s, again);
    }
});
