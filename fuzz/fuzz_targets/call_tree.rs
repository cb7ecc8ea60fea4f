#![no_main]

use libfuzzer_sys::fuzz_target;
use pyroscope_storage::call_tree::CallTree;

fuzz_target!(|data: &[u8]| {
    if let Ok(mut tree) = CallTree::from_bytes(data) {
        let total = tree.total();
        let mut merged = CallTree::default();
        merged.merge(&tree);
        assert_eq!(merged.total(), total);
        tree.trim(tree.len() / 4);
    }
});
