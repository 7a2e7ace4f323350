#![no_main]

use arbor::scheduler::operation::parse_spec;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Ok(parsed) = parse_spec(data, None, None) {
        // The persisted spec never retains the secure vault.
        assert!(parsed.spec_node.get("secure_vault").is_none());
        // Every per-tree override parses back as a strategy spec.
        for tree in parsed.spec.scheduling_options_per_pool_tree.keys() {
            assert!(parsed.custom_per_tree.contains_key(tree));
        }
    }
});
