#![no_main]

use arbor::cypress::path::parse_path;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Ok(parsed) = parse_path(data) {
        // Accepted paths contain no empty or decorated segment names.
        for segment in &parsed.segments {
            assert!(!segment.name.is_empty());
            assert!(!segment.name.contains('@'));
            assert!(!segment.name.contains('&'));
        }
        if let Some(attribute) = &parsed.attribute {
            assert!(!attribute.is_empty());
        }
    }
});
