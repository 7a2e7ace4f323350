#![no_main]

use arbor_types::ObjectId;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Ok(id) = data.parse::<ObjectId>() {
        // Every accepted id roundtrips through its display form.
        let text = id.to_string();
        let reparsed: ObjectId = text.parse().expect("display form must parse");
        assert_eq!(reparsed, id);
    }
});
