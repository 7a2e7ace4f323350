#![no_main]

use std::fs;

use arbor::snapshot::{SNAPSHOT_FILE, load_snapshot};
use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    let path = td.path().join(SNAPSHOT_FILE);
    if fs::write(path, data).is_ok() {
        let _ = load_snapshot(td.path());
    }
});
