#![no_main]

use std::time::Duration;

use arbor_retry::{BackoffConfig, BackoffStrategy, delay_for_attempt, jittered_between};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (u32, u8, u64, u64, u8)| {
    let (attempt, strategy_byte, base_ms, max_ms, jitter_byte) = data;

    let attempt = attempt % 100 + 1;
    let strategy = match strategy_byte % 3 {
        0 => BackoffStrategy::Exponential,
        1 => BackoffStrategy::Linear,
        _ => BackoffStrategy::Constant,
    };
    let base_delay = Duration::from_millis(base_ms % 10_000 + 1);
    let max_delay = Duration::from_millis(max_ms % 300_000 + 100);
    let jitter = (jitter_byte as f64) / 255.0;

    let config = BackoffConfig {
        strategy,
        base_delay,
        max_delay,
        jitter: 0.0,
    };
    // Without jitter the cap is exact.
    assert!(delay_for_attempt(&config, attempt) <= max_delay);

    let config = BackoffConfig { jitter, ..config };
    let _ = delay_for_attempt(&config, attempt);

    let window = jittered_between(base_delay, max_delay);
    if base_delay <= max_delay {
        assert!(window >= base_delay && window <= max_delay);
    }
});
