//! Boomerang wave tracking.
//!
//! Some mutations must visit other cells (typically to replicate the
//! transactions they depend on) and come back before they can be applied
//! here. Each departure is a wave: the tracker records the wave size, tallies
//! returning boomerangs, and releases the original mutation once the whole
//! wave is back. Waves that never complete are garbage-collected by age.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use arbor_types::{IdGenerator, ObjectId, ObjectKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoomerangWave {
    pub size: u32,
    pub returned: u32,
    pub started_at: DateTime<Utc>,
    /// The mutation to resume once the wave is complete.
    pub mutation: Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BoomerangTracker {
    waves: BTreeMap<ObjectId, BoomerangWave>,
}

impl BoomerangTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new wave and returns its id.
    pub fn issue_wave(
        &mut self,
        id_generator: &mut IdGenerator,
        size: u32,
        mutation: Value,
        now: DateTime<Utc>,
    ) -> ObjectId {
        // Wave ids are plain guids; they never name a persisted object.
        let wave_id = id_generator.generate(ObjectKind::Null);
        debug!(wave = %wave_id, size, "boomerang wave issued");
        self.waves.insert(wave_id, BoomerangWave {
            size,
            returned: 0,
            started_at: now,
            mutation,
        });
        wave_id
    }

    /// Registers one returned boomerang. Returns the stored mutation once
    /// every boomerang of the wave is back.
    pub fn process_returned(&mut self, wave_id: ObjectId, wave_size: u32) -> Option<Value> {
        let Some(wave) = self.waves.get_mut(&wave_id) else {
            // A stuck-wave sweep may have collected it already.
            warn!(wave = %wave_id, "returned boomerang for unknown wave");
            return None;
        };
        if wave.size != wave_size {
            warn!(wave = %wave_id, expected = wave.size, got = wave_size, "boomerang wave size mismatch");
        }
        wave.returned += 1;
        if wave.returned < wave.size {
            return None;
        }
        let wave = self.waves.remove(&wave_id).expect("present above");
        debug!(wave = %wave_id, "boomerang wave complete");
        Some(wave.mutation)
    }

    /// Removes waves older than the threshold; returns how many died.
    pub fn remove_stuck_waves(&mut self, older_than: DateTime<Utc>) -> usize {
        let before = self.waves.len();
        self.waves.retain(|wave_id, wave| {
            let stuck = wave.started_at < older_than;
            if stuck {
                warn!(wave = %wave_id, returned = wave.returned, size = wave.size, "removing stuck boomerang wave");
            }
            !stuck
        });
        before - self.waves.len()
    }

    pub fn wave_count(&self) -> usize {
        self.waves.len()
    }

    pub fn waves(&self) -> &BTreeMap<ObjectId, BoomerangWave> {
        &self.waves
    }

    pub fn restore(waves: BTreeMap<ObjectId, BoomerangWave>) -> Self {
        BoomerangTracker { waves }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_types::CellTag;

    #[test]
    fn test_wave_completes_after_all_returns() {
        let mut tracker = BoomerangTracker::new();
        let mut id_generator = IdGenerator::new(CellTag(1));
        let mutation = serde_json::json!({"type": "set", "path": "/x"});
        let wave = tracker.issue_wave(&mut id_generator, 3, mutation.clone(), Utc::now());

        assert_eq!(tracker.process_returned(wave, 3), None);
        assert_eq!(tracker.process_returned(wave, 3), None);
        assert_eq!(tracker.process_returned(wave, 3), Some(mutation));
        assert_eq!(tracker.wave_count(), 0);
    }

    #[test]
    fn test_unknown_wave_return_is_ignored() {
        let mut tracker = BoomerangTracker::new();
        let mut id_generator = IdGenerator::new(CellTag(1));
        let wave = id_generator.generate(ObjectKind::Null);
        assert_eq!(tracker.process_returned(wave, 1), None);
    }

    #[test]
    fn test_stuck_wave_collection() {
        let mut tracker = BoomerangTracker::new();
        let mut id_generator = IdGenerator::new(CellTag(1));
        let t0 = Utc::now();
        let stale = tracker.issue_wave(&mut id_generator, 2, Value::Null, t0);
        let fresh = tracker.issue_wave(
            &mut id_generator,
            2,
            Value::Null,
            t0 + chrono::Duration::seconds(100),
        );

        let removed = tracker.remove_stuck_waves(t0 + chrono::Duration::seconds(50));
        assert_eq!(removed, 1);
        assert_eq!(tracker.process_returned(stale, 2), None);
        assert_eq!(tracker.process_returned(fresh, 2), None);
        assert_eq!(tracker.wave_count(), 1);
    }
}
