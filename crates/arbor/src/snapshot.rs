//! Versioned snapshot persistence.
//!
//! A snapshot captures the two entity maps (nodes with their branches and
//! locks, transactions) plus the timestamp-holder map and the boomerang
//! tracker under a reign tag. Loading validates the tag against the minimum
//! supported reign and reconstructs the derived indices (native and topmost
//! transaction sets, presence cache seeds, leader leases).

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use arbor_types::{CellTag, IdGenerator, ObjectId, TransactionId};

use crate::config::ArborConfig;
use crate::cypress::tree::CypressTree;
use crate::master::Master;
use crate::multicell::CellPostbox;
use crate::transaction::boomerang::{BoomerangTracker, BoomerangWave};
use crate::transaction::manager::{TimestampHolder, Transaction, TransactionManager};

/// Current snapshot reign tag.
pub const CURRENT_REIGN: &str = "arbor.reign.v4";

/// Oldest reign this build can still replay.
pub const MINIMUM_SUPPORTED_REIGN: &str = "arbor.reign.v2";

pub const SNAPSHOT_FILE: &str = "snapshot.json";

#[derive(Debug, Serialize, Deserialize)]
pub struct MasterSnapshot {
    pub reign: String,
    pub cell_tag: CellTag,
    pub id_generator: IdGenerator,
    pub cypress: CypressTree,
    pub transactions: BTreeMap<TransactionId, Transaction>,
    pub timestamp_holders: BTreeMap<TransactionId, TimestampHolder>,
    pub boomerang_waves: BTreeMap<ObjectId, BoomerangWave>,
}

impl Master {
    /// Captures the persistent state.
    pub fn snapshot(&self) -> MasterSnapshot {
        MasterSnapshot {
            reign: CURRENT_REIGN.to_string(),
            cell_tag: self.cell_tag(),
            id_generator: self.id_generator.clone(),
            cypress: self.cypress.clone(),
            transactions: self.transactions.transactions().clone(),
            timestamp_holders: self.transactions.timestamp_holders().clone(),
            boomerang_waves: self.transactions.boomerangs.waves().clone(),
        }
    }

    /// Rebuilds a master from a snapshot, reconstructing derived state.
    pub fn restore_from_snapshot(
        snapshot: MasterSnapshot,
        config: ArborConfig,
        postbox: Arc<dyn CellPostbox>,
    ) -> Result<Master> {
        validate_reign(&snapshot.reign)?;
        let transactions = TransactionManager::restore(
            snapshot.cell_tag,
            config.transaction_manager.clone(),
            snapshot.transactions,
            snapshot.timestamp_holders,
            BoomerangTracker::restore(snapshot.boomerang_waves),
            Utc::now(),
        );
        Ok(Master {
            config,
            id_generator: snapshot.id_generator,
            cypress: snapshot.cypress,
            transactions,
            postbox,
            external_client: None,
        })
    }
}

/// Parses a reign tag (`arbor.reign.v4` -> 4).
fn parse_reign(reign: &str) -> Result<u32> {
    let parts: Vec<&str> = reign.split('.').collect();
    if parts.len() != 3 || parts[0] != "arbor" || parts[1] != "reign" {
        bail!("invalid reign tag format: {reign}");
    }
    let Some(version) = parts[2].strip_prefix('v') else {
        bail!("invalid reign tag format: {reign}");
    };
    version
        .parse()
        .with_context(|| format!("invalid reign tag format: {reign}"))
}

pub fn validate_reign(reign: &str) -> Result<()> {
    let version = parse_reign(reign)?;
    let minimum = parse_reign(MINIMUM_SUPPORTED_REIGN).expect("constant is well-formed");
    let current = parse_reign(CURRENT_REIGN).expect("constant is well-formed");
    if version < minimum {
        bail!("snapshot reign {reign} is too old; minimum supported is {MINIMUM_SUPPORTED_REIGN}");
    }
    if version > current {
        bail!("snapshot reign {reign} is newer than this build ({CURRENT_REIGN})");
    }
    Ok(())
}

/// Writes the snapshot atomically (tmp file + rename).
pub fn save_snapshot(dir: &Path, snapshot: &MasterSnapshot) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create snapshot dir {}", dir.display()))?;
    let path = dir.join(SNAPSHOT_FILE);
    let tmp_path = path.with_extension("tmp");
    let json = serde_json::to_vec_pretty(snapshot).context("failed to serialize snapshot")?;
    {
        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create snapshot tmp file {}", tmp_path.display()))?;
        file.write_all(&json)
            .with_context(|| format!("failed to write snapshot tmp file {}", tmp_path.display()))?;
        file.sync_all().context("failed to sync snapshot file")?;
    }
    fs::rename(&tmp_path, &path)
        .with_context(|| format!("failed to rename snapshot file to {}", path.display()))?;
    Ok(())
}

/// Loads a snapshot; `None` when no snapshot exists yet.
pub fn load_snapshot(dir: &Path) -> Result<Option<MasterSnapshot>> {
    let path = dir.join(SNAPSHOT_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read snapshot file {}", path.display()))?;
    let snapshot: MasterSnapshot = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse snapshot JSON {}", path.display()))?;
    validate_reign(&snapshot.reign)?;
    Ok(Some(snapshot))
}
