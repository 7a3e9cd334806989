//! Sled-backed archive for receipts and periodic snapshots.
//!
//! Optional: a session only writes here when a state directory is
//! configured. The archive is write-behind audit storage and is never
//! read back by a running session, so it cannot influence determinism.

use crate::error::KernelError;
use crate::state_store::{Receipt, Snapshot};
use std::path::Path;

/// Snapshot cadence in revisions.
pub const SNAPSHOT_INTERVAL: u64 = 25;

/// Persistent archive of a session's receipts and snapshots.
pub struct ReceiptArchive {
    db: sled::Db,
    receipts: sled::Tree,
    snapshots: sled::Tree,
}

fn storage_err(context: &str, err: impl std::fmt::Display) -> KernelError {
    KernelError::Persistence(format!("{}: {}", context, err))
}

impl ReceiptArchive {
    /// Opens (or creates) an archive at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, KernelError> {
        let db = sled::open(path).map_err(|e| storage_err("Failed to open sled DB", e))?;
        Self::from_db(db)
    }

    /// Creates a temporary archive (for testing).
    #[cfg(test)]
    pub fn open_temp() -> Result<Self, KernelError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| storage_err("Failed to open temp DB", e))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, KernelError> {
        let receipts = db
            .open_tree("receipts")
            .map_err(|e| storage_err("Failed to open receipts tree", e))?;
        let snapshots = db
            .open_tree("snapshots")
            .map_err(|e| storage_err("Failed to open snapshots tree", e))?;
        Ok(Self {
            db,
            receipts,
            snapshots,
        })
    }

    /// Drops everything stored so far (used on session reset).
    pub fn clear(&self) -> Result<(), KernelError> {
        self.receipts
            .clear()
            .map_err(|e| storage_err("Clear failed", e))?;
        self.snapshots
            .clear()
            .map_err(|e| storage_err("Clear failed", e))?;
        Ok(())
    }

    /// Stores one receipt under its big-endian sequence number.
    pub fn record_receipt(&self, receipt: &Receipt) -> Result<(), KernelError> {
        let bytes = serde_json::to_vec(receipt).map_err(|e| storage_err("Encode failed", e))?;
        self.receipts
            .insert(receipt.sequence_no.to_be_bytes(), bytes)
            .map_err(|e| storage_err("Insert failed", e))?;
        Ok(())
    }

    /// Stores a snapshot when its revision falls on the snapshot cadence.
    ///
    /// Returns whether a snapshot was written.
    pub fn maybe_record_snapshot(&self, snapshot: &Snapshot) -> Result<bool, KernelError> {
        if snapshot.revision == 0 || snapshot.revision % SNAPSHOT_INTERVAL != 0 {
            return Ok(false);
        }
        let bytes = serde_json::to_vec(snapshot).map_err(|e| storage_err("Encode failed", e))?;
        self.snapshots
            .insert(snapshot.revision.to_be_bytes(), bytes)
            .map_err(|e| storage_err("Insert failed", e))?;
        Ok(true)
    }

    /// Loads all receipts in sequence order.
    pub fn load_receipts(&self) -> Result<Vec<Receipt>, KernelError> {
        let mut out = Vec::new();
        for item in self.receipts.iter() {
            let (_, value) = item.map_err(|e| storage_err("Iteration failed", e))?;
            let receipt: Receipt =
                serde_json::from_slice(&value).map_err(|e| storage_err("Decode failed", e))?;
            out.push(receipt);
        }
        Ok(out)
    }

    /// Revisions that have an archived snapshot.
    pub fn snapshot_revisions(&self) -> Result<Vec<u64>, KernelError> {
        let mut out = Vec::new();
        for item in self.snapshots.iter() {
            let (key, _) = item.map_err(|e| storage_err("Iteration failed", e))?;
            if key.len() == 8 {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&key);
                out.push(u64::from_be_bytes(arr));
            }
        }
        Ok(out)
    }

    /// Flushes pending writes to disk.
    pub fn flush(&self) -> Result<(), KernelError> {
        self.db
            .flush()
            .map_err(|e| storage_err("Flush failed", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_store::{Mutation, Operation, StateStore};
    use serde_json::json;

    #[test]
    fn test_receipts_round_trip_in_order() {
        let archive = ReceiptArchive::open_temp().unwrap();
        let mut store = StateStore::new();
        for i in 0..3u64 {
            let receipt = store.append_receipt(i * 1000, "mail.list", &json!({}), &json!([]));
            archive.record_receipt(&receipt).unwrap();
        }
        let loaded = archive.load_receipts().unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded, store.receipts().to_vec());
    }

    #[test]
    fn test_snapshot_cadence() {
        let archive = ReceiptArchive::open_temp().unwrap();
        let mut store = StateStore::new();
        store
            .seed(&[Mutation::Put {
                family: "docs".into(),
                id: "DOC-1".into(),
                value: json!({"n": 0}),
            }])
            .unwrap();
        let mut written = 0;
        for i in 0..SNAPSHOT_INTERVAL * 2 {
            let mut op = Operation::new("docs.update");
            op.mutations.push(Mutation::Put {
                family: "docs".into(),
                id: "DOC-1".into(),
                value: json!({ "n": i }),
            });
            store.apply(&op, i).unwrap();
            if archive.maybe_record_snapshot(&store.snapshot()).unwrap() {
                written += 1;
            }
        }
        assert_eq!(written, 2);
        assert_eq!(
            archive.snapshot_revisions().unwrap(),
            vec![SNAPSHOT_INTERVAL, SNAPSHOT_INTERVAL * 2]
        );
        archive.clear().unwrap();
        assert!(archive.load_receipts().unwrap().is_empty());
        archive.flush().unwrap();
    }
}
