//! Point-in-time snapshots of a single choice tree.
//!
//! The payload is opaque to the persistence collaborator; the digest lets the
//! kernel reject a payload that was altered or truncated in storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use spiral_core::{ChoiceTree, Result, SpiralError, TreeId};
use uuid::Uuid;

/// An opaque, checksummed checkpoint of one tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Unique ID for this snapshot.
    pub id: Uuid,

    /// The tree captured.
    pub tree_id: TreeId,

    /// History length of the tree at snapshot time.
    pub version: u64,

    /// Timestamp when the snapshot was taken.
    pub taken_at: DateTime<Utc>,

    /// Hex SHA-256 of the payload.
    pub digest: String,

    /// Serialized tree state.
    pub payload: Vec<u8>,
}

impl Snapshot {
    /// Capture a tree.
    pub fn capture(tree: &ChoiceTree) -> Result<Self> {
        let payload = serde_json::to_vec(tree)?;
        Ok(Self {
            id: Uuid::new_v4(),
            tree_id: tree.id,
            version: tree.history().len() as u64,
            taken_at: Utc::now(),
            digest: digest(&payload),
            payload,
        })
    }

    /// Check the payload against its digest.
    pub fn verify(&self) -> bool {
        self.digest == digest(&self.payload)
    }

    /// Decode and validate the captured tree.
    pub fn decode(&self) -> Result<ChoiceTree> {
        if !self.verify() {
            return Err(SpiralError::SnapshotCorrupt(format!(
                "digest mismatch for snapshot {}",
                self.id
            )));
        }

        let tree: ChoiceTree = serde_json::from_slice(&self.payload)
            .map_err(|e| SpiralError::SnapshotCorrupt(e.to_string()))?;

        if tree.id != self.tree_id {
            return Err(SpiralError::SnapshotCorrupt(format!(
                "payload holds tree {} but snapshot names {}",
                tree.id, self.tree_id
            )));
        }

        tree.verify()?;
        Ok(tree)
    }

    /// Size of the payload in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Check if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use spiral_core::{Context, TreeConfig};

    fn sample_tree() -> ChoiceTree {
        ChoiceTree::new(
            vec!["A".to_string(), "B".to_string()],
            Context::new(),
            TreeConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_capture_and_decode() {
        let tree = sample_tree();
        let snapshot = Snapshot::capture(&tree).unwrap();

        assert!(snapshot.verify());
        assert_eq!(snapshot.version, 0);
        assert_eq!(snapshot.digest.len(), 64);

        let decoded = snapshot.decode().unwrap();
        assert_eq!(decoded.id, tree.id);
        assert_eq!(decoded.root, tree.root);
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let tree = sample_tree();
        let mut snapshot = Snapshot::capture(&tree).unwrap();
        snapshot.payload.push(b' ');

        assert!(!snapshot.verify());
        assert!(matches!(snapshot.decode(), Err(SpiralError::SnapshotCorrupt(_))));
    }
}
