use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EscrowError;
use crate::types::MilestoneId;

/// Financial events recorded in the audit trail.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Funding,
    Release,
    Refund,
    Withdrawal,
    Adjustment,
}

impl AuditKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Funding => "funding",
            Self::Release => "release",
            Self::Refund => "refund",
            Self::Withdrawal => "withdrawal",
            Self::Adjustment => "adjustment",
        }
    }
}

/// Hash-chained audit entry. The chain is the reconciliation source of
/// record: every escrow movement appears here exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: String,
    pub index: u64,
    pub milestone_id: Option<MilestoneId>,
    pub kind: AuditKind,
    pub payload: Value,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only audit trail with hash-chain proofs.
///
/// No in-place mutation APIs are exposed; every financial event becomes an
/// additional record, which preserves full historical accountability.
#[derive(Debug, Default, Clone)]
pub struct AuditTrail {
    entries: Vec<AuditEntry>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Rebuild a trail from persisted entries and verify hash-chain
    /// integrity.
    pub fn from_entries(entries: Vec<AuditEntry>) -> Result<Self, EscrowError> {
        let trail = Self { entries };

        for (expected_index, entry) in trail.entries.iter().enumerate() {
            if entry.index != expected_index as u64 {
                return Err(EscrowError::Storage(format!(
                    "audit index gap detected at position {} (found {})",
                    expected_index, entry.index
                )));
            }
        }

        if !trail.verify_chain() {
            return Err(EscrowError::Storage(
                "persisted audit trail hash-chain verification failed".to_string(),
            ));
        }

        Ok(trail)
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn entries_for_milestone(&self, milestone_id: MilestoneId) -> Vec<&AuditEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.milestone_id == Some(milestone_id))
            .collect()
    }

    pub fn has_entry(&self, milestone_id: MilestoneId, kind: AuditKind) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.milestone_id == Some(milestone_id) && entry.kind == kind)
    }

    /// Build the next deterministic entry without mutating the chain.
    pub fn build_entry(
        &self,
        milestone_id: Option<MilestoneId>,
        kind: AuditKind,
        payload: Value,
    ) -> AuditEntry {
        let index = self.entries.len() as u64;
        let recorded_at = Utc::now();
        let previous_hash = self.entries.last().map(|entry| entry.entry_hash.clone());
        let entry_hash = compute_entry_hash(
            index,
            milestone_id,
            kind,
            &payload,
            recorded_at,
            previous_hash.as_deref(),
        );

        AuditEntry {
            entry_id: Uuid::new_v4().to_string(),
            index,
            milestone_id,
            kind,
            payload,
            previous_hash,
            entry_hash,
            recorded_at,
        }
    }

    /// Commit a pre-built entry after external durability succeeds.
    pub fn commit_entry(&mut self, entry: AuditEntry) -> Result<(), EscrowError> {
        let expected_index = self.entries.len() as u64;
        if entry.index != expected_index {
            return Err(EscrowError::Storage(format!(
                "audit commit index mismatch: expected {}, got {}",
                expected_index, entry.index
            )));
        }

        let expected_previous = self.entries.last().map(|e| e.entry_hash.clone());
        if entry.previous_hash != expected_previous {
            return Err(EscrowError::Storage(
                "audit commit previous hash mismatch".to_string(),
            ));
        }

        let expected_hash = compute_entry_hash(
            entry.index,
            entry.milestone_id,
            entry.kind,
            &entry.payload,
            entry.recorded_at,
            entry.previous_hash.as_deref(),
        );
        if entry.entry_hash != expected_hash {
            return Err(EscrowError::Storage(
                "audit commit hash mismatch".to_string(),
            ));
        }

        self.entries.push(entry);
        Ok(())
    }

    pub fn verify_chain(&self) -> bool {
        let mut previous_hash: Option<String> = None;
        for entry in &self.entries {
            let expected = compute_entry_hash(
                entry.index,
                entry.milestone_id,
                entry.kind,
                &entry.payload,
                entry.recorded_at,
                previous_hash.as_deref(),
            );
            if entry.entry_hash != expected {
                return false;
            }
            if entry.previous_hash != previous_hash {
                return false;
            }
            previous_hash = Some(entry.entry_hash.clone());
        }
        true
    }
}

fn compute_entry_hash(
    index: u64,
    milestone_id: Option<MilestoneId>,
    kind: AuditKind,
    payload: &Value,
    recorded_at: DateTime<Utc>,
    previous_hash: Option<&str>,
) -> String {
    let material = serde_json::json!({
        "index": index,
        "milestone_id": milestone_id,
        "kind": kind,
        "payload": payload,
        "recorded_at": recorded_at,
        "previous_hash": previous_hash,
    });

    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}
