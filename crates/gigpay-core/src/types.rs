use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::EscrowError;
use crate::milestone::MilestoneStatus;

/// Marketplace user identifier (client, freelancer, or arbiter).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Project identifier; projects themselves are managed outside the escrow core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MilestoneId(pub Uuid);

impl MilestoneId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MilestoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DisputeId(pub Uuid);

impl DisputeId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for DisputeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A billable, independently approvable unit of project work.
///
/// All money fields are integer minor units (cents); `50_000` is 500.00.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub id: MilestoneId,
    pub project_id: ProjectId,
    pub client_id: UserId,
    pub freelancer_id: Option<UserId>,
    pub title: String,
    pub description: String,
    pub amount_minor: u64,
    pub currency: String,
    pub due_date: Option<DateTime<Utc>>,
    pub status: MilestoneStatus,
    pub deliverables: Vec<String>,
    pub revision_notes: Option<String>,
    pub funded_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub disputed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Milestone {
    pub fn is_assigned_to(&self, user: &UserId) -> bool {
        self.freelancer_id.as_ref() == Some(user)
    }

    pub fn is_party(&self, user: &UserId) -> bool {
        &self.client_id == user || self.is_assigned_to(user)
    }
}

/// Input for creating a milestone. Validation happens in `into_milestone`
/// so every construction path shares the same checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneDraft {
    pub project_id: ProjectId,
    pub client_id: UserId,
    pub freelancer_id: Option<UserId>,
    pub title: String,
    pub description: String,
    pub amount_minor: u64,
    pub currency: String,
    pub due_date: Option<DateTime<Utc>>,
}

impl MilestoneDraft {
    pub fn new(
        project_id: impl Into<String>,
        client_id: impl Into<String>,
        title: impl Into<String>,
        amount_minor: u64,
    ) -> Self {
        Self {
            project_id: ProjectId::new(project_id),
            client_id: UserId::new(client_id),
            freelancer_id: None,
            title: title.into(),
            description: String::new(),
            amount_minor,
            currency: "USD".to_string(),
            due_date: None,
        }
    }

    pub fn with_freelancer(mut self, freelancer_id: impl Into<String>) -> Self {
        self.freelancer_id = Some(UserId::new(freelancer_id));
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_due_date(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn into_milestone(self) -> Result<Milestone, EscrowError> {
        if self.amount_minor == 0 {
            return Err(EscrowError::Validation(
                "milestone amount must be positive".to_string(),
            ));
        }
        if self.title.trim().is_empty() {
            return Err(EscrowError::Validation(
                "milestone title must not be empty".to_string(),
            ));
        }
        if self.currency.trim().is_empty() {
            return Err(EscrowError::Validation(
                "milestone currency must not be empty".to_string(),
            ));
        }

        let now = Utc::now();
        Ok(Milestone {
            id: MilestoneId::generate(),
            project_id: self.project_id,
            client_id: self.client_id,
            freelancer_id: self.freelancer_id,
            title: self.title,
            description: self.description,
            amount_minor: self.amount_minor,
            currency: self.currency,
            due_date: self.due_date,
            status: MilestoneStatus::Created,
            deliverables: Vec::new(),
            revision_notes: None,
            funded_at: None,
            submitted_at: None,
            released_at: None,
            disputed_at: None,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Wallet transaction entry kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Credit,
    Debit,
    Refund,
}

/// Immutable record appended to a wallet's history. Never edited or
/// removed after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletEntry {
    pub entry_id: Uuid,
    pub kind: EntryKind,
    pub amount_minor: u64,
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

/// Per-user balance plus append-only transaction history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: UserId,
    pub balance_minor: u64,
    pub entries: Vec<WalletEntry>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            balance_minor: 0,
            entries: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Re-derive the balance from the entry history. The stored balance and
    /// this sum must agree at all times; hydration rejects wallets where
    /// they do not.
    pub fn derived_balance_minor(&self) -> Option<u64> {
        let mut balance: u64 = 0;
        for entry in &self.entries {
            balance = match entry.kind {
                EntryKind::Credit | EntryKind::Refund => {
                    balance.checked_add(entry.amount_minor)?
                }
                EntryKind::Debit => balance.checked_sub(entry.amount_minor)?,
            };
        }
        Some(balance)
    }
}

/// Escrow payment record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Pending,
    Funded,
    Released,
    Refunded,
}

impl EscrowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Released | Self::Refunded)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Funded => "funded",
            Self::Released => "released",
            Self::Refunded => "refunded",
        }
    }
}

/// Links a milestone to the external payment proof. At most one
/// non-terminal record exists per milestone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowRecord {
    pub milestone_id: MilestoneId,
    pub client_id: UserId,
    pub amount_minor: u64,
    pub status: EscrowStatus,
    pub payment_ref: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Arbitration outcome for a disputed milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeOutcome {
    RefundToClient,
    ReleaseToFreelancer,
}

/// Dispute as consumed by the escrow core: raised by either party,
/// terminated only by an arbiter decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    pub id: DisputeId,
    pub milestone_id: MilestoneId,
    pub raised_by: UserId,
    pub reason: String,
    pub outcome: Option<DisputeOutcome>,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<UserId>,
}

/// Proof of an out-of-band gateway payment, presented by the client when
/// funding a milestone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentProof {
    pub order_id: String,
    pub payment_id: String,
    pub signature: String,
}

/// Order reference produced by the payment gateway's create-order call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub order_id: String,
    pub amount_minor: u64,
    pub currency: String,
    pub receipt: String,
    pub notes: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Result of a financial operation on the orchestrator. Replaying an
/// already-settled operation returns the stored receipt with
/// `replayed = true` instead of repeating its effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub milestone_id: MilestoneId,
    pub outcome: EscrowStatus,
    pub amount_minor: u64,
    pub payment_ref: Option<String>,
    pub replayed: bool,
    pub occurred_at: DateTime<Utc>,
}
