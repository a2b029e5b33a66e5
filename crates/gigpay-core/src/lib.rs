//! GigPay escrow core.
//!
//! This crate owns the money-moving path of the marketplace: the milestone
//! lifecycle state machine, the wallet ledger, the hash-chained audit
//! trail, and the payment orchestrator that ties them together under one
//! atomic commit boundary.

#![deny(unsafe_code)]

pub mod audit;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod milestone;
pub mod notify;
pub mod storage;
pub mod types;

pub use audit::{AuditEntry, AuditKind, AuditTrail};
pub use engine::{EngineConfig, EscrowEngine};
pub use error::EscrowError;
pub use gateway::{PaymentGateway, PaymentSignature};
pub use ledger::WalletBook;
pub use milestone::{MilestoneEvent, MilestoneStatus};
pub use notify::{LogNotifier, Notifier};
pub use storage::{CommitSet, EscrowStore, NullMirror, PostgresMirror, StorageConfig, StoreMirror};
pub use types::{
    Dispute, DisputeId, DisputeOutcome, EntryKind, EscrowRecord, EscrowStatus, GatewayOrder,
    Milestone, MilestoneDraft, MilestoneId, PaymentProof, PaymentReceipt, ProjectId, UserId,
    Wallet, WalletEntry,
};
