use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::audit::{AuditEntry, AuditKind};
use crate::error::EscrowError;
use crate::gateway::PaymentGateway;
use crate::milestone::{MilestoneEvent, MilestoneStatus};
use crate::notify::Notifier;
use crate::storage::{CommitSet, EscrowStore};
use crate::types::{
    Dispute, DisputeId, DisputeOutcome, EntryKind, EscrowRecord, EscrowStatus, GatewayOrder,
    Milestone, MilestoneDraft, MilestoneId, PaymentProof, PaymentReceipt, UserId, Wallet,
};

/// Escrow engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Reject funding whose declared amount differs from the milestone
    /// amount. On by default; turning it off downgrades the check to a log
    /// line.
    pub enforce_funding_amount: bool,
    /// Users allowed to resolve disputes.
    pub arbiters: Vec<UserId>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enforce_funding_amount: true,
            arbiters: Vec::new(),
        }
    }
}

/// Payment orchestrator: the only component that mutates wallet balances.
///
/// Every state-changing operation is one commit set spanning the
/// milestone, the escrow record, the wallet, and the audit trail; the
/// store persists and applies it atomically. Financial operations are
/// idempotent under retry with the milestone id as the natural key: a
/// replay after a confirmed success returns the stored receipt instead of
/// repeating the effect.
pub struct EscrowEngine {
    store: Arc<EscrowStore>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
}

impl EscrowEngine {
    pub fn new(
        store: Arc<EscrowStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            notifier,
            config,
        }
    }

    pub fn backend_label(&self) -> &'static str {
        self.store.backend_label()
    }

    pub async fn milestone(&self, id: MilestoneId) -> Result<Milestone, EscrowError> {
        self.store.milestone(id).await
    }

    pub async fn escrow_record(&self, id: MilestoneId) -> Option<EscrowRecord> {
        self.store.escrow_record(id).await
    }

    pub async fn dispute(&self, id: DisputeId) -> Result<Dispute, EscrowError> {
        self.store.dispute(id).await
    }

    pub async fn wallet(&self, user_id: &UserId) -> Wallet {
        self.store.wallet(user_id).await
    }

    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.store.audit_entries().await
    }

    pub async fn verify_audit_chain(&self) -> bool {
        self.store.verify_audit_chain().await
    }

    /// Create a milestone. The caller (controller layer) has already
    /// established that the client owns the referenced project.
    pub async fn create_milestone(&self, draft: MilestoneDraft) -> Result<Milestone, EscrowError> {
        let milestone = draft.into_milestone()?;
        let created = self
            .store
            .commit(|_state| {
                Ok((
                    milestone.clone(),
                    CommitSet {
                        milestone: Some(milestone.clone()),
                        ..CommitSet::default()
                    },
                ))
            })
            .await?;

        info!(milestone = %created.id, amount_minor = created.amount_minor, "milestone created");
        Ok(created)
    }

    /// Freelancer accepts the milestone.
    pub async fn accept_milestone(
        &self,
        actor: &UserId,
        id: MilestoneId,
    ) -> Result<Milestone, EscrowError> {
        self.transition(id, MilestoneEvent::FreelancerAccept, |milestone| {
            require_assigned_freelancer(milestone, actor)
        })
        .await
    }

    /// Ask the gateway for a payment-collection order covering the
    /// milestone amount. No local state changes; a failed or timed-out
    /// call is safe to retry.
    pub async fn create_funding_order(
        &self,
        actor: &UserId,
        id: MilestoneId,
    ) -> Result<GatewayOrder, EscrowError> {
        let milestone = self.store.milestone(id).await?;
        require_client(&milestone, actor)?;
        if milestone.status != MilestoneStatus::Accepted {
            return Err(EscrowError::InvalidState(format!(
                "milestone {} is not fundable while {}",
                id,
                milestone.status.name()
            )));
        }

        let mut notes = BTreeMap::new();
        notes.insert("milestone_id".to_string(), id.to_string());
        notes.insert("project_id".to_string(), milestone.project_id.to_string());

        self.gateway
            .create_order(
                milestone.amount_minor,
                &milestone.currency,
                &id.to_string(),
                notes,
            )
            .await
    }

    /// Fund the escrow with an out-of-band payment proof.
    ///
    /// The proof is verified against the gateway BEFORE any state is
    /// touched; no lock is held across the verification call.
    pub async fn fund_escrow(
        &self,
        actor: &UserId,
        id: MilestoneId,
        amount_minor: u64,
        proof: PaymentProof,
    ) -> Result<PaymentReceipt, EscrowError> {
        if !self.gateway.verify_payment(&proof).await? {
            return Err(EscrowError::SignatureMismatch);
        }

        let actor = actor.clone();
        let enforce_amount = self.config.enforce_funding_amount;
        let receipt = self
            .store
            .commit(move |state| {
                let milestone = state.milestone(id)?;
                require_client(milestone, &actor)?;
                if milestone.freelancer_id.is_none() {
                    return Err(EscrowError::InvalidState(format!(
                        "milestone {id} cannot be funded before a freelancer is assigned"
                    )));
                }

                // Idempotent replay: same payment proof after a confirmed
                // funding returns the stored outcome.
                if milestone.status == MilestoneStatus::Funded {
                    let record = state.escrow_record(id).ok_or_else(|| {
                        EscrowError::Storage(format!(
                            "milestone {id} is funded but has no escrow record"
                        ))
                    })?;
                    if record.payment_ref.as_deref() == Some(proof.payment_id.as_str()) {
                        return Ok((
                            replay_receipt(record),
                            CommitSet::default(),
                        ));
                    }
                    return Err(EscrowError::InvalidState(format!(
                        "milestone {id} is already funded with a different payment"
                    )));
                }

                if amount_minor != milestone.amount_minor {
                    if enforce_amount {
                        return Err(EscrowError::Validation(format!(
                            "funding amount {} does not match milestone amount {}",
                            amount_minor, milestone.amount_minor
                        )));
                    }
                    warn!(
                        milestone = %id,
                        funded_minor = amount_minor,
                        expected_minor = milestone.amount_minor,
                        "funding amount differs from milestone amount"
                    );
                }

                let mut milestone = milestone.clone();
                milestone.status = milestone.status.apply(MilestoneEvent::Fund)?;
                let now = Utc::now();
                milestone.funded_at = Some(now);
                milestone.updated_at = now;

                let record = EscrowRecord {
                    milestone_id: id,
                    client_id: milestone.client_id.clone(),
                    amount_minor: milestone.amount_minor,
                    status: EscrowStatus::Funded,
                    payment_ref: Some(proof.payment_id.clone()),
                    updated_at: now,
                };

                let audit = state.audit().build_entry(
                    Some(id),
                    AuditKind::Funding,
                    serde_json::json!({
                        "amount_minor": milestone.amount_minor,
                        "order_id": proof.order_id,
                        "payment_id": proof.payment_id,
                    }),
                );

                let receipt = PaymentReceipt {
                    milestone_id: id,
                    outcome: EscrowStatus::Funded,
                    amount_minor: milestone.amount_minor,
                    payment_ref: record.payment_ref.clone(),
                    replayed: false,
                    occurred_at: now,
                };

                Ok((
                    receipt,
                    CommitSet {
                        milestone: Some(milestone),
                        escrow: Some(record),
                        audit: Some(audit),
                        ..CommitSet::default()
                    },
                ))
            })
            .await?;

        if !receipt.replayed {
            info!(milestone = %id, amount_minor = receipt.amount_minor, "escrow funded");
            self.notify_parties(id, "Milestone funded", "Escrow funding confirmed")
                .await;
        }
        Ok(receipt)
    }

    /// Freelancer starts work on a funded milestone.
    pub async fn start_work(
        &self,
        actor: &UserId,
        id: MilestoneId,
    ) -> Result<Milestone, EscrowError> {
        self.transition(id, MilestoneEvent::StartWork, |milestone| {
            require_assigned_freelancer(milestone, actor)
        })
        .await
    }

    /// Freelancer submits work for review, attaching deliverable
    /// references. Submitting without deliverables is allowed but logged.
    pub async fn submit_work(
        &self,
        actor: &UserId,
        id: MilestoneId,
        deliverables: Vec<String>,
    ) -> Result<Milestone, EscrowError> {
        if deliverables.is_empty() {
            warn!(milestone = %id, "work submitted without deliverable references");
        }

        let actor = actor.clone();
        let milestone = self
            .store
            .commit(move |state| {
                let milestone = state.milestone(id)?;
                require_assigned_freelancer(milestone, &actor)?;

                let mut milestone = milestone.clone();
                milestone.status = milestone.status.apply(MilestoneEvent::Submit)?;
                let now = Utc::now();
                milestone.deliverables.extend(deliverables);
                milestone.submitted_at = Some(now);
                milestone.updated_at = now;

                Ok((
                    milestone.clone(),
                    CommitSet {
                        milestone: Some(milestone),
                        ..CommitSet::default()
                    },
                ))
            })
            .await?;

        self.notify_quietly(
            &milestone.client_id,
            "Work submitted",
            "Submitted work is ready for review",
        )
        .await;
        Ok(milestone)
    }

    /// Client sends submitted work back for revision.
    pub async fn request_revision(
        &self,
        actor: &UserId,
        id: MilestoneId,
        notes: Option<String>,
    ) -> Result<Milestone, EscrowError> {
        let actor = actor.clone();
        let milestone = self
            .store
            .commit(move |state| {
                let milestone = state.milestone(id)?;
                require_client(milestone, &actor)?;

                let mut milestone = milestone.clone();
                milestone.status = milestone.status.apply(MilestoneEvent::RequestRevision)?;
                milestone.revision_notes = notes;
                milestone.updated_at = Utc::now();

                Ok((
                    milestone.clone(),
                    CommitSet {
                        milestone: Some(milestone),
                        ..CommitSet::default()
                    },
                ))
            })
            .await?;

        if let Some(freelancer) = &milestone.freelancer_id {
            self.notify_quietly(freelancer, "Revision requested", "The client requested changes")
                .await;
        }
        Ok(milestone)
    }

    /// Freelancer resumes work after a revision request.
    pub async fn resume_work(
        &self,
        actor: &UserId,
        id: MilestoneId,
    ) -> Result<Milestone, EscrowError> {
        self.transition(id, MilestoneEvent::Resume, |milestone| {
            require_assigned_freelancer(milestone, actor)
        })
        .await
    }

    /// Client approves submitted work: the milestone is released and the
    /// freelancer's wallet credited, atomically.
    pub async fn release_payment(
        &self,
        actor: &UserId,
        id: MilestoneId,
    ) -> Result<PaymentReceipt, EscrowError> {
        let actor = actor.clone();
        let receipt = self
            .settle(id, MilestoneEvent::Approve, None, move |milestone| {
                require_client(milestone, &actor)
            })
            .await?;

        if !receipt.replayed {
            self.notify_parties(id, "Milestone released", "Escrow released to freelancer")
                .await;
        }
        Ok(receipt)
    }

    /// Either party escalates a funded/in-progress/submitted milestone to
    /// dispute.
    pub async fn raise_dispute(
        &self,
        actor: &UserId,
        id: MilestoneId,
        reason: impl Into<String>,
    ) -> Result<Dispute, EscrowError> {
        let actor = actor.clone();
        let reason = reason.into();
        let dispute = self
            .store
            .commit(move |state| {
                let milestone = state.milestone(id)?;
                if !milestone.is_party(&actor) {
                    return Err(EscrowError::NotAuthorized(format!(
                        "{actor} is neither the client nor the assigned freelancer"
                    )));
                }

                let mut milestone = milestone.clone();
                milestone.status = milestone.status.apply(MilestoneEvent::RaiseDispute)?;
                let now = Utc::now();
                milestone.disputed_at = Some(now);
                milestone.updated_at = now;

                let dispute = Dispute {
                    id: DisputeId::generate(),
                    milestone_id: id,
                    raised_by: actor.clone(),
                    reason: reason.clone(),
                    outcome: None,
                    opened_at: now,
                    resolved_at: None,
                    resolved_by: None,
                };

                Ok((
                    dispute.clone(),
                    CommitSet {
                        milestone: Some(milestone),
                        dispute: Some(dispute),
                        ..CommitSet::default()
                    },
                ))
            })
            .await?;

        info!(milestone = %id, dispute = %dispute.id, raised_by = %dispute.raised_by, "dispute raised");
        self.notify_parties(id, "Dispute raised", "The milestone is now under arbitration")
            .await;
        Ok(dispute)
    }

    /// Dispute-resolution hook: an arbiter forces a disputed milestone
    /// into a terminal state. This delegates to the same settlement path
    /// as the normal flow; it is a caller, not a shortcut around
    /// atomicity.
    pub async fn resolve_dispute(
        &self,
        arbiter: &UserId,
        dispute_id: DisputeId,
        outcome: DisputeOutcome,
    ) -> Result<PaymentReceipt, EscrowError> {
        if !self.config.arbiters.contains(arbiter) {
            return Err(EscrowError::NotAuthorized(format!(
                "{arbiter} is not an arbiter"
            )));
        }

        let dispute = self.store.dispute(dispute_id).await?;

        // Replaying a resolution that already landed returns the stored
        // outcome; a conflicting outcome is an error.
        if let Some(recorded) = dispute.outcome {
            if recorded != outcome {
                return Err(EscrowError::InvalidState(format!(
                    "dispute {dispute_id} was already resolved with a different outcome"
                )));
            }
            let record = self
                .store
                .escrow_record(dispute.milestone_id)
                .await
                .ok_or_else(|| {
                    EscrowError::Storage(format!(
                        "resolved dispute {dispute_id} has no escrow record"
                    ))
                })?;
            return Ok(replay_receipt(&record));
        }

        let now = Utc::now();
        let mut resolved = dispute.clone();
        resolved.outcome = Some(outcome);
        resolved.resolved_at = Some(now);
        resolved.resolved_by = Some(arbiter.clone());

        let event = match outcome {
            DisputeOutcome::ReleaseToFreelancer => MilestoneEvent::ResolveRelease,
            DisputeOutcome::RefundToClient => MilestoneEvent::ResolveRefund,
        };

        let receipt = self
            .settle(dispute.milestone_id, event, Some(resolved), |_| Ok(()))
            .await?;

        info!(
            dispute = %dispute_id,
            milestone = %dispute.milestone_id,
            outcome = ?outcome,
            arbiter = %arbiter,
            "dispute resolved"
        );
        self.notify_parties(
            dispute.milestone_id,
            "Dispute resolved",
            match outcome {
                DisputeOutcome::ReleaseToFreelancer => "Escrow released to freelancer",
                DisputeOutcome::RefundToClient => "Escrow refunded to client",
            },
        )
        .await;
        Ok(receipt)
    }

    pub async fn wallet_balance_minor(&self, user_id: &UserId) -> u64 {
        self.store.wallet(user_id).await.balance_minor
    }

    /// Withdraw from the acting user's own wallet.
    pub async fn withdraw(
        &self,
        actor: &UserId,
        amount_minor: u64,
    ) -> Result<Wallet, EscrowError> {
        let actor = actor.clone();
        let wallet = self
            .store
            .commit(move |state| {
                let wallet =
                    state
                        .book()
                        .build_entry(&actor, EntryKind::Debit, amount_minor, "withdrawal")?;
                let audit = state.audit().build_entry(
                    None,
                    AuditKind::Withdrawal,
                    serde_json::json!({
                        "user_id": actor,
                        "amount_minor": amount_minor,
                    }),
                );

                Ok((
                    wallet.clone(),
                    CommitSet {
                        wallet: Some(wallet),
                        audit: Some(audit),
                        ..CommitSet::default()
                    },
                ))
            })
            .await?;

        info!(user = %wallet.user_id, amount_minor, balance_minor = wallet.balance_minor, "withdrawal recorded");
        Ok(wallet)
    }

    /// Shared settlement path for release and refund, whether triggered by
    /// client approval or arbitration. One commit set carries the
    /// milestone, the escrow record, the optional wallet credit, the
    /// optional dispute update, and the audit entry.
    async fn settle<G>(
        &self,
        id: MilestoneId,
        event: MilestoneEvent,
        dispute: Option<Dispute>,
        guard: G,
    ) -> Result<PaymentReceipt, EscrowError>
    where
        G: FnOnce(&Milestone) -> Result<(), EscrowError> + Send,
    {
        self.store
            .commit(move |state| {
                let milestone = state.milestone(id)?;
                guard(milestone)?;

                let releases_funds = match event {
                    MilestoneEvent::Approve | MilestoneEvent::ResolveRelease => true,
                    MilestoneEvent::ResolveRefund => false,
                    other => {
                        return Err(EscrowError::InvalidState(format!(
                            "'{}' is not a settlement event",
                            other.name()
                        )))
                    }
                };
                let terminal = if releases_funds {
                    MilestoneStatus::Released
                } else {
                    MilestoneStatus::Refunded
                };

                // Idempotent replay: the terminal state was already reached.
                if milestone.status == terminal {
                    let record = state.escrow_record(id).ok_or_else(|| {
                        EscrowError::Storage(format!(
                            "settled milestone {id} has no escrow record"
                        ))
                    })?;
                    return Ok((replay_receipt(record), CommitSet::default()));
                }

                let mut milestone = milestone.clone();
                milestone.status = milestone.status.apply(event)?;
                let now = Utc::now();
                milestone.updated_at = now;

                let mut record = state.escrow_record(id).cloned().ok_or_else(|| {
                    EscrowError::InvalidState(format!("milestone {id} was never funded"))
                })?;
                if record.status.is_terminal() {
                    return Err(EscrowError::InvalidState(format!(
                        "escrow for milestone {id} is already {}",
                        record.status.name()
                    )));
                }
                record.updated_at = now;

                let mut set = CommitSet::default();
                let outcome = if releases_funds {
                    milestone.released_at = Some(now);
                    record.status = EscrowStatus::Released;

                    let freelancer = milestone.freelancer_id.clone().ok_or_else(|| {
                        EscrowError::InvalidState(format!(
                            "milestone {id} has no assigned freelancer to pay"
                        ))
                    })?;
                    let wallet = state.book().build_entry(
                        &freelancer,
                        EntryKind::Credit,
                        record.amount_minor,
                        format!("milestone {id} released"),
                    )?;
                    set.wallet = Some(wallet);
                    set.audit = Some(state.audit().build_entry(
                        Some(id),
                        AuditKind::Release,
                        serde_json::json!({
                            "amount_minor": record.amount_minor,
                            "freelancer_id": freelancer,
                            "via_dispute": dispute.is_some(),
                        }),
                    ));
                    EscrowStatus::Released
                } else {
                    record.status = EscrowStatus::Refunded;
                    // No client wallet exists in this model: the refund is
                    // the status flip plus the audit record.
                    set.audit = Some(state.audit().build_entry(
                        Some(id),
                        AuditKind::Refund,
                        serde_json::json!({
                            "amount_minor": record.amount_minor,
                            "client_id": record.client_id,
                            "reason": dispute
                                .as_ref()
                                .map(|d| d.reason.clone())
                                .unwrap_or_default(),
                        }),
                    ));
                    EscrowStatus::Refunded
                };

                let receipt = PaymentReceipt {
                    milestone_id: id,
                    outcome,
                    amount_minor: record.amount_minor,
                    payment_ref: record.payment_ref.clone(),
                    replayed: false,
                    occurred_at: now,
                };

                set.milestone = Some(milestone);
                set.escrow = Some(record);
                set.dispute = dispute;
                Ok((receipt, set))
            })
            .await
    }

    /// Plain state-machine transition with an actor guard and no ledger
    /// effect.
    async fn transition<G>(
        &self,
        id: MilestoneId,
        event: MilestoneEvent,
        guard: G,
    ) -> Result<Milestone, EscrowError>
    where
        G: FnOnce(&Milestone) -> Result<(), EscrowError> + Send,
    {
        self.store
            .commit(move |state| {
                let milestone = state.milestone(id)?;
                guard(milestone)?;

                let mut milestone = milestone.clone();
                milestone.status = milestone.status.apply(event)?;
                milestone.updated_at = Utc::now();

                Ok((
                    milestone.clone(),
                    CommitSet {
                        milestone: Some(milestone),
                        ..CommitSet::default()
                    },
                ))
            })
            .await
    }

    /// Notify both parties of a milestone. Runs after the commit point;
    /// failures are logged and never abort the committed operation.
    async fn notify_parties(&self, id: MilestoneId, subject: &str, body: &str) {
        let Ok(milestone) = self.store.milestone(id).await else {
            return;
        };
        self.notify_quietly(&milestone.client_id, subject, body).await;
        if let Some(freelancer) = &milestone.freelancer_id {
            self.notify_quietly(freelancer, subject, body).await;
        }
    }

    async fn notify_quietly(&self, user: &UserId, subject: &str, body: &str) {
        if let Err(err) = self.notifier.notify(user, subject, body).await {
            warn!(user = %user, subject, error = %err, "notification failed");
        }
    }
}

fn replay_receipt(record: &EscrowRecord) -> PaymentReceipt {
    PaymentReceipt {
        milestone_id: record.milestone_id,
        outcome: record.status,
        amount_minor: record.amount_minor,
        payment_ref: record.payment_ref.clone(),
        replayed: true,
        occurred_at: record.updated_at,
    }
}

fn require_client(milestone: &Milestone, actor: &UserId) -> Result<(), EscrowError> {
    if &milestone.client_id != actor {
        return Err(EscrowError::NotAuthorized(format!(
            "{actor} is not the client for milestone {}",
            milestone.id
        )));
    }
    Ok(())
}

fn require_assigned_freelancer(milestone: &Milestone, actor: &UserId) -> Result<(), EscrowError> {
    if !milestone.is_assigned_to(actor) {
        return Err(EscrowError::NotAuthorized(format!(
            "{actor} is not the assigned freelancer for milestone {}",
            milestone.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::PaymentSignature;
    use crate::storage::{NullMirror, StoreMirror};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SECRET: &str = "test-gateway-secret";

    /// In-process gateway double: signs and verifies with the shared
    /// scheme, so forged proofs fail exactly as they would upstream.
    struct TestGateway {
        signature: PaymentSignature,
        orders: AtomicUsize,
    }

    impl TestGateway {
        fn new() -> Self {
            Self {
                signature: PaymentSignature::new(SECRET),
                orders: AtomicUsize::new(0),
            }
        }

        fn proof_for(&self, order_id: &str, payment_id: &str) -> PaymentProof {
            PaymentProof {
                order_id: order_id.to_string(),
                payment_id: payment_id.to_string(),
                signature: self.signature.sign(order_id, payment_id),
            }
        }
    }

    #[async_trait]
    impl PaymentGateway for TestGateway {
        fn name(&self) -> &'static str {
            "test"
        }

        async fn create_order(
            &self,
            amount_minor: u64,
            currency: &str,
            receipt: &str,
            _notes: BTreeMap<String, String>,
        ) -> Result<GatewayOrder, EscrowError> {
            let n = self.orders.fetch_add(1, Ordering::SeqCst);
            Ok(GatewayOrder {
                order_id: format!("order_{n}"),
                amount_minor,
                currency: currency.to_string(),
                receipt: receipt.to_string(),
                notes: BTreeMap::new(),
                created_at: Utc::now(),
            })
        }

        async fn verify_payment(&self, proof: &PaymentProof) -> Result<bool, EscrowError> {
            self.signature
                .verify(&proof.order_id, &proof.payment_id, &proof.signature)
        }
    }

    struct Harness {
        engine: Arc<EscrowEngine>,
        gateway: Arc<TestGateway>,
    }

    fn harness() -> Harness {
        harness_with_mirror(Arc::new(NullMirror))
    }

    fn harness_with_mirror(mirror: Arc<dyn StoreMirror>) -> Harness {
        let gateway = Arc::new(TestGateway::new());
        let engine = Arc::new(EscrowEngine::new(
            Arc::new(EscrowStore::with_mirror(mirror)),
            gateway.clone(),
            Arc::new(crate::notify::LogNotifier),
            EngineConfig {
                arbiters: vec![UserId::new("admin")],
                ..EngineConfig::default()
            },
        ));
        Harness { engine, gateway }
    }

    fn client() -> UserId {
        UserId::new("client-a")
    }

    fn freelancer() -> UserId {
        UserId::new("freelancer-b")
    }

    async fn funded_milestone(h: &Harness) -> Milestone {
        let milestone = h
            .engine
            .create_milestone(
                MilestoneDraft::new("proj-1", "client-a", "Logo design", 50_000)
                    .with_freelancer("freelancer-b"),
            )
            .await
            .unwrap();
        h.engine
            .accept_milestone(&freelancer(), milestone.id)
            .await
            .unwrap();

        let order = h
            .engine
            .create_funding_order(&client(), milestone.id)
            .await
            .unwrap();
        let proof = h.gateway.proof_for(&order.order_id, "pay_abc");
        h.engine
            .fund_escrow(&client(), milestone.id, 50_000, proof)
            .await
            .unwrap();

        h.engine.milestone(milestone.id).await.unwrap()
    }

    #[tokio::test]
    async fn funding_holds_escrow_without_touching_wallets() {
        let h = harness();
        let milestone = funded_milestone(&h).await;

        assert_eq!(milestone.status, MilestoneStatus::Funded);
        assert!(milestone.funded_at.is_some());
        assert_eq!(h.engine.wallet_balance_minor(&freelancer()).await, 0);

        let record = h.engine.escrow_record(milestone.id).await.unwrap();
        assert_eq!(record.status, EscrowStatus::Funded);
        assert_eq!(record.payment_ref.as_deref(), Some("pay_abc"));
        assert!(h.engine.verify_audit_chain().await);
    }

    #[tokio::test]
    async fn approval_credits_freelancer_exactly_once() {
        let h = harness();
        let milestone = funded_milestone(&h).await;

        h.engine
            .start_work(&freelancer(), milestone.id)
            .await
            .unwrap();
        h.engine
            .submit_work(&freelancer(), milestone.id, vec!["file1.pdf".to_string()])
            .await
            .unwrap();

        let receipt = h
            .engine
            .release_payment(&client(), milestone.id)
            .await
            .unwrap();
        assert_eq!(receipt.outcome, EscrowStatus::Released);
        assert!(!receipt.replayed);

        let wallet = h.engine.wallet(&freelancer()).await;
        assert_eq!(wallet.balance_minor, 50_000);
        assert_eq!(wallet.entries.len(), 1);
        assert!(wallet.entries[0]
            .reference
            .contains(&milestone.id.to_string()));

        let milestone = h.engine.milestone(milestone.id).await.unwrap();
        assert_eq!(milestone.status, MilestoneStatus::Released);
        assert_eq!(milestone.deliverables, vec!["file1.pdf".to_string()]);
        assert!(h.engine.verify_audit_chain().await);
    }

    #[tokio::test]
    async fn replayed_release_does_not_credit_twice() {
        let h = harness();
        let milestone = funded_milestone(&h).await;
        h.engine
            .start_work(&freelancer(), milestone.id)
            .await
            .unwrap();
        h.engine
            .submit_work(&freelancer(), milestone.id, vec!["file1.pdf".to_string()])
            .await
            .unwrap();

        let first = h
            .engine
            .release_payment(&client(), milestone.id)
            .await
            .unwrap();
        let second = h
            .engine
            .release_payment(&client(), milestone.id)
            .await
            .unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(second.outcome, EscrowStatus::Released);

        let wallet = h.engine.wallet(&freelancer()).await;
        assert_eq!(wallet.balance_minor, 50_000);
        assert_eq!(wallet.entries.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_releases_credit_exactly_once() {
        let h = harness();
        let milestone = funded_milestone(&h).await;
        h.engine
            .start_work(&freelancer(), milestone.id)
            .await
            .unwrap();
        h.engine
            .submit_work(&freelancer(), milestone.id, vec!["file1.pdf".to_string()])
            .await
            .unwrap();

        let a = {
            let engine = h.engine.clone();
            let id = milestone.id;
            tokio::spawn(async move { engine.release_payment(&client(), id).await })
        };
        let b = {
            let engine = h.engine.clone();
            let id = milestone.id;
            tokio::spawn(async move { engine.release_payment(&client(), id).await })
        };

        let first = a.await.unwrap().unwrap();
        let second = b.await.unwrap().unwrap();

        // Exactly one of the two performed the credit.
        assert_ne!(first.replayed, second.replayed);
        let wallet = h.engine.wallet(&freelancer()).await;
        assert_eq!(wallet.balance_minor, 50_000);
        assert_eq!(wallet.entries.len(), 1);
    }

    #[tokio::test]
    async fn revision_loop_leaves_wallets_untouched() {
        let h = harness();
        let milestone = funded_milestone(&h).await;
        h.engine
            .start_work(&freelancer(), milestone.id)
            .await
            .unwrap();
        h.engine
            .submit_work(&freelancer(), milestone.id, vec!["draft.pdf".to_string()])
            .await
            .unwrap();

        let m = h
            .engine
            .request_revision(&client(), milestone.id, Some("tighten the kerning".to_string()))
            .await
            .unwrap();
        assert_eq!(m.status, MilestoneStatus::RevisionRequested);
        assert_eq!(m.revision_notes.as_deref(), Some("tighten the kerning"));

        let m = h.engine.resume_work(&freelancer(), milestone.id).await.unwrap();
        assert_eq!(m.status, MilestoneStatus::InProgress);
        assert_eq!(h.engine.wallet_balance_minor(&freelancer()).await, 0);
    }

    #[tokio::test]
    async fn dispute_refund_leaves_freelancer_wallet_unchanged() {
        let h = harness();
        let milestone = funded_milestone(&h).await;

        let dispute = h
            .engine
            .raise_dispute(&client(), milestone.id, "work never started")
            .await
            .unwrap();
        assert_eq!(
            h.engine.milestone(milestone.id).await.unwrap().status,
            MilestoneStatus::Disputed
        );

        let receipt = h
            .engine
            .resolve_dispute(&UserId::new("admin"), dispute.id, DisputeOutcome::RefundToClient)
            .await
            .unwrap();
        assert_eq!(receipt.outcome, EscrowStatus::Refunded);

        let milestone = h.engine.milestone(milestone.id).await.unwrap();
        assert_eq!(milestone.status, MilestoneStatus::Refunded);
        assert_eq!(h.engine.wallet_balance_minor(&freelancer()).await, 0);

        let resolved = h.engine.dispute(dispute.id).await.unwrap();
        assert_eq!(resolved.outcome, Some(DisputeOutcome::RefundToClient));
        assert!(resolved.resolved_at.is_some());
        assert!(h.engine.verify_audit_chain().await);
    }

    #[tokio::test]
    async fn dispute_release_pays_the_freelancer() {
        let h = harness();
        let milestone = funded_milestone(&h).await;
        h.engine
            .start_work(&freelancer(), milestone.id)
            .await
            .unwrap();

        let dispute = h
            .engine
            .raise_dispute(&freelancer(), milestone.id, "client unresponsive after delivery")
            .await
            .unwrap();

        let receipt = h
            .engine
            .resolve_dispute(
                &UserId::new("admin"),
                dispute.id,
                DisputeOutcome::ReleaseToFreelancer,
            )
            .await
            .unwrap();
        assert_eq!(receipt.outcome, EscrowStatus::Released);
        assert_eq!(h.engine.wallet_balance_minor(&freelancer()).await, 50_000);
    }

    #[tokio::test]
    async fn dispute_resolution_requires_an_arbiter() {
        let h = harness();
        let milestone = funded_milestone(&h).await;
        let dispute = h
            .engine
            .raise_dispute(&client(), milestone.id, "quality concerns")
            .await
            .unwrap();

        let err = h
            .engine
            .resolve_dispute(&client(), dispute.id, DisputeOutcome::RefundToClient)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::NotAuthorized(_)));
    }

    #[tokio::test]
    async fn replayed_resolution_returns_stored_outcome() {
        let h = harness();
        let milestone = funded_milestone(&h).await;
        let dispute = h
            .engine
            .raise_dispute(&client(), milestone.id, "scope disagreement")
            .await
            .unwrap();
        let admin = UserId::new("admin");

        h.engine
            .resolve_dispute(&admin, dispute.id, DisputeOutcome::RefundToClient)
            .await
            .unwrap();
        let replay = h
            .engine
            .resolve_dispute(&admin, dispute.id, DisputeOutcome::RefundToClient)
            .await
            .unwrap();
        assert!(replay.replayed);

        let conflict = h
            .engine
            .resolve_dispute(&admin, dispute.id, DisputeOutcome::ReleaseToFreelancer)
            .await
            .unwrap_err();
        assert!(matches!(conflict, EscrowError::InvalidState(_)));
    }

    #[tokio::test]
    async fn forged_payment_proof_is_rejected() {
        let h = harness();
        let milestone = h
            .engine
            .create_milestone(
                MilestoneDraft::new("proj-1", "client-a", "Logo design", 50_000)
                    .with_freelancer("freelancer-b"),
            )
            .await
            .unwrap();
        h.engine
            .accept_milestone(&freelancer(), milestone.id)
            .await
            .unwrap();

        let forged = PaymentProof {
            order_id: "order_0".to_string(),
            payment_id: "pay_abc".to_string(),
            signature: PaymentSignature::new("wrong-secret").sign("order_0", "pay_abc"),
        };
        let err = h
            .engine
            .fund_escrow(&client(), milestone.id, 50_000, forged)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::SignatureMismatch));
        assert_eq!(
            h.engine.milestone(milestone.id).await.unwrap().status,
            MilestoneStatus::Accepted
        );
        assert!(h.engine.escrow_record(milestone.id).await.is_none());
    }

    #[tokio::test]
    async fn funding_amount_mismatch_is_rejected() {
        let h = harness();
        let milestone = h
            .engine
            .create_milestone(
                MilestoneDraft::new("proj-1", "client-a", "Logo design", 50_000)
                    .with_freelancer("freelancer-b"),
            )
            .await
            .unwrap();
        h.engine
            .accept_milestone(&freelancer(), milestone.id)
            .await
            .unwrap();

        let proof = h.gateway.proof_for("order_x", "pay_short");
        let err = h
            .engine
            .fund_escrow(&client(), milestone.id, 40_000, proof)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Validation(_)));
    }

    #[tokio::test]
    async fn replayed_funding_returns_stored_receipt() {
        let h = harness();
        let milestone = funded_milestone(&h).await;

        let proof = h.gateway.proof_for("order_0", "pay_abc");
        let replay = h
            .engine
            .fund_escrow(&client(), milestone.id, 50_000, proof)
            .await
            .unwrap();
        assert!(replay.replayed);
        assert_eq!(replay.outcome, EscrowStatus::Funded);

        let other = h.gateway.proof_for("order_1", "pay_other");
        let err = h
            .engine
            .fund_escrow(&client(), milestone.id, 50_000, other)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidState(_)));
    }

    #[tokio::test]
    async fn milestone_without_freelancer_cannot_be_accepted_or_funded() {
        let h = harness();
        let milestone = h
            .engine
            .create_milestone(MilestoneDraft::new("proj-1", "client-a", "Logo design", 50_000))
            .await
            .unwrap();

        let err = h
            .engine
            .accept_milestone(&freelancer(), milestone.id)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::NotAuthorized(_)));
    }

    #[tokio::test]
    async fn withdrawal_beyond_balance_fails_and_preserves_balance() {
        let h = harness();
        let milestone = funded_milestone(&h).await;
        h.engine
            .start_work(&freelancer(), milestone.id)
            .await
            .unwrap();
        h.engine
            .submit_work(&freelancer(), milestone.id, vec!["file1.pdf".to_string()])
            .await
            .unwrap();
        h.engine
            .release_payment(&client(), milestone.id)
            .await
            .unwrap();

        // Balance 500.00; withdrawing 600.00 must fail.
        let err = h.engine.withdraw(&freelancer(), 60_000).await.unwrap_err();
        assert!(matches!(err, EscrowError::InsufficientBalance { .. }));
        assert_eq!(h.engine.wallet_balance_minor(&freelancer()).await, 50_000);

        let wallet = h.engine.withdraw(&freelancer(), 20_000).await.unwrap();
        assert_eq!(wallet.balance_minor, 30_000);
    }

    #[tokio::test]
    async fn concurrent_overdraft_debits_admit_at_most_the_balance() {
        let h = harness();
        let milestone = funded_milestone(&h).await;
        h.engine
            .start_work(&freelancer(), milestone.id)
            .await
            .unwrap();
        h.engine
            .submit_work(&freelancer(), milestone.id, vec!["file1.pdf".to_string()])
            .await
            .unwrap();
        h.engine
            .release_payment(&client(), milestone.id)
            .await
            .unwrap();

        // Balance 500.00; two concurrent 400.00 withdrawals would jointly
        // overdraw, so exactly one must succeed.
        let a = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.withdraw(&freelancer(), 40_000).await })
        };
        let b = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.withdraw(&freelancer(), 40_000).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        assert_eq!(h.engine.wallet_balance_minor(&freelancer()).await, 10_000);
    }

    /// Mirror that accepts a fixed number of commit sets and then fails,
    /// for exercising the rollback path.
    struct FlakyMirror {
        remaining: AtomicUsize,
    }

    #[async_trait]
    impl StoreMirror for FlakyMirror {
        fn label(&self) -> &'static str {
            "flaky"
        }

        async fn persist(&self, _set: &CommitSet) -> Result<(), EscrowError> {
            let allowed = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !allowed {
                return Err(EscrowError::Storage("mirror offline".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_credit_persist_rolls_back_the_release() {
        // Allow the five commits leading up to release, then fail.
        let h = harness_with_mirror(Arc::new(FlakyMirror {
            remaining: AtomicUsize::new(5),
        }));
        let milestone = funded_milestone(&h).await;
        h.engine
            .start_work(&freelancer(), milestone.id)
            .await
            .unwrap();
        h.engine
            .submit_work(&freelancer(), milestone.id, vec!["file1.pdf".to_string()])
            .await
            .unwrap();

        let err = h
            .engine
            .release_payment(&client(), milestone.id)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Storage(_)));

        // Nothing moved: milestone still submitted, escrow still funded,
        // wallet untouched.
        let m = h.engine.milestone(milestone.id).await.unwrap();
        assert_eq!(m.status, MilestoneStatus::Submitted);
        let record = h.engine.escrow_record(milestone.id).await.unwrap();
        assert_eq!(record.status, EscrowStatus::Funded);
        assert_eq!(h.engine.wallet_balance_minor(&freelancer()).await, 0);
    }

    struct FailingNotifier;

    #[async_trait]
    impl crate::notify::Notifier for FailingNotifier {
        async fn notify(
            &self,
            _user: &UserId,
            _subject: &str,
            _body: &str,
        ) -> Result<(), EscrowError> {
            Err(EscrowError::Gateway("smtp unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn notifier_failure_never_aborts_a_committed_release() {
        let gateway = Arc::new(TestGateway::new());
        let engine = Arc::new(EscrowEngine::new(
            Arc::new(EscrowStore::in_memory()),
            gateway.clone(),
            Arc::new(FailingNotifier),
            EngineConfig::default(),
        ));
        let h = Harness { engine, gateway };

        let milestone = funded_milestone(&h).await;
        h.engine
            .start_work(&freelancer(), milestone.id)
            .await
            .unwrap();
        h.engine
            .submit_work(&freelancer(), milestone.id, vec!["file1.pdf".to_string()])
            .await
            .unwrap();

        let receipt = h
            .engine
            .release_payment(&client(), milestone.id)
            .await
            .unwrap();
        assert_eq!(receipt.outcome, EscrowStatus::Released);
        assert_eq!(h.engine.wallet_balance_minor(&freelancer()).await, 50_000);
    }

    #[tokio::test]
    async fn stranger_cannot_raise_a_dispute() {
        let h = harness();
        let milestone = funded_milestone(&h).await;

        let err = h
            .engine
            .raise_dispute(&UserId::new("stranger"), milestone.id, "drive-by")
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::NotAuthorized(_)));
    }

    #[tokio::test]
    async fn funding_order_requires_accepted_milestone() {
        let h = harness();
        let milestone = h
            .engine
            .create_milestone(
                MilestoneDraft::new("proj-1", "client-a", "Logo design", 50_000)
                    .with_freelancer("freelancer-b"),
            )
            .await
            .unwrap();

        let err = h
            .engine
            .create_funding_order(&client(), milestone.id)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidState(_)));

        h.engine
            .accept_milestone(&freelancer(), milestone.id)
            .await
            .unwrap();
        let order = h
            .engine
            .create_funding_order(&client(), milestone.id)
            .await
            .unwrap();
        assert_eq!(order.amount_minor, 50_000);
    }
}
