use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::audit::{AuditEntry, AuditKind, AuditTrail};
use crate::error::EscrowError;
use crate::ledger::WalletBook;
use crate::types::{Dispute, DisputeId, EscrowRecord, Milestone, MilestoneId, UserId, Wallet};

/// Storage backend configuration.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// Keep all escrow state in process memory only.
    Memory,
    /// Mirror every commit set to PostgreSQL and hydrate state on startup.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// Everything one orchestrator operation touches, committed as a unit.
///
/// The mirror persists the whole set before the in-memory state is
/// mutated, so a mirror failure leaves no observable partial state: the
/// milestone, escrow record, wallet, and audit trail never disagree about
/// whether a payment happened.
#[derive(Debug, Clone, Default)]
pub struct CommitSet {
    pub milestone: Option<Milestone>,
    pub escrow: Option<EscrowRecord>,
    pub wallet: Option<Wallet>,
    pub dispute: Option<Dispute>,
    pub audit: Option<AuditEntry>,
}

/// Durability backend for commit sets.
#[async_trait]
pub trait StoreMirror: Send + Sync {
    fn label(&self) -> &'static str;

    /// Persist the full commit set atomically, or fail without partial
    /// writes.
    async fn persist(&self, set: &CommitSet) -> Result<(), EscrowError>;
}

/// Memory-only backend: durability is the caller's problem.
#[derive(Debug, Clone, Default)]
pub struct NullMirror;

#[async_trait]
impl StoreMirror for NullMirror {
    fn label(&self) -> &'static str {
        "memory"
    }

    async fn persist(&self, _set: &CommitSet) -> Result<(), EscrowError> {
        Ok(())
    }
}

/// Authoritative in-memory state. Only mutated through `apply`, under the
/// store's write lock, after the mirror accepted the commit set.
#[derive(Debug, Default)]
pub struct StoreState {
    milestones: HashMap<MilestoneId, Milestone>,
    escrows: HashMap<MilestoneId, EscrowRecord>,
    disputes: HashMap<DisputeId, Dispute>,
    book: WalletBook,
    audit: AuditTrail,
}

impl StoreState {
    pub fn milestone(&self, id: MilestoneId) -> Result<&Milestone, EscrowError> {
        self.milestones
            .get(&id)
            .ok_or_else(|| EscrowError::NotFound(format!("milestone {id}")))
    }

    pub fn escrow_record(&self, id: MilestoneId) -> Option<&EscrowRecord> {
        self.escrows.get(&id)
    }

    pub fn dispute(&self, id: DisputeId) -> Result<&Dispute, EscrowError> {
        self.disputes
            .get(&id)
            .ok_or_else(|| EscrowError::NotFound(format!("dispute {id}")))
    }

    pub fn book(&self) -> &WalletBook {
        &self.book
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    fn apply(&mut self, set: CommitSet) -> Result<(), EscrowError> {
        if let Some(milestone) = set.milestone {
            self.milestones.insert(milestone.id, milestone);
        }
        if let Some(escrow) = set.escrow {
            self.escrows.insert(escrow.milestone_id, escrow);
        }
        if let Some(wallet) = set.wallet {
            self.book.install(wallet)?;
        }
        if let Some(dispute) = set.dispute {
            self.disputes.insert(dispute.id, dispute);
        }
        if let Some(audit) = set.audit {
            self.audit.commit_entry(audit)?;
        }
        Ok(())
    }
}

/// Escrow store: authoritative in-memory state plus a write-ahead mirror.
///
/// The write lock is the serialization point required by the concurrency
/// contract: operations touching the same milestone or wallet are
/// linearized here, so two concurrent releases observe each other and
/// two debits cannot jointly overdraw.
pub struct EscrowStore {
    state: RwLock<StoreState>,
    mirror: Arc<dyn StoreMirror>,
}

impl EscrowStore {
    pub fn in_memory() -> Self {
        Self::with_mirror(Arc::new(NullMirror))
    }

    pub fn with_mirror(mirror: Arc<dyn StoreMirror>) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            mirror,
        }
    }

    pub async fn bootstrap(config: StorageConfig) -> Result<Self, EscrowError> {
        match config {
            StorageConfig::Memory => Ok(Self::in_memory()),
            StorageConfig::Postgres {
                database_url,
                max_connections,
            } => {
                let mirror = PostgresMirror::connect(&database_url, max_connections).await?;
                mirror.ensure_schema().await?;
                let state = mirror.hydrate().await?;
                reconcile(&state)?;
                info!(
                    milestones = state.milestones.len(),
                    audit_entries = state.audit.entries().len(),
                    "escrow store hydrated from postgres"
                );
                Ok(Self {
                    state: RwLock::new(state),
                    mirror: Arc::new(mirror),
                })
            }
        }
    }

    pub fn backend_label(&self) -> &'static str {
        self.mirror.label()
    }

    /// Run one atomic operation: `build` reads current state and produces a
    /// commit set; the mirror persists it; only then is it applied. The
    /// write lock is held for the whole sequence so concurrent operations
    /// on the same entities serialize.
    pub(crate) async fn commit<T, F>(&self, build: F) -> Result<T, EscrowError>
    where
        F: FnOnce(&StoreState) -> Result<(T, CommitSet), EscrowError>,
    {
        let mut state = self.state.write().await;
        let (value, set) = build(&state)?;

        if let Err(err) = self.mirror.persist(&set).await {
            warn!(error = %err, "commit set rejected by mirror; state unchanged");
            return Err(err);
        }

        state.apply(set)?;
        Ok(value)
    }

    /// Read-only access under the read lock.
    pub(crate) async fn read<T, F>(&self, read: F) -> T
    where
        F: FnOnce(&StoreState) -> T,
    {
        let state = self.state.read().await;
        read(&state)
    }

    pub async fn milestone(&self, id: MilestoneId) -> Result<Milestone, EscrowError> {
        self.read(|state| state.milestone(id).cloned()).await
    }

    pub async fn escrow_record(&self, id: MilestoneId) -> Option<EscrowRecord> {
        self.read(|state| state.escrow_record(id).cloned()).await
    }

    pub async fn dispute(&self, id: DisputeId) -> Result<Dispute, EscrowError> {
        self.read(|state| state.dispute(id).cloned()).await
    }

    pub async fn wallet(&self, user_id: &UserId) -> Wallet {
        self.read(|state| state.book().wallet(user_id)).await
    }

    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.read(|state| state.audit().entries().to_vec()).await
    }

    pub async fn verify_audit_chain(&self) -> bool {
        self.read(|state| state.audit().verify_chain()).await
    }
}

/// Hydration sanity check: a released milestone must have its wallet
/// credit on record. Detecting the mismatch here turns a torn historical
/// commit into a loud reconciliation case instead of a silent payout.
fn reconcile(state: &StoreState) -> Result<(), EscrowError> {
    for milestone in state.milestones.values() {
        if milestone.status == crate::milestone::MilestoneStatus::Released {
            let credited = state.audit.has_entry(milestone.id, AuditKind::Release);
            if !credited {
                return Err(EscrowError::Storage(format!(
                    "reconciliation required: milestone {} is released but no release entry exists",
                    milestone.id
                )));
            }
        }
    }
    Ok(())
}

/// PostgreSQL mirror. Every entity is stored as a JSONB document (the
/// upstream system is document-shaped); one commit set is one database
/// transaction.
#[derive(Debug, Clone)]
pub struct PostgresMirror {
    pool: PgPool,
}

impl PostgresMirror {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, EscrowError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| EscrowError::Storage(format!("postgres connect failed: {e}")))?;

        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), EscrowError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS gigpay_milestones (
                milestone_id TEXT PRIMARY KEY,
                doc JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS gigpay_escrow_records (
                milestone_id TEXT PRIMARY KEY,
                doc JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS gigpay_disputes (
                dispute_id TEXT PRIMARY KEY,
                doc JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS gigpay_wallets (
                user_id TEXT PRIMARY KEY,
                doc JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS gigpay_audit_entries (
                audit_index BIGINT PRIMARY KEY,
                doc JSONB NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| EscrowError::Storage(format!("postgres schema create failed: {e}")))?;
        }

        Ok(())
    }

    pub async fn hydrate(&self) -> Result<StoreState, EscrowError> {
        let milestones: Vec<Milestone> = self.load_docs("gigpay_milestones", "milestone_id").await?;
        let escrows: Vec<EscrowRecord> = self
            .load_docs("gigpay_escrow_records", "milestone_id")
            .await?;
        let disputes: Vec<Dispute> = self.load_docs("gigpay_disputes", "dispute_id").await?;
        let wallets: Vec<Wallet> = self.load_docs("gigpay_wallets", "user_id").await?;
        let audit_entries: Vec<AuditEntry> =
            self.load_docs("gigpay_audit_entries", "audit_index").await?;

        let mut state = StoreState {
            book: WalletBook::from_wallets(wallets)?,
            audit: AuditTrail::from_entries(audit_entries)?,
            ..StoreState::default()
        };
        for milestone in milestones {
            state.milestones.insert(milestone.id, milestone);
        }
        for escrow in escrows {
            state.escrows.insert(escrow.milestone_id, escrow);
        }
        for dispute in disputes {
            state.disputes.insert(dispute.id, dispute);
        }

        Ok(state)
    }

    async fn load_docs<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        order_by: &str,
    ) -> Result<Vec<T>, EscrowError> {
        let rows = sqlx::query(&format!("SELECT doc FROM {table} ORDER BY {order_by} ASC"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EscrowError::Storage(format!("postgres load from {table} failed: {e}")))?;

        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            let doc: serde_json::Value = row
                .try_get("doc")
                .map_err(|e| EscrowError::Storage(format!("postgres decode doc failed: {e}")))?;
            docs.push(
                serde_json::from_value(doc)
                    .map_err(|e| EscrowError::Serialization(e.to_string()))?,
            );
        }
        Ok(docs)
    }
}

#[async_trait]
impl StoreMirror for PostgresMirror {
    fn label(&self) -> &'static str {
        "postgres"
    }

    async fn persist(&self, set: &CommitSet) -> Result<(), EscrowError> {
        let mut txn = self
            .pool
            .begin()
            .await
            .map_err(|e| EscrowError::Storage(format!("postgres begin failed: {e}")))?;

        if let Some(milestone) = &set.milestone {
            let doc = serde_json::to_value(milestone)
                .map_err(|e| EscrowError::Serialization(e.to_string()))?;
            sqlx::query(
                "INSERT INTO gigpay_milestones (milestone_id, doc) VALUES ($1, $2)
                 ON CONFLICT (milestone_id) DO UPDATE SET doc = EXCLUDED.doc",
            )
            .bind(milestone.id.to_string())
            .bind(doc)
            .execute(&mut *txn)
            .await
            .map_err(|e| EscrowError::Storage(format!("postgres milestone write failed: {e}")))?;
        }

        if let Some(escrow) = &set.escrow {
            let doc = serde_json::to_value(escrow)
                .map_err(|e| EscrowError::Serialization(e.to_string()))?;
            sqlx::query(
                "INSERT INTO gigpay_escrow_records (milestone_id, doc) VALUES ($1, $2)
                 ON CONFLICT (milestone_id) DO UPDATE SET doc = EXCLUDED.doc",
            )
            .bind(escrow.milestone_id.to_string())
            .bind(doc)
            .execute(&mut *txn)
            .await
            .map_err(|e| EscrowError::Storage(format!("postgres escrow write failed: {e}")))?;
        }

        if let Some(wallet) = &set.wallet {
            let doc = serde_json::to_value(wallet)
                .map_err(|e| EscrowError::Serialization(e.to_string()))?;
            sqlx::query(
                "INSERT INTO gigpay_wallets (user_id, doc) VALUES ($1, $2)
                 ON CONFLICT (user_id) DO UPDATE SET doc = EXCLUDED.doc",
            )
            .bind(wallet.user_id.to_string())
            .bind(doc)
            .execute(&mut *txn)
            .await
            .map_err(|e| EscrowError::Storage(format!("postgres wallet write failed: {e}")))?;
        }

        if let Some(dispute) = &set.dispute {
            let doc = serde_json::to_value(dispute)
                .map_err(|e| EscrowError::Serialization(e.to_string()))?;
            sqlx::query(
                "INSERT INTO gigpay_disputes (dispute_id, doc) VALUES ($1, $2)
                 ON CONFLICT (dispute_id) DO UPDATE SET doc = EXCLUDED.doc",
            )
            .bind(dispute.id.to_string())
            .bind(doc)
            .execute(&mut *txn)
            .await
            .map_err(|e| EscrowError::Storage(format!("postgres dispute write failed: {e}")))?;
        }

        if let Some(audit) = &set.audit {
            let index: i64 = audit.index.try_into().map_err(|_| {
                EscrowError::Storage("audit index exceeds postgres BIGINT range".to_string())
            })?;
            let doc = serde_json::to_value(audit)
                .map_err(|e| EscrowError::Serialization(e.to_string()))?;
            // Plain INSERT: audit entries are append-only, a conflicting
            // index means a concurrent writer and must fail the commit.
            sqlx::query("INSERT INTO gigpay_audit_entries (audit_index, doc) VALUES ($1, $2)")
                .bind(index)
                .bind(doc)
                .execute(&mut *txn)
                .await
                .map_err(|e| EscrowError::Storage(format!("postgres audit write failed: {e}")))?;
        }

        txn.commit()
            .await
            .map_err(|e| EscrowError::Storage(format!("postgres commit failed: {e}")))
    }
}
