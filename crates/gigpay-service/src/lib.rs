#![deny(unsafe_code)]

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use gigpay_core::{
    AuditEntry, AuditKind, Dispute, DisputeId, DisputeOutcome, EngineConfig, EscrowEngine,
    EscrowError, EscrowStore, GatewayOrder, LogNotifier, Milestone, MilestoneDraft, MilestoneId,
    PaymentGateway, PaymentProof, PaymentReceipt, StorageConfig, UserId, Wallet,
};
use gigpay_gateway::{HttpCheckoutGateway, MockCheckoutGateway};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Gateway selection for a service instance.
#[derive(Debug, Clone)]
pub enum GatewayConfig {
    /// In-process mock gateway signing with the given secret.
    Mock { secret: String },
    /// External processor reached over HTTP; proofs verify locally against
    /// the shared secret.
    Http {
        base_url: String,
        key_id: String,
        key_secret: String,
        timeout: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub storage: StorageConfig,
    pub gateway: GatewayConfig,
    pub arbiters: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::Memory,
            gateway: GatewayConfig::Mock {
                secret: "gigpay-local-dev-secret".to_string(),
            },
            arbiters: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<EscrowEngine>,
    gateway_label: &'static str,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let store = Arc::new(EscrowStore::bootstrap(config.storage).await?);

        let gateway: Arc<dyn PaymentGateway> = match config.gateway {
            GatewayConfig::Mock { secret } => Arc::new(MockCheckoutGateway::new(&secret)),
            GatewayConfig::Http {
                base_url,
                key_id,
                key_secret,
                timeout,
            } => Arc::new(HttpCheckoutGateway::new(
                base_url, key_id, key_secret, timeout,
            )?),
        };
        let gateway_label = gateway.name();

        let engine = EscrowEngine::new(
            store,
            gateway,
            Arc::new(LogNotifier),
            EngineConfig {
                arbiters: config.arbiters.into_iter().map(UserId::new).collect(),
                ..EngineConfig::default()
            },
        );

        Ok(Self {
            engine: Arc::new(engine),
            gateway_label,
        })
    }

    pub fn from_engine(engine: Arc<EscrowEngine>, gateway_label: &'static str) -> Self {
        Self {
            engine,
            gateway_label,
        }
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/milestones", post(create_milestone))
        .route("/v1/milestones/:id", get(get_milestone))
        .route("/v1/milestones/:id/accept", post(accept_milestone))
        .route("/v1/milestones/:id/funding-order", post(create_funding_order))
        .route("/v1/milestones/:id/fund", post(fund_milestone))
        .route("/v1/milestones/:id/start", post(start_work))
        .route("/v1/milestones/:id/submit", post(submit_work))
        .route("/v1/milestones/:id/approve", post(approve_milestone))
        .route(
            "/v1/milestones/:id/request-revision",
            post(request_revision),
        )
        .route("/v1/milestones/:id/resume", post(resume_work))
        .route("/v1/milestones/:id/dispute", post(raise_dispute))
        .route("/v1/disputes/:id/resolve", post(resolve_dispute))
        .route("/v1/wallets/:user_id", get(get_wallet))
        .route("/v1/wallets/:user_id/withdraw", post(withdraw))
        .route("/v1/audit/entries", get(list_audit_entries))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("escrow engine error: {0}")]
    Core(#[from] EscrowError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] EscrowError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

fn core_status(err: &EscrowError) -> StatusCode {
    match err {
        EscrowError::Validation(_) => StatusCode::BAD_REQUEST,
        EscrowError::NotAuthorized(_) => StatusCode::FORBIDDEN,
        EscrowError::NotFound(_) => StatusCode::NOT_FOUND,
        EscrowError::InvalidTransition { .. }
        | EscrowError::InvalidState(_)
        | EscrowError::InsufficientBalance { .. } => StatusCode::CONFLICT,
        EscrowError::SignatureMismatch => StatusCode::UNPROCESSABLE_ENTITY,
        EscrowError::Gateway(_) => StatusCode::BAD_GATEWAY,
        EscrowError::Storage(_) | EscrowError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => {
                (status, Json(serde_json::json!({ "error": message }))).into_response()
            }
            ApiError::Core(err) => (
                core_status(&err),
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage_backend: &'static str,
    gateway: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "gigpay-service",
        storage_backend: state.engine.backend_label(),
        gateway: state.gateway_label,
    })
}

#[derive(Debug, Clone, Deserialize)]
struct CreateMilestoneRequest {
    actor_id: String,
    project_id: String,
    freelancer_id: Option<String>,
    title: String,
    description: Option<String>,
    amount_minor: u64,
    currency: Option<String>,
    due_date: Option<DateTime<Utc>>,
}

async fn create_milestone(
    State(state): State<ServiceState>,
    Json(request): Json<CreateMilestoneRequest>,
) -> Result<Json<Milestone>, ApiError> {
    let mut draft = MilestoneDraft::new(
        request.project_id,
        request.actor_id,
        request.title,
        request.amount_minor,
    );
    draft.freelancer_id = request.freelancer_id.map(UserId::new);
    draft.description = request.description.unwrap_or_default();
    if let Some(currency) = request.currency {
        draft.currency = currency;
    }
    draft.due_date = request.due_date;

    Ok(Json(state.engine.create_milestone(draft).await?))
}

async fn get_milestone(
    State(state): State<ServiceState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Milestone>, ApiError> {
    Ok(Json(state.engine.milestone(MilestoneId(id)).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct ActorRequest {
    actor_id: String,
}

async fn accept_milestone(
    Path(id): Path<Uuid>,
    State(state): State<ServiceState>,
    Json(request): Json<ActorRequest>,
) -> Result<Json<Milestone>, ApiError> {
    Ok(Json(
        state
            .engine
            .accept_milestone(&UserId::new(request.actor_id), MilestoneId(id))
            .await?,
    ))
}

async fn create_funding_order(
    Path(id): Path<Uuid>,
    State(state): State<ServiceState>,
    Json(request): Json<ActorRequest>,
) -> Result<Json<GatewayOrder>, ApiError> {
    Ok(Json(
        state
            .engine
            .create_funding_order(&UserId::new(request.actor_id), MilestoneId(id))
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct FundRequest {
    actor_id: String,
    amount_minor: u64,
    order_id: String,
    payment_id: String,
    signature: String,
}

async fn fund_milestone(
    Path(id): Path<Uuid>,
    State(state): State<ServiceState>,
    Json(request): Json<FundRequest>,
) -> Result<Json<PaymentReceipt>, ApiError> {
    let proof = PaymentProof {
        order_id: request.order_id,
        payment_id: request.payment_id,
        signature: request.signature,
    };
    Ok(Json(
        state
            .engine
            .fund_escrow(
                &UserId::new(request.actor_id),
                MilestoneId(id),
                request.amount_minor,
                proof,
            )
            .await?,
    ))
}

async fn start_work(
    Path(id): Path<Uuid>,
    State(state): State<ServiceState>,
    Json(request): Json<ActorRequest>,
) -> Result<Json<Milestone>, ApiError> {
    Ok(Json(
        state
            .engine
            .start_work(&UserId::new(request.actor_id), MilestoneId(id))
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct SubmitRequest {
    actor_id: String,
    #[serde(default)]
    deliverables: Vec<String>,
}

async fn submit_work(
    Path(id): Path<Uuid>,
    State(state): State<ServiceState>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<Milestone>, ApiError> {
    Ok(Json(
        state
            .engine
            .submit_work(
                &UserId::new(request.actor_id),
                MilestoneId(id),
                request.deliverables,
            )
            .await?,
    ))
}

async fn approve_milestone(
    Path(id): Path<Uuid>,
    State(state): State<ServiceState>,
    Json(request): Json<ActorRequest>,
) -> Result<Json<PaymentReceipt>, ApiError> {
    Ok(Json(
        state
            .engine
            .release_payment(&UserId::new(request.actor_id), MilestoneId(id))
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct RevisionRequest {
    actor_id: String,
    notes: Option<String>,
}

async fn request_revision(
    Path(id): Path<Uuid>,
    State(state): State<ServiceState>,
    Json(request): Json<RevisionRequest>,
) -> Result<Json<Milestone>, ApiError> {
    Ok(Json(
        state
            .engine
            .request_revision(&UserId::new(request.actor_id), MilestoneId(id), request.notes)
            .await?,
    ))
}

async fn resume_work(
    Path(id): Path<Uuid>,
    State(state): State<ServiceState>,
    Json(request): Json<ActorRequest>,
) -> Result<Json<Milestone>, ApiError> {
    Ok(Json(
        state
            .engine
            .resume_work(&UserId::new(request.actor_id), MilestoneId(id))
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct DisputeRequest {
    actor_id: String,
    reason: String,
}

async fn raise_dispute(
    Path(id): Path<Uuid>,
    State(state): State<ServiceState>,
    Json(request): Json<DisputeRequest>,
) -> Result<Json<Dispute>, ApiError> {
    Ok(Json(
        state
            .engine
            .raise_dispute(
                &UserId::new(request.actor_id),
                MilestoneId(id),
                request.reason,
            )
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct ResolveRequest {
    actor_id: String,
    outcome: DisputeOutcome,
}

async fn resolve_dispute(
    Path(id): Path<Uuid>,
    State(state): State<ServiceState>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<PaymentReceipt>, ApiError> {
    Ok(Json(
        state
            .engine
            .resolve_dispute(
                &UserId::new(request.actor_id),
                DisputeId(id),
                request.outcome,
            )
            .await?,
    ))
}

async fn get_wallet(
    Path(user_id): Path<String>,
    State(state): State<ServiceState>,
) -> Json<Wallet> {
    Json(state.engine.wallet(&UserId::new(user_id)).await)
}

#[derive(Debug, Clone, Deserialize)]
struct WithdrawRequest {
    amount_minor: u64,
}

async fn withdraw(
    Path(user_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<WithdrawRequest>,
) -> Result<Json<Wallet>, ApiError> {
    Ok(Json(
        state
            .engine
            .withdraw(&UserId::new(user_id), request.amount_minor)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct AuditEntriesQuery {
    milestone_id: Option<Uuid>,
    kind: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
    order: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct AuditEntriesResponse {
    backend: &'static str,
    total: usize,
    returned: usize,
    items: Vec<AuditEntry>,
}

fn parse_kind_filter(kind: Option<&str>) -> Result<Option<AuditKind>, ApiError> {
    match kind.map(|value| value.to_ascii_lowercase()) {
        None => Ok(None),
        Some(value) if value == "funding" => Ok(Some(AuditKind::Funding)),
        Some(value) if value == "release" => Ok(Some(AuditKind::Release)),
        Some(value) if value == "refund" => Ok(Some(AuditKind::Refund)),
        Some(value) if value == "withdrawal" => Ok(Some(AuditKind::Withdrawal)),
        Some(value) if value == "adjustment" => Ok(Some(AuditKind::Adjustment)),
        Some(other) => Err(ApiError::bad_request(format!(
            "invalid kind '{}'; expected one of: funding, release, refund, withdrawal, adjustment",
            other
        ))),
    }
}

async fn list_audit_entries(
    State(state): State<ServiceState>,
    Query(query): Query<AuditEntriesQuery>,
) -> Result<Json<AuditEntriesResponse>, ApiError> {
    let kind_filter = parse_kind_filter(query.kind.as_deref())?;

    let mut entries = state.engine.audit_entries().await;

    if let Some(milestone_id) = query.milestone_id {
        entries.retain(|entry| entry.milestone_id == Some(MilestoneId(milestone_id)));
    }

    if let Some(kind) = kind_filter {
        entries.retain(|entry| entry.kind == kind);
    }

    let order = query
        .order
        .as_deref()
        .unwrap_or("desc")
        .to_ascii_lowercase();
    if order == "desc" {
        entries.reverse();
    } else if order != "asc" {
        return Err(ApiError::bad_request(format!(
            "invalid order '{}'; expected asc or desc",
            order
        )));
    }

    let total = entries.len();
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(100).min(1000);
    let items = entries
        .into_iter()
        .skip(offset)
        .take(limit)
        .collect::<Vec<_>>();
    let returned = items.len();

    Ok(Json(AuditEntriesResponse {
        backend: state.engine.backend_label(),
        total,
        returned,
        items,
    }))
}
