use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vanity_name_registry::{
    commitment_hash, AccountId, AccountLedger, Amount, Digest, ForwardReceipt, ForwardedCall,
    InboxForwarder, Name, NameRegistry, PendingCommitment, PriceTier, Registration,
    RegistrationReceipt, RegistryConfig, RegistryError, RegistryStats, Salt, Timestamp,
};
use vanity_storage::RegistryStore;

use crate::auth::{self, AuthError};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<NameRegistry>,
    pub store: Option<Arc<dyn RegistryStore>>,
    /// Set when the registry forwards into in-memory inboxes.
    pub inbox: Option<InboxForwarder>,
    pub require_signatures: bool,
    pub metrics: Option<PrometheusHandle>,
    pub start_time: Instant,
    pub req_count: Arc<AtomicUsize>,
    /// Serializes snapshot-then-save so an older snapshot never lands after a newer one.
    persist_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(registry: Arc<NameRegistry>) -> Self {
        Self {
            registry,
            store: None,
            inbox: None,
            require_signatures: true,
            metrics: None,
            start_time: Instant::now(),
            req_count: Arc::new(AtomicUsize::new(0)),
            persist_lock: Arc::new(Mutex::new(())),
        }
    }

    fn record_request(&self) -> u64 {
        self.req_count.fetch_add(1, Ordering::Relaxed) as u64 + 1
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Check the request signature, then consume the signed nonce.
    ///
    /// The nonce is spent even if the operation itself later fails.
    fn authorize(
        &self,
        account: &AccountId,
        nonce: u64,
        digest: &[u8; 32],
        signature: Option<&str>,
    ) -> Result<(), ApiError> {
        if !self.require_signatures {
            return Ok(());
        }
        auth::verify_signature(account, digest, signature)?;
        self.registry.consume_nonce(account, nonce)?;
        Ok(())
    }

    /// Write the current registry state to the store, if one is attached.
    ///
    /// The in-memory registry stays authoritative: a failed save is logged and counted,
    /// and the next successful save (at the latest the one on shutdown) catches up.
    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.registry.snapshot();
        if let Err(err) = store.save_snapshot(&snapshot, self.registry.now()) {
            metrics::counter!("vanity_persist_failures_total").increment(1);
            warn!("Failed to persist registry snapshot: {}", err);
        }
    }
}

type SharedState = Arc<AppState>;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    req_total: u64,
    time: Timestamp,
    stats: RegistryStats,
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    config: RegistryConfig,
    require_signatures: bool,
}

#[derive(Debug, Serialize)]
struct PricingResponse {
    min_fee: Amount,
    max_fee: Amount,
    tiers: Vec<PriceTier>,
}

#[derive(Debug, Serialize)]
struct NameResponse {
    registration: Registration,
    expired: bool,
}

#[derive(Debug, Serialize)]
struct PriceResponse {
    name: Name,
    length: usize,
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<Amount>,
}

#[derive(Debug, Serialize)]
struct ResolveResponse {
    name: Name,
    owner: AccountId,
}

#[derive(Debug, Serialize)]
struct AccountResponse {
    account: AccountId,
    ledger: AccountLedger,
    #[serde(skip_serializing_if = "Option::is_none")]
    pending: Option<PendingCommitment>,
    live_names: Vec<Name>,
}

#[derive(Debug, Serialize)]
struct WithdrawResponse {
    account: AccountId,
    amount: Amount,
}

#[derive(Debug, Serialize)]
struct InboxResponse {
    account: AccountId,
    calls: Vec<ForwardedCall>,
}

#[derive(Debug, Serialize)]
struct CommitmentHashResponse {
    commitment: Digest,
}

#[derive(Debug, Deserialize)]
struct CommitmentHashRequest {
    committer: String,
    name: String,
    salt: String,
}

#[derive(Debug, Deserialize)]
struct CommitRequest {
    committer: String,
    commitment: String,
    #[serde(default)]
    nonce: u64,
    #[serde(default)]
    signature: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RevealRequest {
    committer: String,
    name: String,
    salt: String,
    paid: Amount,
    #[serde(default)]
    nonce: u64,
    #[serde(default)]
    signature: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OwnerRequest {
    caller: String,
    #[serde(default)]
    nonce: u64,
    #[serde(default)]
    signature: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ForwardRequest {
    caller: String,
    value: Amount,
    paid: Amount,
    #[serde(default)]
    payload: String,
    #[serde(default)]
    nonce: u64,
    #[serde(default)]
    signature: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WithdrawRequest {
    #[serde(default)]
    nonce: u64,
    #[serde(default)]
    signature: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new<S: Into<String>>(status: StatusCode, message: S) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn forbidden<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        let status = match &err {
            RegistryError::NameNotRegistered { .. } => StatusCode::NOT_FOUND,
            RegistryError::NotOwner { .. }
            | RegistryError::InvalidNonce { .. }
            | RegistryError::InvalidCaller => StatusCode::FORBIDDEN,
            RegistryError::NameAlreadyRegistered { .. } | RegistryError::RecipientChanged { .. } => {
                StatusCode::CONFLICT
            }
            RegistryError::ForwardingFailed { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::new(status, err.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self::forbidden(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let payload = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, payload).into_response()
    }
}

pub async fn start_server(state: AppState, addr: &str) -> Result<()> {
    start_server_with_shutdown(state, addr, std::future::pending()).await
}

/// Serve until `shutdown` resolves.
pub async fn start_server_with_shutdown<F>(state: AppState, addr: &str, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);
    let listener = bind_listener(addr).await?;
    info!("Vanity registry API listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("registry API server terminated unexpectedly")
}

async fn bind_listener(addr: &str) -> Result<tokio::net::TcpListener> {
    if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
        tokio::net::TcpListener::bind(socket_addr)
            .await
            .with_context(|| format!("failed to bind API listener on {socket_addr}"))
    } else {
        tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind API listener on {addr}"))
    }
}

pub fn build_router(state: AppState) -> Router {
    let shared: SharedState = Arc::new(state);
    Router::new()
        .route("/health", get(handle_health))
        .route("/config", get(handle_config))
        .route("/pricing", get(handle_pricing))
        .route("/metrics", get(handle_metrics))
        .route("/names/:name", get(handle_get_name))
        .route("/names/:name/price", get(handle_name_price))
        .route("/names/:name/resolve", get(handle_resolve))
        .route("/names/:name/renew", post(handle_renew))
        .route("/names/:name/release", post(handle_release))
        .route("/names/:name/forward", post(handle_forward))
        .route("/commitments/hash", post(handle_commitment_hash))
        .route("/commitments", post(handle_commit))
        .route("/registrations", post(handle_reveal))
        .route("/accounts/:id", get(handle_get_account))
        .route("/accounts/:id/withdraw", post(handle_withdraw))
        .route("/accounts/:id/inbox", get(handle_inbox))
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

async fn handle_health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let req_total = state.record_request();
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.uptime_seconds(),
        req_total,
        time: state.registry.now(),
        stats: state.registry.stats(),
    })
}

async fn handle_config(State(state): State<SharedState>) -> Json<ConfigResponse> {
    state.record_request();
    Json(ConfigResponse {
        config: state.registry.config().clone(),
        require_signatures: state.require_signatures,
    })
}

async fn handle_pricing(State(state): State<SharedState>) -> Json<PricingResponse> {
    state.record_request();
    let fees = state.registry.fee_schedule();
    Json(PricingResponse {
        min_fee: fees.min_fee,
        max_fee: fees.max_fee,
        tiers: fees.table(),
    })
}

async fn handle_metrics(State(state): State<SharedState>) -> Response {
    let req_total = state.record_request();
    let uptime = state.uptime_seconds();
    let stats = state.registry.stats();

    let mut metrics = state
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();
    metrics.push_str("# HELP vanity_http_requests_total Total number of API requests handled\n");
    metrics.push_str("# TYPE vanity_http_requests_total counter\n");
    metrics.push_str(&format!("vanity_http_requests_total {req_total}\n"));
    metrics.push_str("# HELP vanity_uptime_seconds Uptime of the node in seconds\n");
    metrics.push_str("# TYPE vanity_uptime_seconds gauge\n");
    metrics.push_str(&format!("vanity_uptime_seconds {uptime}\n"));
    metrics.push_str("# HELP vanity_registrations Registration records held\n");
    metrics.push_str("# TYPE vanity_registrations gauge\n");
    metrics.push_str(&format!("vanity_registrations {}\n", stats.registrations));
    metrics.push_str("# HELP vanity_pending_commitments Unrevealed commitments\n");
    metrics.push_str("# TYPE vanity_pending_commitments gauge\n");
    metrics.push_str(&format!(
        "vanity_pending_commitments {}\n",
        stats.pending_commitments
    ));
    metrics.push_str("# HELP vanity_total_locked Funds locked by live registrations\n");
    metrics.push_str("# TYPE vanity_total_locked gauge\n");
    metrics.push_str(&format!("vanity_total_locked {}\n", stats.total_locked));

    let mut response = Response::new(Body::from(metrics));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}

async fn handle_get_name(
    State(state): State<SharedState>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<NameResponse>, ApiError> {
    state.record_request();
    let name = parse_name(&name)?;
    let registration = state
        .registry
        .registration(&name)
        .ok_or_else(|| ApiError::not_found(format!("name {name} is not registered")))?;
    let expired = registration.is_expired(state.registry.now());
    Ok(Json(NameResponse {
        registration,
        expired,
    }))
}

async fn handle_name_price(
    State(state): State<SharedState>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<PriceResponse>, ApiError> {
    state.record_request();
    let name = parse_name(&name)?;
    Ok(Json(PriceResponse {
        length: state.registry.name_length(&name),
        valid: state.registry.is_valid_name(&name),
        price: state.registry.price_of(&name).ok(),
        name,
    }))
}

async fn handle_resolve(
    State(state): State<SharedState>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<ResolveResponse>, ApiError> {
    state.record_request();
    let name = parse_name(&name)?;
    let owner = state.registry.resolve(&name)?;
    Ok(Json(ResolveResponse {
        name: name.canonical(),
        owner,
    }))
}

async fn handle_commitment_hash(
    State(state): State<SharedState>,
    Json(request): Json<CommitmentHashRequest>,
) -> Result<Json<CommitmentHashResponse>, ApiError> {
    state.record_request();
    let committer = parse_account(&request.committer, "committer")?;
    let name = parse_name(&request.name)?;
    let salt = Salt::new(parse_hex_array::<32>(&request.salt, "salt")?);
    Ok(Json(CommitmentHashResponse {
        commitment: commitment_hash(&committer, &name, &salt),
    }))
}

async fn handle_commit(
    State(state): State<SharedState>,
    Json(request): Json<CommitRequest>,
) -> Result<(StatusCode, Json<PendingCommitment>), ApiError> {
    state.record_request();
    let committer = parse_account(&request.committer, "committer")?;
    let commitment = Digest::new(parse_hex_array::<32>(&request.commitment, "commitment")?);
    state.authorize(
        &committer,
        request.nonce,
        &auth::commit_digest(&committer, request.nonce, &commitment),
        request.signature.as_deref(),
    )?;

    // Persist even on failure: the nonce was spent.
    let pending = state.registry.begin_registration(&committer, commitment);
    state.persist().await;
    let pending = pending?;
    debug!("Accepted commitment from {}", committer);
    Ok((StatusCode::CREATED, Json(pending)))
}

async fn handle_reveal(
    State(state): State<SharedState>,
    Json(request): Json<RevealRequest>,
) -> Result<(StatusCode, Json<RegistrationReceipt>), ApiError> {
    state.record_request();
    let committer = parse_account(&request.committer, "committer")?;
    let name = parse_name(&request.name)?;
    let salt = Salt::new(parse_hex_array::<32>(&request.salt, "salt")?);
    state.authorize(
        &committer,
        request.nonce,
        &auth::reveal_digest(&committer, request.nonce, &name, &salt, request.paid),
        request.signature.as_deref(),
    )?;

    let receipt = state
        .registry
        .complete_registration(&committer, &name, &salt, request.paid);
    state.persist().await;
    let receipt = receipt?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn handle_renew(
    State(state): State<SharedState>,
    AxumPath(name): AxumPath<String>,
    Json(request): Json<OwnerRequest>,
) -> Result<Json<Registration>, ApiError> {
    state.record_request();
    let name = parse_name(&name)?;
    let caller = parse_account(&request.caller, "caller")?;
    state.authorize(
        &caller,
        request.nonce,
        &auth::renew_digest(&caller, request.nonce, &name),
        request.signature.as_deref(),
    )?;

    let registration = state.registry.renew_registration(&caller, &name);
    state.persist().await;
    let registration = registration?;
    Ok(Json(registration))
}

async fn handle_release(
    State(state): State<SharedState>,
    AxumPath(name): AxumPath<String>,
    Json(request): Json<OwnerRequest>,
) -> Result<Json<Registration>, ApiError> {
    state.record_request();
    let name = parse_name(&name)?;
    let caller = parse_account(&request.caller, "caller")?;
    state.authorize(
        &caller,
        request.nonce,
        &auth::release_digest(&caller, request.nonce, &name),
        request.signature.as_deref(),
    )?;

    let released = state.registry.release_registration(&caller, &name);
    state.persist().await;
    let released = released?;
    Ok(Json(released))
}

async fn handle_forward(
    State(state): State<SharedState>,
    AxumPath(name): AxumPath<String>,
    Json(request): Json<ForwardRequest>,
) -> Result<Json<ForwardReceipt>, ApiError> {
    state.record_request();
    let name = parse_name(&name)?;
    let caller = parse_account(&request.caller, "caller")?;
    let payload = parse_hex_bytes(&request.payload, "payload")?;
    state.authorize(
        &caller,
        request.nonce,
        &auth::forward_digest(
            &caller,
            request.nonce,
            &name,
            request.value,
            request.paid,
            &payload,
        ),
        request.signature.as_deref(),
    )?;

    let receipt = state.registry.resolve_and_forward(
        &caller,
        &name,
        request.value,
        payload,
        request.paid,
    );
    state.persist().await;
    let receipt = receipt?;
    Ok(Json(receipt))
}

async fn handle_get_account(
    State(state): State<SharedState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<AccountResponse>, ApiError> {
    state.record_request();
    let account = parse_account(&id, "account")?;
    Ok(Json(AccountResponse {
        ledger: state.registry.ledger(&account),
        pending: state.registry.pending_commitment(&account),
        live_names: state.registry.live_names(&account),
        account,
    }))
}

async fn handle_withdraw(
    State(state): State<SharedState>,
    AxumPath(id): AxumPath<String>,
    Json(request): Json<WithdrawRequest>,
) -> Result<Json<WithdrawResponse>, ApiError> {
    state.record_request();
    let account = parse_account(&id, "account")?;
    state.authorize(
        &account,
        request.nonce,
        &auth::withdraw_digest(&account, request.nonce),
        request.signature.as_deref(),
    )?;

    let amount = state.registry.withdraw(&account);
    state.persist().await;
    let amount = amount?;
    Ok(Json(WithdrawResponse { account, amount }))
}

async fn handle_inbox(
    State(state): State<SharedState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<InboxResponse>, ApiError> {
    state.record_request();
    let account = parse_account(&id, "account")?;
    let inbox = state
        .inbox
        .as_ref()
        .ok_or_else(|| ApiError::not_found("call inboxes are not enabled on this node"))?;
    Ok(Json(InboxResponse {
        calls: inbox.inbox(&account),
        account,
    }))
}

fn parse_name(value: &str) -> Result<Name, ApiError> {
    Name::parse(value).map_err(ApiError::from)
}

fn parse_account(value: &str, field: &str) -> Result<AccountId, ApiError> {
    AccountId::decode(value)
        .map_err(|err| ApiError::bad_request(format!("invalid {field}: {err}")))
}

fn parse_hex_array<const N: usize>(value: &str, field: &str) -> Result<[u8; N], ApiError> {
    let normalized = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
        .trim();

    let mut output = [0u8; N];
    hex::decode_to_slice(normalized, &mut output).map_err(|_| {
        ApiError::bad_request(format!("invalid {field}: expected {N}-byte hex string"))
    })?;
    Ok(output)
}

fn parse_hex_bytes(value: &str, field: &str) -> Result<Vec<u8>, ApiError> {
    let normalized = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
        .trim();
    hex::decode(normalized)
        .map_err(|_| ApiError::bad_request(format!("invalid {field}: expected hex string")))
}
