//! HTTP handlers for the boot API.
//!
//! Every per-host endpoint shares the same preconditions: the host record
//! must exist, and the request must originate from the host's registered
//! IPv4 address (or pass the trusted-proxy rule). Stage-1 requests mint a
//! fresh set of session IDs; report and extension requests must present the
//! matching session ID. Stage-2/3 requests accept the session path segment
//! unchecked — in-flight retries after a concurrent stage-1 are tolerated,
//! and the segment exists so enforcement can be added without a wire
//! change.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::Utc;
use epoxy_core::compose;
use epoxy_core::extension::{ExtensionRegistry, ExtensionRequest};
use epoxy_core::host::{Host, STAGE2, STAGE3};
use epoxy_core::store::HostStore;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::error::BootError;
use crate::metrics::Metrics;
use crate::proxy;

/// Header consulted in trusted-proxy mode. The first element is the claimed
/// client; anything beyond two elements is treated as spoofing.
const FORWARDED_FOR: &str = "x-forwarded-for";

/// Shared state for all boot handlers.
pub struct Env {
    /// Durable host records.
    pub store: Arc<dyn HostStore>,

    /// Public name of this service, used to emit absolute URLs.
    pub server_name: String,

    /// When true, the source-IP gate consults `X-Forwarded-For` instead of
    /// the transport peer. Enable only behind a trusted load balancer.
    pub allow_forwarded: bool,

    /// Extension operation registry, read-only after startup.
    pub extensions: ExtensionRegistry,

    /// Metric family handles.
    pub metrics: Arc<Metrics>,

    /// Outbound client for the extension proxy.
    pub http: reqwest::Client,
}

/// Handler state as shared with axum.
pub type SharedEnv = Arc<Env>;

/// Builds the public router. The caller must serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()` so the source-IP
/// gate can see the transport peer.
pub fn router(env: SharedEnv) -> Router {
    Router::new()
        .route("/_ah/health", get(health))
        .route("/v1/boot/{hostname}/stage1.ipxe", post(stage1_ipxe))
        .route("/v1/boot/{hostname}/stage1.json", post(stage1_json))
        .route("/v1/boot/{hostname}/{session_id}/stage2", post(stage2))
        .route("/v1/boot/{hostname}/{session_id}/stage3", post(stage3))
        .route("/v1/boot/{hostname}/{session_id}/report", post(report))
        .route("/v1/boot/{hostname}/{session_id}/extension/{operation}", post(extension))
        .with_state(env)
}

async fn health() -> &'static str {
    "ok"
}

/// Checks whether the request appears to originate from `host`.
fn request_is_from_host(
    env: &Env,
    headers: &HeaderMap,
    peer: SocketAddr,
    host: &Host,
) -> Result<(), BootError> {
    if env.allow_forwarded {
        // Behind a trusted front-end the peer address is the load balancer;
        // the claimed client is the first forwarded element. The client can
        // prepend arbitrary entries, so more than two elements is rejected
        // outright.
        let forwarded = headers
            .get(FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        let elements: Vec<&str> = forwarded.split(", ").collect();
        if elements.len() <= 2 && elements[0] == host.ipv4 {
            return Ok(());
        }
        return Err(BootError::CallerCannotAccessHost);
    }

    if peer.ip().to_string() == host.ipv4 {
        return Ok(());
    }
    Err(BootError::CallerCannotAccessHost)
}

/// Loads the host record and applies the source-IP gate.
fn load_authorized_host(
    env: &Env,
    hostname: &str,
    headers: &HeaderMap,
    peer: SocketAddr,
) -> Result<Host, BootError> {
    let host = env.store.load(hostname)?;
    request_is_from_host(env, headers, peer, &host)?;
    Ok(host)
}

/// Constant-time session comparison. An empty expected ID never matches:
/// a host that has not yet seen stage 1 has nothing to authorize.
fn session_matches(given: &str, expected: &str) -> bool {
    !expected.is_empty() && bool::from(given.as_bytes().ct_eq(expected.as_bytes()))
}

/// Mints fresh session IDs, absorbs any reported form fields, and persists
/// the record. Shared by both stage-1 variants. On save failure the minted
/// IDs are lost and the machine retries on its next boot cycle.
fn mint_stage1(
    env: &Env,
    hostname: &str,
    headers: &HeaderMap,
    peer: SocketAddr,
    body: &Bytes,
) -> Result<Host, BootError> {
    let mut host = load_authorized_host(env, hostname, headers, peer)?;
    host.generate_session_ids()?;

    if !body.is_empty() {
        match serde_urlencoded::from_bytes::<Vec<(String, String)>>(body) {
            Ok(pairs) => {
                host.add_information(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            },
            Err(err) => warn!(host = %host.name, %err, "ignoring unparseable stage1 form body"),
        }
    }

    env.store.save(&host)?;
    env.metrics.stage1_total.with_label_values(&[&host.name]).inc();
    info!(host = %host.name, "minted stage1 session IDs");
    Ok(host)
}

/// `POST /v1/boot/{hostname}/stage1.ipxe` — the target for ROM-based iPXE
/// clients.
async fn stage1_ipxe(
    State(env): State<SharedEnv>,
    Path(hostname): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, BootError> {
    let started = Instant::now();
    let host = mint_stage1(&env, &hostname, &headers, peer, &body)?;
    let script = compose::stage1_ipxe_script(&host, &env.server_name);
    env.metrics
        .request_duration
        .with_label_values(&["stage1.ipxe"])
        .observe(started.elapsed().as_secs_f64());
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=us-ascii")], script).into_response())
}

/// `POST /v1/boot/{hostname}/stage1.json` — the target for native clients.
async fn stage1_json(
    State(env): State<SharedEnv>,
    Path(hostname): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, BootError> {
    let started = Instant::now();
    let host = mint_stage1(&env, &hostname, &headers, peer, &body)?;
    let action = compose::stage1_action(&host, &env.server_name);
    let body = serde_json::to_string(&action)
        .map_err(|err| BootError::Internal(err.to_string()))?;
    env.metrics
        .request_duration
        .with_label_values(&["stage1.json"])
        .observe(started.elapsed().as_secs_f64());
    Ok(([(header::CONTENT_TYPE, "application/json; charset=utf-8")], body).into_response())
}

/// Shared body of the stage-2/3 targets.
fn stage_config(
    env: &Env,
    hostname: &str,
    headers: &HeaderMap,
    peer: SocketAddr,
    stage: &str,
) -> Result<Response, BootError> {
    let host = load_authorized_host(env, hostname, headers, peer)?;
    let action = compose::stage_action(&host, stage);
    let body = serde_json::to_string(&action)
        .map_err(|err| BootError::Internal(err.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "application/json; charset=utf-8")], body).into_response())
}

/// `POST /v1/boot/{hostname}/{session_id}/stage2`.
async fn stage2(
    State(env): State<SharedEnv>,
    Path((hostname, _session_id)): Path<(String, String)>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, BootError> {
    stage_config(&env, &hostname, &headers, peer, STAGE2)
}

/// `POST /v1/boot/{hostname}/{session_id}/stage3`.
async fn stage3(
    State(env): State<SharedEnv>,
    Path((hostname, _session_id)): Path<(String, String)>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, BootError> {
    stage_config(&env, &hostname, &headers, peer, STAGE3)
}

/// `POST /v1/boot/{hostname}/{session_id}/report` — the terminal step of a
/// boot. A `success` message clears the update flag so the next boot takes
/// the normal sequence.
async fn report(
    State(env): State<SharedEnv>,
    Path((hostname, session_id)): Path<(String, String)>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, BootError> {
    let mut host = load_authorized_host(&env, &hostname, &headers, peer)?;
    if !session_matches(&session_id, &host.current_session_ids.report) {
        return Err(BootError::SessionMismatch);
    }

    let pairs: Vec<(String, String)> =
        serde_urlencoded::from_bytes(&body).unwrap_or_default();
    let message = pairs
        .iter()
        .find(|(key, _)| key == "message")
        .map(|(_, value)| value.as_str())
        .unwrap_or_default();

    let now = Utc::now();
    host.last_report = Some(now);
    if message == "success" {
        host.last_success = Some(now);
        host.update_enabled = false;
    }
    env.store.save(&host)?;

    info!(host = %host.name, message, "boot report received");
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /v1/boot/{hostname}/{session_id}/extension/{operation}` — forwards
/// the canonical envelope to the backend registered for `operation` and
/// relays the response.
async fn extension(
    State(env): State<SharedEnv>,
    Path((hostname, session_id, operation)): Path<(String, String, String)>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Response<Body>, BootError> {
    let host = load_authorized_host(&env, &hostname, &headers, peer)?;
    if !session_matches(&session_id, &host.current_session_ids.extension) {
        return Err(BootError::SessionMismatch);
    }
    if operation.is_empty() {
        return Err(BootError::BadRequest("zero length operation is invalid".to_string()));
    }
    let backend = env
        .extensions
        .backend_url(&operation)
        .ok_or_else(|| BootError::Internal(format!("unknown extension operation: {operation}")))?;
    let url = reqwest::Url::parse(backend).map_err(|err| {
        BootError::Internal(format!("failed to parse extension URL for {operation}: {err}"))
    })?;

    let envelope = ExtensionRequest::for_host(&host, query.as_deref().unwrap_or_default());
    info!(host = %host.name, %operation, "forwarding extension request");
    proxy::forward(&env.http, url, envelope.encode(), &headers).await
}
