//! HTTP routes. Each handler decodes the request, runs one engine operation
//! on the blocking pool and encodes the result.

use crate::error::ApiError;
use axum::extract::{ConnectInfo, FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use inksign_core::{
    AuditEntry, DocumentInfo, Engine, EngineResult, EnvelopeId, EnvelopeView, FieldId, FieldSpec, NewSigner,
    OrderMode, RawValue, RequestContext, SignatureInput, SignerId, SigningView,
};
use inksign_render::{RenderOptions, preview_png};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Header naming the caller for the audit trail.
pub const ACTOR_HEADER: &str = "x-inksign-actor";

/// Shared application state.
pub struct AppState {
    pub engine: Engine,
    pub render: RenderOptions,
}

impl AppState {
    pub fn new(engine: Engine, render: RenderOptions) -> Self {
        Self { engine, render }
    }
}

type SharedState = Arc<AppState>;

/// Run an engine call on the blocking pool.
async fn run<T, F>(state: &SharedState, op: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Engine) -> EngineResult<T> + Send + 'static,
{
    let state = Arc::clone(state);
    let result = tokio::task::spawn_blocking(move || op(&state.engine)).await?;
    Ok(result?)
}

/// Who is calling and from where, for the audit trail.
pub struct Caller(pub RequestContext);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        Ok(Caller(request_context(&parts.headers, peer)))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn request_context(headers: &HeaderMap, peer: Option<String>) -> RequestContext {
    let mut ctx = RequestContext::new(header_str(headers, ACTOR_HEADER).unwrap_or("anonymous"));
    let forwarded = header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());
    if let Some(ip) = forwarded.or(peer) {
        ctx = ctx.with_ip(ip);
    }
    if let Some(agent) = header_str(headers, header::USER_AGENT.as_str()) {
        ctx = ctx.with_user_agent(agent);
    }
    ctx
}

fn pdf_response(bytes: Vec<u8>, etag: Option<String>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/pdf"));
    if let Some(value) = etag.and_then(|tag| format!("\"{}\"", tag).parse().ok()) {
        headers.insert(header::ETAG, value);
    }
    (headers, bytes).into_response()
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/documents", post(upload_document))
        .route("/documents/{key}", get(download_document))
        .route("/envelopes", post(create_envelope).get(list_envelopes))
        .route("/envelopes/{id}", get(get_envelope))
        .route("/envelopes/{id}/signers", post(add_signer))
        .route("/envelopes/{id}/fields", post(place_field))
        .route("/envelopes/{id}/activate", post(activate))
        .route("/envelopes/{id}/submit", post(submit))
        .route("/envelopes/{id}/decline", post(decline))
        .route("/envelopes/{id}/void", post(void))
        .route("/envelopes/{id}/audit", get(audit_trail))
        .route("/envelopes/{id}/artifact", get(artifact))
        .route("/sign/{token}", get(signing_view).post(sign_with_token))
        .route("/preview/signature", post(preview_signature))
        .with_state(state)
}

async fn index() -> &'static str {
    "InkSign server - see /health, /documents, /envelopes and /sign/{token}"
}

async fn health() -> &'static str {
    "ok"
}

async fn upload_document(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<(StatusCode, Json<DocumentInfo>), ApiError> {
    let info = run(&state, move |engine| engine.upload_document(&body)).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn download_document(State(state): State<SharedState>, Path(key): Path<String>) -> Result<Response, ApiError> {
    let etag = key.clone();
    let bytes = run(&state, move |engine| engine.document(&key)).await?;
    Ok(pdf_response(bytes, Some(etag)))
}

#[derive(Debug, Deserialize)]
pub struct CreateEnvelope {
    pub document_key: String,
    pub signers: Vec<NewSigner>,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub order_mode: OrderMode,
}

async fn create_envelope(
    State(state): State<SharedState>,
    Caller(ctx): Caller,
    Json(request): Json<CreateEnvelope>,
) -> Result<(StatusCode, Json<EnvelopeView>), ApiError> {
    let envelope = run(&state, move |engine| {
        engine.create_envelope(
            &request.document_key,
            request.signers,
            request.fields,
            request.order_mode,
            &ctx,
        )
    })
    .await?;
    Ok((StatusCode::CREATED, Json(envelope.into())))
}

async fn list_envelopes(State(state): State<SharedState>) -> Result<Json<Vec<EnvelopeId>>, ApiError> {
    Ok(Json(run(&state, |engine| engine.list_envelopes()).await?))
}

async fn get_envelope(
    State(state): State<SharedState>,
    Path(id): Path<EnvelopeId>,
) -> Result<Json<EnvelopeView>, ApiError> {
    Ok(Json(run(&state, move |engine| engine.get_state(id)).await?.into()))
}

async fn add_signer(
    State(state): State<SharedState>,
    Path(id): Path<EnvelopeId>,
    Caller(ctx): Caller,
    Json(signer): Json<NewSigner>,
) -> Result<Json<EnvelopeView>, ApiError> {
    Ok(Json(run(&state, move |engine| engine.add_signer(id, signer, &ctx)).await?.into()))
}

#[derive(Debug, Serialize)]
pub struct PlacedField {
    pub field_id: FieldId,
    pub envelope: EnvelopeView,
}

async fn place_field(
    State(state): State<SharedState>,
    Path(id): Path<EnvelopeId>,
    Caller(ctx): Caller,
    Json(spec): Json<FieldSpec>,
) -> Result<(StatusCode, Json<PlacedField>), ApiError> {
    let (envelope, field_id) = run(&state, move |engine| engine.place_field(id, spec, &ctx)).await?;
    Ok((StatusCode::CREATED, Json(PlacedField {
            field_id,
            envelope: envelope.into(),
        })))
}

async fn activate(
    State(state): State<SharedState>,
    Path(id): Path<EnvelopeId>,
    Caller(ctx): Caller,
) -> Result<Json<EnvelopeView>, ApiError> {
    let envelope = run(&state, move |engine| engine.activate(id, &ctx)).await?;
    info!("Envelope {} activated", id);
    Ok(Json(envelope.into()))
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub signer_id: SignerId,
    /// The envelope version the signer last saw.
    pub version: u64,
    pub values: BTreeMap<FieldId, RawValue>,
}

async fn submit(
    State(state): State<SharedState>,
    Path(id): Path<EnvelopeId>,
    Caller(ctx): Caller,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<EnvelopeView>, ApiError> {
    let envelope = run(&state, move |engine| {
        engine.submit_fields(id, request.signer_id, &request.values, request.version, &ctx)
    })
    .await?;
    Ok(Json(envelope.into()))
}

#[derive(Debug, Deserialize)]
pub struct DeclineRequest {
    pub signer_id: SignerId,
    #[serde(default)]
    pub reason: String,
}

async fn decline(
    State(state): State<SharedState>,
    Path(id): Path<EnvelopeId>,
    Caller(ctx): Caller,
    Json(request): Json<DeclineRequest>,
) -> Result<Json<EnvelopeView>, ApiError> {
    let envelope = run(&state, move |engine| {
        engine.decline(id, request.signer_id, &request.reason, &ctx)
    })
    .await?;
    Ok(Json(envelope.into()))
}

#[derive(Debug, Default, Deserialize)]
pub struct VoidRequest {
    /// Defaults to the calling identity.
    #[serde(default)]
    pub actor: Option<String>,
}

async fn void(
    State(state): State<SharedState>,
    Path(id): Path<EnvelopeId>,
    Caller(ctx): Caller,
    body: Option<Json<VoidRequest>>,
) -> Result<Json<EnvelopeView>, ApiError> {
    let actor = body
        .and_then(|Json(request)| request.actor)
        .unwrap_or_else(|| ctx.identity.clone());
    let envelope = run(&state, move |engine| engine.void(id, &actor, &ctx)).await?;
    Ok(Json(envelope.into()))
}

async fn audit_trail(
    State(state): State<SharedState>,
    Path(id): Path<EnvelopeId>,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    Ok(Json(run(&state, move |engine| engine.audit_trail(id)).await?))
}

async fn artifact(State(state): State<SharedState>, Path(id): Path<EnvelopeId>) -> Result<Response, ApiError> {
    let artifact = run(&state, move |engine| engine.get_artifact(id)).await?;
    Ok(pdf_response(artifact.bytes, Some(artifact.hash)))
}

async fn signing_view(
    State(state): State<SharedState>,
    Path(token): Path<String>,
) -> Result<Json<SigningView>, ApiError> {
    Ok(Json(run(&state, move |engine| engine.signing_view(&token)).await?))
}

#[derive(Debug, Deserialize)]
pub struct TokenSubmitRequest {
    pub version: u64,
    pub values: BTreeMap<FieldId, RawValue>,
}

/// Submit as the signer a token belongs to.
async fn sign_with_token(
    State(state): State<SharedState>,
    Path(token): Path<String>,
    Caller(ctx): Caller,
    Json(request): Json<TokenSubmitRequest>,
) -> Result<Json<EnvelopeView>, ApiError> {
    let envelope = run(&state, move |engine| {
        let view = engine.signing_view(&token)?;
        let ctx = if ctx.identity == "anonymous" {
            RequestContext {
                identity: view.signer.identity.email.clone(),
                ..ctx
            }
        } else {
            ctx
        };
        engine.submit_fields(view.envelope_id, view.signer.id, &request.values, request.version, &ctx)
    })
    .await?;
    Ok(Json(envelope.into()))
}

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub input: SignatureInput,
    /// Field size in points.
    pub width: f64,
    pub height: f64,
}

async fn preview_signature(
    State(state): State<SharedState>,
    Json(request): Json<PreviewRequest>,
) -> Result<Response, ApiError> {
    let valid = |v: f64| v.is_finite() && v > 0.0 && v <= 2000.0;
    if !valid(request.width) || !valid(request.height) {
        return Err(ApiError::BadRequest(format!(
            "field size {}x{} is out of range",
            request.width, request.height
        )));
    }
    let options = state.render.raster.clone();
    let png = tokio::task::spawn_blocking(move || {
        preview_png(&request.input, request.width, request.height, &options)
    })
    .await?
    .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    Ok(match png {
        Some(png) => ([(header::CONTENT_TYPE, "image/png")], png).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}
