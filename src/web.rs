//! HTTP endpoints: the token endpoint, the public JWKS used to verify
//! issued access tokens, and device deactivation.
use crate::clock::{Clock, SystemClock};
use crate::jwks::JwksManager;
use crate::oauth::fingerprint::{decrypt_activation, FingerprintCodec};
use crate::oauth::{OAuthError, TokenCodec, TokenHandler, TokenHandlerOptions, TokenRequest};
use crate::settings::Settings;
use crate::storage::{self, SeaOrmModel};
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::SecondsFormat;
use miette::IntoDiagnostic;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: DatabaseConnection,
    pub jwks: JwksManager,
    pub tokens: Arc<TokenHandler>,
}

impl AppState {
    pub fn new(settings: Settings, db: DatabaseConnection, jwks: JwksManager) -> Self {
        Self::with_clock(settings, db, jwks, Arc::new(SystemClock))
    }

    pub fn with_clock(
        settings: Settings,
        db: DatabaseConnection,
        jwks: JwksManager,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let tokens = TokenHandler::new(
            Arc::new(SeaOrmModel::new(db.clone())),
            TokenCodec::new(jwks.clone(), settings.issuer()),
            clock,
            TokenHandlerOptions::from_settings(&settings),
        );

        Self {
            settings: Arc::new(settings),
            db,
            jwks,
            tokens: Arc::new(tokens),
        }
    }
}

// Security headers middleware
async fn security_headers(request: Request<Body>, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    // JSON API only, nothing to load
    headers.insert(
        HeaderName::from_static("content-security-policy"),
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );

    response
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/.well-known/jwks.json", get(jwks_handler))
        .route("/api/oauth/token", post(token))
        .route("/api/activations/deactivate", post(deactivate))
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState) -> miette::Result<()> {
    // NOTE: Rate limiting of the token endpoint belongs in the reverse proxy.
    let addr: SocketAddr = format!(
        "{}:{}",
        state.settings.server.host, state.settings.server.port
    )
    .parse()
    .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    let app = router(state);
    tracing::info!(%addr, "Token service listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .into_diagnostic()?;
    axum::serve(listener, app).await.into_diagnostic()?;
    Ok(())
}

fn json_with_headers<T: Serialize>(
    status: StatusCode,
    value: T,
    headers: &[(&str, String)],
) -> Response {
    let mut resp = (status, Json(value)).into_response();
    let h = resp.headers_mut();
    for (name, val) in headers {
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(val),
        ) {
            h.insert(n, v);
        }
    }
    resp
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let mut headers = Vec::new();
        if self.wants_basic_challenge() {
            headers.push(("www-authenticate", "Basic realm=\"Service\"".to_string()));
        }
        if let OAuthError::InvalidToken(_) = self {
            headers.push((
                "www-authenticate",
                "Bearer realm=\"Service\", error=\"invalid_token\"".to_string(),
            ));
        }
        json_with_headers(self.status(), self.body(), &headers)
    }
}

async fn jwks_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.jwks.jwks_json())
}

async fn token(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = match TokenRequest::from_http(method, headers, &body) {
        Ok(request) => request,
        Err(e) => return e.into_response(),
    };

    match state.tokens.handle(&request).await {
        Ok(response) => json_with_headers(
            StatusCode::OK,
            response,
            &[
                ("cache-control", "no-store".to_string()),
                ("pragma", "no-cache".to_string()),
            ],
        ),
        Err(e) => e.into_response(),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeactivationResponse {
    id: String,
    num_activated: i64,
    expires_at: String,
}

/// Unbinds the device named in the presented access token and revokes
/// that token.
async fn deactivate(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<DeactivationResponse>, OAuthError> {
    let jwt = bearer_token(&headers)
        .ok_or_else(|| OAuthError::InvalidToken("Invalid token: bearer token is missing".into()))?;
    let now = state.tokens.clock().now_utc();

    let claims = state.tokens.codec().verify_access_token(jwt, now)?;
    let stored = storage::get_access_token(&state.db, jwt)
        .await?
        .ok_or_else(|| OAuthError::InvalidToken("Invalid token: access token was revoked".into()))?;
    let blob = claims.activation.as_deref().ok_or_else(|| {
        OAuthError::InvalidRequest("Invalid request: token is not bound to a device".into())
    })?;

    let codec = FingerprintCodec::new(
        &stored.client.fingerprint_secret,
        state.settings.fingerprint.accept_legacy_fixed_iv,
    )?;
    let device = decrypt_activation(&codec, blob)?;

    let license = storage::get_license_for_client_and_user(
        &state.db,
        &stored.client.client_id,
        &stored.user.subject,
    )
    .await?
    .ok_or_else(|| OAuthError::Forbidden("Forbidden: license does not exist".into()))?;

    // Revoking the token claims the deactivation. A concurrent request with
    // the same token loses here and never reaches the activation.
    if !storage::revoke_token(&state.db, &stored.id).await? {
        return Err(OAuthError::InvalidToken(
            "Invalid token: access token was revoked".into(),
        ));
    }
    let activation = storage::get_activation_by_hwid(&state.db, &license.id, &device.hwid)
        .await?
        .ok_or_else(|| OAuthError::Forbidden("Forbidden: activation does not exist".into()))?;
    if !storage::revoke_activation(&state.db, &activation).await? {
        return Err(OAuthError::Forbidden(
            "Forbidden: activation does not exist".into(),
        ));
    }
    tracing::info!(
        license_id = %license.id,
        activation_id = %activation.id,
        "Deactivated device"
    );

    let license = storage::get_license(&state.db, &license.id)
        .await?
        .ok_or_else(|| OAuthError::Forbidden("Forbidden: license does not exist".into()))?;

    Ok(Json(DeactivationResponse {
        id: license.id,
        num_activated: license.num_activated,
        expires_at: license
            .expires_at
            .to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}
