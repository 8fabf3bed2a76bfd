use super::errors::OAuthError;
use super::grant_types::{GrantContext, GrantType};
use super::model::{Client, OAuthModel, Scope, Token};
use super::request::TokenRequest;
use super::token_codec::TokenCodec;
use super::validator;
use crate::clock::Clock;
use crate::settings::Settings;
use axum::http::Method;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Immutable handler configuration, derived from [`Settings`].
#[derive(Debug, Clone)]
pub struct TokenHandlerOptions {
    pub access_token_lifetime: i64,
    pub refresh_token_lifetime: i64,
    pub always_issue_new_refresh_token: bool,
    /// Grant types absent from the map require client authentication.
    pub require_client_authentication: HashMap<String, bool>,
    pub accept_legacy_fixed_iv: bool,
}

impl TokenHandlerOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            access_token_lifetime: settings.oauth.access_token_lifetime,
            refresh_token_lifetime: settings.oauth.refresh_token_lifetime,
            always_issue_new_refresh_token: settings.oauth.always_issue_new_refresh_token,
            require_client_authentication: settings.oauth.require_client_authentication.clone(),
            accept_legacy_fixed_iv: settings.fingerprint.accept_legacy_fixed_iv,
        }
    }
}

impl Default for TokenHandlerOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Successful token endpoint body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
}

impl TokenResponse {
    pub fn from_token(token: &Token, now: DateTime<Utc>) -> Self {
        let expires_in = (token.access_token_expires_at - now).num_seconds();
        Self {
            access_token: token.access_token.clone(),
            token_type: "Bearer",
            expires_in: (expires_in > 0).then_some(expires_in),
            refresh_token: token.refresh_token.clone(),
            scope: (!token.scope.is_empty()).then(|| token.scope.clone()),
        }
    }
}

/// Token endpoint: authenticates the client and dispatches to a grant.
pub struct TokenHandler {
    model: Arc<dyn OAuthModel>,
    codec: TokenCodec,
    clock: Arc<dyn Clock>,
    options: TokenHandlerOptions,
}

impl TokenHandler {
    pub fn new(
        model: Arc<dyn OAuthModel>,
        codec: TokenCodec,
        clock: Arc<dyn Clock>,
        options: TokenHandlerOptions,
    ) -> Self {
        Self {
            model,
            codec,
            clock,
            options,
        }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn model(&self) -> &Arc<dyn OAuthModel> {
        &self.model
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn options(&self) -> &TokenHandlerOptions {
        &self.options
    }

    /// Runs the request and renders the success body.
    pub async fn handle(&self, request: &TokenRequest) -> Result<TokenResponse, OAuthError> {
        let token = self.issue(request).await?;
        Ok(TokenResponse::from_token(&token, self.clock.now_utc()))
    }

    /// Runs the request and returns the persisted token.
    pub async fn issue(&self, request: &TokenRequest) -> Result<Token, OAuthError> {
        let result = self.issue_inner(request).await;
        if let Err(e) = &result {
            let grant_type = request.param("grant_type").unwrap_or_default();
            match e {
                OAuthError::ServerError(source) => {
                    error!(grant_type, error = %source, "Token request failed")
                }
                OAuthError::Misconfigured(message) => {
                    error!(grant_type, error = %message, "Token request failed")
                }
                other => {
                    debug!(grant_type, error = other.name(), "Token request rejected")
                }
            }
        }
        result
    }

    async fn issue_inner(&self, request: &TokenRequest) -> Result<Token, OAuthError> {
        if request.method != Method::POST {
            return Err(OAuthError::InvalidRequest(
                "Invalid request: method must be POST".into(),
            ));
        }
        if !request.has_supported_content_type() {
            return Err(OAuthError::InvalidRequest(
                "Invalid request: content must be application/x-www-form-urlencoded or application/json"
                    .into(),
            ));
        }

        let client = self.get_client(request).await?;
        self.handle_grant_type(request, &client).await
    }

    /// Resolves and authenticates the client.
    pub async fn get_client(&self, request: &TokenRequest) -> Result<Client, OAuthError> {
        let (client_id, client_secret) = self.get_client_credentials(request)?;
        let grant_type = request.param("grant_type");

        if !validator::vschar(&client_id) {
            return Err(OAuthError::InvalidRequest(
                "Invalid parameter: `client_id`".into(),
            ));
        }
        if let Some(secret) = client_secret.as_deref() {
            if !validator::vschar(secret) {
                return Err(OAuthError::InvalidRequest(
                    "Invalid parameter: `client_secret`".into(),
                ));
            }
        }
        if client_secret.is_none() && self.is_client_authentication_required(grant_type) {
            return Err(OAuthError::InvalidRequest(
                "Missing parameter: `client_secret`".into(),
            ));
        }

        match self
            .model
            .get_client(&client_id, client_secret.as_deref())
            .await?
        {
            Some(client) => Ok(client),
            None => {
                let challenge = request.has_authorization_header();
                if challenge {
                    warn!(client_id = %client_id, "Basic client authentication failed");
                }
                Err(OAuthError::InvalidClient {
                    message: "Invalid client: client is invalid".into(),
                    challenge,
                })
            }
        }
    }

    fn get_client_credentials(
        &self,
        request: &TokenRequest,
    ) -> Result<(String, Option<String>), OAuthError> {
        if let Some(credentials) = request.basic_credentials() {
            return Ok(credentials);
        }

        let grant_type = request.param("grant_type");
        match (request.param("client_id"), request.param("client_secret")) {
            (Some(id), Some(secret)) => Ok((id.to_string(), Some(secret.to_string()))),
            (Some(id), None) if !self.is_client_authentication_required(grant_type) => {
                Ok((id.to_string(), None))
            }
            _ => Err(OAuthError::invalid_client(
                "Invalid client: cannot retrieve client credentials",
            )),
        }
    }

    fn is_client_authentication_required(&self, grant_type: Option<&str>) -> bool {
        grant_type
            .and_then(|g| self.options.require_client_authentication.get(g))
            .copied()
            .unwrap_or(true)
    }

    async fn handle_grant_type(
        &self,
        request: &TokenRequest,
        client: &Client,
    ) -> Result<Token, OAuthError> {
        let grant_type = request
            .param("grant_type")
            .ok_or_else(|| OAuthError::InvalidRequest("Missing parameter: `grant_type`".into()))?;

        if !validator::nchar(grant_type) && !validator::uri(grant_type) {
            return Err(OAuthError::InvalidRequest(
                "Invalid parameter: `grant_type`".into(),
            ));
        }

        let grant = GrantType::from_wire(grant_type).ok_or_else(|| {
            OAuthError::UnsupportedGrantType("Unsupported grant type: `grant_type` is invalid".into())
        })?;

        if !client.grants.iter().any(|g| g == grant_type) {
            return Err(OAuthError::UnauthorizedClient(
                "Unauthorized client: `grant_type` is invalid".into(),
            ));
        }

        let ctx = GrantContext {
            model: self.model.as_ref(),
            codec: &self.codec,
            clock: self.clock.as_ref(),
            access_token_lifetime: client
                .access_token_lifetime
                .unwrap_or(self.options.access_token_lifetime),
            refresh_token_lifetime: client
                .refresh_token_lifetime
                .unwrap_or(self.options.refresh_token_lifetime),
            always_issue_new_refresh_token: self.options.always_issue_new_refresh_token,
            accept_legacy_fixed_iv: self.options.accept_legacy_fixed_iv,
        };

        grant.handle(&ctx, request, client).await
    }
}
