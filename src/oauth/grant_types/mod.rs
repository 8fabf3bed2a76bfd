//! Grant type implementations.
//!
//! Each grant is a one-shot handler that turns a validated request and an
//! authenticated client into a persisted [`Token`]. Shared steps (scope
//! parsing, license checks, token generation) live on [`GrantContext`].

mod password;
mod password_security;
mod refresh_token;
mod refresh_token_security;

use super::errors::OAuthError;
use super::fingerprint::{self, FingerprintCodec, SensorPayload};
use super::model::{Activation, Client, License, NewToken, OAuthModel, Scope, Token, User};
use super::request::TokenRequest;
use super::token_codec::TokenCodec;
use super::validator;
use crate::clock::Clock;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GrantType {
    Password,
    PasswordSecurity,
    RefreshToken,
    RefreshTokenSecurity,
}

const GRANT_TYPES: &[(&str, GrantType)] = &[
    ("password", GrantType::Password),
    ("password_security", GrantType::PasswordSecurity),
    ("refresh_token", GrantType::RefreshToken),
    ("refresh_token_security", GrantType::RefreshTokenSecurity),
];

impl GrantType {
    /// Looks up an implemented grant by its wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        GRANT_TYPES
            .iter()
            .find(|(wire, _)| *wire == name)
            .map(|(_, grant)| *grant)
    }

    pub fn as_str(self) -> &'static str {
        GRANT_TYPES
            .iter()
            .find(|(_, grant)| *grant == self)
            .map(|(wire, _)| *wire)
            .unwrap_or("unknown")
    }

    pub fn all() -> impl Iterator<Item = GrantType> {
        GRANT_TYPES.iter().map(|(_, grant)| *grant)
    }

    pub async fn handle(
        self,
        ctx: &GrantContext<'_>,
        request: &TokenRequest,
        client: &Client,
    ) -> Result<Token, OAuthError> {
        match self {
            GrantType::Password => password::handle(ctx, request, client).await,
            GrantType::PasswordSecurity => password_security::handle(ctx, request, client).await,
            GrantType::RefreshToken => refresh_token::handle(ctx, request, client).await,
            GrantType::RefreshTokenSecurity => {
                refresh_token_security::handle(ctx, request, client).await
            }
        }
    }
}

/// Everything a grant needs besides the request itself.
pub struct GrantContext<'a> {
    pub model: &'a dyn OAuthModel,
    pub codec: &'a TokenCodec,
    pub clock: &'a dyn Clock,
    /// Effective lifetimes in seconds, client overrides already applied.
    pub access_token_lifetime: i64,
    pub refresh_token_lifetime: i64,
    pub always_issue_new_refresh_token: bool,
    pub accept_legacy_fixed_iv: bool,
}

impl GrantContext<'_> {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now_utc()
    }

    /// Parses the optional space-delimited `scope` parameter.
    pub fn get_scope(&self, request: &TokenRequest) -> Result<Scope, OAuthError> {
        match request.body.get("scope") {
            None => Ok(Vec::new()),
            Some(raw) if validator::nqschar(raw) => {
                Ok(raw.split(' ').filter(|s| !s.is_empty()).map(String::from).collect())
            }
            Some(_) => Err(OAuthError::InvalidRequest(
                "Invalid parameter: `scope`".into(),
            )),
        }
    }

    pub async fn validate_scope(
        &self,
        user: &User,
        client: &Client,
        scope: &Scope,
    ) -> Result<Scope, OAuthError> {
        self.model
            .validate_scope(user, client, scope)
            .await?
            .ok_or_else(|| OAuthError::InvalidScope("Invalid scope: Requested scope is invalid".into()))
    }

    pub fn access_token_expires_at(&self) -> DateTime<Utc> {
        self.now() + Duration::seconds(self.access_token_lifetime)
    }

    pub fn refresh_token_expires_at(&self) -> DateTime<Utc> {
        self.now() + Duration::seconds(self.refresh_token_lifetime)
    }

    pub fn fingerprint_codec(&self, client: &Client) -> Result<FingerprintCodec, OAuthError> {
        FingerprintCodec::new(&client.fingerprint_secret, self.accept_legacy_fixed_iv)
    }

    /// Fails with `forbidden` when the user holds no unexpired license for
    /// this client.
    pub async fn get_license(&self, client: &Client, user: &User) -> Result<License, OAuthError> {
        let license = self
            .model
            .get_license_for_client_and_user(client, user)
            .await?
            .ok_or_else(|| OAuthError::Forbidden("Forbidden: license does not exist".into()))?;

        if license.is_expired(self.now()) {
            return Err(OAuthError::Forbidden("Forbidden: license has expired".into()));
        }
        Ok(license)
    }

    /// Decodes the encrypted fingerprint carried in `requestId`.
    pub fn get_sensor_payload(
        &self,
        request: &TokenRequest,
        client: &Client,
    ) -> Result<SensorPayload, OAuthError> {
        let blob = request.param("requestId").ok_or_else(|| {
            OAuthError::InvalidRequest("Missing parameter: `requestId`".into())
        })?;
        if !validator::uchar(blob) {
            return Err(OAuthError::InvalidRequest(
                "Invalid parameter: `requestId`".into(),
            ));
        }

        let codec = self.fingerprint_codec(client)?;
        fingerprint::decode_sensor_data(&codec, blob, self.now())
    }

    /// Generates and persists a token. `activation` is embedded encrypted.
    pub async fn save_token(
        &self,
        client: &Client,
        user: &User,
        scope: Scope,
        license: Option<&License>,
        activation: Option<&Activation>,
        with_refresh_token: bool,
    ) -> Result<Token, OAuthError> {
        let activation_claim = match activation {
            Some(activation) => {
                let codec = self.fingerprint_codec(client)?;
                Some(fingerprint::encrypt_activation(&codec, activation)?)
            }
            None => None,
        };

        let access_token_expires_at = self.access_token_expires_at();
        let access_token = self.codec.generate_access_token(
            client,
            user,
            &scope,
            access_token_expires_at,
            self.now(),
            license,
            activation_claim,
        )?;

        let (refresh_token, refresh_token_expires_at) = if with_refresh_token {
            (
                Some(self.codec.generate_refresh_token()),
                Some(self.refresh_token_expires_at()),
            )
        } else {
            (None, None)
        };

        let token = self
            .model
            .save_token(NewToken {
                access_token,
                access_token_expires_at,
                refresh_token,
                refresh_token_expires_at,
                client: client.clone(),
                user: user.clone(),
                scope,
            })
            .await?;

        debug!(
            client_id = %client.client_id,
            subject = %user.subject,
            token_id = %token.id,
            "Issued token"
        );
        Ok(token)
    }
}
