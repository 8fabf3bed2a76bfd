use super::errors::OAuthError;
use super::model::{Client, License, Scope, User};
use crate::errors::TollgateError;
use crate::jwks::JwksManager;
use chrono::{DateTime, SecondsFormat, Utc};
use josekit::jwt::JwtPayload;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseClaim {
    #[serde(rename = "expiresAt")]
    pub expires_at: String,
}

/// Claim set of a signed access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub id: String,
    pub jti: String,
    pub iss: String,
    /// Client id the token was issued to.
    pub aud: String,
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub token_type: String,
    pub scope: Scope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<LicenseClaim>,
    /// Encrypted device signature, see `fingerprint::encrypt_activation`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation: Option<String>,
}

/// Issues RS256 access tokens and opaque refresh tokens.
#[derive(Clone)]
pub struct TokenCodec {
    keys: JwksManager,
    issuer: String,
}

impl TokenCodec {
    pub fn new(keys: JwksManager, issuer: impl Into<String>) -> Self {
        Self {
            keys,
            issuer: issuer.into(),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[allow(clippy::too_many_arguments)]
    pub fn generate_access_token(
        &self,
        client: &Client,
        user: &User,
        scope: &Scope,
        expires_at: DateTime<Utc>,
        issued_at: DateTime<Utc>,
        license: Option<&License>,
        activation: Option<String>,
    ) -> Result<String, OAuthError> {
        let id = random_hex(16);
        let claims = AccessTokenClaims {
            jti: id.clone(),
            id,
            iss: self.issuer.clone(),
            aud: client.client_id.clone(),
            sub: user.subject.clone(),
            exp: expires_at.timestamp(),
            iat: issued_at.timestamp(),
            token_type: "Bearer".to_string(),
            scope: scope.clone(),
            license: license.map(|l| LicenseClaim {
                expires_at: l.expires_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            }),
            activation,
        };

        let map = match serde_json::to_value(&claims).map_err(TollgateError::from)? {
            serde_json::Value::Object(map) => map,
            _ => return Err(TollgateError::Other("claims must be an object".into()).into()),
        };
        let payload = JwtPayload::from_map(map).map_err(TollgateError::from)?;
        Ok(self.keys.sign_jwt_rs256(&payload)?)
    }

    pub fn generate_refresh_token(&self) -> String {
        let mut bytes = [0u8; 256];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(Sha256::digest(bytes))
    }

    /// Verifies signature, issuer and expiry of an access token we issued.
    pub fn verify_access_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessTokenClaims, OAuthError> {
        let invalid = || OAuthError::InvalidToken("Invalid token: access token is invalid".into());

        let payload = self.keys.verify_jwt_rs256(token).map_err(|e| {
            debug!(error = %e, "Access token signature check failed");
            invalid()
        })?;
        let claims: AccessTokenClaims =
            serde_json::from_value(serde_json::Value::Object(payload.claims_set().clone()))
                .map_err(|_| invalid())?;

        if claims.iss != self.issuer {
            return Err(invalid());
        }
        if claims.exp <= now.timestamp() {
            return Err(OAuthError::InvalidToken(
                "Invalid token: access token has expired".into(),
            ));
        }
        Ok(claims)
    }
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
