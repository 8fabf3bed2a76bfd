//! Records the grant engine reads and writes, and the persistence
//! interface it reads and writes them through.

use crate::errors::TollgateError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::SqlErr;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub type Scope = Vec<String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub client_id: String,
    #[serde(skip_serializing)]
    pub client_secret: String,
    pub name: String,
    pub grants: Vec<String>,
    pub access_token_lifetime: Option<i64>,
    pub refresh_token_lifetime: Option<i64>,
    pub max_active_sessions: Option<i64>,
    #[serde(skip_serializing)]
    pub fingerprint_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub subject: String,
    pub username: String,
    pub email: Option<String>,
    pub email_verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct License {
    pub id: String,
    pub client_id: String,
    pub subject: String,
    pub expires_at: DateTime<Utc>,
    pub num_activated: i64,
}

impl License {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Device fingerprint fields shared by activations and sensor payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSignature {
    pub hwid: String,
    pub arch: String,
    pub cpus: Vec<String>,
    pub endianness: String,
    pub platform: String,
    pub username: String,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activation {
    pub id: String,
    pub license_id: String,
    #[serde(flatten)]
    pub device: DeviceSignature,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub id: String,
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token: Option<String>,
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
    pub client: Client,
    pub user: User,
    pub scope: Scope,
}

/// A token that has been generated but not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewToken {
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token: Option<String>,
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
    pub client: Client,
    pub user: User,
    pub scope: Scope,
}

/// Outcome of reserving capacity and binding a device in one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    Created(Activation),
    /// The license already has `max_active_sessions` devices bound.
    CeilingReached,
    /// Another activation already owns this hardware id.
    HwidTaken,
}

#[async_trait]
pub trait OAuthModel: Send + Sync {
    /// Returns the user only when the credentials match an enabled account.
    async fn get_user(&self, username: &str, password: &str)
        -> Result<Option<User>, TollgateError>;

    /// Looks a client up by id. When `client_secret` is given it must match.
    async fn get_client(
        &self,
        client_id: &str,
        client_secret: Option<&str>,
    ) -> Result<Option<Client>, TollgateError>;

    async fn get_license_for_client_and_user(
        &self,
        client: &Client,
        user: &User,
    ) -> Result<Option<License>, TollgateError>;

    async fn get_activation_by_hwid(
        &self,
        license: &License,
        hwid: &str,
    ) -> Result<Option<Activation>, TollgateError>;

    /// Atomically moves `num_activated` by one.
    ///
    /// An increment succeeds only while `num_activated < max_amount` (always
    /// when `max_amount` is `None`). A decrement never takes the counter
    /// below zero. Returns `false` when the precondition did not hold.
    async fn increment_activation(
        &self,
        license: &License,
        max_amount: Option<i64>,
        is_decrement: bool,
    ) -> Result<bool, TollgateError>;

    /// Creates the activation unconditionally. Capacity must already have
    /// been reserved with [`OAuthModel::increment_activation`].
    async fn add_activation(
        &self,
        license: &License,
        device: DeviceSignature,
    ) -> Result<Activation, TollgateError>;

    /// Reserves one unit of capacity and binds the device.
    ///
    /// The default reserves first and creates second, so a crash in between
    /// leaks capacity instead of over-activating. Backends with transactions
    /// should override this to do both atomically.
    async fn reserve_activation(
        &self,
        license: &License,
        max_amount: Option<i64>,
        device: DeviceSignature,
    ) -> Result<Reservation, TollgateError> {
        if !self.increment_activation(license, max_amount, false).await? {
            return Ok(Reservation::CeilingReached);
        }

        match self.add_activation(license, device).await {
            Ok(activation) => Ok(Reservation::Created(activation)),
            Err(TollgateError::Db(e))
                if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) =>
            {
                if !self.increment_activation(license, None, true).await? {
                    warn!(license_id = %license.id, "Failed to release reserved activation");
                }
                Ok(Reservation::HwidTaken)
            }
            Err(e) => Err(e),
        }
    }

    /// Deletes the activation and releases its unit of capacity.
    async fn revoke_activation(&self, activation: &Activation) -> Result<bool, TollgateError>;

    async fn save_token(&self, token: NewToken) -> Result<Token, TollgateError>;

    /// Returns the token owning `refresh_token`, with client and user loaded.
    async fn get_refresh_token(&self, refresh_token: &str)
        -> Result<Option<Token>, TollgateError>;

    /// Returns `true` only for the caller that actually removed the record.
    async fn revoke_token(&self, token: &Token) -> Result<bool, TollgateError>;

    /// Policy hook for requested scopes. `None` rejects the request.
    async fn validate_scope(
        &self,
        _user: &User,
        _client: &Client,
        scope: &Scope,
    ) -> Result<Option<Scope>, TollgateError> {
        Ok(Some(scope.clone()))
    }
}
