use crate::entities;
use crate::errors::TollgateError;
use crate::oauth::model::{
    Activation, Client, DeviceSignature, License, NewToken, OAuthModel, Reservation, Token, User,
};
use crate::settings::Database as DbCfg;
use async_trait::async_trait;
use base64ct::Encoding;
use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use sea_orm::sea_query::{Condition, Expr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, Set, SqlErr, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewClient {
    pub name: String,
    pub grants: Vec<String>,
    pub access_token_lifetime: Option<i64>,
    pub refresh_token_lifetime: Option<i64>,
    pub max_active_sessions: Option<i64>,
    /// Generated when absent. Must be at least 32 bytes.
    pub fingerprint_secret: Option<String>,
}

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, TollgateError> {
    let db = Database::connect(&cfg.url).await?;
    Ok(db)
}

fn random_id() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}

fn from_timestamp(secs: i64) -> Result<DateTime<Utc>, TollgateError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| TollgateError::Other(format!("Timestamp out of range: {}", secs)))
}

// Client functions

fn client_from_model(model: entities::client::Model) -> Result<Client, TollgateError> {
    Ok(Client {
        grants: serde_json::from_str(&model.grants)?,
        client_id: model.client_id,
        client_secret: model.client_secret,
        name: model.name,
        access_token_lifetime: model.access_token_lifetime,
        refresh_token_lifetime: model.refresh_token_lifetime,
        max_active_sessions: model.max_active_sessions,
        fingerprint_secret: model.fingerprint_secret,
    })
}

pub async fn create_client(db: &DatabaseConnection, input: NewClient) -> Result<Client, TollgateError> {
    let client_id = random_id();
    let client_secret = random_id();
    // 24 random bytes encode to exactly 32 characters
    let fingerprint_secret = input.fingerprint_secret.unwrap_or_else(random_id);
    if fingerprint_secret.len() < 32 {
        return Err(TollgateError::Other(
            "Fingerprint secret must be at least 32 bytes".to_string(),
        ));
    }
    let created_at = Utc::now().timestamp();

    let client = entities::client::ActiveModel {
        client_id: Set(client_id),
        client_secret: Set(client_secret),
        name: Set(input.name),
        grants: Set(serde_json::to_string(&input.grants)?),
        access_token_lifetime: Set(input.access_token_lifetime),
        refresh_token_lifetime: Set(input.refresh_token_lifetime),
        max_active_sessions: Set(input.max_active_sessions),
        fingerprint_secret: Set(fingerprint_secret),
        created_at: Set(created_at),
    };

    let model = client.insert(db).await?;
    client_from_model(model)
}

pub async fn get_client(
    db: &DatabaseConnection,
    client_id: &str,
) -> Result<Option<Client>, TollgateError> {
    use entities::client::Entity;

    match Entity::find_by_id(client_id.to_string()).one(db).await? {
        Some(model) => Ok(Some(client_from_model(model)?)),
        None => Ok(None),
    }
}

// User management functions

fn user_from_model(model: entities::user::Model) -> User {
    User {
        subject: model.subject,
        username: model.username,
        email: model.email,
        email_verified: model.email_verified != 0,
    }
}

pub async fn create_user(
    db: &DatabaseConnection,
    username: &str,
    password: &str,
    email: Option<String>,
) -> Result<User, TollgateError> {
    use argon2::password_hash::{rand_core::OsRng, SaltString};
    use argon2::{Argon2, PasswordHasher};

    let subject = random_id();
    let created_at = Utc::now().timestamp();

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| TollgateError::Other(format!("Password hashing failed: {}", e)))?
        .to_string();

    let user = entities::user::ActiveModel {
        subject: Set(subject),
        username: Set(username.to_string()),
        password_hash: Set(password_hash),
        email: Set(email),
        email_verified: Set(0),
        created_at: Set(created_at),
        enabled: Set(1),
    };

    let model = user.insert(db).await?;
    Ok(user_from_model(model))
}

pub async fn get_user_by_subject(
    db: &DatabaseConnection,
    subject: &str,
) -> Result<Option<User>, TollgateError> {
    use entities::user::Entity;

    Ok(Entity::find_by_id(subject.to_string())
        .one(db)
        .await?
        .map(user_from_model))
}

pub async fn set_user_enabled(
    db: &DatabaseConnection,
    subject: &str,
    enabled: bool,
) -> Result<(), TollgateError> {
    use entities::user::{Column, Entity};

    Entity::update_many()
        .col_expr(Column::Enabled, Expr::value(i64::from(enabled)))
        .filter(Column::Subject.eq(subject))
        .exec(db)
        .await?;
    Ok(())
}

/// Returns the user when the password matches an enabled account.
pub async fn verify_user_password(
    db: &DatabaseConnection,
    username: &str,
    password: &str,
) -> Result<Option<User>, TollgateError> {
    use argon2::{Argon2, PasswordHash, PasswordVerifier};
    use entities::user::{Column, Entity};

    let user = match Entity::find()
        .filter(Column::Username.eq(username))
        .one(db)
        .await?
    {
        Some(u) if u.enabled == 1 => u,
        _ => return Ok(None),
    };

    let parsed_hash = PasswordHash::new(&user.password_hash)
        .map_err(|e| TollgateError::Other(format!("Invalid password hash: {}", e)))?;

    if Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
    {
        Ok(Some(user_from_model(user)))
    } else {
        Ok(None)
    }
}

// License functions

fn license_from_model(model: entities::license::Model) -> Result<License, TollgateError> {
    Ok(License {
        expires_at: from_timestamp(model.expires_at)?,
        id: model.id,
        client_id: model.client_id,
        subject: model.subject,
        num_activated: model.num_activated,
    })
}

pub async fn create_license(
    db: &DatabaseConnection,
    client_id: &str,
    subject: &str,
    expires_at: DateTime<Utc>,
) -> Result<License, TollgateError> {
    let license = entities::license::ActiveModel {
        id: Set(random_id()),
        client_id: Set(client_id.to_string()),
        subject: Set(subject.to_string()),
        expires_at: Set(expires_at.timestamp()),
        num_activated: Set(0),
        created_at: Set(Utc::now().timestamp()),
    };

    let model = license.insert(db).await?;
    license_from_model(model)
}

/// Moves the expiry of an existing license. The activation counter is untouched.
pub async fn renew_license(
    db: &DatabaseConnection,
    license_id: &str,
    expires_at: DateTime<Utc>,
) -> Result<Option<License>, TollgateError> {
    use entities::license::{Column, Entity};

    let result = Entity::update_many()
        .col_expr(Column::ExpiresAt, Expr::value(expires_at.timestamp()))
        .filter(Column::Id.eq(license_id))
        .exec(db)
        .await?;
    if result.rows_affected == 0 {
        return Ok(None);
    }
    get_license(db, license_id).await
}

pub async fn get_license<C: ConnectionTrait>(
    db: &C,
    license_id: &str,
) -> Result<Option<License>, TollgateError> {
    use entities::license::Entity;

    match Entity::find_by_id(license_id.to_string()).one(db).await? {
        Some(model) => Ok(Some(license_from_model(model)?)),
        None => Ok(None),
    }
}

pub async fn get_license_for_client_and_user(
    db: &DatabaseConnection,
    client_id: &str,
    subject: &str,
) -> Result<Option<License>, TollgateError> {
    use entities::license::{Column, Entity};

    match Entity::find()
        .filter(Column::ClientId.eq(client_id))
        .filter(Column::Subject.eq(subject))
        .one(db)
        .await?
    {
        Some(model) => Ok(Some(license_from_model(model)?)),
        None => Ok(None),
    }
}

/// Moves `num_activated` by one in a single conditional UPDATE.
///
/// The row is only touched while `num_activated < max_amount` (increment)
/// or `num_activated >= 1` (decrement); one affected row means success.
pub async fn increment_activation<C: ConnectionTrait>(
    db: &C,
    license_id: &str,
    max_amount: Option<i64>,
    is_decrement: bool,
) -> Result<bool, TollgateError> {
    use entities::license::{Column, Entity};

    let step: i64 = if is_decrement { -1 } else { 1 };
    let mut update = Entity::update_many()
        .col_expr(
            Column::NumActivated,
            Expr::col(Column::NumActivated).add(step),
        )
        .filter(Column::Id.eq(license_id));

    if is_decrement {
        update = update.filter(Column::NumActivated.gte(-step));
    } else if let Some(max) = max_amount {
        update = update.filter(Column::NumActivated.lt(max));
    }

    let result = update.exec(db).await?;
    Ok(result.rows_affected == 1)
}

// Activation functions

fn activation_from_model(model: entities::activation::Model) -> Result<Activation, TollgateError> {
    Ok(Activation {
        device: DeviceSignature {
            cpus: serde_json::from_str(&model.cpus)?,
            hwid: model.hwid,
            arch: model.arch,
            endianness: model.endianness,
            platform: model.platform,
            username: model.username,
            hostname: model.hostname,
        },
        id: model.id,
        license_id: model.license_id,
    })
}

pub async fn get_activation_by_hwid(
    db: &DatabaseConnection,
    license_id: &str,
    hwid: &str,
) -> Result<Option<Activation>, TollgateError> {
    use entities::activation::{Column, Entity};

    match Entity::find()
        .filter(Column::LicenseId.eq(license_id))
        .filter(Column::Hwid.eq(hwid))
        .one(db)
        .await?
    {
        Some(model) => Ok(Some(activation_from_model(model)?)),
        None => Ok(None),
    }
}

pub async fn list_activations(
    db: &DatabaseConnection,
    license_id: &str,
) -> Result<Vec<Activation>, TollgateError> {
    use entities::activation::{Column, Entity};

    Entity::find()
        .filter(Column::LicenseId.eq(license_id))
        .all(db)
        .await?
        .into_iter()
        .map(activation_from_model)
        .collect()
}

pub async fn add_activation<C: ConnectionTrait>(
    db: &C,
    license_id: &str,
    device: DeviceSignature,
) -> Result<Activation, TollgateError> {
    let activation = entities::activation::ActiveModel {
        id: Set(random_id()),
        hwid: Set(device.hwid),
        license_id: Set(license_id.to_string()),
        arch: Set(device.arch),
        cpus: Set(serde_json::to_string(&device.cpus)?),
        endianness: Set(device.endianness),
        platform: Set(device.platform),
        username: Set(device.username),
        hostname: Set(device.hostname),
        created_at: Set(Utc::now().timestamp()),
    };

    let model = activation.insert(db).await?;
    activation_from_model(model)
}

fn is_unique_violation(err: &TollgateError) -> bool {
    matches!(
        err,
        TollgateError::Db(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
    )
}

/// Reserves capacity and creates the activation in one transaction, so a
/// failed insert never leaks a slot.
pub async fn reserve_activation(
    db: &DatabaseConnection,
    license_id: &str,
    max_amount: Option<i64>,
    device: DeviceSignature,
) -> Result<Reservation, TollgateError> {
    let txn = db.begin().await?;

    if !increment_activation(&txn, license_id, max_amount, false).await? {
        txn.rollback().await?;
        return Ok(Reservation::CeilingReached);
    }

    match add_activation(&txn, license_id, device).await {
        Ok(activation) => {
            txn.commit().await?;
            Ok(Reservation::Created(activation))
        }
        Err(e) if is_unique_violation(&e) => {
            txn.rollback().await?;
            Ok(Reservation::HwidTaken)
        }
        Err(e) => Err(e),
    }
}

/// Deletes the activation and releases its slot in one transaction, so
/// readers never see the row gone while the slot is still counted.
pub async fn revoke_activation(
    db: &DatabaseConnection,
    activation: &Activation,
) -> Result<bool, TollgateError> {
    use entities::activation::{Column, Entity};

    let txn = db.begin().await?;
    let result = Entity::delete_many()
        .filter(Column::Id.eq(activation.id.as_str()))
        .exec(&txn)
        .await?;
    if result.rows_affected != 1 {
        txn.rollback().await?;
        return Ok(false);
    }

    if !increment_activation(&txn, &activation.license_id, None, true).await? {
        warn!(
            license_id = %activation.license_id,
            "Activation counter already at zero while revoking"
        );
    }
    txn.commit().await?;
    Ok(true)
}

/// Releases capacity leaked by a crash between reservation and creation.
///
/// Each license is lowered to its real activation count with a single
/// compare-and-set on the counter value read beforehand. A license whose
/// counter moved in the meantime is skipped until the next run. Only ever
/// decrements.
pub async fn reconcile_activation_counts(db: &DatabaseConnection) -> Result<u64, TollgateError> {
    use entities::activation::{Column as ActivationColumn, Entity as ActivationEntity};
    use entities::license::{Column as LicenseColumn, Entity as LicenseEntity};

    let mut released = 0u64;
    for license in LicenseEntity::find().all(db).await? {
        let actual = ActivationEntity::find()
            .filter(ActivationColumn::LicenseId.eq(license.id.as_str()))
            .count(db)
            .await? as i64;
        if license.num_activated <= actual {
            continue;
        }

        let result = LicenseEntity::update_many()
            .col_expr(LicenseColumn::NumActivated, Expr::value(actual))
            .filter(LicenseColumn::Id.eq(license.id.as_str()))
            .filter(LicenseColumn::NumActivated.eq(license.num_activated))
            .exec(db)
            .await?;
        if result.rows_affected != 1 {
            debug!(license_id = %license.id, "Activation counter changed during reconcile");
            continue;
        }

        released += (license.num_activated - actual) as u64;
        info!(
            license_id = %license.id,
            counted = license.num_activated,
            actual,
            "Reconciled activation counter"
        );
    }

    Ok(released)
}

// Token functions

async fn token_from_model(
    db: &DatabaseConnection,
    model: entities::token::Model,
) -> Result<Option<Token>, TollgateError> {
    let client = match get_client(db, &model.client_id).await? {
        Some(client) => client,
        None => return Ok(None),
    };
    let user = match get_user_by_subject(db, &model.subject).await? {
        Some(user) => user,
        None => return Ok(None),
    };

    Ok(Some(Token {
        access_token_expires_at: from_timestamp(model.access_token_expires_at)?,
        refresh_token_expires_at: model
            .refresh_token_expires_at
            .map(from_timestamp)
            .transpose()?,
        scope: serde_json::from_str(&model.scope)?,
        id: model.id,
        access_token: model.access_token,
        refresh_token: model.refresh_token,
        client,
        user,
    }))
}

pub async fn save_token(db: &DatabaseConnection, token: NewToken) -> Result<Token, TollgateError> {
    let id = random_id();

    let record = entities::token::ActiveModel {
        id: Set(id.clone()),
        access_token: Set(token.access_token.clone()),
        access_token_expires_at: Set(token.access_token_expires_at.timestamp()),
        refresh_token: Set(token.refresh_token.clone()),
        refresh_token_expires_at: Set(token.refresh_token_expires_at.map(|t| t.timestamp())),
        client_id: Set(token.client.client_id.clone()),
        subject: Set(token.user.subject.clone()),
        scope: Set(serde_json::to_string(&token.scope)?),
        created_at: Set(Utc::now().timestamp()),
    };
    record.insert(db).await?;

    Ok(Token {
        id,
        access_token: token.access_token,
        access_token_expires_at: token.access_token_expires_at,
        refresh_token: token.refresh_token,
        refresh_token_expires_at: token.refresh_token_expires_at,
        client: token.client,
        user: token.user,
        scope: token.scope,
    })
}

pub async fn get_refresh_token(
    db: &DatabaseConnection,
    refresh_token: &str,
) -> Result<Option<Token>, TollgateError> {
    use entities::token::{Column, Entity};

    match Entity::find()
        .filter(Column::RefreshToken.eq(refresh_token))
        .one(db)
        .await?
    {
        Some(model) => token_from_model(db, model).await,
        None => Ok(None),
    }
}

pub async fn get_access_token(
    db: &DatabaseConnection,
    access_token: &str,
) -> Result<Option<Token>, TollgateError> {
    use entities::token::{Column, Entity};

    match Entity::find()
        .filter(Column::AccessToken.eq(access_token))
        .one(db)
        .await?
    {
        Some(model) => token_from_model(db, model).await,
        None => Ok(None),
    }
}

/// Deletes the token record. Of several concurrent callers only the one
/// that removed the row gets `true`.
pub async fn revoke_token(db: &DatabaseConnection, token_id: &str) -> Result<bool, TollgateError> {
    use entities::token::{Column, Entity};

    let result = Entity::delete_many()
        .filter(Column::Id.eq(token_id))
        .exec(db)
        .await?;
    Ok(result.rows_affected == 1)
}

/// Deletes tokens whose access token and refresh token have both expired.
pub async fn cleanup_expired_tokens(
    db: &DatabaseConnection,
    now: DateTime<Utc>,
) -> Result<u64, TollgateError> {
    use entities::token::{Column, Entity};

    let now = now.timestamp();
    let result = Entity::delete_many()
        .filter(Column::AccessTokenExpiresAt.lt(now))
        .filter(
            Condition::any()
                .add(Column::RefreshTokenExpiresAt.is_null())
                .add(Column::RefreshTokenExpiresAt.lt(now)),
        )
        .exec(db)
        .await?;

    Ok(result.rows_affected)
}

/// [`OAuthModel`] backed by the sea-orm schema in `migration`.
#[derive(Clone)]
pub struct SeaOrmModel {
    db: DatabaseConnection,
}

impl SeaOrmModel {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

#[async_trait]
impl OAuthModel for SeaOrmModel {
    async fn get_user(&self, username: &str, password: &str) -> Result<Option<User>, TollgateError> {
        verify_user_password(&self.db, username, password).await
    }

    async fn get_client(
        &self,
        client_id: &str,
        client_secret: Option<&str>,
    ) -> Result<Option<Client>, TollgateError> {
        let client = get_client(&self.db, client_id).await?;
        Ok(match client_secret {
            Some(secret) => client.filter(|c| c.client_secret == secret),
            None => client,
        })
    }

    async fn get_license_for_client_and_user(
        &self,
        client: &Client,
        user: &User,
    ) -> Result<Option<License>, TollgateError> {
        get_license_for_client_and_user(&self.db, &client.client_id, &user.subject).await
    }

    async fn get_activation_by_hwid(
        &self,
        license: &License,
        hwid: &str,
    ) -> Result<Option<Activation>, TollgateError> {
        get_activation_by_hwid(&self.db, &license.id, hwid).await
    }

    async fn increment_activation(
        &self,
        license: &License,
        max_amount: Option<i64>,
        is_decrement: bool,
    ) -> Result<bool, TollgateError> {
        increment_activation(&self.db, &license.id, max_amount, is_decrement).await
    }

    async fn add_activation(
        &self,
        license: &License,
        device: DeviceSignature,
    ) -> Result<Activation, TollgateError> {
        add_activation(&self.db, &license.id, device).await
    }

    async fn reserve_activation(
        &self,
        license: &License,
        max_amount: Option<i64>,
        device: DeviceSignature,
    ) -> Result<Reservation, TollgateError> {
        reserve_activation(&self.db, &license.id, max_amount, device).await
    }

    async fn revoke_activation(&self, activation: &Activation) -> Result<bool, TollgateError> {
        revoke_activation(&self.db, activation).await
    }

    async fn save_token(&self, token: NewToken) -> Result<Token, TollgateError> {
        save_token(&self.db, token).await
    }

    async fn get_refresh_token(&self, refresh_token: &str) -> Result<Option<Token>, TollgateError> {
        get_refresh_token(&self.db, refresh_token).await
    }

    async fn revoke_token(&self, token: &Token) -> Result<bool, TollgateError> {
        revoke_token(&self.db, &token.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use sea_orm::{Database, DatabaseConnection};
    use sea_orm_migration::MigratorTrait;
    use tempfile::NamedTempFile;

    /// Test database helper that keeps temp file alive
    struct TestDb {
        connection: DatabaseConnection,
        _temp_file: NamedTempFile,
    }

    impl TestDb {
        async fn new() -> Self {
            let temp_file = NamedTempFile::new().expect("Failed to create temp file");
            let db_path = temp_file.path().to_str().expect("Invalid temp file path");
            let db_url = format!("sqlite://{}?mode=rwc", db_path);

            let connection = Database::connect(&db_url)
                .await
                .expect("Failed to connect to test database");

            migration::Migrator::up(&connection, None)
                .await
                .expect("Failed to run migrations");

            Self {
                connection,
                _temp_file: temp_file,
            }
        }

        fn connection(&self) -> &DatabaseConnection {
            &self.connection
        }
    }

    fn new_client(max_active_sessions: Option<i64>) -> NewClient {
        NewClient {
            name: "Desktop App".to_string(),
            grants: vec!["password_security".to_string()],
            access_token_lifetime: None,
            refresh_token_lifetime: None,
            max_active_sessions,
            fingerprint_secret: None,
        }
    }

    fn device(hwid: &str) -> DeviceSignature {
        DeviceSignature {
            hwid: hwid.to_string(),
            arch: "x64".to_string(),
            cpus: vec!["cpu0".to_string(), "cpu1".to_string()],
            endianness: "LE".to_string(),
            platform: "linux".to_string(),
            username: "jane".to_string(),
            hostname: "box".to_string(),
        }
    }

    async fn seed_license(db: &DatabaseConnection, max: Option<i64>) -> (Client, User, License) {
        let client = create_client(db, new_client(max))
            .await
            .expect("Failed to create client");
        let user = create_user(db, "jane", "password123", None)
            .await
            .expect("Failed to create user");
        let license = create_license(
            db,
            &client.client_id,
            &user.subject,
            Utc::now() + Duration::days(30),
        )
        .await
        .expect("Failed to create license");
        (client, user, license)
    }

    // ============================================================================
    // Client and User Tests
    // ============================================================================

    #[tokio::test]
    async fn test_create_client_generates_secrets() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        let client = create_client(db, new_client(Some(2)))
            .await
            .expect("Failed to create client");

        assert!(!client.client_id.is_empty());
        assert!(!client.client_secret.is_empty());
        assert_eq!(client.fingerprint_secret.len(), 32);
        assert_eq!(client.grants, vec!["password_security"]);

        let fetched = get_client(db, &client.client_id)
            .await
            .expect("Query failed")
            .expect("Client not found");
        assert_eq!(fetched, client);
    }

    #[tokio::test]
    async fn test_create_client_rejects_short_fingerprint_secret() {
        let test_db = TestDb::new().await;

        let mut input = new_client(None);
        input.fingerprint_secret = Some("short".to_string());
        assert!(create_client(test_db.connection(), input).await.is_err());
    }

    #[tokio::test]
    async fn test_model_get_client_checks_secret() {
        let test_db = TestDb::new().await;
        let client = create_client(test_db.connection(), new_client(None))
            .await
            .unwrap();
        let model = SeaOrmModel::new(test_db.connection().clone());

        assert!(model
            .get_client(&client.client_id, Some(&client.client_secret))
            .await
            .unwrap()
            .is_some());
        assert!(model
            .get_client(&client.client_id, Some("wrong"))
            .await
            .unwrap()
            .is_none());
        assert!(model
            .get_client(&client.client_id, None)
            .await
            .unwrap()
            .is_some());
        assert!(model.get_client("missing", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_verify_user_password() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        let user = create_user(db, "jane", "password123", Some("jane@example.com".into()))
            .await
            .expect("Failed to create user");

        let verified = verify_user_password(db, "jane", "password123")
            .await
            .expect("Verification failed");
        assert_eq!(verified, Some(user.clone()));

        assert!(verify_user_password(db, "jane", "wrong")
            .await
            .unwrap()
            .is_none());
        assert!(verify_user_password(db, "nobody", "password123")
            .await
            .unwrap()
            .is_none());

        set_user_enabled(db, &user.subject, false).await.unwrap();
        assert!(verify_user_password(db, "jane", "password123")
            .await
            .unwrap()
            .is_none());
    }

    // ============================================================================
    // License and Activation Tests
    // ============================================================================

    #[tokio::test]
    async fn test_license_is_unique_per_client_and_user() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let (client, user, license) = seed_license(db, None).await;

        let found = get_license_for_client_and_user(db, &client.client_id, &user.subject)
            .await
            .unwrap()
            .expect("License not found");
        assert_eq!(found.id, license.id);
        assert_eq!(found.num_activated, 0);

        let duplicate =
            create_license(db, &client.client_id, &user.subject, Utc::now()).await;
        assert!(duplicate.is_err());
    }

    #[tokio::test]
    async fn test_renew_license_keeps_counter() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let (_, _, license) = seed_license(db, Some(3)).await;
        assert!(increment_activation(db, &license.id, Some(3), false)
            .await
            .unwrap());

        let new_expiry = Utc::now() + Duration::days(365);
        let renewed = renew_license(db, &license.id, new_expiry)
            .await
            .unwrap()
            .expect("License not found");
        assert_eq!(renewed.expires_at.timestamp(), new_expiry.timestamp());
        assert_eq!(renewed.num_activated, 1);

        assert!(renew_license(db, "missing", new_expiry)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_increment_respects_ceiling_and_floor() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let (_, _, license) = seed_license(db, Some(2)).await;

        assert!(increment_activation(db, &license.id, Some(2), false).await.unwrap());
        assert!(increment_activation(db, &license.id, Some(2), false).await.unwrap());
        assert!(!increment_activation(db, &license.id, Some(2), false).await.unwrap());

        let current = get_license(db, &license.id).await.unwrap().unwrap();
        assert_eq!(current.num_activated, 2);

        assert!(increment_activation(db, &license.id, None, true).await.unwrap());
        assert!(increment_activation(db, &license.id, None, true).await.unwrap());
        assert!(!increment_activation(db, &license.id, None, true).await.unwrap());

        let current = get_license(db, &license.id).await.unwrap().unwrap();
        assert_eq!(current.num_activated, 0);

        // Unknown license never succeeds
        assert!(!increment_activation(db, "missing", None, false).await.unwrap());
    }

    #[tokio::test]
    async fn test_unbounded_increment() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let (_, _, license) = seed_license(db, None).await;

        for _ in 0..5 {
            assert!(increment_activation(db, &license.id, None, false).await.unwrap());
        }
        let current = get_license(db, &license.id).await.unwrap().unwrap();
        assert_eq!(current.num_activated, 5);
    }

    #[tokio::test]
    async fn test_reserve_activation() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let (_, _, license) = seed_license(db, Some(1)).await;

        let first = reserve_activation(db, &license.id, Some(1), device("hw-1"))
            .await
            .unwrap();
        let activation = match first {
            Reservation::Created(a) => a,
            other => panic!("Expected activation, got {:?}", other),
        };
        assert_eq!(activation.device, device("hw-1"));

        let second = reserve_activation(db, &license.id, Some(1), device("hw-2"))
            .await
            .unwrap();
        assert_eq!(second, Reservation::CeilingReached);

        let current = get_license(db, &license.id).await.unwrap().unwrap();
        assert_eq!(current.num_activated, 1);
    }

    #[tokio::test]
    async fn test_reserve_activation_rolls_back_on_duplicate_hwid() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let (_, _, license) = seed_license(db, Some(5)).await;

        reserve_activation(db, &license.id, Some(5), device("hw-1"))
            .await
            .unwrap();
        let again = reserve_activation(db, &license.id, Some(5), device("hw-1"))
            .await
            .unwrap();
        assert_eq!(again, Reservation::HwidTaken);

        let current = get_license(db, &license.id).await.unwrap().unwrap();
        assert_eq!(current.num_activated, 1);
        assert_eq!(list_activations(db, &license.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_revoke_activation_releases_slot() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let (_, _, license) = seed_license(db, Some(1)).await;

        let activation = match reserve_activation(db, &license.id, Some(1), device("hw-1"))
            .await
            .unwrap()
        {
            Reservation::Created(a) => a,
            other => panic!("Expected activation, got {:?}", other),
        };

        assert!(revoke_activation(db, &activation).await.unwrap());
        assert!(!revoke_activation(db, &activation).await.unwrap());

        let current = get_license(db, &license.id).await.unwrap().unwrap();
        assert_eq!(current.num_activated, 0);
        assert!(get_activation_by_hwid(db, &license.id, "hw-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_reconcile_releases_leaked_capacity() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let (_, _, license) = seed_license(db, Some(3)).await;

        add_activation(db, &license.id, device("hw-1")).await.unwrap();
        // One real activation, three reserved slots
        for _ in 0..3 {
            increment_activation(db, &license.id, Some(3), false)
                .await
                .unwrap();
        }

        let released = reconcile_activation_counts(db).await.unwrap();
        assert_eq!(released, 2);

        let current = get_license(db, &license.id).await.unwrap().unwrap();
        assert_eq!(current.num_activated, 1);
        assert_eq!(reconcile_activation_counts(db).await.unwrap(), 0);
    }

    // ============================================================================
    // Token Tests
    // ============================================================================

    fn new_token(client: &Client, user: &User, refresh: Option<&str>, ttl: Duration) -> NewToken {
        let now = Utc::now();
        NewToken {
            access_token: format!("access-{}", random_id()),
            access_token_expires_at: now + ttl,
            refresh_token: refresh.map(String::from),
            refresh_token_expires_at: refresh.map(|_| now + ttl),
            client: client.clone(),
            user: user.clone(),
            scope: vec!["read".to_string()],
        }
    }

    #[tokio::test]
    async fn test_save_and_get_refresh_token() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let (client, user, _) = seed_license(db, None).await;

        let saved = save_token(db, new_token(&client, &user, Some("rt-1"), Duration::hours(1)))
            .await
            .unwrap();

        let fetched = get_refresh_token(db, "rt-1")
            .await
            .unwrap()
            .expect("Token not found");
        assert_eq!(fetched.id, saved.id);
        assert_eq!(fetched.client.client_id, client.client_id);
        assert_eq!(fetched.user.subject, user.subject);
        assert_eq!(fetched.scope, vec!["read"]);

        let by_access = get_access_token(db, &saved.access_token)
            .await
            .unwrap()
            .expect("Token not found");
        assert_eq!(by_access.id, saved.id);

        assert!(get_refresh_token(db, "rt-unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_revoke_token_has_single_winner() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let (client, user, _) = seed_license(db, None).await;

        let saved = save_token(db, new_token(&client, &user, Some("rt-1"), Duration::hours(1)))
            .await
            .unwrap();

        assert!(revoke_token(db, &saved.id).await.unwrap());
        assert!(!revoke_token(db, &saved.id).await.unwrap());
        assert!(get_refresh_token(db, "rt-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_expired_tokens() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let (client, user, _) = seed_license(db, None).await;

        // Fully expired, with and without refresh token
        save_token(db, new_token(&client, &user, Some("rt-old"), Duration::hours(-1)))
            .await
            .unwrap();
        save_token(db, new_token(&client, &user, None, Duration::hours(-1)))
            .await
            .unwrap();
        // Access expired but refresh still usable
        let mut alive = new_token(&client, &user, Some("rt-alive"), Duration::hours(-1));
        alive.refresh_token_expires_at = Some(Utc::now() + Duration::days(1));
        save_token(db, alive).await.unwrap();
        // Fresh
        save_token(db, new_token(&client, &user, None, Duration::hours(1)))
            .await
            .unwrap();

        let removed = cleanup_expired_tokens(db, Utc::now()).await.unwrap();
        assert_eq!(removed, 2);
        assert!(get_refresh_token(db, "rt-alive").await.unwrap().is_some());
    }
}
