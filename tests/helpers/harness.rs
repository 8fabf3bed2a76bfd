use super::db::TestDb;
use axum::http::{header, HeaderMap, HeaderValue, Method};
use base64ct::{Base64, Encoding};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tollgate::clock::FixedClock;
use tollgate::jwks::JwksManager;
use tollgate::oauth::model::Client;
use tollgate::oauth::{OAuthModel, TokenCodec, TokenHandler, TokenHandlerOptions, TokenRequest};
use tollgate::storage::SeaOrmModel;

pub const ISSUER: &str = "https://tollgate.test";

/// RSA key generation is slow, so all tests in a binary share one key.
pub fn test_keys() -> JwksManager {
    static KEYS: OnceLock<JwksManager> = OnceLock::new();
    KEYS.get_or_init(|| {
        JwksManager::ephemeral(Some("test-key".to_string())).expect("Failed to generate test key")
    })
    .clone()
}

/// Token handler over a fresh database and a frozen clock.
pub struct Harness {
    pub db: TestDb,
    pub clock: Arc<FixedClock>,
    pub handler: TokenHandler,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_options(TokenHandlerOptions::default()).await
    }

    pub async fn with_options(options: TokenHandlerOptions) -> Self {
        Self::build(options, |db| -> Arc<dyn OAuthModel> {
            Arc::new(SeaOrmModel::new(db))
        })
        .await
    }

    /// Runs the handler over a custom model built on the test database.
    pub async fn with_model<F>(make_model: F) -> Self
    where
        F: FnOnce(DatabaseConnection) -> Arc<dyn OAuthModel>,
    {
        Self::build(TokenHandlerOptions::default(), make_model).await
    }

    async fn build<F>(options: TokenHandlerOptions, make_model: F) -> Self
    where
        F: FnOnce(DatabaseConnection) -> Arc<dyn OAuthModel>,
    {
        let db = TestDb::new().await;
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let handler = TokenHandler::new(
            make_model(db.connection().clone()),
            TokenCodec::new(test_keys(), ISSUER.to_string()),
            clock.clone(),
            options,
        );

        Self { db, clock, handler }
    }
}

/// Form-encoded POST carrying the client's credentials in the body.
pub fn form_request(client: &Client, params: &[(&str, &str)]) -> TokenRequest {
    let mut body: HashMap<String, String> = params
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    body.insert("client_id".to_string(), client.client_id.clone());
    body.insert("client_secret".to_string(), client.client_secret.clone());
    TokenRequest::new(Method::POST, form_headers(), body)
}

pub fn form_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-www-form-urlencoded"),
    );
    headers
}

pub fn basic_auth(id: &str, secret: &str) -> HeaderValue {
    let encoded = Base64::encode_string(format!("{id}:{secret}").as_bytes());
    HeaderValue::from_str(&format!("Basic {encoded}")).expect("Invalid basic auth header")
}
