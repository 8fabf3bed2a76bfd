use chrono::{DateTime, Duration, Utc};
use sea_orm::DatabaseConnection;
use serde_json::{json, Value};
use tollgate::oauth::fingerprint::FingerprintCodec;
use tollgate::oauth::model::{Client, DeviceSignature, License, User};
use tollgate::storage;

/// Builder for creating test users
pub struct UserBuilder {
    username: String,
    password: String,
    email: Option<String>,
    enabled: bool,
}

impl UserBuilder {
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            password: "password123".to_string(),
            email: None,
            enabled: true,
        }
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = password.to_string();
        self
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> User {
        let user = storage::create_user(db, &self.username, &self.password, self.email)
            .await
            .expect("Failed to create test user");

        if !self.enabled {
            storage::set_user_enabled(db, &user.subject, false)
                .await
                .expect("Failed to disable user");
        }
        user
    }
}

/// Builder for creating test OAuth clients
pub struct ClientBuilder {
    input: storage::NewClient,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            input: storage::NewClient {
                name: "Test Client".to_string(),
                grants: vec![
                    "password".to_string(),
                    "password_security".to_string(),
                    "refresh_token".to_string(),
                    "refresh_token_security".to_string(),
                ],
                access_token_lifetime: None,
                refresh_token_lifetime: None,
                max_active_sessions: None,
                fingerprint_secret: None,
            },
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.input.name = name.to_string();
        self
    }

    pub fn with_grants(mut self, grants: &[&str]) -> Self {
        self.input.grants = grants.iter().map(|g| g.to_string()).collect();
        self
    }

    pub fn with_max_active_sessions(mut self, max: i64) -> Self {
        self.input.max_active_sessions = Some(max);
        self
    }

    pub fn with_access_token_lifetime(mut self, secs: i64) -> Self {
        self.input.access_token_lifetime = Some(secs);
        self
    }

    pub fn with_refresh_token_lifetime(mut self, secs: i64) -> Self {
        self.input.refresh_token_lifetime = Some(secs);
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> Client {
        storage::create_client(db, self.input)
            .await
            .expect("Failed to create test client")
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for creating test licenses
pub struct LicenseBuilder {
    client_id: String,
    subject: String,
    expires_at: DateTime<Utc>,
}

impl LicenseBuilder {
    pub fn new(client: &Client, user: &User) -> Self {
        Self {
            client_id: client.client_id.clone(),
            subject: user.subject.clone(),
            expires_at: Utc::now() + Duration::days(30),
        }
    }

    pub fn expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn expired(self) -> Self {
        self.expires_at(Utc::now() - Duration::days(1))
    }

    pub async fn create(self, db: &DatabaseConnection) -> License {
        storage::create_license(db, &self.client_id, &self.subject, self.expires_at)
            .await
            .expect("Failed to create test license")
    }
}

/// Builder for encrypted device fingerprints, as produced by the sensor
pub struct SensorBuilder {
    payload: Value,
    legacy_fixed_iv: bool,
}

impl SensorBuilder {
    pub fn new(hwid: &str) -> Self {
        let device = DeviceSignature {
            hwid: hwid.to_string(),
            arch: "x64".to_string(),
            cpus: vec![
                "Intel(R) Core(TM) i7-8550U".to_string(),
                "Intel(R) Core(TM) i7-8550U".to_string(),
            ],
            endianness: "LE".to_string(),
            platform: "linux".to_string(),
            username: "jane".to_string(),
            hostname: format!("{}-host", hwid),
        };
        let mut payload = serde_json::to_value(device).expect("Failed to serialize device");
        payload["exp"] = json!((Utc::now() + Duration::minutes(5)).timestamp_millis());

        Self {
            payload,
            legacy_fixed_iv: false,
        }
    }

    pub fn with_hostname(self, hostname: &str) -> Self {
        self.with_field("hostname", json!(hostname))
    }

    pub fn with_cpus(self, cpus: &[&str]) -> Self {
        self.with_field("cpus", json!(cpus))
    }

    pub fn expires_at(self, exp: DateTime<Utc>) -> Self {
        self.with_field("exp", json!(exp.timestamp_millis()))
    }

    pub fn with_field(mut self, name: &str, value: Value) -> Self {
        self.payload[name] = value;
        self
    }

    pub fn without(mut self, name: &str) -> Self {
        if let Some(map) = self.payload.as_object_mut() {
            map.remove(name);
        }
        self
    }

    pub fn legacy_fixed_iv(mut self) -> Self {
        self.legacy_fixed_iv = true;
        self
    }

    pub fn device(&self) -> DeviceSignature {
        serde_json::from_value(self.payload.clone()).expect("Sensor payload is incomplete")
    }

    pub fn encrypt(&self, client: &Client) -> String {
        let codec = FingerprintCodec::new(&client.fingerprint_secret, false)
            .expect("Client fingerprint secret is unusable");
        if self.legacy_fixed_iv {
            codec.encrypt_with_fixed_iv(&self.payload)
        } else {
            codec.encrypt(&self.payload)
        }
        .expect("Failed to encrypt sensor payload")
    }
}
