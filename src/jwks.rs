use crate::errors::TollgateError;
use crate::settings::Keys;
use base64ct::Encoding;
use josekit::jwk::Jwk;
use josekit::jws::{JwsHeader, RS256};
use josekit::jwt;
use josekit::jwt::JwtPayload;
use rand::RngCore;
use serde_json::{json, Value};
use std::fs;
use std::sync::Arc;

#[derive(Clone)]
pub struct JwksManager {
    public_jwks_value: Arc<Value>,
    private_jwk: Arc<Jwk>,
    public_jwk: Arc<Jwk>,
}

impl JwksManager {
    pub async fn new(cfg: Keys) -> Result<Self, TollgateError> {
        // Ensure parent dirs exist
        if let Some(parent) = cfg.jwks_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(parent) = cfg.private_key_path.parent() {
            fs::create_dir_all(parent)?;
        }

        // If private key exists, load it; otherwise generate and persist it
        let private_jwk = if cfg.private_key_path.exists() {
            let s = fs::read_to_string(&cfg.private_key_path)?;
            serde_json::from_str::<Jwk>(&s)?
        } else {
            let jwk = generate_signing_key(cfg.key_id.clone(), &cfg.alg)?;
            fs::write(&cfg.private_key_path, serde_json::to_string_pretty(&jwk)?)?;
            jwk
        };

        if !cfg.jwks_path.exists() {
            let jwks = jwks_document(&private_jwk)?;
            fs::write(&cfg.jwks_path, serde_json::to_string_pretty(&jwks)?)?;
        }

        let public_jwks_value: Value = serde_json::from_str(&fs::read_to_string(&cfg.jwks_path)?)?;
        Self::from_parts(private_jwk, public_jwks_value)
    }

    /// In-memory key pair that is never written to disk.
    pub fn ephemeral(key_id: Option<String>) -> Result<Self, TollgateError> {
        let private_jwk = generate_signing_key(key_id, "RS256")?;
        let public_jwks_value = jwks_document(&private_jwk)?;
        Self::from_parts(private_jwk, public_jwks_value)
    }

    fn from_parts(private_jwk: Jwk, public_jwks_value: Value) -> Result<Self, TollgateError> {
        let public_jwk = private_jwk.to_public_key()?;
        Ok(Self {
            public_jwks_value: Arc::new(public_jwks_value),
            private_jwk: Arc::new(private_jwk),
            public_jwk: Arc::new(public_jwk),
        })
    }

    pub fn jwks_json(&self) -> Value {
        (*self.public_jwks_value).clone()
    }

    pub fn sign_jwt_rs256(&self, payload: &JwtPayload) -> Result<String, TollgateError> {
        let signer = RS256.signer_from_jwk(&self.private_jwk)?;
        let mut header = JwsHeader::new();
        if let Some(kid) = self.private_jwk.key_id() {
            header.set_key_id(kid);
        }
        header.set_algorithm("RS256");
        header.set_token_type("JWT");
        let token = jwt::encode_with_signer(payload, &header, &signer)?;
        Ok(token)
    }

    /// Checks the RS256 signature only; claim validation is up to the caller.
    pub fn verify_jwt_rs256(&self, token: &str) -> Result<JwtPayload, TollgateError> {
        let verifier = RS256.verifier_from_jwk(&self.public_jwk)?;
        let (payload, _header) = jwt::decode_with_verifier(token, &verifier)?;
        Ok(payload)
    }
}

fn generate_signing_key(key_id: Option<String>, alg: &str) -> Result<Jwk, TollgateError> {
    let mut jwk = Jwk::generate_rsa_key(2048)?;
    let kid = key_id.unwrap_or_else(random_kid);
    jwk.set_key_id(&kid);
    jwk.set_algorithm(alg);
    jwk.set_key_use("sig");
    Ok(jwk)
}

fn jwks_document(private_jwk: &Jwk) -> Result<Value, TollgateError> {
    let public = private_jwk.to_public_key()?;
    Ok(json!({ "keys": [serde_json::to_value(public)?] }))
}

fn random_kid() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}
