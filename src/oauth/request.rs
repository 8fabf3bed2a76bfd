use super::errors::OAuthError;
use axum::http::{header, HeaderMap, Method};
use base64ct::{Base64, Encoding};
use serde_json::Value;
use std::collections::HashMap;

const FORM: &str = "application/x-www-form-urlencoded";
const JSON: &str = "application/json";

/// Transport-independent view of a token request.
#[derive(Debug, Clone)]
pub struct TokenRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: HashMap<String, String>,
}

impl TokenRequest {
    pub fn new(method: Method, headers: HeaderMap, body: HashMap<String, String>) -> Self {
        Self {
            method,
            headers,
            body,
        }
    }

    /// Parses a raw HTTP body according to its content type.
    ///
    /// Bodies with any other content type are left empty; the token handler
    /// rejects those requests before looking at parameters.
    pub fn from_http(method: Method, headers: HeaderMap, raw: &[u8]) -> Result<Self, OAuthError> {
        let body = match media_type(&headers).as_deref() {
            Some(FORM) => serde_urlencoded::from_bytes::<Vec<(String, String)>>(raw)
                .map_err(|_| {
                    OAuthError::InvalidRequest("Invalid request: malformed form body".into())
                })?
                .into_iter()
                .collect(),
            Some(JSON) if raw.is_empty() => HashMap::new(),
            Some(JSON) => parse_json_body(raw)?,
            _ => HashMap::new(),
        };
        Ok(Self::new(method, headers, body))
    }

    pub fn has_supported_content_type(&self) -> bool {
        matches!(media_type(&self.headers).as_deref(), Some(FORM) | Some(JSON))
    }

    /// Body parameter, with empty values treated as absent.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.body
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn has_authorization_header(&self) -> bool {
        self.headers.contains_key(header::AUTHORIZATION)
    }

    /// Credentials from an `Authorization: Basic` header. An empty secret
    /// comes back as `None`.
    pub fn basic_credentials(&self) -> Option<(String, Option<String>)> {
        let value = self.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
        let (scheme, encoded) = value.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = Base64::decode_vec(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (id, secret) = decoded.split_once(':')?;
        if id.is_empty() {
            return None;
        }
        let secret = (!secret.is_empty()).then(|| secret.to_string());
        Some((id.to_string(), secret))
    }
}

fn media_type(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    let essence = value.split(';').next()?.trim().to_ascii_lowercase();
    Some(essence)
}

fn parse_json_body(raw: &[u8]) -> Result<HashMap<String, String>, OAuthError> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|_| OAuthError::InvalidRequest("Invalid request: malformed JSON body".into()))?;
    let Value::Object(map) = value else {
        return Err(OAuthError::InvalidRequest(
            "Invalid request: JSON body must be an object".into(),
        ));
    };

    Ok(map
        .into_iter()
        .filter_map(|(k, v)| match v {
            Value::String(s) => Some((k, s)),
            Value::Number(n) => Some((k, n.to_string())),
            Value::Bool(b) => Some((k, b.to_string())),
            _ => None,
        })
        .collect())
}
