//! Token issuance with license-bound device activation.
//!
//! Supports the `password`, `password_security`, `refresh_token` and
//! `refresh_token_security` grants. The `_security` variants require an
//! encrypted device fingerprint and enforce a per-license ceiling on bound
//! devices.

pub mod errors;
pub mod fingerprint;
pub mod grant_types;
pub mod handler;
pub mod model;
pub mod request;
pub mod token_codec;
pub mod validator;

pub use errors::OAuthError;
pub use handler::{TokenHandler, TokenHandlerOptions, TokenResponse};
pub use model::OAuthModel;
pub use request::TokenRequest;
pub use token_codec::TokenCodec;
