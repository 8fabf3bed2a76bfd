//! Tollgate - OAuth2 token service with license-bound device activation
//!
//! This library provides the core functionality of the Tollgate token service.
//! It exposes all modules for testing purposes.

pub mod clock;
pub mod entities;
pub mod errors;
pub mod jobs;
pub mod jwks;
pub mod oauth;
pub mod settings;
pub mod storage;
pub mod web;
