//! Password grant bound to a licensed device.
//!
//! The first request from a device reserves one activation slot on the
//! license and records the device signature. Later requests must present
//! the identical signature.

use super::password::get_user;
use super::GrantContext;
use crate::oauth::errors::OAuthError;
use crate::oauth::fingerprint::{validate_activation, SensorPayload};
use crate::oauth::model::{Activation, Client, License, Reservation, Token};
use crate::oauth::request::TokenRequest;
use tracing::info;

pub(super) async fn handle(
    ctx: &GrantContext<'_>,
    request: &TokenRequest,
    client: &Client,
) -> Result<Token, OAuthError> {
    let scope = ctx.get_scope(request)?;
    let user = get_user(ctx, request).await?;
    let license = ctx.get_license(client, &user).await?;
    let activation = get_activation(ctx, request, client, &license).await?;
    let scope = ctx.validate_scope(&user, client, &scope).await?;

    ctx.save_token(
        client,
        &user,
        scope,
        Some(&license),
        Some(&activation),
        true,
    )
    .await
}

async fn get_activation(
    ctx: &GrantContext<'_>,
    request: &TokenRequest,
    client: &Client,
    license: &License,
) -> Result<Activation, OAuthError> {
    let payload = ctx.get_sensor_payload(request, client)?;

    if let Some(existing) = find_matching(ctx, license, &payload).await? {
        return Ok(existing);
    }

    match ctx
        .model
        .reserve_activation(license, client.max_active_sessions, payload.device.clone())
        .await?
    {
        Reservation::Created(activation) => {
            info!(
                license_id = %license.id,
                activation_id = %activation.id,
                "Activated new device"
            );
            Ok(activation)
        }
        Reservation::CeilingReached => {
            info!(
                license_id = %license.id,
                max_active_sessions = ?client.max_active_sessions,
                "Activation ceiling reached"
            );
            Err(OAuthError::Forbidden(
                "Forbidden: maximal amount of activations reached".into(),
            ))
        }
        // A concurrent request may have bound the same device first.
        Reservation::HwidTaken => find_matching(ctx, license, &payload)
            .await?
            .ok_or_else(|| {
                OAuthError::Forbidden("Forbidden: device is activated on another license".into())
            }),
    }
}

async fn find_matching(
    ctx: &GrantContext<'_>,
    license: &License,
    payload: &SensorPayload,
) -> Result<Option<Activation>, OAuthError> {
    match ctx
        .model
        .get_activation_by_hwid(license, &payload.device.hwid)
        .await?
    {
        Some(existing) => {
            validate_activation(payload, &existing)?;
            Ok(Some(existing))
        }
        None => Ok(None),
    }
}
