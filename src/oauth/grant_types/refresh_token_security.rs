use super::refresh_token::{get_refresh_token, revoke_token};
use super::GrantContext;
use crate::oauth::errors::OAuthError;
use crate::oauth::fingerprint::validate_activation;
use crate::oauth::model::{Activation, Client, License, Token};
use crate::oauth::request::TokenRequest;

pub(super) async fn handle(
    ctx: &GrantContext<'_>,
    request: &TokenRequest,
    client: &Client,
) -> Result<Token, OAuthError> {
    let token = get_refresh_token(ctx, request, client).await?;
    let license = ctx.get_license(client, &token.user).await?;
    let activation = get_activation(ctx, request, client, &license).await?;
    revoke_token(ctx, &token).await?;

    ctx.save_token(
        client,
        &token.user,
        token.scope.clone(),
        Some(&license),
        Some(&activation),
        ctx.always_issue_new_refresh_token,
    )
    .await
}

/// Refreshing never binds a new device: the activation must already exist.
async fn get_activation(
    ctx: &GrantContext<'_>,
    request: &TokenRequest,
    client: &Client,
    license: &License,
) -> Result<Activation, OAuthError> {
    let payload = ctx.get_sensor_payload(request, client)?;

    let activation = ctx
        .model
        .get_activation_by_hwid(license, &payload.device.hwid)
        .await?
        .ok_or_else(|| OAuthError::Forbidden("Forbidden: activation does not exist".into()))?;

    validate_activation(&payload, &activation)?;
    Ok(activation)
}
