use super::GrantContext;
use crate::oauth::errors::OAuthError;
use crate::oauth::model::{Client, License, Token, User};
use crate::oauth::request::TokenRequest;
use crate::oauth::validator;

pub(super) async fn handle(
    ctx: &GrantContext<'_>,
    request: &TokenRequest,
    client: &Client,
) -> Result<Token, OAuthError> {
    let token = get_refresh_token(ctx, request, client).await?;
    let license = find_valid_license(ctx, client, &token.user).await?;
    revoke_token(ctx, &token).await?;

    ctx.save_token(
        client,
        &token.user,
        token.scope.clone(),
        license.as_ref(),
        None,
        ctx.always_issue_new_refresh_token,
    )
    .await
}

/// The plain refresh grant embeds a license when one is valid but never
/// fails for lack of one.
async fn find_valid_license(
    ctx: &GrantContext<'_>,
    client: &Client,
    user: &User,
) -> Result<Option<License>, OAuthError> {
    Ok(ctx
        .model
        .get_license_for_client_and_user(client, user)
        .await?
        .filter(|license| !license.is_expired(ctx.now())))
}

pub(super) async fn get_refresh_token(
    ctx: &GrantContext<'_>,
    request: &TokenRequest,
    client: &Client,
) -> Result<Token, OAuthError> {
    let refresh_token = request
        .param("refresh_token")
        .ok_or_else(|| OAuthError::InvalidRequest("Missing parameter: `refresh_token`".into()))?;
    if !validator::vschar(refresh_token) {
        return Err(OAuthError::InvalidRequest(
            "Invalid parameter: `refresh_token`".into(),
        ));
    }

    let token = ctx
        .model
        .get_refresh_token(refresh_token)
        .await?
        .filter(|token| token.client.client_id == client.client_id)
        .ok_or_else(|| OAuthError::InvalidGrant("Invalid grant: refresh token is invalid".into()))?;

    match token.refresh_token_expires_at {
        Some(expires_at) if expires_at >= ctx.now() => Ok(token),
        Some(_) => Err(OAuthError::InvalidGrant(
            "Invalid grant: refresh token has expired".into(),
        )),
        None => Err(OAuthError::InvalidGrant(
            "Invalid grant: refresh token is invalid".into(),
        )),
    }
}

/// Consumes the presented token when rotation is on. Only one of several
/// concurrent refreshes of the same token can win.
pub(super) async fn revoke_token(ctx: &GrantContext<'_>, token: &Token) -> Result<(), OAuthError> {
    if !ctx.always_issue_new_refresh_token {
        return Ok(());
    }

    if !ctx.model.revoke_token(token).await? {
        return Err(OAuthError::InvalidGrant(
            "Invalid grant: refresh token is invalid".into(),
        ));
    }
    Ok(())
}
