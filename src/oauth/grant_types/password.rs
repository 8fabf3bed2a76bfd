use super::GrantContext;
use crate::oauth::errors::OAuthError;
use crate::oauth::model::{Client, Token, User};
use crate::oauth::request::TokenRequest;
use crate::oauth::validator;

pub(super) async fn handle(
    ctx: &GrantContext<'_>,
    request: &TokenRequest,
    client: &Client,
) -> Result<Token, OAuthError> {
    let scope = ctx.get_scope(request)?;
    let user = get_user(ctx, request).await?;
    let scope = ctx.validate_scope(&user, client, &scope).await?;

    ctx.save_token(client, &user, scope, None, None, true).await
}

/// Resolves the resource owner from `username` and `password`.
pub(super) async fn get_user(
    ctx: &GrantContext<'_>,
    request: &TokenRequest,
) -> Result<User, OAuthError> {
    let username = request
        .param("username")
        .ok_or_else(|| OAuthError::InvalidRequest("Missing parameter: `username`".into()))?;
    let password = request
        .param("password")
        .ok_or_else(|| OAuthError::InvalidRequest("Missing parameter: `password`".into()))?;

    if !validator::uchar(username) {
        return Err(OAuthError::InvalidRequest(
            "Invalid parameter: `username`".into(),
        ));
    }
    if !validator::uchar(password) {
        return Err(OAuthError::InvalidRequest(
            "Invalid parameter: `password`".into(),
        ));
    }

    ctx.model
        .get_user(username, password)
        .await?
        .ok_or_else(|| OAuthError::InvalidGrant("Invalid grant: user credentials are invalid".into()))
}
