mod helpers;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use helpers::harness::basic_auth;
use helpers::{test_keys, ClientBuilder, LicenseBuilder, SensorBuilder, TestDb, UserBuilder};
use serde_json::Value;
use tollgate::oauth::model::Client;
use tollgate::settings::Settings;
use tollgate::web::{router, AppState};
use tower::ServiceExt;

fn app(db: &TestDb) -> axum::Router {
    let state = AppState::new(Settings::default(), db.connection().clone(), test_keys());
    router(state)
}

fn token_request(client: &Client, form: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/oauth/token")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .header(
            header::AUTHORIZATION,
            basic_auth(&client.client_id, &client.client_secret),
        )
        .body(Body::from(form.to_string()))
        .unwrap()
}

async fn json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_token_endpoint_success() {
    let db = TestDb::new().await;
    let client = ClientBuilder::new().create(db.connection()).await;
    UserBuilder::new("jane").create(db.connection()).await;

    let response = app(&db)
        .oneshot(token_request(
            &client,
            "grant_type=password&username=jane&password=password123&scope=read",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["cache-control"], "no-store");
    assert_eq!(response.headers()["pragma"], "no-cache");
    assert_eq!(response.headers()["x-content-type-options"], "nosniff");

    let body = json(response).await;
    assert_eq!(body["token_type"], "Bearer");
    assert_eq!(body["scope"], serde_json::json!(["read"]));
    assert!(body["access_token"].as_str().unwrap().split('.').count() == 3);
    assert_eq!(body["refresh_token"].as_str().unwrap().len(), 64);
}

#[tokio::test]
async fn test_token_endpoint_error_body() {
    let db = TestDb::new().await;
    let client = ClientBuilder::new().create(db.connection()).await;

    let response = app(&db)
        .oneshot(token_request(&client, "grant_type=client_credentials"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json(response).await;
    assert_eq!(body["error"], "unsupported_grant_type");
    assert!(body["error_description"].is_string());
}

#[tokio::test]
async fn test_basic_challenge_on_bad_client() {
    let db = TestDb::new().await;
    let request = Request::builder()
        .method("POST")
        .uri("/api/oauth/token")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .header(header::AUTHORIZATION, basic_auth("nobody", "nothing"))
        .body(Body::from("grant_type=password&username=a&password=b"))
        .unwrap();

    let response = app(&db).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()[header::WWW_AUTHENTICATE],
        "Basic realm=\"Service\""
    );
    assert_eq!(json(response).await["error"], "invalid_client");
}

#[tokio::test]
async fn test_jwks_has_public_key_only() {
    let db = TestDb::new().await;
    let request = Request::builder()
        .uri("/.well-known/jwks.json")
        .body(Body::empty())
        .unwrap();

    let response = app(&db).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json(response).await;
    let key = &body["keys"][0];
    assert_eq!(key["kty"], "RSA");
    assert!(key.get("d").is_none());
}

#[tokio::test]
async fn test_deactivate_releases_device() {
    let db = TestDb::new().await;
    let client = ClientBuilder::new()
        .with_max_active_sessions(1)
        .create(db.connection())
        .await;
    let user = UserBuilder::new("jane").create(db.connection()).await;
    let license = LicenseBuilder::new(&client, &user)
        .create(db.connection())
        .await;
    let app = app(&db);

    let blob = SensorBuilder::new("A").encrypt(&client);
    let form = format!(
        "grant_type=password_security&username=jane&password=password123&requestId={blob}"
    );
    let response = app
        .clone()
        .oneshot(token_request(&client, &form))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let access_token = json(response).await["access_token"]
        .as_str()
        .unwrap()
        .to_string();
    assert_eq!(db.license(&license.id).await.num_activated, 1);

    let deactivate = || {
        Request::builder()
            .method("POST")
            .uri("/api/activations/deactivate")
            .header(header::AUTHORIZATION, format!("Bearer {access_token}"))
            .body(Body::empty())
            .unwrap()
    };

    let response = app.clone().oneshot(deactivate()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["id"], license.id.as_str());
    assert_eq!(body["numActivated"], 0);
    assert_eq!(db.activation_count(&license.id).await, 0);

    // The token was revoked along with the activation.
    let response = app.clone().oneshot(deactivate()).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

    // The freed slot can be taken by another device.
    let blob = SensorBuilder::new("B").encrypt(&client);
    let form = format!(
        "grant_type=password_security&username=jane&password=password123&requestId={blob}"
    );
    let response = app.oneshot(token_request(&client, &form)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_deactivate_requires_bearer() {
    let db = TestDb::new().await;
    let request = Request::builder()
        .method("POST")
        .uri("/api/activations/deactivate")
        .body(Body::empty())
        .unwrap();

    let response = app(&db).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json(response).await["error"], "invalid_token");
}

#[tokio::test]
async fn test_concurrent_deactivation_has_single_winner() {
    let db = TestDb::new().await;
    let client = ClientBuilder::new().create(db.connection()).await;
    let user = UserBuilder::new("jane").create(db.connection()).await;
    let license = LicenseBuilder::new(&client, &user)
        .create(db.connection())
        .await;
    let app = app(&db);

    let blob = SensorBuilder::new("A").encrypt(&client);
    let form = format!(
        "grant_type=password_security&username=jane&password=password123&requestId={blob}"
    );
    let response = app
        .clone()
        .oneshot(token_request(&client, &form))
        .await
        .unwrap();
    let access_token = json(response).await["access_token"]
        .as_str()
        .unwrap()
        .to_string();

    let deactivate = || {
        Request::builder()
            .method("POST")
            .uri("/api/activations/deactivate")
            .header(header::AUTHORIZATION, format!("Bearer {access_token}"))
            .body(Body::empty())
            .unwrap()
    };
    let (first, second) = tokio::join!(
        app.clone().oneshot(deactivate()),
        app.clone().oneshot(deactivate()),
    );
    let mut statuses = [first.unwrap().status(), second.unwrap().status()];
    statuses.sort();

    // The loser sees its token as already revoked, never a half-done unbind.
    assert_eq!(statuses, [StatusCode::OK, StatusCode::UNAUTHORIZED]);
    assert_eq!(db.license(&license.id).await.num_activated, 0);
    assert_eq!(db.activation_count(&license.id).await, 0);
}
