use std::sync::Arc;

use contxt_clock::{TestClock, UnixTime};
use contxt_tokens::{
    AudienceNameRef, Audiences, AuthConfig, ClientId, ClientSecret, Session, SessionBuilder,
    SessionConfig, SessionError, SessionKind, SessionStrategy, UnauthorizedOrigin,
    CONTXT_AUTH_AUDIENCE,
};
use serde_json::json;
use url::Url;
use wiremock::{
    matchers::{body_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn facilities() -> &'static AudienceNameRef {
    AudienceNameRef::from_str("facilities")
}

async fn machine_session(server: &MockServer) -> Arc<Session<TestClock>> {
    let host = Url::parse(&server.uri()).unwrap();
    let config = SessionConfig::new(SessionKind::MachineAuth)
        .with_audiences(
            Audiences::new()
                .with_audience(
                    CONTXT_AUTH_AUDIENCE,
                    Some(ClientId::from_static("auth-id")),
                    host.clone(),
                )
                .with_audience(
                    "facilities",
                    Some(ClientId::from_static("fac-id")),
                    Url::parse("https://facilities.example").unwrap(),
                ),
        )
        .with_auth(
            AuthConfig::default()
                .with_client_id(ClientId::from_static("machine-id"))
                .with_client_secret(ClientSecret::from_static("machine-secret")),
        );

    let session = SessionBuilder::new(config)
        .with_clock(TestClock::new(UnixTime(1_000)))
        .build()
        .await
        .unwrap();

    Arc::new(session)
}

async fn mount_machine_grant(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "machine-primary",
            "expires_in": 86400,
        })))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_a_single_exchange() {
    let server = MockServer::start().await;
    mount_machine_grant(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1/token"))
        .and(header("authorization", "Bearer machine-primary"))
        .and(body_json(json!({ "audiences": ["fac-id"], "nonce": "nonce" })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "access_token": "facilities-token" }))
                .set_delay(std::time::Duration::from_millis(50)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let session = machine_session(&server).await;

    let callers: Vec<_> = (0..8)
        .map(|_| {
            let session = session.clone();
            tokio::spawn(async move { session.get_current_api_token(facilities()).await })
        })
        .collect();

    for caller in callers {
        assert_eq!(caller.await.unwrap().unwrap().as_str(), "facilities-token");
    }

    // A later call is answered from the cache.
    assert_eq!(
        session
            .get_current_api_token(facilities())
            .await
            .unwrap()
            .as_str(),
        "facilities-token"
    );
}

#[tokio::test]
async fn failed_exchange_is_retried_on_next_request() {
    let server = MockServer::start().await;
    mount_machine_grant(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1/token"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "access_token": "second-try" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let session = machine_session(&server).await;

    let err = session
        .get_current_api_token(facilities())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("bad gateway"));

    assert_eq!(
        session
            .get_current_api_token(facilities())
            .await
            .unwrap()
            .as_str(),
        "second-try"
    );
}

#[tokio::test]
async fn clearing_a_token_forces_a_new_exchange() {
    let server = MockServer::start().await;
    mount_machine_grant(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1/token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "access_token": "facilities-token" })),
        )
        .expect(2)
        .mount(&server)
        .await;

    let session = machine_session(&server).await;

    session.get_current_api_token(facilities()).await.unwrap();
    session.clear_current_api_token(facilities());
    session.clear_current_api_token(facilities());
    session.get_current_api_token(facilities()).await.unwrap();
}

#[tokio::test]
async fn logged_out_session_makes_no_requests() {
    let server = MockServer::start().await;
    let session = machine_session(&server).await;

    session.log_out().await.unwrap();

    let err = session
        .get_current_api_token(facilities())
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn rejected_primary_credential_is_a_remote_authorization_failure() {
    let server = MockServer::start().await;
    mount_machine_grant(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1/token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("jwt expired"))
        .expect(1)
        .mount(&server)
        .await;

    let session = machine_session(&server).await;

    let err = session
        .get_current_api_token(facilities())
        .await
        .unwrap_err();

    match err {
        SessionError::Unauthorized(err) => assert_eq!(err.origin(), UnauthorizedOrigin::Remote),
        other => panic!("unexpected error: {other:?}"),
    }
}
