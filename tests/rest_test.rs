use reqwest::Method;
use serde_json::json;
use wallbox_sync::config::RestConfig;
use wallbox_sync::rest::RestSession;
use wallbox_sync::{FieldValue, RegisterCatalog, WallboxError};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn session_for(server: &MockServer) -> RestSession {
    let config = RestConfig {
        enabled: true,
        base_url: Some(format!("{}/api", server.uri())),
        username: "admin".to_string(),
        password: "secret".to_string(),
        initial_backoff_ms: 10,
        ..RestConfig::default()
    };
    RestSession::new(&config, "unused")
}

fn login_ok(token: &str, expires_in: i64) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "access_token": token,
        "expires_in": expires_in,
    }))
}

async fn request_paths(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|r| r.url.path().to_string())
        .collect()
}

#[tokio::test]
async fn login_posts_credentials_and_stores_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/login"))
        .and(body_json(json!({"username": "admin", "password": "secret"})))
        .respond_with(login_ok("tok", 3600))
        .expect(1)
        .mount(&server)
        .await;

    let rest = session_for(&server);
    let session = rest.login("admin", "secret").await.unwrap();

    assert_eq!(session.access_token, "tok");
    assert_eq!((session.expires_at - session.issued_at).num_seconds(), 3600);
    assert!(rest.session().await.is_some());
}

#[tokio::test]
async fn rejected_credentials_surface_auth_expired() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/login"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let rest = session_for(&server);
    let err = rest.login("admin", "wrong").await.unwrap_err();
    assert!(matches!(err, WallboxError::AuthExpired { .. }));
}

#[tokio::test]
async fn token_close_to_expiry_is_refreshed_before_the_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/login"))
        .respond_with(login_ok("short", 1))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/login"))
        .respond_with(login_ok("fresh", 3600))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/sections/system"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let rest = session_for(&server);
    rest.login("admin", "secret").await.unwrap();

    rest.authorized_request(Method::GET, "/sections/system", None)
        .await
        .unwrap();

    assert_eq!(
        request_paths(&server).await,
        vec!["/api/login", "/api/login", "/api/sections/system"]
    );
}

#[tokio::test]
async fn fresh_token_is_reused() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/login"))
        .respond_with(login_ok("tok", 3600))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/sections/system"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(3)
        .mount(&server)
        .await;

    let rest = session_for(&server);
    for _ in 0..3 {
        rest.authorized_request(Method::GET, "/sections/system", None)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn revoked_token_triggers_exactly_one_relogin() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/login"))
        .respond_with(login_ok("revoked", 3600))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/login"))
        .respond_with(login_ok("renewed", 3600))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/sections/auth"))
        .and(header("authorization", "Bearer renewed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/sections/auth"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let rest = session_for(&server);
    rest.authorized_request(Method::GET, "/sections/auth", None)
        .await
        .unwrap();

    let logins = request_paths(&server)
        .await
        .iter()
        .filter(|p| p.as_str() == "/api/login")
        .count();
    assert_eq!(logins, 2);
}

#[tokio::test]
async fn concurrent_section_reads_share_one_relogin() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/login"))
        .respond_with(login_ok("revoked", 3600))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/login"))
        .respond_with(login_ok("renewed", 3600))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(header("authorization", "Bearer renewed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let rest = session_for(&server);
    rest.fetch_fragment(&RegisterCatalog::webasto_next())
        .await
        .unwrap();

    let logins = request_paths(&server)
        .await
        .iter()
        .filter(|p| p.as_str() == "/api/login")
        .count();
    assert_eq!(logins, 2);
    assert_eq!(rest.session().await.unwrap().access_token, "renewed");
}

#[tokio::test]
async fn persistent_auth_failure_is_not_retried_forever() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/login"))
        .respond_with(login_ok("tok", 3600))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/sections/auth"))
        .respond_with(ResponseTemplate::new(403))
        .expect(2)
        .mount(&server)
        .await;

    let rest = session_for(&server);
    let err = rest
        .authorized_request(Method::GET, "/sections/auth", None)
        .await
        .unwrap_err();
    assert!(matches!(err, WallboxError::AuthExpired { .. }));
    assert!(rest.session().await.is_none());
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/login"))
        .respond_with(login_ok("tok", 3600))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/configuration-updates"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad field"))
        .expect(1)
        .mount(&server)
        .await;

    let rest = session_for(&server);
    let err = rest
        .authorized_request(Method::POST, "/configuration-updates", Some(&json!([])))
        .await
        .unwrap_err();
    assert!(matches!(err, WallboxError::Http { status: 400, .. }));
}

#[tokio::test]
async fn unreachable_api_gives_up_after_bounded_attempts() {
    let config = RestConfig {
        enabled: true,
        base_url: Some("http://127.0.0.1:1/api".to_string()),
        max_attempts: 2,
        initial_backoff_ms: 10,
        ..RestConfig::default()
    };
    let rest = RestSession::new(&config, "unused");

    let err = rest.login("admin", "secret").await.unwrap_err();
    assert!(err.is_connection_level());
}

#[tokio::test]
async fn fetch_fragment_maps_sections_and_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/login"))
        .respond_with(login_ok("tok", 3600))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/sections/system"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"fieldKey": "comboard-sw-version", "value": "3.1.8"},
            {"fieldKey": "interfaces", "value": "lo: inet 127.0.0.1/8\neth0: inet 192.168.1.77/24"},
            {"fieldKey": "signal-voltage", "value": "L1: 12.1V, L2: 11,9V, L3: 12.0V"},
            {"fieldKey": "plug-cycles", "value": "341"},
            {"fieldKey": "led-brightness", "value": 80},
            {"fieldKey": "free-charging", "value": false},
            {"fieldKey": "free-charging-alias", "value": "TAG-7"}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/sections/auth"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/current-errors"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"errorDescription": "Ground fault", "errorCode": "E12"}
        ])))
        .mount(&server)
        .await;

    let rest = session_for(&server);
    let fragment = rest
        .fetch_fragment(&RegisterCatalog::webasto_next())
        .await
        .unwrap();

    let get = |key: &str| fragment.get(key).cloned().flatten();
    assert_eq!(get("comboard_sw_version"), Some(FieldValue::Text("3.1.8".into())));
    assert_eq!(get("ip_address"), Some(FieldValue::Text("192.168.1.77".into())));
    assert_eq!(get("signal_voltage_l3"), Some(FieldValue::Float(12.0)));
    assert_eq!(get("plug_cycles"), Some(FieldValue::Int(341)));
    assert_eq!(get("led_brightness"), Some(FieldValue::Int(80)));
    assert_eq!(get("free_charging_enabled"), Some(FieldValue::Bool(false)));
    assert_eq!(get("free_charging_tag_id"), Some(FieldValue::Text("TAG-7".into())));
    assert_eq!(
        get("active_errors"),
        Some(FieldValue::TextList(vec!["Ground fault".into()]))
    );
    // Keys of a section that failed are present but absent
    assert!(fragment.contains_key("mac_address_wifi"));
    assert_eq!(get("mac_address_wifi"), None);
    assert!(!fragment.contains_key("restart_system"));
}

#[tokio::test]
async fn write_field_posts_typed_configuration_update() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/login"))
        .respond_with(login_ok("tok", 3600))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/configuration-updates"))
        .and(body_json(json!([{
            "fieldKey": "led-brightness",
            "value": 40,
            "configurationFieldUpdateType": "number-configuration-field-update"
        }])))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/custom-actions/restart-system"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let catalog = RegisterCatalog::webasto_next();
    let rest = session_for(&server);

    let led = catalog.get("led_brightness").unwrap();
    rest.write_field(led, &FieldValue::Int(40)).await.unwrap();

    let err = rest
        .write_field(led, &FieldValue::Text("bright".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, WallboxError::WriteRejected { .. }));

    rest.restart_system().await.unwrap();
}
