//! Captcha vendor protocol tests using wiremock
//!
//! These tests drive the create/poll task API and the balance check against
//! a mock vendor.

use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use banwatch::captcha::{
    CaptchaError, CaptchaSolver, PollSettings, ProviderKind, SolverPreference, SolverRegistry, TaskApiSolver,
};
use banwatch::config::{CaptchaConfig, ProviderConfig};

fn fast_poll(max_attempts: u32) -> PollSettings {
    PollSettings {
        interval: Duration::from_millis(10),
        max_attempts,
    }
}

fn solver(server: &MockServer, kind: ProviderKind, max_attempts: u32) -> TaskApiSolver {
    TaskApiSolver::new(kind, "CLIENT-KEY", fast_poll(max_attempts), Duration::from_secs(5))
        .unwrap()
        .with_base_url(&server.uri())
}

async fn mount_create(server: &MockServer, body: serde_json::Value) {
    Mock::given(method("POST"))
        .and(path("/createTask"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

// ============================================================================
// Solve
// ============================================================================

#[tokio::test]
async fn test_solve_polls_until_ready() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/createTask"))
        .and(body_partial_json(serde_json::json!({
            "clientKey": "CLIENT-KEY",
            "task": {
                "type": "RecaptchaV2TaskProxyless",
                "websiteKey": "SITE-KEY",
                "websiteURL": "https://appeals.example.com/",
                "isInvisible": true,
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"errorId": 0, "taskId": 7001})))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/getTaskResult"))
        .and(body_partial_json(serde_json::json!({"taskId": 7001})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"errorId": 0, "status": "processing"})))
        .up_to_n_times(2)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/getTaskResult"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errorId": 0,
            "status": "ready",
            "solution": {"gRecaptchaResponse": "03AGdBq2-token"}
        })))
        .mount(&server)
        .await;

    let token = solver(&server, ProviderKind::AntiCaptcha, 5)
        .solve("SITE-KEY", "https://appeals.example.com/")
        .await
        .unwrap();
    assert_eq!(token, "03AGdBq2-token");
}

#[tokio::test]
async fn test_capsolver_token_field_and_string_task_id() {
    let server = MockServer::start().await;
    mount_create(&server, serde_json::json!({"errorId": 0, "taskId": "a1b2-c3"})).await;

    Mock::given(method("POST"))
        .and(path("/getTaskResult"))
        .and(body_partial_json(serde_json::json!({"taskId": "a1b2-c3"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errorId": 0,
            "status": "ready",
            "solution": {"token": "cap-token"}
        })))
        .mount(&server)
        .await;

    let token = solver(&server, ProviderKind::CapSolver, 3)
        .solve("SITE-KEY", "https://appeals.example.com/")
        .await
        .unwrap();
    assert_eq!(token, "cap-token");
}

#[tokio::test]
async fn test_polling_is_bounded() {
    let server = MockServer::start().await;
    mount_create(&server, serde_json::json!({"errorId": 0, "taskId": 42})).await;

    Mock::given(method("POST"))
        .and(path("/getTaskResult"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"errorId": 0, "status": "processing"})))
        .expect(3)
        .mount(&server)
        .await;

    let err = solver(&server, ProviderKind::AntiCaptcha, 3)
        .solve("SITE-KEY", "https://appeals.example.com/")
        .await
        .unwrap_err();
    assert_eq!(err, CaptchaError::PollingTimeout { attempts: 3 });
    assert!(err.is_recoverable());
}

#[tokio::test]
async fn test_poll_error_stops_polling() {
    let server = MockServer::start().await;
    mount_create(&server, serde_json::json!({"errorId": 0, "taskId": 42})).await;

    Mock::given(method("POST"))
        .and(path("/getTaskResult"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errorId": 12,
            "errorCode": "ERROR_CAPTCHA_UNSOLVABLE",
            "errorDescription": "workers could not solve the captcha"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let err = solver(&server, ProviderKind::AntiCaptcha, 5)
        .solve("SITE-KEY", "https://appeals.example.com/")
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CaptchaError::VendorError {
            code: "ERROR_CAPTCHA_UNSOLVABLE".to_string(),
            description: "workers could not solve the captcha".to_string(),
        }
    );
    assert!(err.is_recoverable());
}

#[tokio::test]
async fn test_failed_task_stops_polling() {
    let server = MockServer::start().await;
    mount_create(&server, serde_json::json!({"errorId": 0, "taskId": "a1b2-c3"})).await;

    Mock::given(method("POST"))
        .and(path("/getTaskResult"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"errorId": 0, "status": "processing"})))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/getTaskResult"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"errorId": 0, "status": "failed"})))
        .expect(1)
        .mount(&server)
        .await;

    let err = solver(&server, ProviderKind::CapSolver, 5)
        .solve("SITE-KEY", "https://appeals.example.com/")
        .await
        .unwrap_err();
    assert!(matches!(err, CaptchaError::VendorError { ref code, .. } if code == "TASK_FAILED"));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_create_errors_are_classified() {
    let server = MockServer::start().await;
    mount_create(
        &server,
        serde_json::json!({"errorId": 10, "errorCode": "ERROR_ZERO_BALANCE", "errorDescription": "no funds"}),
    )
    .await;

    let err = solver(&server, ProviderKind::AntiCaptcha, 3)
        .solve("SITE-KEY", "https://appeals.example.com/")
        .await
        .unwrap_err();
    assert_eq!(err, CaptchaError::InsufficientBalance { balance: None });

    let server = MockServer::start().await;
    mount_create(
        &server,
        serde_json::json!({"errorId": 1, "errorCode": "ERROR_KEY_DOES_NOT_EXIST"}),
    )
    .await;

    let err = solver(&server, ProviderKind::AntiCaptcha, 3)
        .solve("SITE-KEY", "https://appeals.example.com/")
        .await
        .unwrap_err();
    assert!(matches!(err, CaptchaError::InvalidCredential { .. }));
    assert!(!err.is_recoverable());
}

#[tokio::test]
async fn test_vendor_http_error_is_network() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/createTask"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let err = solver(&server, ProviderKind::CapSolver, 3)
        .solve("SITE-KEY", "https://appeals.example.com/")
        .await
        .unwrap_err();
    assert!(matches!(err, CaptchaError::Network(_)));
}

// ============================================================================
// Balance
// ============================================================================

#[tokio::test]
async fn test_validate_key_reports_balance() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/getBalance"))
        .and(body_partial_json(serde_json::json!({"clientKey": "CLIENT-KEY"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"errorId": 0, "balance": 4.2})))
        .mount(&server)
        .await;

    let validation = solver(&server, ProviderKind::AntiCaptcha, 3).validate_key().await.unwrap();
    assert!(validation.valid);
    assert!((validation.balance - 4.2).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_validate_key_rejected_credential() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/getBalance"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errorId": 1,
            "errorCode": "ERROR_KEY_DOES_NOT_EXIST"
        })))
        .mount(&server)
        .await;

    let validation = solver(&server, ProviderKind::AntiCaptcha, 3).validate_key().await.unwrap();
    assert!(!validation.valid);
}

#[tokio::test]
async fn test_registry_caches_balance_between_solves() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/getBalance"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"errorId": 0, "balance": 25.0})))
        .expect(1)
        .mount(&server)
        .await;
    mount_create(&server, serde_json::json!({"errorId": 0, "taskId": 1})).await;
    Mock::given(method("POST"))
        .and(path("/getTaskResult"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errorId": 0,
            "status": "ready",
            "solution": {"gRecaptchaResponse": "tok"}
        })))
        .mount(&server)
        .await;

    let config = CaptchaConfig {
        default_provider: ProviderKind::AntiCaptcha,
        providers: vec![ProviderConfig {
            kind: ProviderKind::AntiCaptcha,
            api_key: "OPERATOR-KEY".to_string(),
            base_url: Some(server.uri()),
            app_id: None,
            min_balance: 1.0,
        }],
        poll_interval_secs: 0,
        max_poll_attempts: 2,
        ..CaptchaConfig::default()
    };
    let registry = SolverRegistry::from_config(&config).unwrap();
    let preference = SolverPreference::default();

    for _ in 0..2 {
        let outcome = registry
            .solve(&preference, "SITE-KEY", "https://appeals.example.com/")
            .await
            .unwrap();
        assert_eq!(outcome.token, "tok");
        assert_eq!(outcome.provider, ProviderKind::AntiCaptcha);
        assert!(!outcome.self_funded);
    }
}

#[tokio::test]
async fn test_registry_uses_user_key_through_factory() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/getBalance"))
        .and(body_partial_json(serde_json::json!({"clientKey": "USER-KEY"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"errorId": 0, "balance": 0.0})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/createTask"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"errorId": 0, "taskId": 1})))
        .expect(0)
        .mount(&server)
        .await;

    let config = CaptchaConfig {
        providers: vec![ProviderConfig {
            kind: ProviderKind::CapSolver,
            api_key: "OPERATOR-KEY".to_string(),
            base_url: Some(server.uri()),
            app_id: None,
            min_balance: 0.0,
        }],
        ..CaptchaConfig::default()
    };
    let registry = SolverRegistry::from_config(&config).unwrap();
    let preference = SolverPreference {
        provider: Some(ProviderKind::CapSolver),
        api_key: Some("USER-KEY".to_string()),
    };

    // Zero balance is exhausted even for a self-funded key
    let err = registry
        .solve(&preference, "SITE-KEY", "https://appeals.example.com/")
        .await
        .unwrap_err();
    assert_eq!(err, CaptchaError::InsufficientBalance { balance: Some(0.0) });
}
