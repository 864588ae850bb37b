use leafkv::config::{
    FaultInjection, GrantConfig, HashedPasswordConfig, RoleConfig, ServerConfig, StorageConfig,
    UserConfig,
};
use leafkv::protocol::{Message, ResponseBody};
use leafkv::security::{Action, PasswordAlgorithm};
use leafkv::{DatabaseKind, LeafError, LeafInstance, Request};
use std::path::Path;
use tempfile::{TempDir, tempdir};

const PASSWORD: &str = "12345678";

fn config(dir: &Path, kind: DatabaseKind, faults: Option<FaultInjection>) -> ServerConfig {
    let password = PasswordAlgorithm::new(16, 256)
        .expect("algorithm")
        .create_hashed(PASSWORD)
        .expect("hash");
    ServerConfig {
        schema: None,
        database_file: dir.join("leaf.db"),
        database_kind: Some(kind.as_str().to_lowercase()),
        roles: vec![RoleConfig {
            name: "writers".into(),
            grants: vec![
                GrantConfig {
                    action: Action::Read,
                    keys: "/*".into(),
                },
                GrantConfig {
                    action: Action::Write,
                    keys: "/app/*".into(),
                },
            ],
        }],
        users: vec![UserConfig {
            name: "grouch".into(),
            password: HashedPasswordConfig::from(&password),
            roles: vec!["writers".into()],
        }],
        fault_injection: faults,
        storage: StorageConfig::development(),
    }
}

fn write_config(dir: &TempDir, config: &ServerConfig) -> std::path::PathBuf {
    let path = dir.path().join("server.json");
    std::fs::write(&path, serde_json::to_vec_pretty(config).expect("encode")).expect("write");
    path
}

fn error_code(body: &ResponseBody) -> String {
    match body {
        ResponseBody::Message(Message::Error(error)) => error.error_code.clone(),
        other => panic!("expected a single error, got {other:?}"),
    }
}

#[tokio::test]
async fn instance_opens_from_file_and_serves_requests() {
    for kind in DatabaseKind::ALL {
        let dir = tempdir().expect("tempdir");
        let path = write_config(&dir, &config(dir.path(), kind, None));
        let instance = LeafInstance::open_file(&path).expect("open");

        let response = instance
            .handle(
                "grouch",
                PASSWORD,
                Request::Rud(br#"{"read":[],"update":{"/app/a":"1"},"delete":[]}"#.to_vec()),
            )
            .await;
        assert_eq!(response.status, 200, "{kind}: {response:?}");

        let response = instance
            .handle("grouch", PASSWORD, Request::Read("/app/a".into()))
            .await;
        assert_eq!(response.body, ResponseBody::Text("1".into()));

        let response = instance
            .handle(
                "grouch",
                PASSWORD,
                Request::Update("/other".into(), "v".into()),
            )
            .await;
        assert_eq!(response.status, 400);
        assert_eq!(error_code(&response.body), "operation-not-permitted");

        let size = instance.database_size().expect("size");
        assert_eq!(size.keys, 1);
        assert_eq!(size.data_bytes, 1);

        let snapshot = instance.metrics();
        assert_eq!(snapshot.transactions_total, 2);
        assert_eq!(snapshot.rejected_requests, 1);

        instance.close().expect("close");
        assert!(instance.controller().database().is_closed());
    }
}

#[tokio::test]
async fn bad_credentials_are_unauthorized() {
    let dir = tempdir().expect("tempdir");
    let instance =
        LeafInstance::open(config(dir.path(), DatabaseKind::MvStore, None)).expect("open");

    for (user, password) in [("grouch", "wrong"), ("nobody", PASSWORD)] {
        let response = instance
            .handle(user, password, Request::Read("/app/a".into()))
            .await;
        assert_eq!(response.status, 401);
        assert_eq!(error_code(&response.body), "authentication-failed");
    }
    assert_eq!(instance.metrics().authentication_failures, 2);
    assert_eq!(instance.metrics().transactions_total, 0);
}

#[tokio::test]
async fn injected_faults_become_server_errors() {
    let dir = tempdir().expect("tempdir");
    let faults = FaultInjection::with_probability(0.999_999_999).expect("probability");
    let instance =
        LeafInstance::open(config(dir.path(), DatabaseKind::MvStore, Some(faults))).expect("open");

    let response = instance
        .handle("grouch", PASSWORD, Request::Delete("/app/a".into()))
        .await;
    assert_eq!(response.status, 500);
    assert_eq!(error_code(&response.body), "unexpected-exception");
    assert_eq!(instance.metrics().storage_errors, 1);
}

#[tokio::test]
async fn missing_keys_are_not_found() {
    let dir = tempdir().expect("tempdir");
    let instance =
        LeafInstance::open(config(dir.path(), DatabaseKind::Sqlite, None)).expect("open");
    let response = instance
        .handle("grouch", PASSWORD, Request::Read("/absent".into()))
        .await;
    assert_eq!(response.status, 404);
    assert_eq!(error_code(&response.body), "not-found");
}

#[tokio::test]
async fn data_survives_reopening_the_instance() {
    let dir = tempdir().expect("tempdir");
    let config = config(dir.path(), DatabaseKind::MvStore, None);
    {
        let instance = LeafInstance::open(config.clone()).expect("open");
        let response = instance
            .handle(
                "grouch",
                PASSWORD,
                Request::Update("/app/kept".into(), "yes".into()),
            )
            .await;
        assert!(response.is_success());
        instance.close().expect("close");
    }
    let instance = LeafInstance::open(config).expect("reopen");
    let response = instance
        .handle("grouch", PASSWORD, Request::Read("/app/kept".into()))
        .await;
    assert_eq!(response.body, ResponseBody::Text("yes".into()));
}

#[test]
fn invalid_security_configuration_never_creates_a_database() {
    let dir = tempdir().expect("tempdir");
    let mut config = config(dir.path(), DatabaseKind::Sqlite, None);
    config.users[0].roles.push("missing".into());

    let err = LeafInstance::open(config.clone()).err().expect("invalid config");
    assert!(matches!(err, LeafError::ConfigValidation { .. }), "{err}");
    assert!(!config.database_file.exists());
}

#[test]
fn unreadable_configuration_is_a_config_error() {
    let dir = tempdir().expect("tempdir");
    let err = LeafInstance::open_file(&dir.path().join("absent.json"))
        .err()
        .expect("missing file");
    assert_eq!(err.code_str(), "invalid-config");
}
