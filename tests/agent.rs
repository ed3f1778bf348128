//! End-to-end runs of the agent against a mocked secret service.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vault_agent::cache::{BoltStorage, Index, KeyManager};
use vault_agent::crypto::{DhKeyPair, Envelope, PublicKeyInfo};
use vault_agent::{Agent, Config, Result};
use vault_client::SecretWrapInfo;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const LOOKUP_SELF: &str = "/v1/auth/token/lookup-self";
const TEMPLATE_ID: &str = r#"{{ with secret "auth/token/lookup-self" }}{{ .Data.id }}{{ end }}"#;

fn lookup_body(token: &str) -> Value {
    json!({
        "data": {
            "id": token,
            "accessor": format!("acc-{}", token),
            "ttl": 0,
            "renewable": false,
            "policies": ["default"],
        }
    })
}

async fn mount_lookup(server: &MockServer, token: &str) {
    Mock::given(method("GET"))
        .and(path(LOOKUP_SELF))
        .and(header("X-Vault-Token", token))
        .respond_with(ResponseTemplate::new(200).set_body_json(lookup_body(token)))
        .mount(server)
        .await;
}

fn auth_stanza(token_file: &Path, out: &Path) -> Value {
    json!({
        "method": {
            "type": "token_file",
            "min_backoff": "100ms",
            "max_backoff": "500ms",
            "config": { "token_file_path": token_file },
        },
        "sink": [{ "type": "file", "config": { "path": out } }],
    })
}

fn start(config: Value) -> (CancellationToken, JoinHandle<Result<()>>) {
    let mut config = Config::parse(&config.to_string()).unwrap();
    config.validate().unwrap();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(Agent::new(config).run(cancel.clone()));
    (cancel, task)
}

async fn wait_for_contents(path: &Path, expected: &str, within: Duration) {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if std::fs::read_to_string(path).is_ok_and(|c| c == expected) {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "{} never became {:?}, last seen {:?}",
                path.display(),
                expected,
                std::fs::read_to_string(path).ok()
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn stop(cancel: CancellationToken, task: JoinHandle<Result<()>>) {
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

struct Paths {
    _dir: tempfile::TempDir,
    token_file: PathBuf,
    out: PathBuf,
    tmpl: PathBuf,
}

fn paths(initial_token: &str) -> Paths {
    let dir = tempfile::tempdir().unwrap();
    let token_file = dir.path().join("token");
    std::fs::write(&token_file, initial_token).unwrap();
    Paths {
        token_file,
        out: dir.path().join("out"),
        tmpl: dir.path().join("tmpl"),
        _dir: dir,
    }
}

#[tokio::test]
async fn test_self_heals_after_revocation() {
    let server = MockServer::start().await;
    mount_lookup(&server, "T1").await;
    let p = paths("T1");

    let (cancel, task) = start(json!({
        "auto_auth": auth_stanza(&p.token_file, &p.out),
        "vault": { "address": server.uri() },
        "template": [{ "contents": TEMPLATE_ID, "destination": p.tmpl }],
        "template_config": { "static_secret_render_interval": "1s" },
    }));

    wait_for_contents(&p.out, "T1", Duration::from_secs(5)).await;
    wait_for_contents(&p.tmpl, "T1", Duration::from_secs(5)).await;

    server.reset().await;
    Mock::given(method("GET"))
        .and(path(LOOKUP_SELF))
        .and(header("X-Vault-Token", "T1"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "errors": ["2 errors occurred:\n\t* permission denied\n\t* invalid token\n\n"]
        })))
        .mount(&server)
        .await;
    mount_lookup(&server, "T2").await;
    std::fs::write(&p.token_file, "T2").unwrap();

    wait_for_contents(&p.out, "T2", Duration::from_secs(5)).await;
    wait_for_contents(&p.tmpl, "T2", Duration::from_secs(5)).await;

    stop(cancel, task).await;
}

#[tokio::test]
async fn test_permission_denied_does_not_reauthenticate() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(LOOKUP_SELF))
        .and(header("X-Vault-Token", "T1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(lookup_body("T1")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/secret/data/otherapp"))
        .and(header("X-Vault-Token", "T1"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "errors": ["1 error occurred:\n\t* permission denied\n\n"]
        })))
        .expect(2..)
        .mount(&server)
        .await;
    Mock::given(header("X-Vault-Token", "T2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(lookup_body("T2")))
        .expect(0)
        .mount(&server)
        .await;
    let p = paths("T1");

    let (cancel, task) = start(json!({
        "auto_auth": auth_stanza(&p.token_file, &p.out),
        "vault": { "address": server.uri() },
        "template": [{
            "contents": r#"{{ with secret "secret/data/otherapp" }}{{ .Data.data.password }}{{ end }}"#,
            "destination": p.tmpl,
        }],
        "template_config": { "static_secret_render_interval": "1s" },
    }));

    wait_for_contents(&p.out, "T1", Duration::from_secs(5)).await;
    tokio::time::sleep(Duration::from_millis(3500)).await;

    assert_eq!(std::fs::read_to_string(&p.out).unwrap(), "T1");
    assert!(!p.tmpl.exists());

    stop(cancel, task).await;
    server.verify().await;
}

#[tokio::test]
async fn test_wrapped_and_encrypted_sink() {
    let server = MockServer::start().await;
    mount_lookup(&server, "T1").await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/wrapping/wrap"))
        .and(header("X-Vault-Token", "T1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "wrap_info": {
                "token": "hvs.wrapping",
                "accessor": "wrap-acc",
                "ttl": 10,
                "creation_time": "2026-10-18T10:00:00Z",
                "creation_path": "sys/wrapping/wrap",
            }
        })))
        .mount(&server)
        .await;

    let p = paths("T1");
    let peer = DhKeyPair::generate();
    let dh_path = p.out.with_file_name("dh.pub");
    std::fs::write(&dh_path, serde_json::to_vec(&PublicKeyInfo::new(&peer.public_key())).unwrap()).unwrap();

    let (cancel, task) = start(json!({
        "auto_auth": {
            "method": {
                "type": "token_file",
                "config": { "token_file_path": p.token_file },
            },
            "sink": [{
                "type": "file",
                "wrap_ttl": "10s",
                "dh_type": "curve25519",
                "dh_path": dh_path,
                "aad": "agent-aad",
                "config": { "path": p.out },
            }],
        },
        "vault": { "address": server.uri() },
    }));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !p.out.exists() {
        assert!(tokio::time::Instant::now() < deadline, "sink never written");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    stop(cancel, task).await;

    let envelope = Envelope::from_json(&std::fs::read(&p.out).unwrap()).unwrap();
    let sender = envelope.sender_key().unwrap().unwrap();
    let key = peer.shared_key(&sender, false).unwrap();
    let plaintext = envelope.open(&key, b"agent-aad").unwrap();

    let wrap_info: SecretWrapInfo = serde_json::from_slice(&plaintext).unwrap();
    assert_eq!(wrap_info.ttl, 10);
    assert_eq!(wrap_info.creation_path, "sys/wrapping/wrap");
    assert!(!wrap_info.token.is_empty());
}

#[tokio::test]
async fn test_exit_after_auth_with_template() {
    let server = MockServer::start().await;
    mount_lookup(&server, "T1").await;
    let p = paths("T1");

    let (_cancel, task) = start(json!({
        "exit_after_auth": true,
        "auto_auth": auth_stanza(&p.token_file, &p.out),
        "vault": { "address": server.uri() },
        "template": [{ "contents": TEMPLATE_ID, "destination": p.tmpl }],
    }));

    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("agent did not exit after auth")
        .unwrap()
        .unwrap();
    assert_eq!(std::fs::read_to_string(&p.out).unwrap(), "T1");
    assert_eq!(std::fs::read_to_string(&p.tmpl).unwrap(), "T1");
}

#[tokio::test]
async fn test_persistent_cache_survives_restart() {
    let server = MockServer::start().await;
    mount_lookup(&server, "T1").await;
    Mock::given(method("GET"))
        .and(path(LOOKUP_SELF))
        .and(header("X-Vault-Token", "T-unused"))
        .respond_with(ResponseTemplate::new(200).set_body_json(lookup_body("T-unused")))
        .expect(0)
        .mount(&server)
        .await;

    let p = paths("T1");
    let db = p.out.with_file_name("agent.db");
    let config = json!({
        "auto_auth": auth_stanza(&p.token_file, &p.out),
        "vault": { "address": server.uri() },
        "cache": { "persist": { "type": "file", "path": db } },
    });

    let (cancel, task) = start(config.clone());
    wait_for_contents(&p.out, "T1", Duration::from_secs(5)).await;
    stop(cancel, task).await;

    {
        let material = BoltStorage::read_retrieval_token(&db).unwrap().unwrap();
        let key_manager = KeyManager::from_material(&material).unwrap();
        let storage = BoltStorage::open(&db, Arc::new(key_manager)).unwrap();
        let stored = storage.get_auto_auth_token().unwrap().unwrap();
        assert_eq!(Index::from_bytes(&stored).unwrap().token, "T1");
    }

    std::fs::remove_file(&p.out).unwrap();
    std::fs::write(&p.token_file, "T-unused").unwrap();
    let (cancel, task) = start(config);
    wait_for_contents(&p.out, "T1", Duration::from_secs(5)).await;
    stop(cancel, task).await;

    server.verify().await;
}

#[tokio::test]
async fn test_inmem_sink_leaves_persisted_lease_alone() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(LOOKUP_SELF))
        .and(header("X-Vault-Token", "T1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "id": "T1",
                "accessor": "acc-T1",
                "ttl": 3600,
                "renewable": true,
                "policies": ["default"],
            }
        })))
        .mount(&server)
        .await;

    let p = paths("T1");
    let db = p.out.with_file_name("agent.db");
    let (cancel, task) = start(json!({
        "auto_auth": {
            "method": {
                "type": "token_file",
                "config": { "token_file_path": p.token_file },
            },
            "sink": [
                { "type": "inmem" },
                { "type": "file", "config": { "path": p.out } },
            ],
        },
        "vault": { "address": server.uri() },
        "cache": { "persist": { "type": "file", "path": db } },
    }));

    wait_for_contents(&p.out, "T1", Duration::from_secs(5)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    stop(cancel, task).await;

    let material = BoltStorage::read_retrieval_token(&db).unwrap().unwrap();
    let key_manager = KeyManager::from_material(&material).unwrap();
    let storage = BoltStorage::open(&db, Arc::new(key_manager)).unwrap();
    let stored = Index::from_bytes(&storage.get_auto_auth_token().unwrap().unwrap()).unwrap();
    assert_eq!(stored.token, "T1");
    assert_eq!(stored.lease_duration, 3600);
    assert!(stored.renewable);
}
