// ABOUTME: Integration tests for the SSH client.
// ABOUTME: Tests run against a shared OpenSSH server container.

mod support;

use machine_ssh::ssh::{
    ConnectOptions, Connection, ConnectionPool, Credential, Error, ErrorKind, ExitStatus,
    HealthStatus, HostKeyPolicy, NoAgent,
};
use std::sync::Arc;
use support::fixture;
use support::ssh_container::shared_container;

/// Test: run_for_output returns stdout and a clean exit.
#[tokio::test]
async fn run_for_output_returns_stdout() {
    support::init_tracing();
    let container = shared_container().await;

    let result = container
        .client()
        .run_for_output("echo hi")
        .await
        .expect("command should run");

    assert!(result.success());
    assert_eq!(result.output, b"hi\n");
    assert!(result.exit_error().is_none());
}

/// Test: stderr is not part of run_for_output's captured bytes.
#[tokio::test]
async fn run_for_output_discards_stderr() {
    let container = shared_container().await;

    let result = container
        .client()
        .run_for_output("echo out; echo err >&2")
        .await
        .expect("command should run");

    assert_eq!(result.output, b"out\n");
}

/// Test: a failing command still returns its partial output with the exit error.
#[tokio::test]
async fn failing_command_keeps_partial_output() {
    let container = shared_container().await;

    let result = container
        .client()
        .run_for_output("echo partial; exit 3")
        .await
        .expect("command should complete");

    assert_eq!(result.output, b"partial\n");
    assert_eq!(result.exit, ExitStatus::Code(3));
    let err = result.exit_error().expect("non-zero exit should be an error");
    assert_eq!(err.kind(), ErrorKind::RemoteExecution);
}

/// Test: `false` produces no output and an exit error.
#[tokio::test]
async fn false_has_empty_output_and_exit_error() {
    let container = shared_container().await;

    let result = container.client().run_for_output("false").await.unwrap();

    assert!(result.output.is_empty());
    assert_eq!(result.exit, ExitStatus::Code(1));
}

/// Test: run succeeds for zero exit and fails with Exit otherwise.
#[tokio::test]
async fn run_reports_exit_status() {
    let container = shared_container().await;
    let client = container.client();

    client.run("echo hello >&2").await.expect("run should succeed");

    let err = client.run("exit 42").await.unwrap_err();
    assert!(
        matches!(err, Error::Exit(ExitStatus::Code(42))),
        "expected exit 42, got: {:?}",
        err
    );
}

/// Test: the kubeconfig path is absent on a plain host, so fetching fails.
#[tokio::test]
async fn kubeconfig_missing_is_exit_error() {
    let container = shared_container().await;

    let err = container.client().kubeconfig().await.unwrap_err();
    assert!(err.exit_status().is_some(), "got: {:?}", err);
}

/// Test: a written file has the given content and default permissions.
#[tokio::test]
async fn write_file_then_read_back() {
    let container = shared_container().await;
    let client = container.client();
    let remote_path = format!("/tmp/machine-ssh-write-{}.sh", std::process::id());
    let content = b"#!/bin/sh\necho bootstrapped\n";

    client
        .write_file(content, &remote_path)
        .await
        .expect("write should succeed");

    let read_back = client
        .run_for_output(&format!("cat {}", remote_path))
        .await
        .unwrap()
        .into_output()
        .unwrap();
    assert_eq!(read_back, content);

    let mode = client
        .run_for_output(&format!("stat -c %a {}", remote_path))
        .await
        .unwrap()
        .into_output()
        .unwrap();
    assert_eq!(String::from_utf8(mode).unwrap().trim(), "644");

    client.run(&format!("rm -f {}", remote_path)).await.unwrap();
}

/// Test: an explicit mode is applied to the remote file.
#[tokio::test]
async fn write_file_with_mode_sets_permissions() {
    let container = shared_container().await;
    let client = container.client();
    let remote_path = format!("/tmp/machine-ssh-mode-{}.sh", std::process::id());

    client
        .write_file_with_mode(b"true\n", &remote_path, 0o755)
        .await
        .expect("write should succeed");

    let result = client
        .run_for_output(&format!("stat -c %a {} && rm -f {}", remote_path, remote_path))
        .await
        .unwrap();
    assert_eq!(String::from_utf8(result.output).unwrap().trim(), "755");
}

/// Test: an empty payload creates an empty file.
#[tokio::test]
async fn write_empty_file() {
    let container = shared_container().await;
    let client = container.client();
    let remote_path = format!("/tmp/machine-ssh-empty-{}", std::process::id());

    client.write_file(b"", &remote_path).await.unwrap();

    let result = client
        .run_for_output(&format!("wc -c < {} && rm -f {}", remote_path, remote_path))
        .await
        .unwrap();
    assert_eq!(String::from_utf8(result.output).unwrap().trim(), "0");
}

/// Test: a directory the user cannot write to yields a transfer error.
#[tokio::test]
async fn write_to_unwritable_directory_fails() {
    let container = shared_container().await;

    let err = container
        .client()
        .write_file(b"x", "/proc/machine-ssh-denied")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transfer, "got: {:?}", err);
}

/// Test: passphrase-protected key authenticates with the right passphrase.
#[tokio::test]
async fn encrypted_key_with_passphrase() {
    let container = shared_container().await;
    let credential = Credential::new(
        fixture("test_key_encrypted"),
        Some("correct horse battery staple"),
    );

    container
        .client_with(credential)
        .run("true")
        .await
        .expect("passphrase-protected key should authenticate");
}

/// Test: a wrong passphrase aborts before connecting.
#[tokio::test]
async fn encrypted_key_with_wrong_passphrase() {
    let container = shared_container().await;
    let credential = Credential::new(fixture("test_key_encrypted"), Some("wrong"));

    let err = container.client_with(credential).run("true").await.unwrap_err();
    assert!(matches!(err, Error::KeyParse(_)), "got: {:?}", err);
}

/// Test: a key the server does not know is rejected.
#[tokio::test]
async fn unknown_key_fails_authentication() {
    let container = shared_container().await;
    let err = container
        .client_with(Credential::new(fixture("stranger_key"), None))
        .run("true")
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::AuthenticationFailed { .. }),
        "got: {:?}",
        err
    );
}

/// Test: neither key nor agent fails without reaching the server.
#[tokio::test]
async fn no_credentials() {
    let container = shared_container().await;

    let err = container
        .client_with(Credential::none())
        .run("true")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoCredentials), "got: {:?}", err);
}

/// Test: strict known_hosts mode refuses a host it has never seen.
#[tokio::test]
async fn strict_host_key_rejects_unknown_host() {
    let container = shared_container().await;
    let known_hosts = tempfile::NamedTempFile::new().unwrap();
    let options = ConnectOptions::default().host_key(HostKeyPolicy::KnownHosts {
        path: Some(known_hosts.path().to_path_buf()),
        trust_on_first_use: false,
    });

    let err = container
        .client()
        .with_options(options)
        .run("true")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::HostKeyRejected { .. }), "got: {:?}", err);
}

/// Test: a pinned fingerprint that does not match is rejected.
#[tokio::test]
async fn wrong_pinned_fingerprint_is_rejected() {
    let container = shared_container().await;
    let options = ConnectOptions::default().host_key(HostKeyPolicy::Pinned {
        fingerprint: "SHA256:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".to_string(),
    });

    let err = container
        .client()
        .with_options(options)
        .run("true")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Handshake, "got: {:?}", err);
}

/// Test: a fresh connection reports no probes yet and is usable until closed.
#[tokio::test]
async fn connection_health_after_connect() {
    let container = shared_container().await;
    let connection = Connection::establish(
        &container.endpoint(),
        &container.credential(),
        &NoAgent,
        &container.connect_options(),
    )
    .await
    .expect("connection should be established");

    assert_eq!(connection.health(), HealthStatus::NeverProbed);
    assert!(connection.is_usable());

    let session = connection.open_session().await.unwrap();
    let result = session
        .run("echo pong", machine_ssh::ssh::Capture::Combined)
        .await
        .unwrap();
    assert_eq!(result.output, b"pong\n");

    connection.close().await.expect("close should succeed");
}

/// Test: a pooled client reuses one connection across calls.
#[tokio::test]
async fn pooled_client_reuses_connection() {
    let container = shared_container().await;
    let pool: Arc<ConnectionPool> = Arc::new(ConnectionPool::default());
    let client = container.client().with_pool(Arc::clone(&pool));

    client.run("true").await.unwrap();
    client.run_for_output("echo again").await.unwrap();
    assert_eq!(pool.len(), 1);

    pool.invalidate(&container.endpoint()).await;
    assert!(pool.is_empty());

    client.run("true").await.unwrap();
    assert_eq!(pool.len(), 1);
    pool.close_all().await;
}

/// Test: two clients on one pool talk over the same SSH connection.
#[tokio::test]
async fn clients_sharing_a_pool_share_a_connection() {
    let container = shared_container().await;
    let pool: Arc<ConnectionPool> = Arc::new(ConnectionPool::default());
    let first = container.client().with_pool(Arc::clone(&pool));
    let second = container.client().with_pool(Arc::clone(&pool));

    let a = first.run_for_output("echo $SSH_CLIENT").await.unwrap();
    let b = second.run_for_output("echo $SSH_CLIENT").await.unwrap();

    assert_eq!(a.output, b.output, "both calls should come from one client port");
    assert_eq!(pool.len(), 1);
    pool.close_all().await;
}

/// Test: a home-relative remote path lands in the login user's home directory.
#[tokio::test]
async fn write_file_to_home_directory() {
    let container = shared_container().await;
    let client = container.client();
    let name = format!("machine-ssh-home-{}.sh", std::process::id());

    client
        .write_file(b"echo home\n", &format!("~/{}", name))
        .await
        .expect("write should succeed");

    let result = client
        .run_for_output(&format!("cat \"$HOME/{}\" && rm -f \"$HOME/{}\"", name, name))
        .await
        .unwrap();
    assert_eq!(result.output, b"echo home\n");
}

/// Test: authorize is idempotent and revoke removes the key again.
#[tokio::test]
async fn authorize_and_revoke_public_key() {
    let container = shared_container().await;
    let client = container.client();
    let key = fixture("extra_key.pub");
    let count = format!("grep -cxF '{}' ~/.ssh/authorized_keys || true", key.trim());

    client.authorize_public_key(&key).await.unwrap();
    client.authorize_public_key(&key).await.unwrap();
    let present = client.run_for_output(&count).await.unwrap();
    assert_eq!(String::from_utf8(present.output).unwrap().trim(), "1");

    client.revoke_public_key(&key).await.unwrap();
    let absent = client.run_for_output(&count).await.unwrap();
    assert_eq!(String::from_utf8(absent.output).unwrap().trim(), "0");

    // The fixture key used by every other test must survive the revoke.
    client.run("true").await.expect("fixture key still authorized");
}

/// Test: malformed public keys never reach the remote shell.
#[tokio::test]
async fn malformed_public_key_is_rejected() {
    let container = shared_container().await;

    let err = container
        .client()
        .authorize_public_key("ssh-ed25519 not-base64; touch /tmp/pwned")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidPublicKey(_)), "got: {:?}", err);
}
