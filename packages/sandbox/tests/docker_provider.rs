// ABOUTME: Integration tests for the Docker sandbox provider and exec-stream transport
// ABOUTME: Skipped unless Docker answers and AGENTBOX_TEST_DOCKER_IMAGE names a sandbox image

use agentbox_sandbox::{
    AgentOptions, DockerConfig, DockerProvider, ExecOptions, SandboxError, SandboxProvider,
};
use agentbox_sandbox::transport::docker::DockerExecChannel;
use futures::StreamExt;
use std::time::Duration;

const TEST_IMAGE_VAR: &str = "AGENTBOX_TEST_DOCKER_IMAGE";

/// Provider against a real daemon, or `None` when the environment cannot run these tests
async fn docker_provider() -> Option<DockerProvider> {
    let Ok(image) = std::env::var(TEST_IMAGE_VAR) else {
        println!("Note: {} is not set, skipping", TEST_IMAGE_VAR);
        return None;
    };
    let config = DockerConfig {
        image,
        network: "bridge".to_string(),
        ..Default::default()
    };
    let provider = match DockerProvider::new(config) {
        Ok(provider) => provider,
        Err(e) => {
            println!("Note: Docker is not available ({}), skipping", e);
            return None;
        }
    };
    if !provider.is_available().await {
        println!("Note: Docker is not available, skipping");
        return None;
    }
    Some(provider)
}

#[tokio::test]
async fn test_missing_docker_socket_is_a_provisioning_error() {
    let config = DockerConfig {
        host: Some("unix:///nonexistent/docker.sock".to_string()),
        ..Default::default()
    };
    match DockerProvider::new(config) {
        Err(err) => assert!(
            matches!(err, SandboxError::Provisioning(_)),
            "unexpected error: {}",
            err
        ),
        // Clients that defer the socket check report the daemon as unreachable instead
        Ok(provider) => assert!(!provider.is_available().await),
    }
}

#[test]
fn test_docker_exec_channel_is_send_and_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<DockerExecChannel>();
}

#[test]
fn test_unsupported_docker_host_rejected() {
    let config = DockerConfig {
        host: Some("ssh://builder".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        DockerProvider::new(config),
        Err(SandboxError::InvalidConfiguration(_))
    ));
}

#[tokio::test]
async fn test_docker_sandbox_round_trip() {
    let Some(provider) = docker_provider().await else {
        return;
    };

    let id = provider.create().await.expect("Failed to create sandbox");
    assert!(provider.is_running(&id).await.unwrap());

    let result = provider
        .execute(&id, "echo hi; echo err >&2; exit 4", ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(result.stdout.trim(), "hi");
    assert_eq!(result.stderr.trim(), "err");
    assert_eq!(result.exit_code, 4);

    // A command exiting 124 on its own is not a timeout
    let result = provider
        .execute(&id, "exit 124", ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(result.exit_code, 124);

    let err = provider
        .execute(&id, "sleep 30", ExecOptions::with_timeout(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    provider
        .write_file(&id, "nested/dir/hello.txt", b"hello docker")
        .await
        .unwrap();
    let file = provider.read_file(&id, "nested/dir/hello.txt").await.unwrap();
    assert_eq!(file.content, "hello docker");
    assert!(provider
        .read_file(&id, "missing.txt")
        .await
        .unwrap_err()
        .is_not_found());

    provider.delete(&id).await.unwrap();
    assert!(!provider.connect(&id).await.unwrap());
}

#[tokio::test]
async fn test_docker_transport_streams_until_result() {
    let Some(provider) = docker_provider().await else {
        return;
    };
    let id = provider.create().await.expect("Failed to create sandbox");

    let script = "#!/bin/bash\n\
        echo '{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"s-9\"}'\n\
        while IFS= read -r line; do\n\
          printf '{\"type\":\"assistant\",\"echo\":%s}\\n' \"$line\"\n\
        done\n\
        echo '{\"type\":\"result\"}'\n";
    provider.write_file(&id, "fake-cli", script.as_bytes()).await.unwrap();
    provider
        .execute(&id, "chmod 755 ~/fake-cli", ExecOptions::default())
        .await
        .unwrap();

    let options = AgentOptions {
        cli_path: Some("/home/user/fake-cli".to_string()),
        ..Default::default()
    };
    let mut transport = provider.open_transport(&id, options).unwrap();
    transport.connect().await.unwrap();
    let mut messages = transport.read_messages();

    let init = messages.next().await.unwrap().unwrap();
    assert_eq!(init["session_id"], "s-9");

    transport.write("{\"n\":7}\n").await.unwrap();
    let echoed = messages.next().await.unwrap().unwrap();
    assert_eq!(echoed["echo"]["n"], 7);

    transport.end_input().await.unwrap();
    let result = messages.next().await.unwrap().unwrap();
    assert_eq!(result["type"], "result");
    assert!(messages.next().await.is_none());

    transport.close().await.unwrap();
    provider.delete(&id).await.unwrap();
}
