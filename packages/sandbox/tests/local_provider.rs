// ABOUTME: Integration tests for the host-directory sandbox provider
// ABOUTME: Covers commands, timeouts, files, PTY sessions, secrets, checkpoints, and clones end to end

use agentbox_sandbox::{
    ExecOptions, LocalConfig, LocalProvider, PtyEvent, PtySize, SandboxError, SandboxProvider,
};
use std::time::{Duration, Instant};

fn setup() -> (tempfile::TempDir, LocalProvider) {
    // Listings hide dot-directories, so the root must not live under one
    let root = tempfile::Builder::new()
        .prefix("agentbox-test")
        .tempdir()
        .expect("Failed to create temp root");
    let mut config = LocalConfig::new(root.path());
    config.max_checkpoints = 3;
    (root, LocalProvider::new(config))
}

#[tokio::test]
async fn test_lifecycle_and_execute() {
    let (_root, provider) = setup();
    let id = provider.create().await.unwrap();

    assert!(provider.connect(&id).await.unwrap());
    assert!(provider.is_running(&id).await.unwrap());

    let result = provider
        .execute(&id, "echo hello && echo oops >&2 && exit 3", ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(result.stdout.trim(), "hello");
    assert_eq!(result.stderr.trim(), "oops");
    assert_eq!(result.exit_code, 3);

    let home = provider
        .execute(&id, "pwd && echo $HOME", ExecOptions::default())
        .await
        .unwrap();
    let lines: Vec<&str> = home.stdout.lines().collect();
    assert_eq!(lines[0], lines[1]);

    provider.delete(&id).await.unwrap();
    assert!(!provider.connect(&id).await.unwrap());
    // Idempotent
    provider.delete(&id).await.unwrap();
}

#[tokio::test]
async fn test_unknown_sandbox_is_not_found() {
    let (_root, provider) = setup();
    let err = provider
        .execute("missing", "true", ExecOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(!provider.connect("missing").await.unwrap());
}

#[tokio::test]
async fn test_execute_timeout_kills_process_group() {
    let (_root, provider) = setup();
    let id = provider.create().await.unwrap();

    let started = Instant::now();
    let err = provider
        .execute(
            &id,
            "sleep 30 & sleep 30; echo never",
            ExecOptions::with_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::Timeout { seconds: 1 }));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_background_execute_returns_immediately() {
    let (_root, provider) = setup();
    let id = provider.create().await.unwrap();

    let started = Instant::now();
    let result = provider
        .execute(&id, "sleep 2; touch done.txt", ExecOptions::background())
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0);
    assert!(result.stdout.is_empty());
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_files_round_trip_and_listing() {
    let (_root, provider) = setup();
    let id = provider.create().await.unwrap();

    provider
        .write_file(&id, "src/main.rs", b"fn main() {}")
        .await
        .unwrap();
    provider
        .write_file(&id, "/home/user/img/logo.png", &[0x89, 0x50, 0x4e, 0x47])
        .await
        .unwrap();

    let text = provider.read_file(&id, "src/main.rs").await.unwrap();
    assert!(!text.is_binary);
    assert_eq!(text.content, "fn main() {}");

    let image = provider.read_file(&id, "img/logo.png").await.unwrap();
    assert!(image.is_binary);
    assert_eq!(image.content, "iVBORw==");

    // Paths cannot climb out of the sandbox
    provider
        .write_file(&id, "../../escape.txt", b"contained")
        .await
        .unwrap();
    let contained = provider.read_file(&id, "escape.txt").await.unwrap();
    assert_eq!(contained.content, "contained");

    let err = provider.read_file(&id, "nope.txt").await.unwrap_err();
    assert!(err.is_not_found());

    let listing = provider.list_files(&id, None).await.unwrap();
    let paths: Vec<&str> = listing.iter().map(|f| f.path.as_str()).collect();
    assert!(paths.contains(&"src/main.rs"));
    assert!(paths.contains(&"src"));
}

#[tokio::test]
async fn test_secrets_in_bashrc() {
    let (_root, provider) = setup();
    let id = provider.create().await.unwrap();
    provider
        .write_file(&id, ".bashrc", b"export PATH=/usr/bin\n")
        .await
        .unwrap();

    provider.add_secret(&id, "API_TOKEN", "s3cr3t value").await.unwrap();
    provider.add_secret(&id, "OTHER", "x").await.unwrap();

    let secrets = provider.get_secrets(&id).await.unwrap();
    let keys: Vec<&str> = secrets.iter().map(|s| s.key.as_str()).collect();
    assert_eq!(keys, vec!["API_TOKEN", "OTHER"]);
    assert_eq!(secrets[0].value, "s3cr3t value");

    provider.delete_secret(&id, "API_TOKEN").await.unwrap();
    let secrets = provider.get_secrets(&id).await.unwrap();
    assert_eq!(secrets.len(), 1);
    assert_eq!(secrets[0].key, "OTHER");
}

#[tokio::test]
async fn test_pty_echo_and_kill() {
    let (_root, provider) = setup();
    let id = provider.create().await.unwrap();

    let mut handle = provider.create_pty(&id, PtySize::default()).await.unwrap();
    let pty_id = handle.session.id.clone();
    assert!(handle.session.pid.is_some());

    provider
        .send_pty_input(&id, &pty_id, b"echo pty-$((40+2))\n")
        .await
        .unwrap();
    provider
        .resize_pty(&id, &pty_id, PtySize { rows: 40, cols: 120 })
        .await
        .unwrap();

    let mut seen = String::new();
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = handle.output.recv().await {
            if let PtyEvent::Output(bytes) = event {
                seen.push_str(&String::from_utf8_lossy(&bytes));
                if seen.contains("pty-42") {
                    return true;
                }
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(found, "PTY output was: {:?}", seen);

    provider.kill_pty(&id, &pty_id).await.unwrap();
    let err = provider
        .send_pty_input(&id, &pty_id, b"ls\n")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    // Killing twice is a no-op
    provider.kill_pty(&id, &pty_id).await.unwrap();
}

#[tokio::test]
async fn test_checkpoint_restore_round_trip() {
    let (_root, provider) = setup();
    let id = provider.create().await.unwrap();

    provider.write_file(&id, "keep.txt", b"v1").await.unwrap();
    provider.create_checkpoint(&id, "cp-1").await.unwrap();

    provider.write_file(&id, "keep.txt", b"v2").await.unwrap();
    provider.write_file(&id, "added.txt", b"new").await.unwrap();
    provider.write_file(&id, "server.log", b"volatile").await.unwrap();
    provider.create_checkpoint(&id, "cp-2").await.unwrap();

    provider.write_file(&id, "keep.txt", b"v3").await.unwrap();
    provider.restore_checkpoint(&id, "cp-1").await.unwrap();

    assert_eq!(provider.read_file(&id, "keep.txt").await.unwrap().content, "v1");
    assert!(provider.read_file(&id, "added.txt").await.unwrap_err().is_not_found());
    // Excluded paths survive restores
    assert_eq!(
        provider.read_file(&id, "server.log").await.unwrap().content,
        "volatile"
    );

    let listed: Vec<String> = provider
        .list_checkpoints(&id)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(listed, vec!["cp-2", "cp-1"]);

    let err = provider.restore_checkpoint(&id, "cp-404").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_checkpoint_retention_keeps_newest() {
    let (_root, provider) = setup();
    let id = provider.create().await.unwrap();

    for n in 0..8 {
        provider
            .write_file(&id, "counter.txt", n.to_string().as_bytes())
            .await
            .unwrap();
        provider
            .create_checkpoint(&id, &format!("cp-{}", n))
            .await
            .unwrap();
    }

    let listed: Vec<String> = provider
        .list_checkpoints(&id)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(listed, vec!["cp-7", "cp-6", "cp-5"]);
    assert!(provider
        .restore_checkpoint(&id, "cp-0")
        .await
        .unwrap_err()
        .is_not_found());

    provider.restore_checkpoint(&id, "cp-5").await.unwrap();
    assert_eq!(provider.read_file(&id, "counter.txt").await.unwrap().content, "5");
}

#[tokio::test]
async fn test_clone_with_checkpoint() {
    let (root, provider) = setup();
    let source = provider.create().await.unwrap();
    provider.write_file(&source, "state.txt", b"old").await.unwrap();
    provider.create_checkpoint(&source, "base").await.unwrap();
    provider.write_file(&source, "state.txt", b"new").await.unwrap();

    let plain = provider.clone_sandbox(&source, None).await.unwrap();
    assert_eq!(provider.read_file(&plain, "state.txt").await.unwrap().content, "new");

    let restored = provider.clone_sandbox(&source, Some("base")).await.unwrap();
    assert_ne!(restored, source);
    assert_eq!(provider.read_file(&restored, "state.txt").await.unwrap().content, "old");
    // Source untouched
    assert_eq!(provider.read_file(&source, "state.txt").await.unwrap().content, "new");

    let err = provider.clone_sandbox(&source, Some("missing")).await.unwrap_err();
    assert!(err.is_not_found());

    // The failed clone leaves nothing behind
    let mut entries: Vec<String> = std::fs::read_dir(root.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    entries.sort();
    let mut expected = vec![source, plain, restored];
    expected.sort();
    assert_eq!(entries, expected);
}

#[tokio::test]
async fn test_invalid_ids_are_rejected() {
    let (_root, provider) = setup();
    let id = provider.create().await.unwrap();
    assert!(provider.create_checkpoint(&id, "../etc").await.is_err());
    assert!(provider.connect("../outside").await.is_err());
}

#[tokio::test]
async fn test_ide_and_vnc_are_unsupported_locally() {
    let (_root, provider) = setup();
    let id = provider.create().await.unwrap();

    for result in [provider.get_ide_url(&id).await, provider.get_vnc_url(&id).await] {
        assert!(matches!(
            result,
            Err(SandboxError::NotSupported { provider: "local", .. })
        ));
    }
    // Unknown sandboxes are still reported as missing
    assert!(provider.get_ide_url("missing").await.unwrap_err().is_not_found());
}
