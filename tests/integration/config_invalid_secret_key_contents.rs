use std::time::Duration;

use clap::Parser;
use lighthouse::{ApplicationConfig, entrypoint};
use tokio::{fs, time::timeout};

use crate::common::random_name;

/// This test ensures that an unreadable host key is a startup error instead of being
/// silently replaced.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn config_invalid_secret_key_contents() {
    // 1. Create random temporary directory with a bad host key
    let temp_dir = std::env::temp_dir().join(format!("lighthouse_test_{}", random_name()));
    fs::create_dir(temp_dir.as_path())
        .await
        .expect("Unable to create tempdir");
    let temp_dir_path = |path: &str| temp_dir.join(path).to_string_lossy().to_string();
    fs::write(temp_dir_path("bad_ssh_key"), "bad data")
        .await
        .expect("Failed to write bad SSH key.");

    // 2. Fail to initialize Lighthouse
    let config = ApplicationConfig::parse_from([
        "lighthouse",
        "--identities-directory",
        &temp_dir_path("identities"),
        "--access-policy-file",
        &temp_dir_path("access.json"),
        "--private-key-file",
        &temp_dir_path("bad_ssh_key"),
        "--listen-address=127.0.0.1",
        "--ssh-port=28122",
    ]);
    if timeout(Duration::from_secs(5), async {
        assert!(entrypoint(config).await.is_err());
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for Lighthouse to fail.")
    };
    let _ = fs::remove_dir_all(temp_dir).await;
}
