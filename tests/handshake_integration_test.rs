//! Plugins that fail to start must not take the others down.

mod common;

use common::*;
use oasis::commands;

#[tokio::test]
async fn test_failed_launches_do_not_block_the_batch() {
    let state = state_with_entries(vec![
        entry("hello", HELLO),
        faulty("bad-version", "bad-version"),
        faulty("bad-cookie", "bad-cookie"),
        faulty("garbage", "garbage"),
        faulty("exit", "exit"),
        faulty("invalid-route", "invalid-route"),
        entry("missing", "/nonexistent/oasis-plugin"),
    ]);

    let report = state.reload.reload().await.expect("reload failed");
    assert_eq!(report.started, vec!["hello".to_string()]);
    let mut failed: Vec<_> = report.failed.iter().map(|(name, _)| name.as_str()).collect();
    failed.sort();
    assert_eq!(
        failed,
        vec!["bad-cookie", "bad-version", "exit", "garbage", "invalid-route", "missing"]
    );

    assert_eq!(get(&state, "/hello").await.status, 200);
    assert_eq!(state.launcher.active().len(), 1);
    assert_eq!(state.launcher.failures().len(), 6);

    // The front reload endpoint reports a partial failure, but still publishes.
    let reply = send(&state, "POST", "/reload_plugins", "").await;
    assert_eq!(reply.status, 500);
    assert!(reply.body.starts_with("Failed to reload plugins"));
    assert_eq!(state.current_registry().generation(), 2);
    assert_eq!(get(&state, "/hello").await.status, 200);

    state.shutdown().await;
}

#[tokio::test]
async fn test_silent_plugin_times_out() {
    let state = state_with_entries(vec![faulty("silent", "silent"), entry("hello", HELLO)]);

    let started = std::time::Instant::now();
    let report = state.reload.reload().await.expect("reload failed");
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "silent");
    assert!(report.failed[0].1.contains("no handshake line"), "{}", report.failed[0].1);
    // Launches run concurrently, so the batch waits for one timeout at most.
    assert!(started.elapsed() < std::time::Duration::from_secs(10));

    assert_eq!(get(&state, "/hello").await.status, 200);
    state.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_address_fails_within_handshake_timeout() {
    let state = state_with_entries(vec![faulty("unreachable", "unreachable"), entry("hello", HELLO)]);

    let started = std::time::Instant::now();
    let report = state.reload.reload().await.expect("reload failed");
    assert_eq!(report.started, vec!["hello".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "unreachable");
    let reason = &report.failed[0].1;
    // Hosts without a route to the address refuse at once instead of stalling.
    assert!(
        reason.contains("timed out") || reason.contains("Connection failed"),
        "{reason}"
    );
    assert!(started.elapsed() < std::time::Duration::from_secs(10));
    assert!(state.launcher.get("unreachable").is_none());

    assert_eq!(get(&state, "/hello").await.status, 200);
    state.shutdown().await;
}

#[tokio::test]
async fn test_check_command_launches_each_plugin() {
    let mut config = test_config();
    config.plugins.entries = vec![entry("hello", HELLO)];
    assert!(commands::run_config_check(config.clone(), true).await.is_ok());

    config.plugins.entries.push(faulty("bad-version", "bad-version"));
    assert!(commands::run_config_check(config.clone(), false).await.is_ok());
    assert!(commands::run_config_check(config, true).await.is_err());
}
