mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use iptv_manager::{
    database::Database,
    models::{Channel, ChannelUpdateRequest, ReconcileOutcome},
};

async fn channels_by_name(database: &Database, source_id: i64) -> Vec<Channel> {
    let mut channels = database.list_channels_for_source(source_id).await.unwrap();
    channels.sort_by(|a, b| a.name.cmp(&b.name));
    channels
}

fn channel<'a>(channels: &'a [Channel], name: &str) -> &'a Channel {
    channels
        .iter()
        .find(|c| c.name == name)
        .unwrap_or_else(|| panic!("channel {} missing", name))
}

#[tokio::test]
async fn test_first_import_applies_default_policy() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let database = Database::in_memory().await.unwrap();
    let fetcher = Arc::new(StaticFetcher::new(SAMPLE_PLAYLIST));
    let engine = engine(&database, &config, fetcher.clone());
    let source = create_source(&database, source_request("provider", PROVIDER_URL)).await;

    let outcome = tokio_test::assert_ok!(engine.reconcile(source.id, true).await);
    assert_eq!(
        outcome,
        ReconcileOutcome::Completed {
            entries: 3,
            created: 3,
            updated: 0,
            fetched: true,
        }
    );

    let channels = channels_by_name(&database, source.id).await;
    assert_eq!(channels.len(), 3);
    assert!(channel(&channels, "Alpha News").enabled);
    assert!(channel(&channels, "Beta Sports").enabled);
    // .mp4 is a blocked suffix in the default admission settings
    assert!(!channel(&channels, "Gamma Movie").enabled);
    assert_eq!(
        channel(&channels, "Beta Sports").extra_tag_lines,
        "#EXTVLCOPT:http-user-agent=Custom/1.0"
    );

    let groups = database.list_groups().await.unwrap();
    assert_eq!(groups.len(), 3);
    assert!(groups.iter().all(|g| g.source_name == "provider"));

    let icons = database.list_icons().await.unwrap();
    assert_eq!(icons.len(), 1);
    assert_eq!(icons[0].url, "http://logos.test/alpha.png");

    let refreshed = database.get_upstream_source(source.id).await.unwrap().unwrap();
    assert!(refreshed.last_reconciled_at.is_some());
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let database = Database::in_memory().await.unwrap();
    let fetcher = Arc::new(StaticFetcher::new(SAMPLE_PLAYLIST));
    let engine = engine(&database, &config, fetcher.clone());
    let source = create_source(&database, source_request("provider", PROVIDER_URL)).await;

    engine.reconcile(source.id, true).await.unwrap();
    let first = channels_by_name(&database, source.id).await;

    let outcome = engine.reconcile(source.id, true).await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Completed {
            entries: 3,
            created: 0,
            updated: 3,
            fetched: true,
        }
    );

    let second = channels_by_name(&database, source.id).await;
    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.enabled, b.enabled);
        assert_eq!(a.first_seen_at, b.first_seen_at);
    }
    assert_eq!(database.list_groups().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_disappeared_channels_are_disabled_not_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let database = Database::in_memory().await.unwrap();
    let fetcher = Arc::new(StaticFetcher::new(SAMPLE_PLAYLIST));
    let engine = engine(&database, &config, fetcher.clone());
    let source = create_source(&database, source_request("provider", PROVIDER_URL)).await;

    engine.reconcile(source.id, true).await.unwrap();

    fetcher.set_body(
        "#EXTM3U
#EXTINF:-1 tvg-id=\"alpha\" tvg-logo=\"http://logos.test/alpha.png\" group-title=\"News\",Alpha News
http://up.test/live/alpha.ts
",
    );
    engine.reconcile(source.id, true).await.unwrap();

    let channels = channels_by_name(&database, source.id).await;
    assert_eq!(channels.len(), 3);
    assert!(channel(&channels, "Alpha News").enabled);
    assert!(!channel(&channels, "Beta Sports").enabled);

    // Reappearing brings the channel back under the default policy
    fetcher.set_body(SAMPLE_PLAYLIST);
    engine.reconcile(source.id, true).await.unwrap();
    let channels = channels_by_name(&database, source.id).await;
    assert!(channel(&channels, "Beta Sports").enabled);
}

#[tokio::test]
async fn test_protected_channels_keep_operator_choice() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let database = Database::in_memory().await.unwrap();
    let fetcher = Arc::new(StaticFetcher::new(SAMPLE_PLAYLIST));
    let engine = engine(&database, &config, fetcher.clone());
    let source = create_source(&database, source_request("provider", PROVIDER_URL)).await;

    engine.reconcile(source.id, true).await.unwrap();
    let channels = channels_by_name(&database, source.id).await;
    let alpha = channel(&channels, "Alpha News").id;
    let gamma = channel(&channels, "Gamma Movie").id;

    // Operator disables a channel the policy would enable, and enables one
    // the policy would block
    database
        .update_channel(
            alpha,
            &ChannelUpdateRequest {
                enabled: Some(false),
                protected: Some(true),
            },
        )
        .await
        .unwrap();
    database
        .update_channel(
            gamma,
            &ChannelUpdateRequest {
                enabled: Some(true),
                protected: Some(true),
            },
        )
        .await
        .unwrap();

    engine.reconcile(source.id, true).await.unwrap();
    let channels = channels_by_name(&database, source.id).await;
    assert!(!channel(&channels, "Alpha News").enabled);
    assert!(channel(&channels, "Gamma Movie").enabled);

    // A protected channel that vanishes upstream is left untouched too
    fetcher.set_body("#EXTM3U\n");
    engine.reconcile(source.id, true).await.unwrap();
    let channels = channels_by_name(&database, source.id).await;
    assert!(channel(&channels, "Gamma Movie").enabled);
    assert!(!channel(&channels, "Beta Sports").enabled);
}

#[tokio::test]
async fn test_excluded_groups_never_reach_the_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let database = Database::in_memory().await.unwrap();
    let fetcher = Arc::new(StaticFetcher::new(SAMPLE_PLAYLIST));
    let engine = engine(&database, &config, fetcher.clone());

    let mut request = source_request("provider", PROVIDER_URL);
    request.group_exclusions = "Sports\nMovies\n".to_string();
    let source = create_source(&database, request).await;

    engine.reconcile(source.id, true).await.unwrap();

    let channels = channels_by_name(&database, source.id).await;
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].name, "Alpha News");

    let filtered = engine.store().read_filtered(source.id).await.unwrap();
    assert!(filtered.contains("Alpha News"));
    assert!(!filtered.contains("Beta Sports"));
    let raw = engine.store().read_raw(source.id).await.unwrap();
    assert!(raw.contains("Beta Sports"));
}

#[tokio::test]
async fn test_fresh_stored_copy_is_reused_unless_forced() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let database = Database::in_memory().await.unwrap();
    let fetcher = Arc::new(StaticFetcher::new(SAMPLE_PLAYLIST));
    let engine = engine(&database, &config, fetcher.clone());
    let source = create_source(&database, source_request("provider", PROVIDER_URL)).await;

    engine.reconcile(source.id, false).await.unwrap();
    assert_eq!(fetcher.calls(), 1);

    let outcome = engine.reconcile(source.id, false).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Completed { fetched: false, .. }));
    assert_eq!(fetcher.calls(), 1);

    engine.reconcile(source.id, true).await.unwrap();
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn test_concurrent_triggers_are_coalesced() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let database = Database::in_memory().await.unwrap();
    let fetcher = Arc::new(StaticFetcher::with_delay(
        SAMPLE_PLAYLIST,
        Duration::from_millis(300),
    ));
    let engine = engine(&database, &config, fetcher.clone());
    let source = create_source(&database, source_request("provider", PROVIDER_URL)).await;

    let (a, b) = tokio::join!(
        engine.reconcile(source.id, true),
        engine.reconcile(source.id, true)
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == ReconcileOutcome::AlreadyRunning)
            .count(),
        1
    );
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(channels_by_name(&database, source.id).await.len(), 3);

    // Once finished, the next trigger runs normally
    let outcome = engine.reconcile(source.id, true).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Completed { .. }));
}

#[tokio::test]
async fn test_local_source_and_failure_progress() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let database = Database::in_memory().await.unwrap();
    let fetcher = Arc::new(StaticFetcher::new(""));
    let engine = engine(&database, &config, fetcher.clone());

    let path = dir.path().join("local.m3u");
    std::fs::write(&path, SAMPLE_PLAYLIST).unwrap();
    let mut request = source_request("local", path.to_str().unwrap());
    request.is_local = true;
    let source = create_source(&database, request).await;

    engine.reconcile(source.id, false).await.unwrap();
    assert_eq!(fetcher.calls(), 0);
    assert_eq!(channels_by_name(&database, source.id).await.len(), 3);

    std::fs::remove_file(&path).unwrap();
    assert!(engine.reconcile(source.id, false).await.is_err());

    let progress = engine.state_manager().get_progress(source.id).await.unwrap();
    assert!(progress.error.is_some());
    // Catalog from the previous successful run is untouched
    assert_eq!(channels_by_name(&database, source.id).await.len(), 3);
}
