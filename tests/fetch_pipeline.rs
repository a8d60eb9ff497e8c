//! End-to-end pipeline tests against a mock API
//!
//! These exercise the public facade the way an embedding application would:
//! build a config, construct a [`RegistryDownloader`], run a batch, and
//! inspect what landed on disk.

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#![allow(clippy::unwrap_used, clippy::expect_used)]

use registry_dl::{BatchReport, Config, RecordId, RegistryDownloader};
use std::path::Path;
use std::time::Duration;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(server_url: &str, output_root: &Path) -> Config {
    let mut config = Config::default();
    config.api.detail_url = format!("{server_url}/records");
    config.api.listing_url = format!("{server_url}/listing");
    config.api.per_page = 2;
    config.fetch.workers = 4;
    config.fetch.max_attempts = 2;
    config.fetch.initial_delay = Duration::from_millis(5);
    config.fetch.rate_limit_pause = Duration::from_millis(5);
    config.fetch.slice_pause = Duration::from_millis(5);
    config.proxy.limiter.initial_rate = 100.0;
    config.proxy.limiter.max_rate = 100.0;
    config.output.output_root = output_root.to_path_buf();
    config
}

fn record_body(id: u64) -> serde_json::Value {
    serde_json::json!({
        "certdecltr_id": id,
        "DocId": format!("BY/112 03.02 TP034 {id}"),
        "Status": 1
    })
}

/// The single batch directory created under `root`
fn batch_dir(root: &Path) -> std::path::PathBuf {
    let mut dirs: Vec<_> = std::fs::read_dir(root)
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with("batch_"))
        .map(|e| e.path())
        .collect();
    dirs.sort();
    dirs.pop().unwrap()
}

#[tokio::test]
async fn batch_run_persists_records_and_report() {
    let server = MockServer::start().await;
    for id in 1..=5u64 {
        Mock::given(method("GET"))
            .and(path(format!("/records/{id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(record_body(id)))
            .mount(&server)
            .await;
    }

    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(&server.uri(), tmp.path());
    let downloader = RegistryDownloader::new(config).unwrap();

    let report = downloader.fetch_range(1, 5).await.unwrap();
    assert_eq!(report.total_ids, 5);
    assert_eq!(report.success, 5);
    assert_eq!(report.errors, 0);
    assert!(report.time_elapsed >= 0.0);

    let dir = batch_dir(tmp.path());
    for id in 1..=5u64 {
        let payload: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.join(format!("{id}.json"))).unwrap())
                .unwrap();
        assert_eq!(payload["certdecltr_id"], id);
    }

    let on_disk: BatchReport =
        serde_json::from_slice(&std::fs::read(dir.join("download_report.json")).unwrap()).unwrap();
    assert_eq!(on_disk.success, 5);
    assert_eq!(on_disk.results.len(), 5);
}

#[tokio::test]
async fn mixed_outcomes_are_reported_per_record() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/records/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(record_body(1)))
        .mount(&server)
        .await;
    // missing record: terminal on the first attempt
    Mock::given(method("GET"))
        .and(path("/records/2"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    // persistent maintenance page: retried, then terminal
    Mock::given(method("GET"))
        .and(path("/records/3"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>down</html>"))
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(&server.uri(), tmp.path());
    let downloader = RegistryDownloader::new(config).unwrap();

    let report = downloader
        .fetch_ids(vec![RecordId(1), RecordId(2), RecordId(3)])
        .await
        .unwrap();
    assert_eq!(report.completed, 3);
    assert_eq!(report.success, 1);
    assert_eq!(report.errors, 2);

    let dir = batch_dir(tmp.path());
    assert!(dir.join("1.json").exists());
    assert!(!dir.join("2.json").exists());
    assert!(!dir.join("3.json").exists());
    // the maintenance page body was kept for inspection
    let diags = std::fs::read_dir(dir.join("diagnostics")).unwrap().count();
    assert!(diags > 0);
}

#[tokio::test]
async fn second_run_with_resume_skips_persisted_records() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/records/\d+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(record_body(0)))
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let mut config = test_config(&server.uri(), tmp.path());
    config.output.resume = true;

    let downloader = RegistryDownloader::new(config.clone()).unwrap();
    let first = downloader.fetch_range(1, 4).await.unwrap();
    assert_eq!(first.total_ids, 4);

    // same range again plus one new id: only the new one is fetched
    let downloader = RegistryDownloader::new(config).unwrap();
    let second = downloader.fetch_range(1, 5).await.unwrap();
    assert_eq!(second.total_ids, 1);
    assert_eq!(second.success, 1);
}

#[tokio::test]
async fn listing_discovery_feeds_the_batch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/listing"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [
                {"certdecltr_id": 11},
                {"certdecltr_id": 12}
            ],
            "_meta": {"totalCount": 2, "pageCount": 1}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/records/1[12]$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(record_body(11)))
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(&server.uri(), tmp.path());
    let downloader = RegistryDownloader::new(config).unwrap();

    let report = downloader.fetch_from_listing().await.unwrap();
    assert_eq!(report.total_ids, 2);
    assert_eq!(report.success, 2);
}

#[tokio::test]
async fn rate_limited_api_still_completes_with_retries() {
    let server = MockServer::start().await;
    // every record 429s once, then succeeds
    for id in 1..=3u64 {
        Mock::given(method("GET"))
            .and(path(format!("/records/{id}")))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/records/{id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(record_body(id)))
            .mount(&server)
            .await;
    }

    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(&server.uri(), tmp.path());
    let downloader = RegistryDownloader::new(config).unwrap();

    let report = downloader.fetch_range(1, 3).await.unwrap();
    assert_eq!(report.success, 3);
}

#[tokio::test]
async fn shutdown_before_run_drains_to_an_empty_report() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(record_body(1)))
        .expect(0)
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(&server.uri(), tmp.path());
    let downloader = RegistryDownloader::new(config).unwrap();

    downloader.shutdown();
    let report = downloader.fetch_range(1, 10).await.unwrap();
    assert_eq!(report.completed, 0);
    assert_eq!(report.total_ids, 10);

    // the report still exists on disk for the interrupted run
    let dir = batch_dir(tmp.path());
    assert!(dir.join("download_report.json").exists());
}
