use wasm_bootstrap::{ChunkPayload, ErrorCategory, LoadError, LoadState};

mod common;

const CHUNK_TWO_URL: &str = "http://test/2.bootstrap.js";

#[tokio::test]
async fn test_concurrent_ensure_fetches_once() {
    let fetcher = common::MockFetcher::new();
    common::serve_chunk_one(&fetcher);
    let loader = common::loader(&fetcher);

    let (first, second) = tokio::join!(loader.ensure("1"), loader.ensure("1"));
    assert_eq!(first, Ok(()));
    assert_eq!(second, Ok(()));
    assert_eq!(fetcher.fetch_count(common::SCRIPT_URL), 1);
    assert_eq!(fetcher.fetch_count(common::ADDER_URL), 1);
}

#[tokio::test]
async fn test_loaded_chunk_needs_no_network() {
    let fetcher = common::MockFetcher::new();
    common::serve_chunk_one(&fetcher);
    let loader = common::loader(&fetcher);

    loader.ensure("1").await.unwrap();
    assert_eq!(loader.chunk_state("1"), LoadState::Loaded);
    assert_eq!(loader.wasm_state(common::ADDER), LoadState::Loaded);

    loader.ensure("1").await.unwrap();
    loader.ensure(1u32).await.unwrap();
    assert_eq!(fetcher.fetch_count(common::SCRIPT_URL), 1);
    assert_eq!(fetcher.fetch_count(common::ADDER_URL), 1);

    let exports = loader.exports(common::ADDER).unwrap();
    assert_eq!(exports.call_i32("compute", &[20]).await.unwrap(), Some(41));
}

#[tokio::test]
async fn test_installed_chunk_is_loaded_from_start() {
    let fetcher = common::MockFetcher::new();
    let loader = common::loader(&fetcher);

    assert_eq!(loader.chunk_state("main"), LoadState::Loaded);
    assert_eq!(loader.chunk_state("2"), LoadState::NotRequested);
    loader.ensure("main").await.unwrap();
    assert_eq!(fetcher.fetch_count("http://test/main.bootstrap.js"), 0);
}

#[tokio::test]
async fn test_missing_script_reports_missing() {
    let fetcher = common::MockFetcher::new();
    let loader = common::loader(&fetcher);

    let error = loader.ensure("2").await.unwrap_err();
    common::assert_missing(&error, CHUNK_TWO_URL);
    assert_eq!(error.category(), Some(ErrorCategory::Missing));
    assert!(error.to_string().starts_with("Loading chunk 2 failed.\n(missing: "));
    assert_eq!(loader.chunk_state("2"), LoadState::NotRequested);
}

#[tokio::test]
async fn test_transport_failure_reports_error() {
    let fetcher = common::MockFetcher::new();
    fetcher.fail(CHUNK_TWO_URL, "connection reset");
    let loader = common::loader(&fetcher);

    let error = loader.ensure("2").await.unwrap_err();
    assert!(matches!(error, LoadError::Transport { .. }), "{error:?}");
    assert_eq!(error.category(), Some(ErrorCategory::Error));
    assert_eq!(error.request(), Some(CHUNK_TWO_URL));
}

#[tokio::test]
async fn test_waiters_observe_same_failure() {
    let fetcher = common::MockFetcher::new();
    fetcher.serve_status(CHUNK_TWO_URL, 500);
    let loader = common::loader(&fetcher);

    let (first, second) = tokio::join!(loader.ensure("2"), loader.ensure("2"));
    let first = first.unwrap_err();
    common::assert_missing(&first, CHUNK_TWO_URL);
    assert_eq!(Err(first), second);
    assert_eq!(fetcher.fetch_count(CHUNK_TWO_URL), 1);
}

#[tokio::test]
async fn test_retry_after_failure_refetches() {
    let fetcher = common::MockFetcher::new();
    let loader = common::loader(&fetcher);

    assert!(loader.ensure("2").await.is_err());
    fetcher.serve(CHUNK_TWO_URL, common::payload_json(&["2"], &[]));
    loader.ensure("2").await.unwrap();

    assert_eq!(fetcher.fetch_count(CHUNK_TWO_URL), 2);
    assert_eq!(loader.chunk_state("2"), LoadState::Loaded);
}

#[tokio::test]
async fn test_script_payload_without_chunk_is_missing() {
    let fetcher = common::MockFetcher::new();
    fetcher.serve(CHUNK_TWO_URL, common::payload_json(&["3"], &[common::GLUE]));
    let loader = common::loader(&fetcher);

    let error = loader.ensure("2").await.unwrap_err();
    common::assert_missing(&error, CHUNK_TWO_URL);
    assert_eq!(loader.chunk_state("2"), LoadState::NotRequested);
    // What the payload did register still counts.
    assert_eq!(loader.chunk_state("3"), LoadState::Loaded);
    assert!(loader.is_module_available(common::GLUE));
}

#[tokio::test]
async fn test_invalid_payload_is_missing() {
    let fetcher = common::MockFetcher::new();
    fetcher.serve(CHUNK_TWO_URL, "console.log('not a payload')");
    let loader = common::loader(&fetcher);

    let error = loader.ensure("2").await.unwrap_err();
    common::assert_missing(&error, CHUNK_TWO_URL);
}

#[tokio::test]
async fn test_preregistered_chunk_needs_no_fetch() {
    let fetcher = common::MockFetcher::new();
    let loader = common::builder(&fetcher, common::manifest())
        .with_preregistered(ChunkPayload::new(["2"], [common::GLUE]))
        .build()
        .unwrap();

    assert_eq!(loader.chunk_state("2"), LoadState::Loaded);
    loader.ensure("2").await.unwrap();
    assert_eq!(fetcher.fetch_count(CHUNK_TWO_URL), 0);
    assert!(loader.is_module_available(common::GLUE));
}

#[tokio::test]
async fn test_registration_resolves_pending_load() {
    let fetcher = common::MockFetcher::new();
    fetcher.hang(CHUNK_TWO_URL);
    let loader = common::loader(&fetcher);

    let pending = tokio::spawn({
        let loader = loader.clone();
        async move { loader.ensure("2").await }
    });
    while loader.chunk_state("2") != LoadState::Loading {
        tokio::task::yield_now().await;
    }

    loader.register_chunk(&ChunkPayload::new(["2"], [common::GLUE]));
    assert_eq!(pending.await.unwrap(), Ok(()));
    assert_eq!(loader.chunk_state("2"), LoadState::Loaded);
}

#[tokio::test]
async fn test_missing_wasm_fails_chunk_but_keeps_script() {
    let fetcher = common::MockFetcher::new();
    fetcher.serve(common::SCRIPT_URL, common::payload_json(&["1"], &[common::GLUE]));
    let loader = common::loader(&fetcher);

    let error = loader.ensure("1").await.unwrap_err();
    common::assert_missing(&error, common::ADDER_URL);
    assert_eq!(loader.chunk_state("1"), LoadState::Loaded);
    assert_eq!(loader.wasm_state(common::ADDER), LoadState::NotRequested);
    assert!(loader.exports(common::ADDER).is_none());
}
