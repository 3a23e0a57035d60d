/// Service facade tests: input validation, error categories, file-backed restarts
///
/// Run with: cargo test --test service_tests
mod common;

use common::*;
use kvstore::{
    ConnectionTarget, ErrorCategory, InvalidInput, KvError, KvService, ProvisionError,
    RawListParams, ServiceConfig, WriteKind,
};
use serde_json::json;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

const KEY: &str = "550e8400-e29b-41d4-a716-446655440000";

#[tokio::test]
async fn test_put_get_round_trip_through_facade() {
    let (service, _) = service().await;

    let receipt = assert_ok!(service.put(KEY, r#"{"name": "first", "tags": [1, 2]}"#).await);
    let record = service.get(KEY).await.unwrap().unwrap();

    assert_eq!(receipt.kind, WriteKind::Inserted);
    assert_eq!(record.key.as_str(), KEY);
    assert_eq!(record.value, json!({"name": "first", "tags": [1, 2]}));
}

#[tokio::test]
async fn test_uppercase_key_is_canonicalized() {
    let (service, _) = service().await;

    service.put(&KEY.to_uppercase(), "1").await.unwrap();
    let record = service.get(KEY).await.unwrap().unwrap();

    assert_eq!(record.key.as_str(), KEY);
}

#[tokio::test]
async fn test_malformed_key_is_a_client_error() {
    let (service, faulty) = service().await;

    for bad in ["", "not-a-uuid", "550e8400e29b41d4a716446655440000", "550e8400-e29b-41d4-a716-44665544000z"] {
        let err = assert_err!(service.put(bad, "{}").await);
        assert!(matches!(err, KvError::InvalidInput(InvalidInput::MalformedKey(_))));
        assert_eq!(err.category(), ErrorCategory::Client);
    }
    assert_eq!(faulty.calls(BEGIN), 0);
}

#[tokio::test]
async fn test_malformed_json_is_a_client_error() {
    let (service, faulty) = service().await;

    let err = assert_err!(service.put(KEY, "{not json").await);

    assert!(matches!(err, KvError::InvalidInput(InvalidInput::MalformedJson(_))));
    assert_eq!(err.category(), ErrorCategory::Client);
    assert_eq!(faulty.calls(BEGIN), 0);
}

#[tokio::test]
async fn test_list_page_serializes_with_data_field() {
    let (service, _) = service().await;
    service.put(KEY, r#"{"a": 1}"#).await.unwrap();

    let page = service.list(&RawListParams::default()).await.unwrap();
    let body = serde_json::to_value(&page).unwrap();

    assert_eq!(body["total_count"], 1);
    assert_eq!(body["data"][0]["key"], KEY);
    assert_eq!(body["data"][0]["value"], json!({"a": 1}));
    assert!(body["data"][0]["created_at"].is_string());
}

#[tokio::test]
async fn test_start_provisions_in_memory() {
    let service = KvService::start(ServiceConfig::new("kv-instance", "kvdb"))
        .await
        .unwrap();

    assert_eq!(service.provision_report().created_count(), 3);
    assert!(service.health().await.is_healthy());
}

#[tokio::test]
async fn test_invalid_config_fails_start() {
    let config = ServiceConfig::new("kv-instance", "kvdb").table_name("bad table");

    let err = KvService::start(config).await.err().unwrap();

    assert!(matches!(err, ProvisionError::InvalidTarget(_)));
}

#[tokio::test]
async fn test_file_backed_store_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = ServiceConfig::new("kv-instance", "kvdb")
        .connection_target(ConnectionTarget::File(dir.path().join("kv.snapshot")));

    let written = {
        let service = KvService::start(config.clone()).await.unwrap();
        assert_eq!(service.provision_report().created_count(), 3);
        service.put(KEY, r#"{"persisted": true}"#).await.unwrap()
    };

    let reopened = KvService::start(config).await.unwrap();
    let record = reopened.get(KEY).await.unwrap().unwrap();

    assert!(reopened.provision_report().all_existed());
    assert_eq!(record.value, json!({"persisted": true}));
    assert_eq!(record.created_at, written.commit_timestamp);

    // Commit timestamps keep increasing across the restart.
    let later = reopened.put(KEY, "2").await.unwrap();
    assert_eq!(later.kind, WriteKind::Updated);
    assert!(later.commit_timestamp > written.commit_timestamp);
}

#[test]
fn test_config_from_lookup_feeds_start() {
    let config = ServiceConfig::from_lookup(|name| match name {
        "KV_CONTAINER" => Some("kv-instance".to_string()),
        "KV_DATABASE" => Some("kvdb".to_string()),
        "KV_CONNECTION" => Some("memory://".to_string()),
        _ => None,
    })
    .unwrap();

    let service = tokio_test::block_on(KvService::start(config)).unwrap();

    assert_eq!(service.provision_report().created_count(), 3);
}
