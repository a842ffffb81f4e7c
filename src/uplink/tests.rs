//! End-to-end uplink handling

use super::*;
use crate::config::ReplayPolicy;
use crate::queue::{CommandStatus, ConfigUpdate, FirmwareJob, MemoryCommandStore, RegisterWrite};
use crate::storage::{MemoryArtifactStore, MemoryReadingSink};
use crate::test_utils::{
    FailingSink, FrameBuilder, plain_request, sealed_request, sealed_request_with_nonce,
};
use serde_json::json;

fn readings() -> Vec<Vec<u16>> {
    vec![
        vec![2300, 2302, 2302, 2302, 2298],
        vec![52, 52, 53, 53, 53],
        vec![5000, 5000, 4999, 5000, 5000],
    ]
}

fn frame() -> Vec<u8> {
    FrameBuilder::new(ProtocolGeneration::Dynamic).columns(readings()).build()
}

fn service_with_sink(sink: Arc<dyn ReadingSink>) -> UplinkService {
    UplinkService::new(ProtocolGeneration::Dynamic, sink, Arc::new(MemoryCommandStore::new()))
}

fn service() -> (UplinkService, Arc<MemoryReadingSink>) {
    let sink = Arc::new(MemoryReadingSink::new());
    (service_with_sink(sink.clone()), sink)
}

fn interval(secs: u32) -> ConfigUpdate {
    ConfigUpdate { upload_interval: Some(secs), ..Default::default() }
}

#[tokio::test]
async fn plaintext_uplink_is_decoded_and_stored() {
    let (service, sink) = service();
    let response = service.handle(&plain_request(&frame())).await.unwrap();

    assert_eq!(response.status, "success");
    assert_eq!(response.values_processed, 15);
    assert_eq!(&response.values[..3], &[2300, 52, 5000]);
    assert_eq!(response.storage, StorageOutcome::Stored);

    let batches = sink.batches().await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].uplink_id, response.uplink_id);
    assert_eq!(batches[0].scaled[0]["vac1"], 230.0);

    let body = serde_json::to_value(&response).unwrap();
    assert_eq!(body["storage"], "stored");
    assert!(body.get("command").is_none());
    assert!(body.get("config_update").is_none());
    assert!(body.get("fota").is_none());
}

#[tokio::test]
async fn sealed_uplink_is_authenticated_and_decrypted() {
    let (service, _) = service();
    let response = service.handle(&sealed_request(&frame())).await.unwrap();
    assert_eq!(response.values_processed, 15);
}

#[tokio::test]
async fn envelope_failures_are_authentication_errors() {
    let (service, _) = service();

    let replayed = sealed_request_with_nonce(&frame(), 12346);
    let err = service.handle(&replayed).await.unwrap_err();
    assert!(matches!(err, UplinkError::AuthenticationFailure { .. }));
    assert_eq!(err.status_code(), 401);

    let sealed = sealed_request(&frame());
    let tampered = UplinkRequest::new(sealed.body().to_vec())
        .with_header(ENCRYPTION_HEADER, "aes-256-cbc")
        .with_header(NONCE_HEADER, "12345")
        .with_header(MAC_HEADER, "0".repeat(64));
    let err = service.handle(&tampered).await.unwrap_err();
    assert_eq!(err.to_string(), "Authentication failed: MAC verification failed");

    let unsigned = UplinkRequest::new(sealed.body().to_vec())
        .with_header(ENCRYPTION_HEADER, "aes-256-cbc")
        .with_header(NONCE_HEADER, "12345");
    assert!(matches!(
        service.handle(&unsigned).await,
        Err(UplinkError::AuthenticationFailure { .. })
    ));

    let no_nonce = UplinkRequest::new(sealed.body().to_vec()).with_header(ENCRYPTION_HEADER, "aes-256-cbc");
    assert!(matches!(
        service.handle(&no_nonce).await,
        Err(UplinkError::AuthenticationFailure { .. })
    ));
}

#[tokio::test]
async fn unknown_scheme_and_content_type_are_rejected() {
    let (service, _) = service();

    let request = UplinkRequest::new(frame()).with_header("encryption", "chacha20");
    assert!(matches!(
        service.handle(&request).await,
        Err(UplinkError::DecryptionFailure(CipherError::UnsupportedScheme { .. }))
    ));

    let request = UplinkRequest::new(frame()).with_header("content-type", "text/plain");
    let err = service.handle(&request).await.unwrap_err();
    assert_eq!(err.status_code(), 415);

    let request = UplinkRequest::new(frame())
        .with_header("Content-Type", "application/octet-stream; charset=binary");
    assert!(service.handle(&request).await.is_ok());
}

#[tokio::test]
async fn api_key_and_encryption_requirements() {
    let (service, _) = service();
    let service = service.with_api_key("ColdPlay2025").require_encryption(true);

    let err = service.handle(&sealed_request(&frame())).await.unwrap_err();
    assert_eq!(err.to_string(), "Authentication failed: missing Authorization header");

    let wrong_key = sealed_request(&frame()).with_header(AUTHORIZATION_HEADER, "ColdPlay2024");
    assert!(service.handle(&wrong_key).await.is_err());

    let plaintext = plain_request(&frame()).with_header(AUTHORIZATION_HEADER, "ColdPlay2025");
    assert!(matches!(
        service.handle(&plaintext).await,
        Err(UplinkError::AuthenticationFailure { .. })
    ));

    let good = sealed_request(&frame()).with_header(AUTHORIZATION_HEADER, "ColdPlay2025");
    assert!(service.handle(&good).await.is_ok());
}

#[tokio::test]
async fn rejected_frame_delivers_nothing() {
    let (service, sink) = service();
    let queued = service.configs().enqueue(interval(60)).await.unwrap();

    let corrupt = FrameBuilder::new(ProtocolGeneration::Dynamic).columns(readings()).corrupt_crc().build();
    let err = service.handle(&plain_request(&corrupt)).await.unwrap_err();
    assert!(matches!(err, UplinkError::IntegrityFailure { algorithm: "CRC-16/MODBUS" }));

    let aggregated =
        FrameBuilder::new(ProtocolGeneration::Dynamic).columns(readings()).metadata_flag(1).build();
    assert!(matches!(
        service.handle(&plain_request(&aggregated)).await,
        Err(UplinkError::HeaderValidationFailure { field: "metadata_flag", .. })
    ));

    assert!(sink.batches().await.is_empty());
    let item = service.configs().get(queued.id).await.unwrap().unwrap();
    assert_eq!(item.status, CommandStatus::Pending);
}

#[tokio::test]
async fn storage_failure_degrades_response() {
    let service = service_with_sink(Arc::new(FailingSink));
    service.writes().enqueue(RegisterWrite { value: 75 }).await.unwrap();

    let response = service.handle(&plain_request(&frame())).await.unwrap();
    assert_eq!(response.storage, StorageOutcome::ProcessingOnly);
    assert!(response.storage_info.unwrap().starts_with("Processing successful, storage skipped"));
    assert_eq!(response.command.unwrap().value, 75);
}

#[tokio::test]
async fn one_command_of_each_kind_per_uplink() {
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let image = artifacts.insert(vec![0x42; 2048]).await;
    let (service, _) = service();
    let service = service
        .with_artifacts(artifacts)
        .with_firmware_url("https://relay.invalid/api/fota/firmware");

    service.configs().enqueue(interval(60)).await.unwrap();
    service.configs().enqueue(interval(120)).await.unwrap();
    service.writes().enqueue(RegisterWrite { value: 40 }).await.unwrap();
    let job = service
        .firmware()
        .enqueue(FirmwareJob { firmware_sha256: image.sha256.clone(), firmware_size: image.size, filename: None })
        .await
        .unwrap();

    let first = service.handle(&plain_request(&frame())).await.unwrap();
    let body = serde_json::to_value(&first).unwrap();
    assert_eq!(body["config_update"], json!({"upload_interval": 60}));
    assert_eq!(body["command"], json!({"action": "write_register", "register": "export_power", "value": 40}));
    assert_eq!(
        body["fota"],
        json!({
            "job_id": job.id.to_string(),
            "fwUrl": "https://relay.invalid/api/fota/firmware",
            "fwSize": 2048,
            "shaExpected": image.sha256,
        })
    );

    // Everything is in flight now
    let second = service.handle(&plain_request(&frame())).await.unwrap();
    assert!(second.config_update.is_none());
    assert!(second.command.is_none());
    assert!(second.fota.is_none());
}

#[tokio::test]
async fn inline_config_ack_frees_the_slot_in_the_same_uplink() {
    let (service, _) = service();
    let first = service.configs().enqueue(interval(60)).await.unwrap();
    service.configs().enqueue(interval(120)).await.unwrap();

    service.handle(&plain_request(&frame())).await.unwrap();

    let ack = r#"{"config_ack":{"accepted":["upload_interval"],"rejected":[],"unchanged":[]}}"#;
    let response =
        service.handle(&plain_request(&frame()).with_header(CONFIG_ACK_HEADER, ack)).await.unwrap();
    assert_eq!(response.config_update, Some(interval(120)));
    assert_eq!(service.configs().get(first.id).await.unwrap().unwrap().status, CommandStatus::Success);

    // A garbage header is ignored
    let response = service
        .handle(&plain_request(&frame()).with_header(CONFIG_ACK_HEADER, "not json"))
        .await
        .unwrap();
    assert!(response.config_update.is_none());
}

#[tokio::test]
async fn lost_acknowledgment_times_out_under_default_config() {
    let store = Arc::new(MemoryCommandStore::new());
    let service = UplinkService::from_config(
        &IngestConfig::default(),
        Arc::new(MemoryReadingSink::new()),
        store.clone(),
    )
    .await
    .unwrap();
    let lost = service.configs().enqueue(interval(60)).await.unwrap();
    service.configs().enqueue(interval(120)).await.unwrap();

    let response = service.handle(&plain_request(&frame())).await.unwrap();
    assert_eq!(response.config_update, Some(interval(60)));
    let response = service.handle(&plain_request(&frame())).await.unwrap();
    assert!(response.config_update.is_none());

    store.backdate(CommandKind::Config, lost.id, chrono::Duration::seconds(901));
    let response = service.handle(&plain_request(&frame())).await.unwrap();
    assert_eq!(response.config_update, Some(interval(120)));

    let lost = service.configs().get(lost.id).await.unwrap().unwrap();
    assert_eq!(lost.status, CommandStatus::Failed);
    assert_eq!(lost.error_message.as_deref(), Some("no acknowledgment within 900s"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_uplinks_share_one_pending_config() {
    let (service, _) = service();
    let service = Arc::new(service);
    service.configs().enqueue(interval(60)).await.unwrap();
    service.configs().enqueue(interval(120)).await.unwrap();

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.handle(&plain_request(&frame())).await.unwrap() })
        })
        .collect();

    let mut updates = Vec::new();
    for handle in handles {
        if let Some(update) = handle.await.unwrap().config_update {
            updates.push(update);
        }
    }
    assert_eq!(updates, vec![interval(60)]);
}

#[tokio::test]
async fn missing_firmware_fails_without_delivery() {
    let (service, _) = service();
    let service = service.with_artifacts(Arc::new(MemoryArtifactStore::new()));
    let job = service
        .firmware()
        .enqueue(FirmwareJob { firmware_sha256: "ab".repeat(32), firmware_size: 4096, filename: None })
        .await
        .unwrap();

    let response = service.handle(&plain_request(&frame())).await.unwrap();
    assert!(response.fota.is_none());

    let record = service.firmware().get(job.id).await.unwrap().unwrap();
    assert_eq!(record.status, CommandStatus::Failed);
    assert_eq!(record.delivered_in, None);
}

#[tokio::test]
async fn acknowledgments_are_routed_by_shape() {
    let (service, _) = service();
    service.writes().enqueue(RegisterWrite { value: 10 }).await.unwrap();
    let response = service.handle(&plain_request(&frame())).await.unwrap();
    assert!(response.command.is_some());

    let receipt = service
        .acknowledge_json(r#"{"command_result":{"status":"success","executed_at":"2025-10-01T10:00:00Z"}}"#)
        .await
        .unwrap();
    assert_eq!(receipt.kind, CommandKind::RegisterWrite);
    assert_eq!(receipt.outcome.record().unwrap().status, CommandStatus::Success);

    // Duplicate and unmatched acknowledgments are no-ops
    let duplicate = service.acknowledge_json(r#"{"command_result":{"status":"success"}}"#).await.unwrap();
    assert_eq!(duplicate.outcome, AckOutcome::Orphaned);
    let orphan = service
        .acknowledge_json(r#"{"jobId":"99","final_status":"success","duration_ms":10,"events":[]}"#)
        .await
        .unwrap();
    assert_eq!((orphan.kind, orphan.outcome), (CommandKind::Firmware, AckOutcome::Orphaned));
    let config = service.acknowledge_json(r#"{"config_ack":{"accepted":["x"]}}"#).await.unwrap();
    assert_eq!(config.outcome, AckOutcome::Orphaned);

    assert!(matches!(
        service.acknowledge_json(r#"{"hello":"world"}"#).await,
        Err(UplinkError::InvalidCommand { .. })
    ));
}

#[tokio::test]
async fn service_from_config_uses_counter_policy() {
    let config = IngestConfig {
        replay: ReplayPolicy::Counter { path: None },
        ..IngestConfig::default()
    };
    let service = UplinkService::from_config(
        &config,
        Arc::new(MemoryReadingSink::new()),
        Arc::new(MemoryCommandStore::new()),
    )
    .await
    .unwrap();

    assert!(service.handle(&sealed_request_with_nonce(&frame(), 5)).await.is_ok());
    assert!(service.handle(&sealed_request_with_nonce(&frame(), 5)).await.is_err());
    assert!(service.handle(&sealed_request_with_nonce(&frame(), 6)).await.is_ok());
}

#[tokio::test]
async fn forged_mac_does_not_advance_the_counter() {
    let config = IngestConfig {
        replay: ReplayPolicy::Counter { path: None },
        ..IngestConfig::default()
    };
    let service = UplinkService::from_config(
        &config,
        Arc::new(MemoryReadingSink::new()),
        Arc::new(MemoryCommandStore::new()),
    )
    .await
    .unwrap();

    let sealed = sealed_request(&frame());
    let forged = UplinkRequest::new(sealed.body().to_vec())
        .with_header(ENCRYPTION_HEADER, "aes-256-cbc")
        .with_header(NONCE_HEADER, u64::MAX.to_string())
        .with_header(MAC_HEADER, "00");
    let err = service.handle(&forged).await.unwrap_err();
    assert!(matches!(err, UplinkError::AuthenticationFailure { .. }));

    // The genuine device keeps counting from where it was
    assert!(service.handle(&sealed_request_with_nonce(&frame(), 1)).await.is_ok());
    assert!(service.handle(&sealed_request_with_nonce(&frame(), 1)).await.is_err());
}

#[tokio::test]
async fn services_sharing_a_store_never_reuse_uplink_ids() {
    let store: Arc<dyn CommandStore> = Arc::new(MemoryCommandStore::new());
    let sink = Arc::new(MemoryReadingSink::new());
    let east = UplinkService::new(ProtocolGeneration::Dynamic, sink.clone(), Arc::clone(&store));
    let west = UplinkService::new(ProtocolGeneration::Dynamic, sink, store);
    east.configs().enqueue(interval(60)).await.unwrap();

    let first = east.handle(&plain_request(&frame())).await.unwrap();
    let second = west.handle(&plain_request(&frame())).await.unwrap();
    assert_ne!(first.uplink_id, second.uplink_id);

    // Either instance resolves the item by the uplink that carried it
    let delivered = west.configs().in_flight().await.unwrap().unwrap();
    assert_eq!(delivered.delivered_in, Some(first.uplink_id));
}

#[tokio::test]
async fn fixed_generation_service() {
    let service = UplinkService::new(
        ProtocolGeneration::Fixed,
        Arc::new(MemoryReadingSink::new()),
        Arc::new(MemoryCommandStore::new()),
    );
    let columns: Vec<Vec<u16>> = (0..10).map(|register| vec![register * 10; 5]).collect();
    let frame = FrameBuilder::new(ProtocolGeneration::Fixed).columns(columns).build();

    let response = service.handle(&sealed_request(&frame)).await.unwrap();
    assert_eq!(response.values_processed, 50);
    assert_eq!(&response.values[..3], &[0, 10, 20]);
}

#[test]
fn errors_map_to_status_and_body() {
    let (status, body) = ErrorBody::from_error(&UplinkError::IntegrityFailure { algorithm: "CRC-16/MODBUS" });
    assert_eq!(status, 400);
    assert_eq!(serde_json::to_value(&body).unwrap(), json!({"error": "CRC validation failed (CRC-16/MODBUS)"}));
}
