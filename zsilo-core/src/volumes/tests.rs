use super::*;
use crate::error::SiloError;
use crate::testutil::{MockExecutor, Outcome};
use chrono::{TimeZone, Utc};
use serde_json::json;
use std::sync::Arc;

const INITIATOR: &str = "iqn.2006-01.com.example:client";
const PORTAL: &str = "10.0.0.2:3260";

fn host() -> Host {
    Host::new("linux-iscsi.org", Utc.with_ymd_and_hms(2006, 1, 1, 0, 0, 0).unwrap(), "storage")
}

fn credentials() -> Credentials {
    Credentials {
        user_id: "user".into(),
        password: "pass".into(),
        mutual_user_id: "muser".into(),
        mutual_password: "mpass".into(),
    }
}

struct Fixture {
    manager: VolumeManager,
    store: VolumeStore,
    producer: Arc<MockExecutor>,
    consumer: Arc<MockExecutor>,
}

async fn fixture() -> Fixture {
    let producer = MockExecutor::new();
    let consumer = MockExecutor::new();
    let store = VolumeStore::new_in_memory().await.unwrap();

    let shared_producer: SharedExecutor = producer.clone();
    let shared_consumer: SharedExecutor = consumer.clone();
    let mut consumers = ConsumerMap::new();
    consumers.insert(INITIATOR.to_string(), shared_consumer);

    let manager = VolumeManager::new(
        store.clone(),
        shared_producer,
        consumers,
        host(),
        credentials(),
        "tank",
    );

    Fixture { manager, store, producer, consumer }
}

fn params(name: &str) -> CreateVolumeParams {
    CreateVolumeParams {
        name: name.to_string(),
        parent_dataset_id: "tank".to_string(),
        required_bytes: 100 * 1024 * 1024,
        limit_bytes: 0,
        capabilities: vec![VolumeCapability::Mount],
        sparse: true,
        options: Vec::new(),
        attrs: serde_json::Value::Null,
    }
}

fn block_params(name: &str) -> CreateVolumeParams {
    CreateVolumeParams { capabilities: vec![VolumeCapability::Block], ..params(name) }
}

/// Every row returned by a successful RPC satisfies the implication chain
/// between status and the identifier fields.
fn assert_invariants(volume: &Volume) {
    if volume.is_published() {
        assert!(!volume.target_iqn.is_empty());
    }
    if volume.is_connected() {
        assert!(!volume.initiator_iqn.is_empty());
        assert!(!volume.target_address.is_empty());
    }
    if volume.is_mounted() {
        assert!(!volume.mount_path.is_empty());
    }
}

#[tokio::test]
async fn full_lifecycle_walk() {
    let f = fixture().await;

    let volume = f.manager.create(params("foo")).await.unwrap();
    assert_eq!(volume.id, "vol_foo");
    assert_eq!(volume.dataset_id, "tank/vol_foo");
    assert_eq!(volume.status, VolumeStatus::Initial);
    assert_eq!(volume.mode, VolumeMode::Filesystem);
    assert_eq!(volume.capacity_bytes, 100 * 1024 * 1024);
    assert!(f.producer.saw("zfs create -s -V 104857600 tank/vol_foo"));
    assert!(f.producer.saw("mkfs.ext4 -F -m0 '/dev/zvol/tank/vol_foo'"));
    assert_invariants(&volume);

    let volume = f.manager.publish("vol_foo").await.unwrap();
    assert_eq!(volume.status, VolumeStatus::Published);
    assert_eq!(volume.target_iqn, "iqn.2006-01.org.linux-iscsi.storage:vol_foo");
    assert!(f.producer.saw("| targetcli"));
    assert_invariants(&volume);

    let volume = f.manager.connect("vol_foo", INITIATOR, PORTAL).await.unwrap();
    assert_eq!(volume.status, VolumeStatus::Connected);
    assert_eq!(volume.initiator_iqn, INITIATOR);
    assert_eq!(volume.target_address, PORTAL);
    assert!(f.consumer.saw("--login"));
    assert_invariants(&volume);

    let volume = f.manager.mount("vol_foo", "/mnt/foo").await.unwrap();
    assert_eq!(volume.status, VolumeStatus::Mounted);
    assert_eq!(volume.mount_path, "/mnt/foo");
    assert!(f.consumer.saw("mkdir -m 0750 -p /mnt/foo"));
    assert!(f.consumer.saw("mount -t ext4 -o 'defaults'"));
    assert!(f.consumer.saw("chmod 0777 /mnt/foo"));
    assert_invariants(&volume);

    let volume = f.manager.unmount("vol_foo").await.unwrap();
    assert_eq!(volume.status, VolumeStatus::Connected);
    assert!(volume.mount_path.is_empty());
    assert!(f.consumer.saw("umount '/mnt/foo'"));

    let volume = f.manager.disconnect("vol_foo").await.unwrap();
    assert_eq!(volume.status, VolumeStatus::Published);
    assert!(volume.initiator_iqn.is_empty());
    assert!(volume.target_address.is_empty());
    assert!(f.consumer.saw("--logout"));

    let volume = f.manager.unpublish("vol_foo").await.unwrap();
    assert_eq!(volume.status, VolumeStatus::Initial);
    assert!(volume.target_iqn.is_empty());
    assert!(f.producer.saw("delete iqn.2006-01.org.linux-iscsi.storage:vol_foo"));

    f.manager.delete("vol_foo").await.unwrap();
    assert!(f.producer.saw("zfs destroy tank/vol_foo"));
    let err = f.manager.get("vol_foo").await.unwrap_err();
    assert!(matches!(err, SiloError::NotFound(_)));
}

#[tokio::test]
async fn create_again_is_already_exists_and_leaves_original_intact() {
    let f = fixture().await;

    f.manager.create(params("foo")).await.unwrap();

    let mut second = params("foo");
    second.required_bytes = 999 * 1024 * 1024;
    let err = f.manager.create(second).await.unwrap_err();
    assert!(matches!(err, SiloError::AlreadyExists(_)));

    let original = f.manager.get("vol_foo").await.unwrap();
    assert_eq!(original.capacity_bytes, 100 * 1024 * 1024);
}

#[tokio::test]
async fn create_rejects_bad_arguments() {
    let f = fixture().await;

    let err = f.manager.create(CreateVolumeParams { name: String::new(), ..params("x") }).await;
    assert!(matches!(err, Err(SiloError::InvalidArgument(_))));

    let err =
        f.manager.create(CreateVolumeParams { name: "bad name!".into(), ..params("x") }).await;
    assert!(matches!(err, Err(SiloError::InvalidArgument(_))));

    let err = f
        .manager
        .create(CreateVolumeParams { capabilities: Vec::new(), ..params("x") })
        .await;
    assert!(matches!(err, Err(SiloError::InvalidArgument(_))));

    // Inverted capacity range.
    let err = f
        .manager
        .create(CreateVolumeParams { required_bytes: 100, limit_bytes: 50, ..params("x") })
        .await;
    assert!(matches!(err, Err(SiloError::InvalidArgument(_))));
}

#[tokio::test]
async fn create_defaults_capacity_to_one_gib() {
    let f = fixture().await;
    let volume = f
        .manager
        .create(CreateVolumeParams { required_bytes: 0, ..params("foo") })
        .await
        .unwrap();
    assert_eq!(volume.capacity_bytes, 1 << 30);
}

#[tokio::test]
async fn create_is_atomic_when_format_fails() {
    let f = fixture().await;
    f.producer.on("mkfs.ext4", Outcome::Exit(1, "format failed"));

    let err = f.manager.create(params("foo")).await;
    assert!(err.is_err());

    // Neither the row nor the dataset survive: the row rolled back and the
    // undo destroyed the zvol.
    let err = f.manager.get("vol_foo").await.unwrap_err();
    assert!(matches!(err, SiloError::NotFound(_)));
    assert!(f.producer.saw("zfs destroy tank/vol_foo"));
}

#[tokio::test]
async fn delete_while_published_is_invalid_argument() {
    let f = fixture().await;

    f.manager.create(params("foo")).await.unwrap();
    f.manager.publish("vol_foo").await.unwrap();

    let err = f.manager.delete("vol_foo").await.unwrap_err();
    match err {
        SiloError::InvalidArgument(message) => assert_eq!(message, "volume is published"),
        other => panic!("expected InvalidArgument, got {other:?}"),
    }

    // The row is unchanged.
    let volume = f.manager.get("vol_foo").await.unwrap();
    assert_eq!(volume.status, VolumeStatus::Published);
}

#[tokio::test]
async fn delete_busy_dataset_is_failed_precondition() {
    let f = fixture().await;
    f.manager.create(params("foo")).await.unwrap();

    f.producer
        .on("zfs destroy", Outcome::Exit(1, "cannot destroy 'tank/vol_foo': dataset is busy"));
    let err = f.manager.delete("vol_foo").await.unwrap_err();
    assert!(matches!(err, SiloError::FailedPrecondition(_)));

    // The row survived the rollback.
    f.manager.get("vol_foo").await.unwrap();
}

#[tokio::test]
async fn publish_is_idempotent() {
    let f = fixture().await;
    f.manager.create(params("foo")).await.unwrap();

    let first = f.manager.publish("vol_foo").await.unwrap();
    let second = f.manager.publish("vol_foo").await.unwrap();
    assert_eq!(first.target_iqn, second.target_iqn);
    assert_eq!(f.producer.count("| targetcli"), 1);
}

#[tokio::test]
async fn unmount_at_connected_is_idempotent() {
    let f = fixture().await;
    f.manager.create(params("foo")).await.unwrap();
    f.manager.publish("vol_foo").await.unwrap();
    f.manager.connect("vol_foo", INITIATOR, PORTAL).await.unwrap();

    let volume = f.manager.unmount("vol_foo").await.unwrap();
    assert_eq!(volume.status, VolumeStatus::Connected);
    assert!(!f.consumer.saw("umount"));
}

#[tokio::test]
async fn connect_before_publish_is_failed_precondition() {
    let f = fixture().await;
    f.manager.create(params("foo")).await.unwrap();

    let err = f.manager.connect("vol_foo", INITIATOR, PORTAL).await.unwrap_err();
    assert!(matches!(err, SiloError::FailedPrecondition(_)));
}

#[tokio::test]
async fn disconnect_before_connect_is_failed_precondition() {
    let f = fixture().await;
    f.manager.create(params("foo")).await.unwrap();

    let err = f.manager.disconnect("vol_foo").await.unwrap_err();
    assert!(matches!(err, SiloError::FailedPrecondition(_)));
    assert!(!f.consumer.saw("--logout"));
}

#[tokio::test]
async fn unmount_before_connect_is_failed_precondition() {
    let f = fixture().await;
    f.manager.create(params("foo")).await.unwrap();

    // Below CONNECTED in both shapes: never published, and published only.
    let err = f.manager.unmount("vol_foo").await.unwrap_err();
    assert!(matches!(err, SiloError::FailedPrecondition(_)));

    f.manager.publish("vol_foo").await.unwrap();
    let err = f.manager.unmount("vol_foo").await.unwrap_err();
    assert!(matches!(err, SiloError::FailedPrecondition(_)));
    assert!(!f.consumer.saw("umount"));
}

#[tokio::test]
async fn connect_unknown_initiator_fails_before_mutating() {
    let f = fixture().await;
    f.manager.create(params("foo")).await.unwrap();
    f.manager.publish("vol_foo").await.unwrap();

    let err = f
        .manager
        .connect("vol_foo", "iqn.2006-01.com.example:stranger", PORTAL)
        .await
        .unwrap_err();
    assert!(matches!(err, SiloError::Internal(_)));

    let volume = f.manager.get("vol_foo").await.unwrap();
    assert_eq!(volume.status, VolumeStatus::Published);
    assert!(volume.initiator_iqn.is_empty());
}

#[tokio::test]
async fn connect_failure_rolls_back_row() {
    let f = fixture().await;
    f.manager.create(params("foo")).await.unwrap();
    f.manager.publish("vol_foo").await.unwrap();

    f.consumer.on("--login", Outcome::Exit(19, "login failed"));
    let err = f.manager.connect("vol_foo", INITIATOR, PORTAL).await;
    assert!(err.is_err());

    let volume = f.manager.get("vol_foo").await.unwrap();
    assert_eq!(volume.status, VolumeStatus::Published);
    assert!(volume.initiator_iqn.is_empty());
    assert!(volume.target_address.is_empty());
}

#[tokio::test]
async fn update_wrong_kind_is_field_type_error() {
    let f = fixture().await;
    f.manager.create(params("foo")).await.unwrap();

    let updates = match json!({"id": "vol_foo", "capacity_bytes": "not a number"}) {
        serde_json::Value::Object(map) => map,
        _ => unreachable!(),
    };
    let err = f.manager.update(updates).await.unwrap_err();
    match err {
        SiloError::FieldType { field, expected, .. } => {
            assert_eq!(field, "capacity_bytes");
            assert_eq!(expected, "number");
        }
        other => panic!("expected FieldType, got {other:?}"),
    }
}

#[tokio::test]
async fn update_grows_capacity_and_rescans_connected_volume() {
    let f = fixture().await;
    f.manager.create(params("foo")).await.unwrap();
    f.manager.publish("vol_foo").await.unwrap();
    f.manager.connect("vol_foo", INITIATOR, PORTAL).await.unwrap();

    let updates = match json!({"id": "vol_foo", "capacity_bytes": 209715200}) {
        serde_json::Value::Object(map) => map,
        _ => unreachable!(),
    };
    let volume = f.manager.update(updates).await.unwrap();
    assert_eq!(volume.capacity_bytes, 209715200);

    assert!(f.producer.saw("zfs set 'volsize'='209715200' 'tank/vol_foo'"));
    assert!(f.consumer.saw("--rescan"));
    assert!(f.consumer.saw("resize2fs"));
}

#[tokio::test]
async fn update_cannot_shrink_capacity() {
    let f = fixture().await;
    f.manager.create(params("foo")).await.unwrap();

    let updates = match json!({"id": "vol_foo", "capacity_bytes": 1024}) {
        serde_json::Value::Object(map) => map,
        _ => unreachable!(),
    };
    let err = f.manager.update(updates).await.unwrap_err();
    assert!(matches!(err, SiloError::InvalidArgument(_)));

    let volume = f.manager.get("vol_foo").await.unwrap();
    assert_eq!(volume.capacity_bytes, 100 * 1024 * 1024);
}

#[tokio::test]
async fn stats_filesystem_reports_bytes_and_inodes() {
    let f = fixture().await;
    f.manager.create(params("foo")).await.unwrap();
    f.manager.publish("vol_foo").await.unwrap();
    f.manager.connect("vol_foo", INITIATOR, PORTAL).await.unwrap();
    f.manager.mount("vol_foo", "/mnt/foo").await.unwrap();

    f.consumer.on("df '/mnt/foo'", Outcome::Stdout("1000 200 800 65536 12 65524\n"));
    let usage = f.manager.stats("vol_foo").await.unwrap();

    assert_eq!(usage.len(), 2);
    assert_eq!(usage[0].unit, UsageUnit::Bytes);
    assert_eq!(usage[0].total, 1_000_000);
    assert_eq!(usage[0].used, 200_000);
    assert_eq!(usage[0].available, 800_000);
    assert_eq!(usage[1].unit, UsageUnit::Inodes);
    assert_eq!(usage[1].total, 65536);
    assert_eq!(usage[1].used, 12);
    assert_eq!(usage[1].available, 65524);
}

#[tokio::test]
async fn stats_block_synthesizes_totals_from_zfs() {
    let f = fixture().await;
    f.manager.create(block_params("blk")).await.unwrap();
    f.manager.publish("vol_blk").await.unwrap();
    f.manager.connect("vol_blk", INITIATOR, PORTAL).await.unwrap();
    f.manager.mount("vol_blk", "/mnt/blk").await.unwrap();

    // Block mode bind-mounts the device onto a file.
    assert!(f.consumer.saw("install -m 0644 /dev/null /mnt/blk"));
    assert!(f.consumer.saw("mount -o 'bind'"));

    f.producer.on("'usedds'", Outcome::Stdout("400\n"));
    f.producer.on("'used'", Outcome::Stdout("1000\n"));
    let usage = f.manager.stats("vol_blk").await.unwrap();

    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].unit, UsageUnit::Bytes);
    assert_eq!(usage[0].total, 1000);
    assert_eq!(usage[0].used, 400);
    assert_eq!(usage[0].available, 600);
}

#[tokio::test]
async fn stats_before_mount_is_failed_precondition() {
    let f = fixture().await;
    f.manager.create(params("foo")).await.unwrap();

    let err = f.manager.stats("vol_foo").await.unwrap_err();
    assert!(matches!(err, SiloError::FailedPrecondition(_)));
}

#[tokio::test]
async fn capacity_reads_pool_avail() {
    let f = fixture().await;
    f.producer.on("'avail' 'tank'", Outcome::Stdout("1099511627776\n"));

    let capacity = f.manager.capacity().await.unwrap();
    assert_eq!(capacity, 1099511627776);
}

#[tokio::test]
async fn list_pages_through_volumes() {
    let f = fixture().await;
    for name in ["a", "b", "c"] {
        f.manager.create(params(name)).await.unwrap();
    }

    let (first, token) = f.manager.list(2, "").await.unwrap();
    assert_eq!(first.len(), 2);
    assert!(!token.is_empty());

    let (second, token) = f.manager.list(2, &token).await.unwrap();
    assert_eq!(second.len(), 1);
    assert!(token.is_empty());

    let mut seen = std::collections::HashSet::new();
    for v in first.iter().chain(&second) {
        assert!(seen.insert(v.id.clone()));
    }
    assert_eq!(seen.len(), 3);
}

#[tokio::test]
async fn list_rejects_malformed_token() {
    let f = fixture().await;
    let err = f.manager.list(10, "@@@not base64@@@").await.unwrap_err();
    assert!(matches!(err, SiloError::InvalidArgument(_)));
}

#[tokio::test]
async fn sync_recreates_missing_dataset() {
    let f = fixture().await;
    f.manager.create(params("foo")).await.unwrap();
    f.producer.reset();

    // The dataset was destroyed out-of-band and the target never existed.
    f.producer.on("zfs list -H -o name", Outcome::Exit(1, ""));
    f.producer.on("ls -d /sys/kernel/config", Outcome::Exit(2, "No such file or directory"));

    f.manager.sync("vol_foo").await.unwrap();

    assert!(f.producer.saw("zfs create -s -V 104857600 tank/vol_foo"));
    assert!(f.producer.saw("mkfs.ext4 -F -m0 '/dev/zvol/tank/vol_foo'"));
}

#[tokio::test]
async fn sync_is_a_noop_when_world_matches() {
    let f = fixture().await;
    f.manager.create(params("foo")).await.unwrap();
    f.producer.reset();

    // Dataset present (default ok), target absent, as an INITIAL volume wants.
    f.producer.on("ls -d /sys/kernel/config", Outcome::Exit(2, "No such file or directory"));

    f.manager.sync("vol_foo").await.unwrap();
    f.manager.sync("vol_foo").await.unwrap();

    assert_eq!(f.producer.count("zfs create"), 0);
    assert_eq!(f.producer.count("| targetcli"), 0);
}

#[tokio::test]
async fn sync_republishes_with_recorded_target_iqn() {
    let f = fixture().await;

    let mut volume = f.manager.create(params("foo")).await.unwrap();
    volume.status = VolumeStatus::Published;
    volume.target_iqn = "iqn.2006-01.org.example:custom".to_string();
    f.store.update_volume(&mut volume).await.unwrap();

    f.producer.on("ls -d /sys/kernel/config", Outcome::Exit(2, "No such file or directory"));
    f.manager.sync("vol_foo").await.unwrap();

    assert!(f.producer.saw("create iqn.2006-01.org.example:custom"));
}

#[tokio::test]
async fn sync_recomputes_target_iqn_when_row_has_none() {
    let f = fixture().await;

    // A row claiming published without a recorded IQN: the syncer falls back
    // to the IQN the configured host identity produces.
    let mut volume = f.manager.create(params("foo")).await.unwrap();
    volume.status = VolumeStatus::Published;
    volume.target_iqn = String::new();
    f.store.update_volume(&mut volume).await.unwrap();

    f.producer.on("ls -d /sys/kernel/config", Outcome::Exit(2, "No such file or directory"));
    f.manager.sync("vol_foo").await.unwrap();

    assert!(f.producer.saw("create iqn.2006-01.org.linux-iscsi.storage:vol_foo"));
}

#[tokio::test]
async fn sync_unmounts_when_store_says_connected() {
    let f = fixture().await;
    f.manager.create(params("foo")).await.unwrap();
    f.manager.publish("vol_foo").await.unwrap();
    f.manager.connect("vol_foo", INITIATOR, PORTAL).await.unwrap();

    // The store says CONNECTED but the consumer still has a stale mount.
    let mut volume = f.manager.get("vol_foo").await.unwrap();
    volume.mount_path = "/mnt/foo".to_string();
    f.store.update_volume(&mut volume).await.unwrap();

    f.producer.on("ls -d /sys/kernel/config", Outcome::Stdout(""));
    f.manager.sync("vol_foo").await.unwrap();

    assert!(f.consumer.saw("umount '/mnt/foo'"));
}

#[tokio::test]
async fn sync_all_aggregates_failures_without_aborting() {
    let f = fixture().await;
    f.manager.create(params("a")).await.unwrap();
    f.manager.create(params("b")).await.unwrap();
    f.producer.reset();

    f.producer.on("ls -d /sys/kernel/config", Outcome::Exit(2, "No such file or directory"));
    // Recreating vol_a fails; vol_b still gets scanned.
    f.producer.on("grep -x tank/vol_a", Outcome::Exit(1, ""));
    f.producer.on("zfs create -s -V 104857600 tank/vol_a", Outcome::Exit(1, "out of space"));

    let err = f.manager.sync_all().await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("vol_a"));
    assert!(f.producer.saw("grep -x tank/vol_b"));
}
