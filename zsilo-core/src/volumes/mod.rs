//! The volume orchestrator.
//!
//! [`VolumeManager`] implements the RPC surface over volumes: it enforces the
//! lifecycle state machine, composes the CLI adapters against the producer
//! and consumer executors, and keeps the store authoritative by running each
//! row mutation and its side effect inside one store transaction. Create is
//! the only operation with two independent effects, so it alone uses the
//! reversible-operation stack.

pub mod page;
pub mod sync;
pub mod update;

#[cfg(test)]
mod tests;

pub use sync::VolumeSyncer;

use crate::cmd::fsops::{Fs, FormatArgs};
use crate::cmd::iscsi::{
    ConnectTargetArgs, Credentials, DisconnectTargetArgs, Host, Iscsi, PublishVolumeArgs,
    RescanTargetArgs, UnpublishVolumeArgs,
};
use crate::cmd::literal::Literal;
use crate::cmd::mount::{Mount, MountArgs, UmountArgs};
use crate::cmd::zfs::{
    CreateVolumeArgs, DestroyVolumeArgs, GetPropertyArgs, SetPropertyArgs, Zfs,
};
use crate::error::{Result, SiloError};
use crate::exec::{ConsumerMap, SharedExecutor};
use crate::store::{self, VolumeStore};
use crate::types::{Volume, VolumeMode, VolumeOption, VolumeStatus};
use crate::undo::{self, UndoStack};
use page::PageToken;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, instrument};
use update::apply_volume_update;

const DEFAULT_PAGE_SIZE: i64 = 25;
const MAX_PAGE_SIZE: i64 = 100;
const DEFAULT_CAPACITY_BYTES: i64 = 1 << 30;

/// Requested access capability for a new volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeCapability {
    Mount,
    Block,
}

/// Validated inputs for `CreateVolume`.
#[derive(Debug, Clone)]
pub struct CreateVolumeParams {
    pub name: String,
    pub parent_dataset_id: String,
    pub required_bytes: i64,
    pub limit_bytes: i64,
    pub capabilities: Vec<VolumeCapability>,
    pub sparse: bool,
    pub options: Vec<VolumeOption>,
    pub attrs: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageUnit {
    Bytes,
    Inodes,
}

/// One usage record returned by `StatsVolume`.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub total: i64,
    pub used: i64,
    pub available: i64,
    pub unit: UsageUnit,
}

/// Stateful coordinator for the volume lifecycle.
pub struct VolumeManager {
    store: VolumeStore,
    producer: SharedExecutor,
    consumers: ConsumerMap,
    host: Host,
    credentials: Credentials,
    pool: String,
    syncer: VolumeSyncer,
}

impl VolumeManager {
    pub fn new(
        store: VolumeStore,
        producer: SharedExecutor,
        consumers: ConsumerMap,
        host: Host,
        credentials: Credentials,
        pool: impl Into<String>,
    ) -> Self {
        let syncer = VolumeSyncer::new(
            Arc::clone(&producer),
            consumers.clone(),
            host.clone(),
            credentials.clone(),
        );
        Self { store, producer, consumers, host, credentials, pool: pool.into(), syncer }
    }

    /// Available bytes in the root pool.
    pub async fn capacity(&self) -> Result<i64> {
        let avail = Zfs::with(&self.producer)
            .get_property(GetPropertyArgs { name: &self.pool, key: "avail" })
            .await?;
        avail.parse::<i64>().map_err(|e| {
            SiloError::Internal(format!("failed to parse available capacity '{avail}': {e}"))
        })
    }

    pub async fn get(&self, id: &str) -> Result<Volume> {
        self.store.get_volume(id).await
    }

    /// List one page of volumes ordered by creation time descending. Returns
    /// the page and the next-page token, empty when this was the last page.
    pub async fn list(&self, page_size: i32, page_token: &str) -> Result<(Vec<Volume>, String)> {
        let mut page_size = i64::from(page_size);
        if page_size <= 0 {
            page_size = DEFAULT_PAGE_SIZE;
        }
        if page_size > MAX_PAGE_SIZE {
            page_size = MAX_PAGE_SIZE;
        }

        // The page token is empty on the first request and populated on
        // subsequent requests.
        let (offset, limit) = if page_token.is_empty() {
            (0, page_size)
        } else {
            let token = PageToken::unmarshal(page_token)?;
            (token.offset, token.limit)
        };

        let volumes = self.store.list_volumes(offset, limit).await?;

        // A full page may have another one behind it; a short page is the end.
        let next_page_token = if volumes.len() as i64 == limit {
            PageToken { offset: offset + volumes.len() as i64, limit }.marshal()?
        } else {
            String::new()
        };

        Ok((volumes, next_page_token))
    }

    #[instrument(skip(self, params), fields(name = %params.name))]
    pub async fn create(&self, params: CreateVolumeParams) -> Result<Volume> {
        validate_name(&params.name)?;
        if params.parent_dataset_id.is_empty() {
            return Err(SiloError::InvalidArgument(
                "parent dataset id cannot be empty".to_string(),
            ));
        }
        if params.capabilities.is_empty() {
            return Err(SiloError::InvalidArgument(
                "volume capabilities must be provided".to_string(),
            ));
        }
        if params.required_bytes < 0 || params.limit_bytes < 0 {
            return Err(SiloError::InvalidArgument(
                "capacity bytes must not be negative".to_string(),
            ));
        }
        if params.limit_bytes > 0 && params.required_bytes > params.limit_bytes {
            return Err(SiloError::InvalidArgument(
                "required bytes is greater than limit bytes".to_string(),
            ));
        }

        let mode = if params.capabilities.contains(&VolumeCapability::Block) {
            VolumeMode::Block
        } else {
            VolumeMode::Filesystem
        };
        let capacity_bytes = if params.required_bytes == 0 {
            DEFAULT_CAPACITY_BYTES
        } else {
            params.required_bytes
        };

        let id = format!("vol_{}", params.name);
        let dataset_id = format!("{}/{}", params.parent_dataset_id, id);

        let mut volume = Volume {
            id,
            name: params.name,
            dataset_id,
            mode,
            status: VolumeStatus::Initial,
            capacity_bytes,
            sparse: params.sparse,
            options: params.options,
            attrs: params.attrs,
            target_iqn: String::new(),
            initiator_iqn: String::new(),
            target_address: String::new(),
            mount_path: String::new(),
            create_time: 0,
            update_time: 0,
        };

        let mut tx = self.store.begin().await?;
        store::insert_volume(&mut *tx, &mut volume).await?;

        let mut stack = UndoStack::new();
        if let Err(err) = self.create_effects(&volume, &mut stack).await {
            tx.rollback().await.ok();
            let cleanup = stack.unwind().await;
            return Err(undo::join_errors(err, cleanup));
        }

        tx.commit().await.map_err(|e| SiloError::Database(e.to_string()))?;

        info!(volume_id = %volume.id, "created volume");
        Ok(volume)
    }

    /// The side effects of create: the zvol, then for filesystem volumes the
    /// ext4 format once the device node shows up. Each effect pushes its undo
    /// right after it lands.
    async fn create_effects(&self, volume: &Volume, stack: &mut UndoStack) -> Result<()> {
        Zfs::with(&self.producer)
            .create_volume(CreateVolumeArgs {
                name: &volume.dataset_id,
                size: volume.capacity_bytes as u64,
                options: &volume.options,
                sparse: volume.sparse,
            })
            .await?;

        let producer = Arc::clone(&self.producer);
        let dataset_id = volume.dataset_id.clone();
        stack.push(move || async move {
            Zfs::with(&producer).destroy_volume(DestroyVolumeArgs { name: &dataset_id }).await
        });

        if volume.mode == VolumeMode::Filesystem {
            let device = volume.device_path_zfs();
            Fs::with(&self.producer)
                .format(FormatArgs { device: &device, wait_for_device: true })
                .await?;
        }

        Ok(())
    }

    #[instrument(skip(self, updates))]
    pub async fn update(&self, updates: Map<String, Value>) -> Result<Volume> {
        let id = updates
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| SiloError::InvalidArgument("volume id must be defined".to_string()))?
            .to_string();

        let mut volume = self.store.get_volume(&id).await?;
        let previous_capacity = volume.capacity_bytes;

        apply_volume_update(&mut volume, &updates)?;

        if volume.capacity_bytes < previous_capacity {
            return Err(SiloError::InvalidArgument(format!(
                "capacity_bytes cannot shrink from {previous_capacity} to {}",
                volume.capacity_bytes
            )));
        }

        // NOTE: The row update and the property writes below are not one
        // transaction; if a `zfs set` fails the row is ahead of the world
        // until the next sync.
        self.store.update_volume(&mut volume).await?;

        let zfs = Zfs::with(&self.producer);
        zfs.set_property(SetPropertyArgs {
            name: &volume.dataset_id,
            key: "volsize",
            value: &volume.capacity_bytes.to_string(),
        })
        .await?;
        for option in &volume.options {
            zfs.set_property(SetPropertyArgs {
                name: &volume.dataset_id,
                key: &option.key,
                value: &option.value,
            })
            .await?;
        }

        // A published volume's consumer has a live session; it must rescan to
        // observe the growth, and filesystem volumes also grow the ext4.
        if volume.is_published() {
            let consumer = self.consumer(&volume.initiator_iqn)?;
            Iscsi::with(consumer)
                .rescan_target(RescanTargetArgs {
                    target_iqn: &volume.target_iqn,
                    target_address: &volume.target_address,
                })
                .await?;

            if volume.mode == VolumeMode::Filesystem {
                let device = volume.device_path_iscsi_client();
                Fs::with(consumer).resize(crate::cmd::fsops::ResizeArgs { device: &device }).await?;
            }
        }

        Ok(volume)
    }

    #[instrument(skip(self), fields(volume_id = %id))]
    pub async fn delete(&self, id: &str) -> Result<()> {
        let volume = self.store.get_volume(id).await?;

        match volume.status {
            VolumeStatus::Published => {
                return Err(SiloError::InvalidArgument("volume is published".to_string()))
            }
            VolumeStatus::Connected => {
                return Err(SiloError::InvalidArgument("volume is connected".to_string()))
            }
            VolumeStatus::Mounted => {
                return Err(SiloError::InvalidArgument("volume is mounted".to_string()))
            }
            VolumeStatus::Initial => {}
        }

        let mut tx = self.store.begin().await?;

        if let Err(err) =
            Zfs::with(&self.producer).destroy_volume(DestroyVolumeArgs { name: &volume.dataset_id }).await
        {
            tx.rollback().await.ok();
            if err.command_stderr().is_some_and(|s| s.contains("dataset is busy")) {
                return Err(SiloError::FailedPrecondition("dataset is busy".to_string()));
            }
            return Err(err);
        }

        store::delete_volume(&mut *tx, id).await?;
        tx.commit().await.map_err(|e| SiloError::Database(e.to_string()))?;

        info!(volume_id = %id, "deleted volume");
        Ok(())
    }

    #[instrument(skip(self), fields(volume_id = %id))]
    pub async fn publish(&self, id: &str) -> Result<Volume> {
        let mut volume = self.store.get_volume(id).await?;

        match volume.status {
            VolumeStatus::Published => return Ok(volume),
            VolumeStatus::Connected => {
                return Err(SiloError::InvalidArgument("volume is connected".to_string()))
            }
            VolumeStatus::Mounted => {
                return Err(SiloError::InvalidArgument("volume is mounted".to_string()))
            }
            VolumeStatus::Initial => {}
        }

        volume.target_iqn = self.host.volume_iqn(&volume.id).to_string();
        volume.status = VolumeStatus::Published;

        let mut tx = self.store.begin().await?;
        store::update_volume(&mut *tx, &mut volume).await?;

        let device = volume.device_path_zfs();
        if let Err(err) = Iscsi::with(&self.producer)
            .publish_volume(PublishVolumeArgs {
                volume_id: &volume.id,
                device_path: &device,
                target_iqn: &volume.target_iqn,
                credentials: &self.credentials,
            })
            .await
        {
            tx.rollback().await.ok();
            return Err(err);
        }

        tx.commit().await.map_err(|e| SiloError::Database(e.to_string()))?;
        Ok(volume)
    }

    #[instrument(skip(self), fields(volume_id = %id))]
    pub async fn unpublish(&self, id: &str) -> Result<Volume> {
        let mut volume = self.store.get_volume(id).await?;

        match volume.status {
            VolumeStatus::Initial => return Ok(volume),
            VolumeStatus::Connected => {
                return Err(SiloError::InvalidArgument("volume is connected".to_string()))
            }
            VolumeStatus::Mounted => {
                return Err(SiloError::InvalidArgument("volume is mounted".to_string()))
            }
            VolumeStatus::Published => {}
        }

        let previous_target_iqn = std::mem::take(&mut volume.target_iqn);
        volume.status = VolumeStatus::Initial;

        let mut tx = self.store.begin().await?;
        store::update_volume(&mut *tx, &mut volume).await?;

        if let Err(err) = Iscsi::with(&self.producer)
            .unpublish_volume(UnpublishVolumeArgs {
                volume_id: &volume.id,
                target_iqn: &previous_target_iqn,
            })
            .await
        {
            tx.rollback().await.ok();
            return Err(err);
        }

        tx.commit().await.map_err(|e| SiloError::Database(e.to_string()))?;
        Ok(volume)
    }

    #[instrument(skip(self), fields(volume_id = %id))]
    pub async fn connect(
        &self,
        id: &str,
        initiator_iqn: &str,
        target_address: &str,
    ) -> Result<Volume> {
        if initiator_iqn.is_empty() {
            return Err(SiloError::InvalidArgument("initiator iqn cannot be empty".to_string()));
        }
        if target_address.is_empty() {
            return Err(SiloError::InvalidArgument("target address cannot be empty".to_string()));
        }

        let mut volume = self.store.get_volume(id).await?;

        match volume.status {
            VolumeStatus::Initial => {
                return Err(SiloError::FailedPrecondition("volume is not published".to_string()))
            }
            VolumeStatus::Connected => return Ok(volume),
            VolumeStatus::Mounted => {
                return Err(SiloError::InvalidArgument("volume is mounted".to_string()))
            }
            VolumeStatus::Published => {}
        }

        let consumer = self.consumer(initiator_iqn)?;

        volume.initiator_iqn = initiator_iqn.to_string();
        volume.target_address = target_address.to_string();
        volume.status = VolumeStatus::Connected;

        let mut tx = self.store.begin().await?;
        store::update_volume(&mut *tx, &mut volume).await?;

        if let Err(err) = Iscsi::with(consumer)
            .connect_target(ConnectTargetArgs {
                target_iqn: &volume.target_iqn,
                target_address: &volume.target_address,
                credentials: &self.credentials,
            })
            .await
        {
            tx.rollback().await.ok();
            return Err(err);
        }

        tx.commit().await.map_err(|e| SiloError::Database(e.to_string()))?;
        Ok(volume)
    }

    #[instrument(skip(self), fields(volume_id = %id))]
    pub async fn disconnect(&self, id: &str) -> Result<Volume> {
        let mut volume = self.store.get_volume(id).await?;

        match volume.status {
            VolumeStatus::Initial => {
                return Err(SiloError::FailedPrecondition("volume is not connected".to_string()))
            }
            VolumeStatus::Published => return Ok(volume),
            VolumeStatus::Mounted => {
                return Err(SiloError::InvalidArgument("volume is mounted".to_string()))
            }
            VolumeStatus::Connected => {}
        }

        // Resolve the consumer before the row fields are cleared.
        let consumer = self.consumer(&volume.initiator_iqn)?;

        let previous_target_address = std::mem::take(&mut volume.target_address);
        volume.initiator_iqn = String::new();
        volume.status = VolumeStatus::Published;

        let mut tx = self.store.begin().await?;
        store::update_volume(&mut *tx, &mut volume).await?;

        if let Err(err) = Iscsi::with(consumer)
            .disconnect_target(DisconnectTargetArgs {
                target_iqn: &volume.target_iqn,
                target_address: &previous_target_address,
            })
            .await
        {
            tx.rollback().await.ok();
            return Err(err);
        }

        tx.commit().await.map_err(|e| SiloError::Database(e.to_string()))?;
        Ok(volume)
    }

    #[instrument(skip(self), fields(volume_id = %id))]
    pub async fn mount(&self, id: &str, mount_path: &str) -> Result<Volume> {
        let mut volume = self.store.get_volume(id).await?;

        match volume.status {
            VolumeStatus::Initial => {
                return Err(SiloError::FailedPrecondition("volume is not published".to_string()))
            }
            VolumeStatus::Published => {
                return Err(SiloError::FailedPrecondition("volume is not connected".to_string()))
            }
            VolumeStatus::Mounted => return Ok(volume),
            VolumeStatus::Connected => {}
        }

        if mount_path.is_empty() || !mount_path.starts_with('/') {
            return Err(SiloError::InvalidArgument("mount path must be absolute".to_string()));
        }

        let consumer = self.consumer(&volume.initiator_iqn)?;

        volume.mount_path = mount_path.to_string();
        volume.status = VolumeStatus::Mounted;

        let mut tx = self.store.begin().await?;
        store::update_volume(&mut *tx, &mut volume).await?;

        if let Err(err) = mount_volume_effects(consumer, &volume).await {
            tx.rollback().await.ok();
            return Err(err);
        }

        tx.commit().await.map_err(|e| SiloError::Database(e.to_string()))?;
        Ok(volume)
    }

    #[instrument(skip(self), fields(volume_id = %id))]
    pub async fn unmount(&self, id: &str) -> Result<Volume> {
        let mut volume = self.store.get_volume(id).await?;

        match volume.status {
            VolumeStatus::Initial => {
                return Err(SiloError::FailedPrecondition("volume is not published".to_string()))
            }
            VolumeStatus::Published => {
                return Err(SiloError::FailedPrecondition("volume is not connected".to_string()))
            }
            VolumeStatus::Connected => return Ok(volume),
            VolumeStatus::Mounted => {}
        }

        let consumer = self.consumer(&volume.initiator_iqn)?;

        let previous_mount_path = std::mem::take(&mut volume.mount_path);
        volume.status = VolumeStatus::Connected;

        let mut tx = self.store.begin().await?;
        store::update_volume(&mut *tx, &mut volume).await?;

        if let Err(err) =
            Mount::with(consumer).umount(UmountArgs { path: &previous_mount_path }).await
        {
            tx.rollback().await.ok();
            return Err(err);
        }

        tx.commit().await.map_err(|e| SiloError::Database(e.to_string()))?;
        Ok(volume)
    }

    #[instrument(skip(self), fields(volume_id = %id))]
    pub async fn stats(&self, id: &str) -> Result<Vec<UsageRecord>> {
        let volume = self.store.get_volume(id).await?;

        match volume.status {
            VolumeStatus::Initial => {
                return Err(SiloError::FailedPrecondition("volume is not published".to_string()))
            }
            VolumeStatus::Published => {
                return Err(SiloError::FailedPrecondition("volume is not connected".to_string()))
            }
            VolumeStatus::Connected => {
                return Err(SiloError::FailedPrecondition("volume is not mounted".to_string()))
            }
            VolumeStatus::Mounted => {}
        }

        match volume.mode {
            VolumeMode::Block => self.stats_block(&volume).await,
            VolumeMode::Filesystem => self.stats_filesystem(&volume).await,
        }
    }

    /// Block volumes are measured on the producer from ZFS accounting.
    async fn stats_block(&self, volume: &Volume) -> Result<Vec<UsageRecord>> {
        let zfs = Zfs::with(&self.producer);
        let mut values = Vec::with_capacity(2);
        for property in ["used", "usedds"] {
            let value = zfs
                .get_property(GetPropertyArgs { name: &volume.dataset_id, key: property })
                .await?;
            let value = value.parse::<i64>().map_err(|e| {
                SiloError::Internal(format!("failed to parse property {property}='{value}': {e}"))
            })?;
            values.push(value);
        }

        Ok(vec![UsageRecord {
            total: values[0],
            used: values[1],
            available: values[0] - values[1],
            unit: UsageUnit::Bytes,
        }])
    }

    /// Filesystem volumes are measured on the consumer with `df`, which
    /// reports in kilo-units.
    async fn stats_filesystem(&self, volume: &Volume) -> Result<Vec<UsageRecord>> {
        let consumer = self.consumer(&volume.initiator_iqn)?;

        let output = Literal::with(consumer)
            .run(&format!(
                "df '{}' --output=size,used,avail,itotal,iused,iavail | sed 1d",
                volume.mount_path
            ))
            .await?;

        let fields: Vec<&str> = output.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(SiloError::Internal(format!("unexpected df output: '{output}'")));
        }

        let mut values = Vec::with_capacity(6);
        for field in &fields {
            let value = field.parse::<i64>().map_err(|e| {
                SiloError::Internal(format!("failed to parse df field '{field}': {e}"))
            })?;
            values.push(value);
        }

        Ok(vec![
            UsageRecord {
                total: values[0] * 1000,
                used: values[1] * 1000,
                available: values[2] * 1000,
                unit: UsageUnit::Bytes,
            },
            UsageRecord {
                total: values[3],
                used: values[4],
                available: values[5],
                unit: UsageUnit::Inodes,
            },
        ])
    }

    /// Reconcile one volume with the real world.
    #[instrument(skip(self), fields(volume_id = %id))]
    pub async fn sync(&self, id: &str) -> Result<()> {
        let volume = self.store.get_volume(id).await?;
        self.syncer.sync(&volume).await
    }

    /// Reconcile every volume. A failing volume does not abort the scan; the
    /// failures are aggregated into one error.
    #[instrument(skip(self))]
    pub async fn sync_all(&self) -> Result<()> {
        let volumes = self.store.list_all_volumes().await?;

        let mut failures = Vec::new();
        for volume in &volumes {
            if let Err(err) = self.syncer.sync(volume).await {
                tracing::error!(volume_id = %volume.id, "failed to sync volume: {err}");
                failures.push(format!("volume {}: {err}", volume.id));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SiloError::Internal(format!("failed to sync volumes: {}", failures.join("; "))))
        }
    }

    fn consumer(&self, initiator_iqn: &str) -> Result<&SharedExecutor> {
        self.consumers.get(initiator_iqn).ok_or_else(|| {
            SiloError::Internal(format!("unable to lookup consumer {initiator_iqn}"))
        })
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SiloError::InvalidArgument("volume name cannot be empty".to_string()));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(SiloError::InvalidArgument(format!(
            "volume name contains invalid characters: {name}"
        )));
    }
    Ok(())
}

/// Prepare the mount path and mount the iSCSI device, branching on mode:
/// block volumes bind-mount the device node onto a file, filesystem volumes
/// mount ext4 onto a directory. Shared between the mount operation and the
/// syncer.
pub(crate) async fn mount_volume_effects(
    consumer: &SharedExecutor,
    volume: &Volume,
) -> Result<()> {
    let device = volume.device_path_iscsi_client();

    match volume.mode {
        VolumeMode::Block => {
            Literal::with(consumer)
                .run(&format!("install -m 0644 /dev/null {}", volume.mount_path))
                .await?;

            Mount::with(consumer)
                .mount(MountArgs {
                    source_path: &device,
                    target_path: &volume.mount_path,
                    fs_type: None,
                    options: &["bind"],
                })
                .await?;
        }
        VolumeMode::Filesystem => {
            Literal::with(consumer)
                .run(&format!("mkdir -m 0750 -p {}", volume.mount_path))
                .await?;

            Mount::with(consumer)
                .mount(MountArgs {
                    source_path: &device,
                    target_path: &volume.mount_path,
                    fs_type: Some("ext4"),
                    options: &["defaults"],
                })
                .await?;

            // TODO: properly expose the volume to non-root users.
            Literal::with(consumer)
                .run(&format!("chmod 0777 {}", volume.mount_path))
                .await?;
        }
    }

    Ok(())
}
