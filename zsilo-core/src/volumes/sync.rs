//! Volume reconciliation.
//!
//! The syncer drives the real world toward a volume's recorded status after
//! crashes or external tampering. Four phases (zfs, publish, connect,
//! mount) run in order, and each is idempotent: it probes the world first and
//! only issues commands when the probe disagrees with the store.

use crate::cmd::fsops::{Fs, FormatArgs};
use crate::cmd::iscsi::{
    ConnectTargetArgs, Credentials, DisconnectTargetArgs, Host, Iscsi, PublishVolumeArgs,
    UnpublishVolumeArgs,
};
use crate::cmd::literal::Literal;
use crate::cmd::mount::{Mount, UmountArgs};
use crate::cmd::zfs::{CreateVolumeArgs, VolumeExistsArgs, Zfs};
use crate::error::{Result, SiloError};
use crate::exec::{ConsumerMap, SharedExecutor};
use crate::types::{self, Volume, VolumeMode};
use crate::volumes::mount_volume_effects;
use tracing::{info, instrument};

pub struct VolumeSyncer {
    producer: SharedExecutor,
    consumers: ConsumerMap,
    host: Host,
    credentials: Credentials,
}

impl VolumeSyncer {
    pub fn new(
        producer: SharedExecutor,
        consumers: ConsumerMap,
        host: Host,
        credentials: Credentials,
    ) -> Self {
        Self { producer, consumers, host, credentials }
    }

    /// Drive the world toward `volume.status`.
    #[instrument(skip(self, volume), fields(volume_id = %volume.id))]
    pub async fn sync(&self, volume: &Volume) -> Result<()> {
        self.sync_zfs(volume).await?;
        self.sync_publish(volume).await?;
        self.sync_connect(volume).await?;
        self.sync_mount(volume).await?;
        Ok(())
    }

    /// Re-create the dataset when it has gone missing. Only existence is
    /// checked currently; size and properties are not verified.
    async fn sync_zfs(&self, volume: &Volume) -> Result<()> {
        let exists = Zfs::with(&self.producer)
            .volume_exists(VolumeExistsArgs { name: &volume.dataset_id })
            .await?;
        if exists {
            return Ok(());
        }

        info!(volume_id = %volume.id, "recreating dataset during sync");
        Zfs::with(&self.producer)
            .create_volume(CreateVolumeArgs {
                name: &volume.dataset_id,
                size: volume.capacity_bytes as u64,
                options: &volume.options,
                sparse: volume.sparse,
            })
            .await?;

        if volume.mode == VolumeMode::Filesystem {
            let device = volume.device_path_zfs();
            Fs::with(&self.producer)
                .format(FormatArgs { device: &device, wait_for_device: true })
                .await?;
        }

        Ok(())
    }

    async fn sync_publish(&self, volume: &Volume) -> Result<()> {
        let target_iqn = self.effective_target_iqn(volume);
        let published = self.check_published(&target_iqn).await;

        if volume.is_published() && !published {
            info!(volume_id = %volume.id, "publishing volume during sync");
            let device = volume.device_path_zfs();
            Iscsi::with(&self.producer)
                .publish_volume(PublishVolumeArgs {
                    volume_id: &volume.id,
                    device_path: &device,
                    target_iqn: &target_iqn,
                    credentials: &self.credentials,
                })
                .await?;
        } else if !volume.is_published() && published {
            info!(volume_id = %volume.id, "unpublishing volume during sync");
            Iscsi::with(&self.producer)
                .unpublish_volume(UnpublishVolumeArgs {
                    volume_id: &volume.id,
                    target_iqn: &target_iqn,
                })
                .await?;
        }

        Ok(())
    }

    async fn sync_connect(&self, volume: &Volume) -> Result<()> {
        // Without an initiator there is nothing to connect or disconnect.
        if volume.initiator_iqn.is_empty() {
            return Ok(());
        }

        let consumer = self.consumer(&volume.initiator_iqn)?;
        let target_iqn = self.effective_target_iqn(volume);
        let connected = self.check_connected(consumer, &target_iqn).await;

        if volume.is_connected() && !connected {
            info!(volume_id = %volume.id, "connecting volume during sync");
            Iscsi::with(consumer)
                .connect_target(ConnectTargetArgs {
                    target_iqn: &target_iqn,
                    target_address: &volume.target_address,
                    credentials: &self.credentials,
                })
                .await?;
        } else if !volume.is_connected() && connected {
            info!(volume_id = %volume.id, "disconnecting volume during sync");
            Iscsi::with(consumer)
                .disconnect_target(DisconnectTargetArgs {
                    target_iqn: &target_iqn,
                    target_address: &volume.target_address,
                })
                .await?;
        }

        Ok(())
    }

    async fn sync_mount(&self, volume: &Volume) -> Result<()> {
        // Without an initiator nothing is reachable; without a mount path
        // there is nothing to check.
        if volume.initiator_iqn.is_empty() || volume.mount_path.is_empty() {
            return Ok(());
        }

        let consumer = self.consumer(&volume.initiator_iqn)?;
        // A failing probe counts as "not mounted", matching the semantics of
        // the other phase probes.
        let mounted =
            Mount::with(consumer).is_mounted(&volume.mount_path).await.unwrap_or(false);

        if volume.is_mounted() && !mounted {
            info!(volume_id = %volume.id, "mounting volume during sync");
            mount_volume_effects(consumer, volume).await?;
        } else if !volume.is_mounted() && mounted {
            info!(volume_id = %volume.id, "unmounting volume during sync");
            Mount::with(consumer).umount(UmountArgs { path: &volume.mount_path }).await?;
        }

        Ok(())
    }

    /// The target IQN to probe and act on: the recorded one when the row has
    /// it, otherwise what the configured host identity would have produced.
    fn effective_target_iqn(&self, volume: &Volume) -> String {
        if !volume.target_iqn.is_empty() {
            volume.target_iqn.clone()
        } else {
            self.host.volume_iqn(&volume.id).to_string()
        }
    }

    /// A published target shows up under the kernel target configfs tree.
    async fn check_published(&self, target_iqn: &str) -> bool {
        let path = types::volume::build_device_path_iscsi_server(target_iqn);
        Literal::with(&self.producer).run(&format!("ls -d {path}")).await.is_ok()
    }

    /// A connected target shows up in the initiator's session list.
    async fn check_connected(&self, consumer: &SharedExecutor, target_iqn: &str) -> bool {
        Literal::with(consumer)
            .run(&format!("iscsiadm -m session | grep -q {target_iqn}"))
            .await
            .is_ok()
    }

    fn consumer(&self, initiator_iqn: &str) -> Result<&SharedExecutor> {
        self.consumers
            .get(initiator_iqn)
            .ok_or_else(|| SiloError::Internal(format!("unknown consumer: {initiator_iqn}")))
    }
}
