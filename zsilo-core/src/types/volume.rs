//! Volume domain types.

use serde::{Deserialize, Serialize};

/// How a volume is exposed to its consumer. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeMode {
    Block,
    Filesystem,
}

impl VolumeMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BLOCK" => Some(VolumeMode::Block),
            "FILESYSTEM" => Some(VolumeMode::Filesystem),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeMode::Block => "BLOCK",
            VolumeMode::Filesystem => "FILESYSTEM",
        }
    }
}

/// Lifecycle stage of a volume.
///
/// The ordering matters: `status >= Published` means "the volume has an
/// iSCSI target", and so on up the chain. Lifecycle RPCs move a volume one
/// stage at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VolumeStatus {
    Initial,
    Published,
    Connected,
    Mounted,
}

impl VolumeStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INITIAL" => Some(VolumeStatus::Initial),
            "PUBLISHED" => Some(VolumeStatus::Published),
            "CONNECTED" => Some(VolumeStatus::Connected),
            "MOUNTED" => Some(VolumeStatus::Mounted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeStatus::Initial => "INITIAL",
            VolumeStatus::Published => "PUBLISHED",
            VolumeStatus::Connected => "CONNECTED",
            VolumeStatus::Mounted => "MOUNTED",
        }
    }
}

/// A ZFS property passed to `zfs create -o` and re-applied on update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeOption {
    pub key: String,
    pub value: String,
}

/// A network-exported volume backed by a ZFS zvol.
#[derive(Debug, Clone)]
pub struct Volume {
    /// Client-supplied unique ID, `vol_<name>`.
    pub id: String,
    /// Human-readable name. Informational.
    pub name: String,
    /// Absolute ZFS dataset name, e.g. `tank/vol_foo`. Globally unique.
    pub dataset_id: String,
    pub mode: VolumeMode,
    pub status: VolumeStatus,
    /// Grows only.
    pub capacity_bytes: i64,
    /// Thin-provisioned zvol when true.
    pub sparse: bool,
    pub options: Vec<VolumeOption>,
    /// Caller-owned metadata. Stored and returned verbatim, never inspected.
    pub attrs: serde_json::Value,
    /// Set while the volume is published.
    pub target_iqn: String,
    /// Set while the volume is connected.
    pub initiator_iqn: String,
    /// Portal the client dialed, `host:port`. Set while connected.
    pub target_address: String,
    /// Absolute path on the consumer host. Set while mounted.
    pub mount_path: String,
    /// Unix seconds.
    pub create_time: i64,
    /// Unix seconds.
    pub update_time: i64,
}

impl Volume {
    pub fn is_published(&self) -> bool {
        self.status >= VolumeStatus::Published
    }

    pub fn is_connected(&self) -> bool {
        self.status >= VolumeStatus::Connected
    }

    pub fn is_mounted(&self) -> bool {
        self.status >= VolumeStatus::Mounted
    }

    /// Device node for the zvol on the producer.
    pub fn device_path_zfs(&self) -> String {
        build_device_path_zfs(&self.dataset_id)
    }

    /// Device node the iSCSI initiator creates on the consumer.
    pub fn device_path_iscsi_client(&self) -> String {
        build_device_path_iscsi_client(&self.target_address, &self.target_iqn)
    }

    /// configfs path the kernel target creates on the producer.
    pub fn device_path_iscsi_server(&self) -> String {
        build_device_path_iscsi_server(&self.target_iqn)
    }
}

pub fn build_device_path_zfs(dataset_id: &str) -> String {
    format!("/dev/zvol/{dataset_id}")
}

pub fn build_device_path_iscsi_client(address: &str, iqn: &str) -> String {
    format!("/dev/disk/by-path/ip-{address}-iscsi-{iqn}-lun-0")
}

pub fn build_device_path_iscsi_server(iqn: &str) -> String {
    format!("/sys/kernel/config/target/iscsi/{iqn}")
}
