//! Conversions between domain types and the generated protobuf types.

use prost_types::value::Kind;
use prost_types::{ListValue, Struct, Timestamp, Value as ProstValue};
use serde_json::Value as JsonValue;
use tonic::Status;
use zsilo_api::zsilo::v1 as pb;
use zsilo_core::volumes::{UsageRecord, UsageUnit, VolumeCapability};
use zsilo_core::{Volume, VolumeMode, VolumeOption, VolumeStatus};

pub fn volume_to_proto(volume: Volume) -> pb::Volume {
    let mode = match volume.mode {
        VolumeMode::Block => pb::VolumeMode::Block,
        VolumeMode::Filesystem => pb::VolumeMode::Filesystem,
    };
    let status = match volume.status {
        VolumeStatus::Initial => pb::VolumeStatus::Initial,
        VolumeStatus::Published => pb::VolumeStatus::Published,
        VolumeStatus::Connected => pb::VolumeStatus::Connected,
        VolumeStatus::Mounted => pb::VolumeStatus::Mounted,
    };

    pb::Volume {
        id: volume.id,
        name: volume.name,
        dataset_id: volume.dataset_id,
        mode: mode as i32,
        status: status as i32,
        capacity_bytes: volume.capacity_bytes,
        sparse: volume.sparse,
        options: volume
            .options
            .into_iter()
            .map(|option| pb::VolumeOption { key: option.key, value: option.value })
            .collect(),
        target_iqn: volume.target_iqn,
        initiator_iqn: volume.initiator_iqn,
        target_address: volume.target_address,
        mount_path: volume.mount_path,
        r#struct: json_to_struct(volume.attrs),
        create_time: Some(Timestamp { seconds: volume.create_time, nanos: 0 }),
        update_time: Some(Timestamp { seconds: volume.update_time, nanos: 0 }),
    }
}

pub fn options_from_proto(options: Vec<pb::VolumeOption>) -> Vec<VolumeOption> {
    options
        .into_iter()
        .map(|option| VolumeOption { key: option.key, value: option.value })
        .collect()
}

pub fn capabilities_from_proto(capabilities: &[i32]) -> Result<Vec<VolumeCapability>, Status> {
    capabilities
        .iter()
        .map(|&value| match pb::VolumeCapability::try_from(value) {
            Ok(pb::VolumeCapability::Mount) => Ok(VolumeCapability::Mount),
            Ok(pb::VolumeCapability::Block) => Ok(VolumeCapability::Block),
            _ => Err(Status::invalid_argument(format!("unknown capability {value}"))),
        })
        .collect()
}

pub fn usage_to_proto(usage: Vec<UsageRecord>) -> pb::stats_volume_response::Stats {
    use pb::stats_volume_response::stats::usage::Unit;
    use pb::stats_volume_response::stats::Usage;

    pb::stats_volume_response::Stats {
        usage: usage
            .into_iter()
            .map(|record| Usage {
                total: record.total,
                used: record.used,
                available: record.available,
                unit: match record.unit {
                    UsageUnit::Bytes => Unit::Bytes,
                    UsageUnit::Inodes => Unit::Inodes,
                } as i32,
            })
            .collect(),
    }
}

/// A JSON object becomes a `Struct`; anything else (including null) is
/// absent.
pub fn json_to_struct(value: JsonValue) -> Option<Struct> {
    match value {
        JsonValue::Object(map) => Some(Struct {
            fields: map.into_iter().map(|(key, value)| (key, json_to_value(value))).collect(),
        }),
        _ => None,
    }
}

fn json_to_value(value: JsonValue) -> ProstValue {
    let kind = match value {
        JsonValue::Null => Kind::NullValue(0),
        JsonValue::Bool(value) => Kind::BoolValue(value),
        JsonValue::Number(number) => Kind::NumberValue(number.as_f64().unwrap_or(0.0)),
        JsonValue::String(value) => Kind::StringValue(value),
        JsonValue::Array(items) => Kind::ListValue(ListValue {
            values: items.into_iter().map(json_to_value).collect(),
        }),
        JsonValue::Object(map) => Kind::StructValue(Struct {
            fields: map.into_iter().map(|(key, value)| (key, json_to_value(value))).collect(),
        }),
    };
    ProstValue { kind: Some(kind) }
}

pub fn struct_to_json(value: Struct) -> JsonValue {
    JsonValue::Object(
        value.fields.into_iter().map(|(key, value)| (key, value_to_json(value))).collect(),
    )
}

fn value_to_json(value: ProstValue) -> JsonValue {
    match value.kind {
        None | Some(Kind::NullValue(_)) => JsonValue::Null,
        Some(Kind::BoolValue(value)) => JsonValue::Bool(value),
        Some(Kind::NumberValue(number)) => serde_json::Number::from_f64(number)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Some(Kind::StringValue(value)) => JsonValue::String(value),
        Some(Kind::ListValue(list)) => {
            JsonValue::Array(list.values.into_iter().map(value_to_json).collect())
        }
        Some(Kind::StructValue(value)) => struct_to_json(value),
    }
}
