//! Sparse volume updates.
//!
//! An update request arrives as a loose JSON object. Only `capacity_bytes`,
//! `options` and `struct` are mutable; immutable, read-only and unknown
//! fields are silently ignored. A mutable field carrying the wrong value
//! kind is rejected with a typed field error.

use crate::error::{Result, SiloError};
use crate::types::{Volume, VolumeOption};
use serde_json::{Map, Value};

/// Apply a sparse update map onto an existing volume.
pub fn apply_volume_update(volume: &mut Volume, updates: &Map<String, Value>) -> Result<()> {
    for (key, value) in updates {
        match key.as_str() {
            "capacity_bytes" => match value {
                Value::Number(number) => {
                    volume.capacity_bytes = number.as_f64().map(|f| f as i64).ok_or_else(|| {
                        SiloError::InvalidArgument(format!(
                            "capacity_bytes is not a representable number: {number}"
                        ))
                    })?;
                }
                other => {
                    return Err(SiloError::FieldType {
                        field: key.clone(),
                        expected: "number",
                        actual: kind_name(other),
                    })
                }
            },
            "options" => match value {
                Value::Array(_) => {
                    volume.options = serde_json::from_value::<Vec<VolumeOption>>(value.clone())
                        .map_err(|_| {
                            SiloError::InvalidArgument(
                                "options entries must be {key, value} string pairs".to_string(),
                            )
                        })?;
                }
                other => {
                    return Err(SiloError::FieldType {
                        field: key.clone(),
                        expected: "list",
                        actual: kind_name(other),
                    })
                }
            },
            "struct" => match value {
                Value::Object(_) => volume.attrs = value.clone(),
                other => {
                    return Err(SiloError::FieldType {
                        field: key.clone(),
                        expected: "object",
                        actual: kind_name(other),
                    })
                }
            },
            // Immutable, read-only, and unknown fields are ignored.
            _ => {}
        }
    }

    Ok(())
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{VolumeMode, VolumeStatus};
    use serde_json::json;

    fn volume() -> Volume {
        Volume {
            id: "vol_foo".into(),
            name: "foo".into(),
            dataset_id: "tank/vol_foo".into(),
            mode: VolumeMode::Filesystem,
            status: VolumeStatus::Initial,
            capacity_bytes: 1 << 30,
            sparse: false,
            options: Vec::new(),
            attrs: Value::Null,
            target_iqn: String::new(),
            initiator_iqn: String::new(),
            target_address: String::new(),
            mount_path: String::new(),
            create_time: 0,
            update_time: 0,
        }
    }

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn applies_capacity() {
        let mut v = volume();
        apply_volume_update(&mut v, &map(json!({"capacity_bytes": 2147483648u64}))).unwrap();
        assert_eq!(v.capacity_bytes, 2147483648);
    }

    #[test]
    fn wrong_capacity_kind_is_field_type_error() {
        let mut v = volume();
        let err =
            apply_volume_update(&mut v, &map(json!({"capacity_bytes": "not a number"})))
                .unwrap_err();
        match err {
            SiloError::FieldType { field, expected, actual } => {
                assert_eq!(field, "capacity_bytes");
                assert_eq!(expected, "number");
                assert_eq!(actual, "string");
            }
            other => panic!("expected FieldType, got {other:?}"),
        }
        // The volume was not modified.
        assert_eq!(v.capacity_bytes, 1 << 30);
    }

    #[test]
    fn applies_struct_object() {
        let mut v = volume();
        apply_volume_update(&mut v, &map(json!({"struct": {"owner": "alice"}}))).unwrap();
        assert_eq!(v.attrs, json!({"owner": "alice"}));
    }

    #[test]
    fn wrong_struct_kind_is_field_type_error() {
        let mut v = volume();
        let err = apply_volume_update(&mut v, &map(json!({"struct": [1, 2]}))).unwrap_err();
        assert!(matches!(
            err,
            SiloError::FieldType { expected: "object", actual: "list", .. }
        ));
    }

    #[test]
    fn applies_options_list() {
        let mut v = volume();
        apply_volume_update(
            &mut v,
            &map(json!({"options": [{"key": "compression", "value": "lz4"}]})),
        )
        .unwrap();
        assert_eq!(
            v.options,
            vec![VolumeOption { key: "compression".into(), value: "lz4".into() }]
        );
    }

    #[test]
    fn unknown_and_immutable_fields_are_ignored() {
        let mut v = volume();
        apply_volume_update(
            &mut v,
            &map(json!({
                "id": "vol_other",
                "dataset_id": "tank/vol_other",
                "status": "MOUNTED",
                "bogus": true,
            })),
        )
        .unwrap();
        assert_eq!(v.id, "vol_foo");
        assert_eq!(v.dataset_id, "tank/vol_foo");
        assert_eq!(v.status, VolumeStatus::Initial);
    }
}
