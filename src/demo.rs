//! Placeholder protocol surface for the demo service.
//!
//! The descriptor built here mirrors a BLE protocol gateway: device listing,
//! connect/disconnect, discovery control and record read/write stubs, plus a
//! periodic `NewRecordSignal` broadcast. The handler bodies are canned
//! responses that exercise the registration and dispatch machinery without
//! talking to real hardware. Applications supply their own descriptor the
//! same way.

use std::collections::HashMap;

use tracing::info;
use zbus::zvariant::{Array, Dict, OwnedValue, Signature, StructureBuilder, Value};

use crate::descriptor::{DescriptorError, InterfaceDescriptor};
use crate::dispatch::HandlerError;
use crate::emitter::PayloadFn;

/// Signal broadcast by the demo emitter.
pub const RECORD_SIGNAL: &str = "NewRecordSignal";

const DRIVER: &str = "BLE";
const PROTOCOL_NAME: &str = "Bluetooth Low Energy";

fn owned<'a>(value: impl Into<Value<'a>>) -> Result<OwnedValue, HandlerError> {
    value
        .into()
        .try_to_owned()
        .map_err(|e| HandlerError::new(e.to_string()))
}

// Signature parsing and value construction report different error types.
fn variant_err(e: impl std::fmt::Display) -> HandlerError {
    HandlerError::new(e.to_string())
}

/// One canned `(id, protocol, name, status)` device row.
fn device_row() -> Result<Value<'static>, HandlerError> {
    let row = StructureBuilder::new()
        .append_field(Value::from("D0:37:02:2C:27:42".to_string()))
        .append_field(Value::from(DRIVER.to_string()))
        .append_field(Value::from("X10Pro".to_string()))
        .append_field(Value::from("AVAILABLE".to_string()))
        .build()
        .map_err(variant_err)?;
    Ok(Value::from(row))
}

/// Build the demo interface descriptor.
///
/// The interface name is chosen by the caller; the demo service uses its own
/// well-known name.
pub fn demo_interface(interface_name: &str) -> Result<InterfaceDescriptor, DescriptorError> {
    let builder = InterfaceDescriptor::builder(interface_name)?
        .method("Echo", "s", "s", &["text"], &["reply"], Ok)?
        .method("Driver", "", "s", &[], &["driver"], |_| {
            Ok(vec![owned(DRIVER)?])
        })?
        .method("Name", "", "s", &[], &["name"], |_| {
            Ok(vec![owned(PROTOCOL_NAME)?])
        })?
        .method("Status", "", "s", &[], &["status"], |_| {
            Ok(vec![owned("READY")?])
        })?
        .method("DiscoveryStatus", "", "s", &[], &["status"], |_| {
            Ok(vec![owned("NONE")?])
        })?
        .method("Devices", "", "a(ssss)", &[], &["devices"], |_| {
            let element = Signature::try_from("(ssss)").map_err(variant_err)?;
            let mut devices = Array::new(&element);
            devices.append(device_row()?).map_err(variant_err)?;
            Ok(vec![owned(devices)?])
        })?
        .method(
            "DeviceStatus",
            "s",
            "(s)",
            &["device"],
            &["status"],
            |_| {
                let status = StructureBuilder::new()
                    .append_field(Value::from("DISCONNECTED".to_string()))
                    .build()
                    .map_err(variant_err)?;
                Ok(vec![owned(status)?])
            },
        )?
        .method("Connect", "s", "", &["device"], &[], |args| {
            info!("Connect requested for {}", display_arg(&args, 0));
            Ok(vec![])
        })?
        .method("Disconnect", "s", "", &["device"], &[], |args| {
            info!("Disconnect requested for {}", display_arg(&args, 0));
            Ok(vec![])
        })?
        .method("StartDiscovery", "", "", &[], &[], |_| {
            info!("Starting discovery");
            Ok(vec![])
        })?
        .method("StopDiscovery", "", "", &[], &[], |_| {
            info!("Stopping discovery");
            Ok(vec![])
        })?
        .method("Data", "", "ay", &[], &["data"], |_| {
            Ok(vec![owned(Vec::<u8>::new())?])
        })?
        .method(
            "Read",
            "sa{ss}",
            "ay",
            &["device", "profile"],
            &["record"],
            |_| Ok(vec![owned(Vec::<u8>::new())?]),
        )?
        .method(
            "NotificationRead",
            "sa{ss}",
            "ay",
            &["device", "profile"],
            &["record"],
            |_| Ok(vec![owned(Vec::<u8>::new())?]),
        )?
        .method(
            "Subscribe",
            "sa{ss}",
            "",
            &["device", "profile"],
            &[],
            |args| {
                info!("Subscribe requested for {}", display_arg(&args, 0));
                Ok(vec![])
            },
        )?
        .method(
            "Unsubscribe",
            "sa{ss}",
            "",
            &["device", "profile"],
            &[],
            |args| {
                info!("Unsubscribe requested for {}", display_arg(&args, 0));
                Ok(vec![])
            },
        )?
        .method(
            "Write",
            "sa{ss}ay",
            "",
            &["device", "profile", "payload"],
            &[],
            |args| {
                info!("Write requested for {}", display_arg(&args, 0));
                Ok(vec![])
            },
        )?
        .signal(RECORD_SIGNAL, "aysa{ss}", &["data", "device", "profile"])?;
    Ok(builder.build())
}

/// Fixed demo payload for [`RECORD_SIGNAL`]: two record bytes, a device
/// address and a profile dictionary.
pub fn record_payload() -> PayloadFn {
    Box::new(|| {
        let mut profile = HashMap::new();
        profile.insert("profile", "test1");
        let profile: Dict<'_, '_> = profile.into();
        Ok(vec![
            owned(vec![0x31u8, 0x32])?,
            owned("D0:11:22:33:44:55")?,
            owned(profile)?,
        ])
    })
}

fn display_arg(args: &[OwnedValue], index: usize) -> String {
    args.get(index)
        .map(|value| value.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchTable;
    use std::sync::Arc;

    const IFACE: &str = "com.example.Demo";
    const PATH: &str = "/com/example/Demo";

    fn table() -> DispatchTable {
        DispatchTable::new(PATH, Arc::new(demo_interface(IFACE).unwrap()))
    }

    #[test]
    fn test_echo_returns_input() {
        let out = table()
            .dispatch(
                PATH,
                IFACE,
                "Echo",
                vec![Value::from("hi").try_to_owned().unwrap()],
            )
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(String::try_from(out[0].clone()).unwrap(), "hi");
    }

    #[test]
    fn test_driver_and_name() {
        let table = table();
        let driver = table.dispatch(PATH, IFACE, "Driver", vec![]).unwrap();
        assert_eq!(String::try_from(driver[0].clone()).unwrap(), "BLE");
        let name = table.dispatch(PATH, IFACE, "Name", vec![]).unwrap();
        assert_eq!(
            String::try_from(name[0].clone()).unwrap(),
            "Bluetooth Low Energy"
        );
    }

    #[test]
    fn test_devices_shape() {
        let out = table().dispatch(PATH, IFACE, "Devices", vec![]).unwrap();
        assert_eq!(out[0].value_signature().to_string(), "a(ssss)");
    }

    #[test]
    fn test_record_payload_matches_declared_signature() {
        let descriptor = demo_interface(IFACE).unwrap();
        let entry = descriptor.signal(RECORD_SIGNAL).unwrap();
        let payload = record_payload()().unwrap();
        entry.payload().check_owned(&payload).unwrap();
    }

    #[test]
    fn test_all_members_have_arg_names() {
        let descriptor = demo_interface(IFACE).unwrap();
        for method in descriptor.methods() {
            assert_eq!(method.input_names().len(), method.input().len());
            assert_eq!(method.output_names().len(), method.output().len());
        }
    }
}
