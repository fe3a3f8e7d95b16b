//! Call routing from the bus into handler callbacks.
//!
//! The [`DispatchTable`] binds an [`InterfaceDescriptor`] to a fixed object
//! path and routes each inbound `(path, interface, member, args)` tuple to
//! the matching handler. Argument values are validated against the declared
//! input signature before the handler runs, and the handler's return values
//! are validated against the declared output signature before they are
//! marshalled back to the caller.
//!
//! The table is read-only after export: lookups need no locking, and handler
//! invocations may run concurrently (one task per inbound call). A failing
//! handler only fails its own call.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};
use zbus::zvariant::OwnedValue;

use crate::descriptor::InterfaceDescriptor;

/// Domain error reported by a handler callback.
///
/// Carries only a caller-facing detail string; it is mapped to
/// `org.freedesktop.DBus.Error.Failed` on the bus.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self(detail.into())
    }
}

pub type HandlerResult = Result<Vec<OwnedValue>, HandlerError>;

/// Callback bound to one method entry.
///
/// Handlers are expected to be fast and non-blocking; long work belongs in a
/// task of their own, with completion reported through the call's reply.
pub type MethodHandler = dyn Fn(Vec<OwnedValue>) -> HandlerResult + Send + Sync;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no method '{member}' on '{interface}' at '{path}'")]
    NotFound {
        path: String,
        interface: String,
        member: String,
    },

    #[error("invalid arguments for '{member}': {detail}")]
    InvalidArgs { member: String, detail: String },

    #[error("'{member}' failed: {detail}")]
    HandlerFailed { member: String, detail: String },

    #[error("handler for '{member}' declared output \"{declared}\" but returned: {detail}")]
    ResultMismatch {
        member: String,
        declared: String,
        detail: String,
    },
}

impl DispatchError {
    /// The D-Bus error name this error is reported under.
    pub fn dbus_error_name(&self, interface: &str) -> String {
        match self {
            DispatchError::NotFound { .. } => {
                "org.freedesktop.DBus.Error.UnknownMethod".to_string()
            }
            DispatchError::InvalidArgs { .. } => {
                "org.freedesktop.DBus.Error.InvalidArgs".to_string()
            }
            DispatchError::HandlerFailed { .. } => "org.freedesktop.DBus.Error.Failed".to_string(),
            DispatchError::ResultMismatch { .. } => format!("{}.Error.ResultMismatch", interface),
        }
    }

    /// Whether this error is an internal service defect rather than a
    /// caller or domain problem.
    pub fn is_service_defect(&self) -> bool {
        matches!(self, DispatchError::ResultMismatch { .. })
    }
}

/// Routes inbound calls to the handlers of one exported interface.
pub struct DispatchTable {
    object_path: String,
    descriptor: Arc<InterfaceDescriptor>,
}

impl DispatchTable {
    pub fn new(object_path: impl Into<String>, descriptor: Arc<InterfaceDescriptor>) -> Self {
        Self {
            object_path: object_path.into(),
            descriptor,
        }
    }

    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    pub fn descriptor(&self) -> &Arc<InterfaceDescriptor> {
        &self.descriptor
    }

    /// Route one inbound call.
    ///
    /// Lookup is exact-match on the `(path, interface, member)` triple.
    /// Malformed input never reaches the handler; a conforming call with a
    /// conforming handler never produces a dispatch-level error.
    pub fn dispatch(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        args: Vec<OwnedValue>,
    ) -> Result<Vec<OwnedValue>, DispatchError> {
        let entry = if path == self.object_path && interface == self.descriptor.interface_name() {
            self.descriptor.method(member)
        } else {
            None
        };
        let entry = entry.ok_or_else(|| DispatchError::NotFound {
            path: path.to_string(),
            interface: interface.to_string(),
            member: member.to_string(),
        })?;

        entry
            .input()
            .check_owned(&args)
            .map_err(|detail| DispatchError::InvalidArgs {
                member: member.to_string(),
                detail,
            })?;

        let output = (entry.handler())(args).map_err(|err| {
            warn!("handler '{}' reported: {}", member, err);
            DispatchError::HandlerFailed {
                member: member.to_string(),
                detail: err.to_string(),
            }
        })?;

        if let Err(detail) = entry.output().check_owned(&output) {
            let mismatch = DispatchError::ResultMismatch {
                member: member.to_string(),
                declared: entry.output().to_string(),
                detail,
            };
            // Contract violation inside the service, not a caller problem.
            error!("{}", mismatch);
            return Err(mismatch);
        }
        Ok(output)
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("object_path", &self.object_path)
            .field("interface", &self.descriptor.interface_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::InterfaceDescriptor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use zbus::zvariant::Value;

    const PATH: &str = "/com/example/Demo";
    const IFACE: &str = "com.example.Demo";

    fn owned(value: Value<'_>) -> OwnedValue {
        value.try_to_owned().unwrap()
    }

    fn echo_table() -> (DispatchTable, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let descriptor = InterfaceDescriptor::builder(IFACE)
            .unwrap()
            .method("Echo", "s", "s", &["text"], &["reply"], move |args| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(args)
            })
            .unwrap()
            .method("Fail", "", "", &[], &[], |_| {
                Err(HandlerError::new("device not connected"))
            })
            .unwrap()
            .method("Broken", "", "s", &[], &["reply"], |_| Ok(vec![]))
            .unwrap()
            .method("StartDiscovery", "", "", &[], &[], |_| Ok(vec![]))
            .unwrap()
            .build();
        (DispatchTable::new(PATH, Arc::new(descriptor)), calls)
    }

    #[test]
    fn test_conforming_call_succeeds() {
        let (table, calls) = echo_table();
        let out = table
            .dispatch(PATH, IFACE, "Echo", vec![owned(Value::from("hi"))])
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value_signature().to_string(), "s");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wrong_arg_count_fails_before_handler() {
        let (table, calls) = echo_table();
        let err = table.dispatch(PATH, IFACE, "Echo", vec![]).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArgs { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wrong_arg_type_fails_before_handler() {
        let (table, calls) = echo_table();
        let err = table
            .dispatch(PATH, IFACE, "Echo", vec![owned(Value::from(7u32))])
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArgs { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unknown_member_not_found() {
        let (table, calls) = echo_table();
        let err = table.dispatch(PATH, IFACE, "Unknown", vec![]).unwrap_err();
        assert!(matches!(err, DispatchError::NotFound { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wrong_path_or_interface_not_found() {
        let (table, _) = echo_table();
        let err = table
            .dispatch("/somewhere/else", IFACE, "Echo", vec![owned(Value::from("hi"))])
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotFound { .. }));
        let err = table
            .dispatch(PATH, "com.example.Other", "Echo", vec![owned(Value::from("hi"))])
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotFound { .. }));
    }

    #[test]
    fn test_handler_domain_error_propagates() {
        let (table, _) = echo_table();
        let err = table.dispatch(PATH, IFACE, "Fail", vec![]).unwrap_err();
        match &err {
            DispatchError::HandlerFailed { detail, .. } => {
                assert_eq!(detail, "device not connected");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!err.is_service_defect());
        assert_eq!(
            err.dbus_error_name(IFACE),
            "org.freedesktop.DBus.Error.Failed"
        );
    }

    #[test]
    fn test_result_mismatch_is_service_defect() {
        let (table, _) = echo_table();
        let err = table.dispatch(PATH, IFACE, "Broken", vec![]).unwrap_err();
        assert!(matches!(err, DispatchError::ResultMismatch { .. }));
        assert!(err.is_service_defect());
        assert_eq!(
            err.dbus_error_name(IFACE),
            "com.example.Demo.Error.ResultMismatch"
        );
    }

    #[test]
    fn test_empty_output_contract() {
        let (table, _) = echo_table();
        let out = table
            .dispatch(PATH, IFACE, "StartDiscovery", vec![])
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_not_found_error_name() {
        let (table, _) = echo_table();
        let err = table.dispatch(PATH, IFACE, "Nope", vec![]).unwrap_err();
        assert_eq!(
            err.dbus_error_name(IFACE),
            "org.freedesktop.DBus.Error.UnknownMethod"
        );
    }
}
