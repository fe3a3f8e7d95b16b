//! Declarative interface descriptions.
//!
//! An [`InterfaceDescriptor`] is the full self-description of one exported
//! D-Bus interface: its methods (name, input/output signatures, argument
//! names, handler) and its signals (name, payload signature, argument names).
//! It is built once before export through [`InterfaceBuilder`], which rejects
//! duplicate member names, argument-name lists that do not match their
//! signature's slot count, and malformed names or signatures. After `build()`
//! the descriptor is immutable and shared read-only for the process lifetime.

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;
use thiserror::Error;

use crate::dispatch::MethodHandler;
use crate::signature::{MemberSignature, SignatureError};

#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("invalid interface name '{0}'")]
    InvalidInterfaceName(String),

    #[error("invalid member name '{0}'")]
    InvalidMemberName(String),

    #[error("invalid {direction} signature for '{member}': {source}")]
    InvalidSignature {
        member: String,
        direction: &'static str,
        source: SignatureError,
    },

    #[error(
        "'{member}' declares {names} {direction} argument name(s) \
         for {slots} signature slot(s)"
    )]
    ArgNameCount {
        member: String,
        direction: &'static str,
        names: usize,
        slots: usize,
    },

    #[error("duplicate method '{0}'")]
    DuplicateMethod(String),

    #[error("duplicate signal '{0}'")]
    DuplicateSignal(String),
}

/// One method of an interface: signatures, argument names and the handler
/// callback invoked by the dispatch table. Immutable once built.
#[derive(Clone)]
pub struct MethodEntry {
    name: String,
    input: MemberSignature,
    output: MemberSignature,
    input_names: Vec<String>,
    output_names: Vec<String>,
    handler: Arc<MethodHandler>,
}

impl MethodEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input(&self) -> &MemberSignature {
        &self.input
    }

    pub fn output(&self) -> &MemberSignature {
        &self.output
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    pub(crate) fn handler(&self) -> &MethodHandler {
        self.handler.as_ref()
    }
}

impl fmt::Debug for MethodEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodEntry")
            .field("name", &self.name)
            .field("input", &self.input.to_string())
            .field("output", &self.output.to_string())
            .finish_non_exhaustive()
    }
}

/// One broadcast signal of an interface.
#[derive(Debug, Clone)]
pub struct SignalEntry {
    name: String,
    payload: MemberSignature,
    payload_names: Vec<String>,
}

impl SignalEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &MemberSignature {
        &self.payload
    }

    pub fn payload_names(&self) -> &[String] {
        &self.payload_names
    }
}

/// Immutable description of one exported interface.
#[derive(Debug)]
pub struct InterfaceDescriptor {
    interface_name: String,
    methods: BTreeMap<String, MethodEntry>,
    signals: BTreeMap<String, SignalEntry>,
}

impl InterfaceDescriptor {
    /// Start building a descriptor for the given interface name.
    pub fn builder(interface_name: &str) -> Result<InterfaceBuilder, DescriptorError> {
        if !is_valid_interface_name(interface_name) {
            return Err(DescriptorError::InvalidInterfaceName(
                interface_name.to_string(),
            ));
        }
        Ok(InterfaceBuilder {
            interface_name: interface_name.to_string(),
            methods: BTreeMap::new(),
            signals: BTreeMap::new(),
        })
    }

    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    pub fn method(&self, name: &str) -> Option<&MethodEntry> {
        self.methods.get(name)
    }

    pub fn signal(&self, name: &str) -> Option<&SignalEntry> {
        self.signals.get(name)
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodEntry> {
        self.methods.values()
    }

    pub fn signals(&self) -> impl Iterator<Item = &SignalEntry> {
        self.signals.values()
    }

    /// Render the `org.freedesktop.DBus.Introspectable` XML for this
    /// interface at the given object path.
    pub fn introspect_xml(&self, object_path: &str) -> String {
        let mut xml = String::new();
        xml.push_str(
            "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n \
             \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n",
        );
        let _ = writeln!(xml, "<node name=\"{}\">", object_path);
        let _ = writeln!(xml, "  <interface name=\"{}\">", self.interface_name);
        for method in self.methods.values() {
            let _ = writeln!(xml, "    <method name=\"{}\">", method.name);
            for (slot, name) in method.input.slots().iter().zip(&method.input_names) {
                let _ = writeln!(
                    xml,
                    "      <arg name=\"{}\" type=\"{}\" direction=\"in\"/>",
                    name,
                    slot.dbus_type()
                );
            }
            for (slot, name) in method.output.slots().iter().zip(&method.output_names) {
                let _ = writeln!(
                    xml,
                    "      <arg name=\"{}\" type=\"{}\" direction=\"out\"/>",
                    name,
                    slot.dbus_type()
                );
            }
            xml.push_str("    </method>\n");
        }
        for signal in self.signals.values() {
            let _ = writeln!(xml, "    <signal name=\"{}\">", signal.name);
            for (slot, name) in signal.payload.slots().iter().zip(&signal.payload_names) {
                let _ = writeln!(
                    xml,
                    "      <arg name=\"{}\" type=\"{}\"/>",
                    name,
                    slot.dbus_type()
                );
            }
            xml.push_str("    </signal>\n");
        }
        xml.push_str("  </interface>\n");
        xml.push_str(
            "  <interface name=\"org.freedesktop.DBus.Introspectable\">\n    \
             <method name=\"Introspect\">\n      \
             <arg name=\"xml_data\" type=\"s\" direction=\"out\"/>\n    \
             </method>\n  </interface>\n",
        );
        xml.push_str("</node>\n");
        xml
    }
}

/// Builder for [`InterfaceDescriptor`]; validates every entry as it is added.
#[derive(Debug)]
pub struct InterfaceBuilder {
    interface_name: String,
    methods: BTreeMap<String, MethodEntry>,
    signals: BTreeMap<String, SignalEntry>,
}

impl InterfaceBuilder {
    /// Declare a method with its handler.
    ///
    /// `input`/`output` are D-Bus signature strings; the name slices must
    /// match their slot counts exactly.
    pub fn method<F>(
        mut self,
        name: &str,
        input: &str,
        output: &str,
        input_names: &[&str],
        output_names: &[&str],
        handler: F,
    ) -> Result<Self, DescriptorError>
    where
        F: Fn(Vec<zbus::zvariant::OwnedValue>) -> crate::dispatch::HandlerResult
            + Send
            + Sync
            + 'static,
    {
        if !is_valid_member_name(name) {
            return Err(DescriptorError::InvalidMemberName(name.to_string()));
        }
        if self.methods.contains_key(name) {
            return Err(DescriptorError::DuplicateMethod(name.to_string()));
        }
        let input = parse_member_signature(name, "input", input)?;
        let output = parse_member_signature(name, "output", output)?;
        check_arg_names(name, "input", &input, input_names)?;
        check_arg_names(name, "output", &output, output_names)?;
        self.methods.insert(
            name.to_string(),
            MethodEntry {
                name: name.to_string(),
                input,
                output,
                input_names: input_names.iter().map(|s| s.to_string()).collect(),
                output_names: output_names.iter().map(|s| s.to_string()).collect(),
                handler: Arc::new(handler),
            },
        );
        Ok(self)
    }

    /// Declare a broadcast signal.
    pub fn signal(
        mut self,
        name: &str,
        payload: &str,
        payload_names: &[&str],
    ) -> Result<Self, DescriptorError> {
        if !is_valid_member_name(name) {
            return Err(DescriptorError::InvalidMemberName(name.to_string()));
        }
        if self.signals.contains_key(name) {
            return Err(DescriptorError::DuplicateSignal(name.to_string()));
        }
        let payload = parse_member_signature(name, "payload", payload)?;
        check_arg_names(name, "payload", &payload, payload_names)?;
        self.signals.insert(
            name.to_string(),
            SignalEntry {
                name: name.to_string(),
                payload,
                payload_names: payload_names.iter().map(|s| s.to_string()).collect(),
            },
        );
        Ok(self)
    }

    pub fn build(self) -> InterfaceDescriptor {
        InterfaceDescriptor {
            interface_name: self.interface_name,
            methods: self.methods,
            signals: self.signals,
        }
    }
}

fn parse_member_signature(
    member: &str,
    direction: &'static str,
    signature: &str,
) -> Result<MemberSignature, DescriptorError> {
    MemberSignature::parse(signature).map_err(|source| DescriptorError::InvalidSignature {
        member: member.to_string(),
        direction,
        source,
    })
}

fn check_arg_names(
    member: &str,
    direction: &'static str,
    signature: &MemberSignature,
    names: &[&str],
) -> Result<(), DescriptorError> {
    if names.len() != signature.len() {
        return Err(DescriptorError::ArgNameCount {
            member: member.to_string(),
            direction,
            names: names.len(),
            slots: signature.len(),
        });
    }
    Ok(())
}

/// D-Bus member names: `[A-Za-z_][A-Za-z0-9_]*`, at most 255 bytes.
pub fn is_valid_member_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 {
        return false;
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap_or('0');
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// D-Bus interface names: two or more dot-separated member-like elements,
/// at most 255 bytes total.
pub fn is_valid_interface_name(name: &str) -> bool {
    if name.len() > 255 {
        return false;
    }
    let elements: Vec<&str> = name.split('.').collect();
    elements.len() >= 2 && elements.iter().all(|e| is_valid_member_name(e))
}
