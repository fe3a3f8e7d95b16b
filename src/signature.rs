//! D-Bus type signatures for method and signal arguments.
//!
//! A [`MemberSignature`] is the ordered list of complete D-Bus types that one
//! direction of a member carries: the input or output of a method, or the
//! payload of a signal. `"sa{ss}ay"` describes three argument slots: a string,
//! a string-to-string dictionary and a byte array.
//!
//! Signatures are parsed once at interface-definition time and used for two
//! things afterwards: argument-name/slot-count validation in the descriptor,
//! and runtime shape checks against incoming and outgoing values in the
//! dispatch and emitter layers.

use std::fmt;
use thiserror::Error;
use zbus::zvariant::{OwnedValue, Value};

/// Type codes for the primitive (single-character) D-Bus types.
///
/// `v` (variant) and `h` (file descriptor) are complete types of their own and
/// are treated as primitives here.
const PRIMITIVE_CODES: &str = "ybnqiuxtdsogvh";

/// Type codes allowed as dictionary keys (the D-Bus "basic" types).
const BASIC_CODES: &str = "ybnqiuxtdsog";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("unknown type code '{code}' at position {pos}")]
    UnknownTypeCode { code: char, pos: usize },

    #[error("unexpected '{code}' at position {pos}")]
    UnexpectedToken { code: char, pos: usize },

    #[error("array at position {pos} is missing an element type")]
    MissingArrayElement { pos: usize },

    #[error("struct opened at position {pos} is not terminated")]
    UnterminatedStruct { pos: usize },

    #[error("struct at position {pos} has no fields")]
    EmptyStruct { pos: usize },

    #[error("dict entry opened at position {pos} is not terminated")]
    UnterminatedDict { pos: usize },

    #[error("dict key at position {pos} must be a basic type")]
    NonBasicDictKey { pos: usize },

    #[error("dict entry at position {pos} must hold exactly one key and one value")]
    MalformedDictEntry { pos: usize },
}

/// One complete D-Bus type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    /// A single-character type: numeric, boolean, string-like, variant or fd.
    Primitive(char),
    /// `aX`: array of one element type.
    Array(Box<Slot>),
    /// `(X...)`: struct of one or more fields.
    Struct(Vec<Slot>),
    /// `a{kV}`: dictionary with a basic key type and any value type.
    Dict { key: char, value: Box<Slot> },
}

impl Slot {
    /// Render this slot back to its D-Bus signature string.
    pub fn dbus_type(&self) -> String {
        let mut out = String::new();
        self.write(&mut out);
        out
    }

    fn write(&self, out: &mut String) {
        match self {
            Slot::Primitive(code) => out.push(*code),
            Slot::Array(element) => {
                out.push('a');
                element.write(out);
            }
            Slot::Struct(fields) => {
                out.push('(');
                for field in fields {
                    field.write(out);
                }
                out.push(')');
            }
            Slot::Dict { key, value } => {
                out.push_str("a{");
                out.push(*key);
                value.write(out);
                out.push('}');
            }
        }
    }

    /// Whether a runtime value has exactly this slot's shape.
    ///
    /// The check compares the value's own signature against the declared one,
    /// so it covers nesting (array element types, struct fields, dict key and
    /// value types) without walking the value tree.
    pub fn matches(&self, value: &Value<'_>) -> bool {
        value.value_signature().to_string() == self.dbus_type()
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dbus_type())
    }
}

/// Ordered argument slots for one direction of a method, or a signal payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemberSignature {
    slots: Vec<Slot>,
}

impl MemberSignature {
    /// The empty signature (no arguments).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse a D-Bus signature string into argument slots.
    pub fn parse(signature: &str) -> Result<Self, SignatureError> {
        let chars: Vec<char> = signature.chars().collect();
        let mut pos = 0;
        let mut slots = Vec::new();
        while pos < chars.len() {
            let (slot, next) = parse_slot(&chars, pos)?;
            slots.push(slot);
            pos = next;
        }
        Ok(Self { slots })
    }

    /// Number of argument slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Check a value list against this signature.
    ///
    /// Returns `Err` with a caller-facing detail string naming the first
    /// offending argument, or the count mismatch.
    pub fn check(&self, values: &[Value<'_>]) -> Result<(), String> {
        self.check_len(values.len())?;
        for (index, (slot, value)) in self.slots.iter().zip(values).enumerate() {
            self.check_slot(index, slot, value)?;
        }
        Ok(())
    }

    /// Same as [`check`](Self::check), for owned value lists.
    pub fn check_owned(&self, values: &[OwnedValue]) -> Result<(), String> {
        self.check_len(values.len())?;
        for (index, (slot, value)) in self.slots.iter().zip(values).enumerate() {
            let value: &Value<'_> = value;
            self.check_slot(index, slot, value)?;
        }
        Ok(())
    }

    fn check_len(&self, got: usize) -> Result<(), String> {
        if got != self.slots.len() {
            return Err(format!(
                "expected {} argument(s), got {}",
                self.slots.len(),
                got
            ));
        }
        Ok(())
    }

    fn check_slot(&self, index: usize, slot: &Slot, value: &Value<'_>) -> Result<(), String> {
        if !slot.matches(value) {
            return Err(format!(
                "argument {} must have type \"{}\", got \"{}\"",
                index,
                slot,
                value.value_signature()
            ));
        }
        Ok(())
    }
}

impl fmt::Display for MemberSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for slot in &self.slots {
            f.write_str(&slot.dbus_type())?;
        }
        Ok(())
    }
}

fn parse_slot(chars: &[char], pos: usize) -> Result<(Slot, usize), SignatureError> {
    let code = chars[pos];
    if PRIMITIVE_CODES.contains(code) {
        return Ok((Slot::Primitive(code), pos + 1));
    }
    match code {
        'a' => parse_array(chars, pos),
        '(' => parse_struct(chars, pos),
        ')' | '}' | '{' => Err(SignatureError::UnexpectedToken { code, pos }),
        _ => Err(SignatureError::UnknownTypeCode { code, pos }),
    }
}

fn parse_array(chars: &[char], pos: usize) -> Result<(Slot, usize), SignatureError> {
    let element_pos = pos + 1;
    if element_pos >= chars.len() {
        return Err(SignatureError::MissingArrayElement { pos });
    }
    if chars[element_pos] == '{' {
        return parse_dict(chars, element_pos);
    }
    let (element, next) = parse_slot(chars, element_pos)?;
    Ok((Slot::Array(Box::new(element)), next))
}

fn parse_struct(chars: &[char], open: usize) -> Result<(Slot, usize), SignatureError> {
    let mut fields = Vec::new();
    let mut pos = open + 1;
    loop {
        if pos >= chars.len() {
            return Err(SignatureError::UnterminatedStruct { pos: open });
        }
        if chars[pos] == ')' {
            if fields.is_empty() {
                return Err(SignatureError::EmptyStruct { pos: open });
            }
            return Ok((Slot::Struct(fields), pos + 1));
        }
        let (field, next) = parse_slot(chars, pos)?;
        fields.push(field);
        pos = next;
    }
}

// `open` points at the '{'; the leading 'a' was consumed by parse_array.
fn parse_dict(chars: &[char], open: usize) -> Result<(Slot, usize), SignatureError> {
    let key_pos = open + 1;
    if key_pos >= chars.len() {
        return Err(SignatureError::UnterminatedDict { pos: open });
    }
    let key = chars[key_pos];
    if !BASIC_CODES.contains(key) {
        return Err(SignatureError::NonBasicDictKey { pos: key_pos });
    }
    let value_pos = key_pos + 1;
    if value_pos >= chars.len() {
        return Err(SignatureError::UnterminatedDict { pos: open });
    }
    if chars[value_pos] == '}' {
        return Err(SignatureError::MalformedDictEntry { pos: open });
    }
    let (value, next) = parse_slot(chars, value_pos)?;
    if next >= chars.len() {
        return Err(SignatureError::UnterminatedDict { pos: open });
    }
    if chars[next] != '}' {
        return Err(SignatureError::MalformedDictEntry { pos: open });
    }
    Ok((
        Slot::Dict {
            key,
            value: Box::new(value),
        },
        next + 1,
    ))
}
