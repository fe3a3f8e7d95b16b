//! Conversions between D-Bus message bodies and argument value lists.
//!
//! Message bodies with more than zero arguments travel as a flattened
//! structure; these helpers move between that wire shape and the
//! `Vec<OwnedValue>` currency used by the dispatch table, the emitter and
//! the client.

use zbus::message::Message;
use zbus::zvariant::{OwnedValue, Structure, StructureBuilder, Value};

/// Extract a message body into owned argument values.
pub(crate) fn message_args(message: &Message) -> zbus::Result<Vec<OwnedValue>> {
    let body = message.body();
    if body.signature().to_string().is_empty() {
        return Ok(Vec::new());
    }
    let structure: Structure<'_> = body.deserialize()?;
    structure
        .fields()
        .iter()
        .map(|value| value.try_to_owned().map_err(Into::into))
        .collect()
}

/// Pack argument values into a body structure.
///
/// Callers must branch on `args.is_empty()` and send `&()` for empty bodies;
/// D-Bus has no empty structure.
pub(crate) fn args_structure(args: Vec<OwnedValue>) -> zbus::Result<Structure<'static>> {
    let mut builder = StructureBuilder::new();
    for value in args {
        builder = builder.append_field(Value::from(value));
    }
    builder.build().map_err(Into::into)
}
