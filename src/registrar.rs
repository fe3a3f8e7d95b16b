//! Service startup: bus name ownership and interface export.
//!
//! The [`ServiceRegistrar`] drives the startup state machine
//!
//! ```text
//! Unregistered -> NameRequested -> NameOwned -> Exported
//!                              \-> NameRejected (terminal)
//! ```
//!
//! Name requests use DO_NOT_QUEUE; only an explicit exclusive grant
//! (`PrimaryOwner`) moves the machine forward. Any other reply is a fatal
//! startup failure: nothing is exported, and the caller is expected to exit
//! non-zero. There is no retry and no queueing, so a service is never
//! reachable under a name it does not exclusively own.
//!
//! Once the name is owned, the registrar exports the dispatch table at its
//! fixed object path by spawning a serve loop over the connection's message
//! stream. Each inbound call is handled on its own task; per-call errors are
//! isolated to that call's reply.

use std::sync::Arc;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use zbus::fdo::{RequestNameFlags, RequestNameReply};
use zbus::message::{Message, Type as MessageType};
use zbus::{Connection, MessageStream};

use crate::dispatch::DispatchTable;
use crate::emitter::{BusSink, PayloadFn, SignalEmitter, SignalSink};
use crate::wire;

const INTROSPECTABLE: &str = "org.freedesktop.DBus.Introspectable";

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("bus connection failed: {0}")]
    Connection(#[from] zbus::Error),

    #[error("bus name '{name}' was not granted exclusively: {reason}")]
    NameRejected { name: String, reason: String },

    #[error("cannot register from state {0:?}")]
    AlreadyRegistered(RegistrarState),

    #[error("no signal '{0}' declared on the exported interface")]
    UnknownSignal(String),
}

/// Startup states. `NameRejected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrarState {
    Unregistered,
    NameRequested,
    NameOwned,
    Exported,
    NameRejected,
}

/// Owns the service's bus name, dispatch table and serve loop.
pub struct ServiceRegistrar {
    service_name: String,
    table: Arc<DispatchTable>,
    state: RegistrarState,
    connection: Option<Connection>,
    serve_task: Option<JoinHandle<()>>,
}

impl ServiceRegistrar {
    pub fn new(service_name: impl Into<String>, table: Arc<DispatchTable>) -> Self {
        Self {
            service_name: service_name.into(),
            table,
            state: RegistrarState::Unregistered,
            connection: None,
            serve_task: None,
        }
    }

    pub fn state(&self) -> RegistrarState {
        self.state
    }

    pub fn table(&self) -> &Arc<DispatchTable> {
        &self.table
    }

    /// Claim the well-known name and export the interface.
    ///
    /// On success the service is live: inbound calls are dispatched until
    /// [`shutdown`](Self::shutdown) or process exit. On rejection the
    /// registrar is left in its terminal state and nothing was exported.
    pub async fn register(&mut self, connection: Connection) -> Result<(), ServiceError> {
        self.ensure_unregistered()?;

        self.state = RegistrarState::NameRequested;
        info!("requesting bus name '{}'", self.service_name);
        match connection
            .request_name_with_flags(self.service_name.as_str(), RequestNameFlags::DoNotQueue.into())
            .await
        {
            Ok(reply) => self.note_name_reply(reply)?,
            Err(err) => return Err(self.note_name_error(err)),
        }

        let task = tokio::spawn(serve_loop(connection.clone(), self.table.clone()));
        self.connection = Some(connection);
        self.serve_task = Some(task);
        self.state = RegistrarState::Exported;
        info!(
            "'{}' exported at '{}', ready to receive calls",
            self.service_name,
            self.table.object_path()
        );
        Ok(())
    }

    /// Build an emitter for one of the exported interface's signals.
    ///
    /// If the registrar never reached `Exported`, the emitter has no sink
    /// and every emission is a logged no-op rather than a failure.
    pub fn emitter(
        &self,
        signal_name: &str,
        payload: PayloadFn,
    ) -> Result<SignalEmitter, ServiceError> {
        let entry = self
            .table
            .descriptor()
            .signal(signal_name)
            .ok_or_else(|| ServiceError::UnknownSignal(signal_name.to_string()))?
            .clone();
        let sink: Option<Arc<dyn SignalSink>> = match (&self.connection, self.state) {
            (Some(connection), RegistrarState::Exported) => Some(Arc::new(BusSink::new(
                connection.clone(),
                self.table.object_path(),
                self.table.descriptor().interface_name(),
            ))),
            _ => None,
        };
        Ok(SignalEmitter::new(entry, sink, payload))
    }

    /// Stop serving and release the name.
    pub async fn shutdown(&mut self) {
        if let Some(task) = self.serve_task.take() {
            task.abort();
        }
        if let Some(connection) = self.connection.take() {
            if let Err(err) = connection.release_name(self.service_name.as_str()).await {
                debug!("failed to release '{}': {}", self.service_name, err);
            }
        }
        self.state = RegistrarState::Unregistered;
    }

    fn ensure_unregistered(&self) -> Result<(), ServiceError> {
        if self.state != RegistrarState::Unregistered {
            return Err(ServiceError::AlreadyRegistered(self.state));
        }
        Ok(())
    }

    fn note_name_reply(&mut self, reply: RequestNameReply) -> Result<(), ServiceError> {
        if matches!(reply, RequestNameReply::PrimaryOwner) {
            self.state = RegistrarState::NameOwned;
            Ok(())
        } else {
            // Queued or owned elsewhere: fatal, never retried.
            self.state = RegistrarState::NameRejected;
            Err(ServiceError::NameRejected {
                name: self.service_name.clone(),
                reason: format!("request returned {:?}", reply),
            })
        }
    }

    // Under DO_NOT_QUEUE the bus reports an already-owned name as a
    // `NameTaken` error, not as a reply variant.
    fn note_name_error(&mut self, err: zbus::Error) -> ServiceError {
        self.state = RegistrarState::NameRejected;
        match err {
            zbus::Error::NameTaken => ServiceError::NameRejected {
                name: self.service_name.clone(),
                reason: "name is already owned".to_string(),
            },
            other => ServiceError::Connection(other),
        }
    }
}

async fn serve_loop(connection: Connection, table: Arc<DispatchTable>) {
    let mut stream = MessageStream::from(&connection);
    while let Some(next) = stream.next().await {
        let message = match next {
            Ok(message) => message,
            Err(err) => {
                debug!("message stream error: {}", err);
                continue;
            }
        };
        if message.message_type() != MessageType::MethodCall {
            continue;
        }
        // One task per call; a slow handler must not hold up the stream.
        let connection = connection.clone();
        let table = table.clone();
        tokio::spawn(async move {
            respond(connection, table, message).await;
        });
    }
    debug!("message stream closed, serve loop exiting");
}

async fn respond(connection: Connection, table: Arc<DispatchTable>, message: Message) {
    let reply = match build_reply(&table, &message) {
        Ok(reply) => reply,
        Err(err) => {
            debug!("failed to build reply: {}", err);
            return;
        }
    };
    // The caller may have abandoned the call; a failed send is not ours to fix.
    if let Err(err) = connection.send(&reply).await {
        debug!("failed to send reply: {}", err);
    }
}

fn build_reply(table: &DispatchTable, message: &Message) -> zbus::Result<Message> {
    let header = message.header();
    let member = match header.member() {
        Some(member) => member.to_string(),
        None => {
            return Message::error(&header, "org.freedesktop.DBus.Error.InvalidArgs")?
                .build(&("method call without member",));
        }
    };
    let path = header.path().map(|p| p.to_string()).unwrap_or_default();
    // A call may omit the interface; the exported one is the only candidate.
    let interface = header
        .interface()
        .map(|i| i.to_string())
        .unwrap_or_else(|| table.descriptor().interface_name().to_string());

    if interface == INTROSPECTABLE && member == "Introspect" {
        // Only the exported path carries the interface; anything else is an
        // empty node.
        let xml = if path == table.object_path() {
            table.descriptor().introspect_xml(table.object_path())
        } else {
            empty_node_xml(&path)
        };
        return Message::method_return(&header)?.build(&(xml.as_str(),));
    }

    let args = match wire::message_args(message) {
        Ok(args) => args,
        Err(err) => {
            return Message::error(&header, "org.freedesktop.DBus.Error.InvalidArgs")?
                .build(&(err.to_string(),));
        }
    };

    match table.dispatch(&path, &interface, &member, args) {
        Ok(output) if output.is_empty() => Message::method_return(&header)?.build(&()),
        Ok(output) => Message::method_return(&header)?.build(&wire::args_structure(output)?),
        Err(err) => {
            let name = err.dbus_error_name(table.descriptor().interface_name());
            Message::error(&header, name.as_str())?.build(&(err.to_string(),))
        }
    }
}

fn empty_node_xml(path: &str) -> String {
    format!(
        "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n \
         \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n\
         <node name=\"{}\"/>\n",
        path
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::InterfaceDescriptor;

    fn test_registrar() -> ServiceRegistrar {
        let descriptor = InterfaceDescriptor::builder("com.example.Demo")
            .unwrap()
            .method("Echo", "s", "s", &["text"], &["reply"], Ok)
            .unwrap()
            .signal("Tick", "u", &["count"])
            .unwrap()
            .build();
        let table = DispatchTable::new("/com/example/Demo", Arc::new(descriptor));
        ServiceRegistrar::new("com.example.Demo", Arc::new(table))
    }

    #[test]
    fn test_exclusive_grant_owns_name() {
        let mut registrar = test_registrar();
        registrar.state = RegistrarState::NameRequested;
        registrar
            .note_name_reply(RequestNameReply::PrimaryOwner)
            .unwrap();
        assert_eq!(registrar.state(), RegistrarState::NameOwned);
    }

    #[test]
    fn test_non_exclusive_grants_are_rejected() {
        for reply in [
            RequestNameReply::InQueue,
            RequestNameReply::Exists,
            RequestNameReply::AlreadyOwner,
        ] {
            let mut registrar = test_registrar();
            registrar.state = RegistrarState::NameRequested;
            let err = registrar.note_name_reply(reply).unwrap_err();
            assert!(matches!(err, ServiceError::NameRejected { .. }));
            assert_eq!(registrar.state(), RegistrarState::NameRejected);
        }
    }

    #[test]
    fn test_name_taken_is_a_rejection_not_a_connection_failure() {
        let mut registrar = test_registrar();
        registrar.state = RegistrarState::NameRequested;
        let err = registrar.note_name_error(zbus::Error::NameTaken);
        assert!(matches!(err, ServiceError::NameRejected { .. }));
        assert_eq!(registrar.state(), RegistrarState::NameRejected);
    }

    #[test]
    fn test_other_request_errors_are_connection_failures() {
        let mut registrar = test_registrar();
        registrar.state = RegistrarState::NameRequested;
        let err = registrar.note_name_error(zbus::Error::InvalidReply);
        assert!(matches!(err, ServiceError::Connection(_)));
    }

    #[test]
    fn test_rejection_is_terminal() {
        let mut registrar = test_registrar();
        registrar.state = RegistrarState::NameRequested;
        let _ = registrar.note_name_reply(RequestNameReply::Exists);

        // No export happened and a further register attempt is refused.
        let err = registrar.ensure_unregistered().unwrap_err();
        assert!(matches!(
            err,
            ServiceError::AlreadyRegistered(RegistrarState::NameRejected)
        ));
    }

    #[test]
    fn test_unexported_registrar_yields_disconnected_emitter() {
        let registrar = test_registrar();
        let emitter = registrar
            .emitter("Tick", Box::new(|| Ok(vec![])))
            .unwrap();
        assert!(!emitter.is_connected());
    }

    fn introspect_call(path: &str) -> Message {
        Message::method_call(path, "Introspect")
            .unwrap()
            .destination("com.example.Demo")
            .unwrap()
            .interface(INTROSPECTABLE)
            .unwrap()
            .build(&())
            .unwrap()
    }

    #[test]
    fn test_introspect_describes_only_the_exported_path() {
        let registrar = test_registrar();

        let reply = build_reply(registrar.table(), &introspect_call("/com/example/Demo")).unwrap();
        let xml: String = reply.body().deserialize().unwrap();
        assert!(xml.contains("<interface name=\"com.example.Demo\">"));

        let reply = build_reply(registrar.table(), &introspect_call("/somewhere/else")).unwrap();
        let xml: String = reply.body().deserialize().unwrap();
        assert!(xml.contains("<node name=\"/somewhere/else\"/>"));
        assert!(!xml.contains("<interface"));
    }

    #[test]
    fn test_unknown_member_reply_is_a_bus_error() {
        let registrar = test_registrar();
        let message = Message::method_call("/com/example/Demo", "Nope")
            .unwrap()
            .destination("com.example.Demo")
            .unwrap()
            .interface("com.example.Demo")
            .unwrap()
            .build(&())
            .unwrap();
        let reply = build_reply(registrar.table(), &message).unwrap();
        assert_eq!(reply.message_type(), MessageType::Error);
        assert_eq!(
            reply.header().error_name().unwrap().as_str(),
            "org.freedesktop.DBus.Error.UnknownMethod"
        );
    }

    #[test]
    fn test_unknown_signal_rejected() {
        let registrar = test_registrar();
        let err = registrar
            .emitter("Nope", Box::new(|| Ok(vec![])))
            .unwrap_err();
        assert!(matches!(err, ServiceError::UnknownSignal(name) if name == "Nope"));
    }
}
