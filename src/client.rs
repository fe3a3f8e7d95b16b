//! Client-side invocation of a remote interface.
//!
//! A [`RemoteHandle`] names a `(service, object path, interface)` triple on
//! the bus. Resolution only verifies that the service name currently has an
//! owner; the handle trusts the remote's self-description and carries no
//! descriptor of its own. Method calls suspend the calling task until the
//! remote replies, and bus-reported errors ([`CallError::Remote`]) are
//! distinguishable from connection-level failures ([`CallError::Transport`]).
//!
//! Signal subscriptions are match-rule based: the callback runs once per
//! broadcast, in arrival order, until the [`Subscription`] is dropped or
//! explicitly unsubscribed.

use futures_util::StreamExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use zbus::message::Type as MessageType;
use zbus::zvariant::OwnedValue;
use zbus::{Connection, MatchRule, MessageStream};

use crate::wire;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("bus connection failed: {0}")]
    Connection(#[from] zbus::Error),

    #[error("could not resolve '{service}' at '{path}': {reason}")]
    ResolutionFailed {
        service: String,
        path: String,
        reason: String,
    },
}

/// A failed method call.
#[derive(Error, Debug)]
pub enum CallError {
    /// The remote service replied with an error (dispatch or handler).
    #[error("remote error {name}: {message}")]
    Remote { name: String, message: String },

    /// The call never completed at the transport level.
    #[error("transport failure: {0}")]
    Transport(#[from] zbus::Error),
}

fn classify(err: zbus::Error) -> CallError {
    match err {
        zbus::Error::MethodError(name, message, _) => CallError::Remote {
            name: name.to_string(),
            message: message.unwrap_or_default(),
        },
        other => CallError::Transport(other),
    }
}

/// Lazily-resolved address of one remote interface.
#[derive(Clone, Debug)]
pub struct RemoteHandle {
    connection: Connection,
    service: String,
    path: String,
    interface: String,
}

impl RemoteHandle {
    /// Resolve a remote interface.
    ///
    /// Fails with [`ClientError::ResolutionFailed`] when the service name has
    /// no owner on the bus. Resolving the same triple twice yields handles
    /// that route calls to the same remote dispatch table.
    pub async fn resolve(
        connection: &Connection,
        service: &str,
        path: &str,
        interface: &str,
    ) -> Result<Self, ClientError> {
        let proxy = zbus::fdo::DBusProxy::new(connection)
            .await
            .map_err(zbus::Error::from)?;
        let owned = proxy
            .name_has_owner(service.try_into().map_err(zbus::Error::from)?)
            .await
            .map_err(zbus::Error::from)?;
        if !owned {
            return Err(ClientError::ResolutionFailed {
                service: service.to_string(),
                path: path.to_string(),
                reason: "name has no owner on the bus".to_string(),
            });
        }
        trace!("resolved '{}' at '{}'", service, path);
        Ok(Self {
            connection: connection.clone(),
            service: service.to_string(),
            path: path.to_string(),
            interface: interface.to_string(),
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Call a method and await its reply.
    pub async fn call(
        &self,
        member: &str,
        args: Vec<OwnedValue>,
    ) -> Result<Vec<OwnedValue>, CallError> {
        let reply = if args.is_empty() {
            self.connection
                .call_method(
                    Some(self.service.as_str()),
                    self.path.as_str(),
                    Some(self.interface.as_str()),
                    member,
                    &(),
                )
                .await
        } else {
            let body = wire::args_structure(args)?;
            self.connection
                .call_method(
                    Some(self.service.as_str()),
                    self.path.as_str(),
                    Some(self.interface.as_str()),
                    member,
                    &body,
                )
                .await
        }
        .map_err(classify)?;
        wire::message_args(&reply).map_err(CallError::Transport)
    }

    /// Attach a callback to one of the remote interface's signals.
    ///
    /// The callback is invoked once per broadcast, in arrival order, until
    /// the returned [`Subscription`] is dropped.
    pub async fn subscribe<F>(&self, signal: &str, mut callback: F) -> Result<Subscription, ClientError>
    where
        F: FnMut(Vec<OwnedValue>) + Send + 'static,
    {
        let rule = MatchRule::builder()
            .msg_type(MessageType::Signal)
            .sender(self.service.as_str())
            .map_err(zbus::Error::from)?
            .path(self.path.as_str())
            .map_err(zbus::Error::from)?
            .interface(self.interface.as_str())
            .map_err(zbus::Error::from)?
            .member(signal)
            .map_err(zbus::Error::from)?
            .build();
        let mut stream = MessageStream::for_match_rule(rule, &self.connection, Some(64)).await?;

        let signal = signal.to_string();
        let task = tokio::spawn(async move {
            while let Some(next) = stream.next().await {
                let message = match next {
                    Ok(message) => message,
                    Err(err) => {
                        debug!("signal stream error: {}", err);
                        continue;
                    }
                };
                match wire::message_args(&message) {
                    Ok(payload) => callback(payload),
                    Err(err) => debug!("undecodable '{}' payload: {}", signal, err),
                }
            }
        });
        Ok(Subscription { task })
    }
}

/// An active signal subscription; delivery stops when this is dropped.
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    /// Stop delivery. Callbacks already delivered are unaffected.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zbus::message::Message;
    use zbus::names::OwnedErrorName;

    #[test]
    fn test_remote_errors_are_distinguished() {
        let message = Message::method_call("/com/example/Demo", "Echo")
            .unwrap()
            .destination("com.example.Demo")
            .unwrap()
            .build(&("hi",))
            .unwrap();
        let name = OwnedErrorName::try_from("org.freedesktop.DBus.Error.UnknownMethod").unwrap();
        let err = classify(zbus::Error::MethodError(
            name,
            Some("no method 'Echo'".to_string()),
            message,
        ));
        match err {
            CallError::Remote { name, message } => {
                assert_eq!(name, "org.freedesktop.DBus.Error.UnknownMethod");
                assert!(message.contains("Echo"));
            }
            other => panic!("unexpected classification: {}", other),
        }
    }

    #[test]
    fn test_transport_errors_are_distinguished() {
        let err = classify(zbus::Error::InvalidReply);
        assert!(matches!(err, CallError::Transport(_)));
    }
}
