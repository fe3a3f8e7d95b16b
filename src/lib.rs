//! buskit: declarative D-Bus interface export, dispatch and client toolkit.
//!
//! A service declares its methods and signals as an [`InterfaceDescriptor`],
//! binds it to an object path in a [`DispatchTable`], and hands both to a
//! [`ServiceRegistrar`] that claims a well-known bus name and serves inbound
//! calls. A [`SignalEmitter`] broadcasts declared signals on a period, and
//! [`RemoteHandle`] is the client-side counterpart for calls and signal
//! subscriptions.

pub mod client;
pub mod config;
pub mod demo;
pub mod descriptor;
pub mod dispatch;
pub mod emitter;
pub mod registrar;
pub mod signature;
mod wire;

// Re-export commonly used types for convenience
pub use client::{CallError, ClientError, RemoteHandle, Subscription};
pub use config::{BusConfig, BusKind};
pub use descriptor::{DescriptorError, InterfaceDescriptor, MethodEntry, SignalEntry};
pub use dispatch::{DispatchError, DispatchTable, HandlerError, HandlerResult};
pub use emitter::{EmitError, SignalEmitter, SignalSink};
pub use registrar::{RegistrarState, ServiceError, ServiceRegistrar};
pub use signature::{MemberSignature, SignatureError, Slot};
