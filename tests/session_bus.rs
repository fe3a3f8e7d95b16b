//! End-to-end tests over a real session bus.
//!
//! Run with `cargo test -- --ignored` on a machine with a session bus
//! (or under `dbus-run-session`); environments without one skip them.

use std::sync::Arc;
use std::time::Duration;

use zbus::zvariant::Value;
use zbus::Connection;

use buskit::client::{CallError, ClientError, RemoteHandle};
use buskit::demo;
use buskit::dispatch::DispatchTable;
use buskit::registrar::{RegistrarState, ServiceError, ServiceRegistrar};

fn unique_name(tag: &str) -> String {
    format!("com.buskit.{}{}", tag, std::process::id())
}

fn path_for(name: &str) -> String {
    format!("/{}", name.replace('.', "/"))
}

async fn export_demo(name: &str) -> (ServiceRegistrar, Connection) {
    let connection = Connection::session().await.unwrap();
    let descriptor = demo::demo_interface(name).unwrap();
    let table = DispatchTable::new(path_for(name), Arc::new(descriptor));
    let mut registrar = ServiceRegistrar::new(name, Arc::new(table));
    registrar.register(connection.clone()).await.unwrap();
    (registrar, connection)
}

#[tokio::test]
#[ignore = "requires a session bus"]
async fn test_echo_roundtrip() {
    let name = unique_name("Echo");
    let (mut registrar, _conn) = export_demo(&name).await;

    let client = Connection::session().await.unwrap();
    let handle = RemoteHandle::resolve(&client, &name, &path_for(&name), &name)
        .await
        .unwrap();

    let out = handle
        .call("Echo", vec![Value::from("hi").try_to_owned().unwrap()])
        .await
        .unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(String::try_from(out[0].clone()).unwrap(), "hi");

    // Resolving again routes to the same dispatch table.
    let again = RemoteHandle::resolve(&client, &name, &path_for(&name), &name)
        .await
        .unwrap();
    let out_again = again
        .call("Echo", vec![Value::from("hi").try_to_owned().unwrap()])
        .await
        .unwrap();
    assert_eq!(
        String::try_from(out_again[0].clone()).unwrap(),
        String::try_from(out[0].clone()).unwrap()
    );

    registrar.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a session bus"]
async fn test_unknown_member_is_remote_not_found() {
    let name = unique_name("Unknown");
    let (mut registrar, _conn) = export_demo(&name).await;

    let client = Connection::session().await.unwrap();
    let handle = RemoteHandle::resolve(&client, &name, &path_for(&name), &name)
        .await
        .unwrap();

    let err = handle.call("NoSuchMethod", vec![]).await.unwrap_err();
    match err {
        CallError::Remote { name, .. } => {
            assert_eq!(name, "org.freedesktop.DBus.Error.UnknownMethod");
        }
        other => panic!("expected remote error, got {}", other),
    }

    registrar.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a session bus"]
async fn test_invalid_args_reported_before_handler() {
    let name = unique_name("Args");
    let (mut registrar, _conn) = export_demo(&name).await;

    let client = Connection::session().await.unwrap();
    let handle = RemoteHandle::resolve(&client, &name, &path_for(&name), &name)
        .await
        .unwrap();

    // Echo declares a single string input.
    let err = handle
        .call("Echo", vec![Value::from(5u32).try_to_owned().unwrap()])
        .await
        .unwrap_err();
    match err {
        CallError::Remote { name, .. } => {
            assert_eq!(name, "org.freedesktop.DBus.Error.InvalidArgs");
        }
        other => panic!("expected remote error, got {}", other),
    }

    registrar.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a session bus"]
async fn test_second_owner_is_rejected_without_export() {
    let name = unique_name("Owner");
    let (mut registrar, _conn) = export_demo(&name).await;

    let second = Connection::session().await.unwrap();
    let descriptor = demo::demo_interface(&name).unwrap();
    let table = DispatchTable::new(path_for(&name), Arc::new(descriptor));
    let mut rival = ServiceRegistrar::new(&name, Arc::new(table));
    let err = rival.register(second).await.unwrap_err();
    assert!(matches!(err, ServiceError::NameRejected { .. }));
    assert_eq!(rival.state(), RegistrarState::NameRejected);

    registrar.shutdown().await;

    // With the owner gone, resolution must fail, not dispatch.
    let client = Connection::session().await.unwrap();
    let err = RemoteHandle::resolve(&client, &name, &path_for(&name), &name)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::ResolutionFailed { .. }));
}

#[tokio::test]
#[ignore = "requires a session bus"]
async fn test_signals_arrive_in_emission_order() {
    let name = unique_name("Signals");
    let (mut registrar, _conn) = export_demo(&name).await;

    let client = Connection::session().await.unwrap();
    let handle = RemoteHandle::resolve(&client, &name, &path_for(&name), &name)
        .await
        .unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let subscription = handle
        .subscribe(demo::RECORD_SIGNAL, move |payload| {
            let _ = tx.send(payload);
        })
        .await
        .unwrap();

    // Counting payload so arrival order is observable.
    let counter = std::sync::atomic::AtomicU8::new(0);
    let payload_fn: buskit::emitter::PayloadFn = Box::new(move || {
        let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        Ok(vec![
            Value::from(vec![n]).try_to_owned().unwrap(),
            Value::from("D0:11:22:33:44:55").try_to_owned().unwrap(),
            Value::from(zbus::zvariant::Dict::from(std::collections::HashMap::from([
                ("profile", "test1"),
            ])))
            .try_to_owned()
            .unwrap(),
        ])
    });
    let mut emitter = registrar
        .emitter(demo::RECORD_SIGNAL, payload_fn)
        .unwrap();
    emitter.start(Duration::from_millis(50));

    for expected in 1u8..=3 {
        let payload = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for signal")
            .expect("subscription closed");
        assert_eq!(payload.len(), 3);
        let data = Vec::<u8>::try_from(payload[0].clone()).unwrap();
        assert_eq!(data, vec![expected]);
    }

    emitter.stop();
    subscription.unsubscribe();
    registrar.shutdown().await;
}
