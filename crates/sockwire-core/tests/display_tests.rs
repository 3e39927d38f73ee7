//! Display and client talking over a real socket pair.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use sockwire::client::ClientDisplay;
use sockwire::protocol::{DisplayErrorCode, CALLBACK_DONE, DISPLAY_GET_REGISTRY, DISPLAY_SYNC};
use sockwire::server::{Client, ClientId, Display, RequestContext};
use sockwire::wire::Header;
use sockwire::{Argument, Interface, Message, MessageDesc, ResourceHandle, SockwireError, WireConfig};

use common::*;

fn expect_protocol_error(result: sockwire::Result<()>) -> sockwire::ProtocolError {
    match result {
        Err(SockwireError::Protocol(err)) => err,
        other => panic!("expected a protocol error, got {other:?}"),
    }
}

#[test]
fn test_sync_done_carries_serial() {
    let (mut display, id, mut client) = connected();
    display.next_serial();
    display.next_serial();

    let serial = Arc::new(AtomicU32::new(0));
    let callback = client.sync().unwrap();
    let seen = Arc::clone(&serial);
    client
        .add_listener(
            callback,
            move |_: &mut ClientDisplay, _: ResourceHandle, message: Message| {
                assert_eq!(message.opcode, CALLBACK_DONE);
                seen.store(message.args[0].as_uint().unwrap(), Ordering::SeqCst);
            },
            None,
        )
        .unwrap();
    client.flush().unwrap();
    pump(&mut display, id);
    client.dispatch().unwrap();

    assert_eq!(serial.load(Ordering::SeqCst), 2);
    assert!(!client.proxies().is_live(callback));
}

#[test]
fn test_callback_id_recycled_after_delete_id() {
    let (mut display, id, mut client) = connected();
    let first = client.sync().unwrap();
    client.flush().unwrap();
    pump(&mut display, id);
    client.dispatch().unwrap();

    // done and delete_id arrive in the same flush
    assert!(!client.is_zombie(first.id()));
    let second = client.create_proxy(&sockwire::protocol::CALLBACK_INTERFACE, 1).unwrap();
    assert_eq!(second.id(), first.id());
    assert_ne!(second, first);
}

#[test]
fn test_registry_lists_existing_globals() {
    let (mut display, id, mut client) = connected();
    display
        .create_global(&POOL_INTERFACE, 1, pool_bind(new_log()))
        .unwrap();

    let (_registry, announced, removed) = watch_registry(&mut client);
    roundtrip(&mut display, id, &mut client).unwrap();

    assert_eq!(
        announced.lock().unwrap().as_slice(),
        &[(1, "test_pool".to_string(), 1)]
    );
    assert!(removed.lock().unwrap().is_empty());
}

#[test]
fn test_global_added_and_removed_after_get_registry() {
    let (mut display, id, mut client) = connected();
    let (_registry, announced, removed) = watch_registry(&mut client);
    roundtrip(&mut display, id, &mut client).unwrap();
    assert!(announced.lock().unwrap().is_empty());

    let name = display
        .create_global(&POOL_INTERFACE, 1, pool_bind(new_log()))
        .unwrap();
    roundtrip(&mut display, id, &mut client).unwrap();
    assert_eq!(announced.lock().unwrap().len(), 1);

    display.remove_global(name).unwrap();
    roundtrip(&mut display, id, &mut client).unwrap();
    assert_eq!(removed.lock().unwrap().as_slice(), &[name]);

    // A registry created afterwards no longer sees it.
    let (_late, late_announced, _) = watch_registry(&mut client);
    roundtrip(&mut display, id, &mut client).unwrap();
    assert!(late_announced.lock().unwrap().is_empty());
}

#[test]
fn test_bind_and_use_global() {
    let (mut display, id, mut client) = connected();
    let log = new_log();
    display
        .create_global(&POOL_INTERFACE, 1, pool_bind(Arc::clone(&log)))
        .unwrap();
    let (registry, _, _) = watch_registry(&mut client);
    roundtrip(&mut display, id, &mut client).unwrap();

    let pool = client.bind(registry, 1, &POOL_INTERFACE, 1).unwrap();
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&sizes);
    client
        .add_listener(
            pool,
            move |_: &mut ClientDisplay, _: ResourceHandle, message: Message| {
                seen.lock().unwrap().push(message.args[0].as_int().unwrap());
            },
            None,
        )
        .unwrap();
    client.marshal(pool, POOL_RESIZE, &[Argument::Int(64)]).unwrap();
    roundtrip(&mut display, id, &mut client).unwrap();

    assert_eq!(entries(&log), vec!["resize 64"]);
    assert_eq!(sizes.lock().unwrap().as_slice(), &[64]);
    assert!(display.client(id).unwrap().is_alive());
}

fn expect_bind_error(interface: &'static Interface, name: u32, version: u32) {
    let (mut display, id, mut client) = connected();
    display
        .create_global(&POOL_INTERFACE, 1, pool_bind(new_log()))
        .unwrap();
    let (registry, _, _) = watch_registry(&mut client);
    roundtrip(&mut display, id, &mut client).unwrap();

    client.bind(registry, name, interface, version).unwrap();
    let err = expect_protocol_error(roundtrip(&mut display, id, &mut client));

    assert_eq!(err.code, DisplayErrorCode::InvalidObject.code());
    assert_eq!(err.object_id, registry.id());
    assert_eq!(err.interface, "sw_registry");
    assert!(client.last_error().is_some());
    assert!(client.sync().is_err());

    let posted = display.client(id).unwrap().error().unwrap().clone();
    assert_eq!(posted.object_id, registry.id());
    assert_eq!(display.reap_dead_clients(), vec![id]);
    assert!(display.client(id).is_none());
}

#[test]
fn test_bind_unknown_global() {
    expect_bind_error(&POOL_INTERFACE, 99, 1);
}

#[test]
fn test_bind_wrong_interface() {
    expect_bind_error(&BUFFER_INTERFACE, 1, 1);
}

#[test]
fn test_bind_version_too_high() {
    expect_bind_error(&POOL_INTERFACE, 1, 2);
}

fn send_raw(display: &mut Display, id: ClientId, client: &mut ClientDisplay, header: Header) -> sockwire::ProtocolError {
    client
        .connection_mut()
        .queue(&header.to_bytes())
        .unwrap();
    client.flush().unwrap();
    pump(display, id);
    expect_protocol_error(client.dispatch().map(drop))
}

#[test]
fn test_invalid_opcode() {
    let (mut display, id, mut client) = connected();
    let header = Header {
        object_id: 1,
        opcode: 7,
        size: 8,
    };
    let err = send_raw(&mut display, id, &mut client, header);
    assert_eq!(err.code, DisplayErrorCode::InvalidMethod.code());
    assert_eq!(err.object_id, 1);
    assert!(!display.client(id).unwrap().is_alive());
}

#[test]
fn test_request_to_unknown_object() {
    let (mut display, id, mut client) = connected();
    let header = Header {
        object_id: 42,
        opcode: 0,
        size: 8,
    };
    let err = send_raw(&mut display, id, &mut client, header);
    assert_eq!(err.code, DisplayErrorCode::InvalidObject.code());
    assert!(!display.client(id).unwrap().is_alive());
}

#[test]
fn test_invalid_opcode_reported_on_target() {
    let (mut display, id, mut client) = connected();
    display
        .create_global(&POOL_INTERFACE, 1, pool_bind(new_log()))
        .unwrap();
    let (registry, _, _) = watch_registry(&mut client);
    roundtrip(&mut display, id, &mut client).unwrap();
    let pool = client.bind(registry, 1, &POOL_INTERFACE, 1).unwrap();
    roundtrip(&mut display, id, &mut client).unwrap();

    let header = Header {
        object_id: pool.id(),
        opcode: 9,
        size: 8,
    };
    let err = send_raw(&mut display, id, &mut client, header);
    assert_eq!(err.code, DisplayErrorCode::InvalidMethod.code());
    assert_eq!(err.object_id, pool.id());
    assert_eq!(err.interface, "test_pool");
}

const DIAL_SET_MODE: u16 = 1;

static DIAL_REQUESTS: [MessageDesc; 2] = [
    MessageDesc::new("destroy", "", &[]).destructor(),
    MessageDesc::new("set_mode", "2u", &[]),
];

static DIAL_INTERFACE: Interface = Interface {
    name: "test_dial",
    version: 2,
    requests: &DIAL_REQUESTS,
    events: &[],
};

/// Advertise a version 2 dial global whose handler logs each opcode.
fn add_dial_global(display: &mut Display, log: Log) {
    display
        .create_global(&DIAL_INTERFACE, 2, move |client: &mut Client, version: u32, id: u32| {
            let dial = client.create_resource(&DIAL_INTERFACE, version, id);
            let handled = Arc::clone(&log);
            client.set_implementation(
                dial,
                move |_: &mut RequestContext<'_>, _: ResourceHandle, message: Message| -> sockwire::Result<()> {
                    handled.lock().unwrap().push(format!("opcode {}", message.opcode));
                    Ok(())
                },
                None,
                None,
            )?;
            Ok(dial)
        })
        .unwrap();
}

#[test]
fn test_request_newer_than_bound_version() {
    let (mut display, id, mut client) = connected();
    let log = new_log();
    add_dial_global(&mut display, Arc::clone(&log));
    let (registry, _, _) = watch_registry(&mut client);
    roundtrip(&mut display, id, &mut client).unwrap();

    let dial = client.bind(registry, 1, &DIAL_INTERFACE, 1).unwrap();
    client.marshal(dial, DIAL_SET_MODE, &[Argument::Uint(3)]).unwrap();
    let err = expect_protocol_error(roundtrip(&mut display, id, &mut client));

    assert_eq!(err.code, DisplayErrorCode::InvalidMethod.code());
    assert_eq!(err.object_id, dial.id());
    assert_eq!(err.interface, "test_dial");
    assert!(entries(&log).is_empty());
}

#[test]
fn test_request_within_bound_version() {
    let (mut display, id, mut client) = connected();
    let log = new_log();
    add_dial_global(&mut display, Arc::clone(&log));
    let (registry, _, _) = watch_registry(&mut client);
    roundtrip(&mut display, id, &mut client).unwrap();

    let dial = client.bind(registry, 1, &DIAL_INTERFACE, 2).unwrap();
    client.marshal(dial, DIAL_SET_MODE, &[Argument::Uint(3)]).unwrap();
    roundtrip(&mut display, id, &mut client).unwrap();

    assert_eq!(entries(&log), vec!["opcode 1"]);
    assert!(display.client(id).unwrap().is_alive());
}

#[test]
fn test_new_id_already_in_use() {
    let (mut display, id, mut client) = connected();
    let (registry, _, _) = watch_registry(&mut client);
    roundtrip(&mut display, id, &mut client).unwrap();

    let display_proxy = client.display();
    client
        .marshal(display_proxy, DISPLAY_GET_REGISTRY, &[Argument::NewId(registry.id())])
        .unwrap();
    let err = expect_protocol_error(roundtrip(&mut display, id, &mut client));

    assert_eq!(err.code, DisplayErrorCode::InvalidObject.code());
    assert_eq!(err.object_id, 1);
    let server = display.client(id).unwrap();
    assert!(!server.is_alive());
    assert_eq!(server.registries().count(), 1);
}

#[test]
fn test_new_id_in_display_range() {
    let (mut display, id, mut client) = connected();
    let display_proxy = client.display();
    client
        .marshal(
            display_proxy,
            DISPLAY_SYNC,
            &[Argument::NewId(WireConfig::SERVER_ID_START)],
        )
        .unwrap();
    let err = expect_protocol_error(roundtrip(&mut display, id, &mut client));

    assert_eq!(err.code, DisplayErrorCode::InvalidObject.code());
    assert_eq!(err.object_id, 1);
    let server = display.client(id).unwrap();
    assert!(!server.is_alive());
    assert!(server.get_object(WireConfig::SERVER_ID_START).is_none());
}

#[test]
fn test_destroy_client_runs_destructors() {
    let (mut display, id, mut client) = connected();
    let log = new_log();
    display
        .create_global(&POOL_INTERFACE, 1, pool_bind(Arc::clone(&log)))
        .unwrap();
    let (registry, _, _) = watch_registry(&mut client);
    roundtrip(&mut display, id, &mut client).unwrap();
    let pool = client.bind(registry, 1, &POOL_INTERFACE, 1).unwrap();
    client
        .marshal_constructor(pool, POOL_CREATE_BUFFER, vec![Argument::NewId(0), Argument::Int(16)], &BUFFER_INTERFACE, 1)
        .unwrap();
    roundtrip(&mut display, id, &mut client).unwrap();
    assert_eq!(entries(&log), vec!["create_buffer"]);

    assert!(display.destroy_client(id));
    let mut destroyed = entries(&log);
    destroyed.sort();
    assert_eq!(destroyed, vec!["buffer destroyed", "create_buffer", "pool destroyed"]);
    assert!(!display.destroy_client(id));
}

#[test]
fn test_events_for_destroyed_proxy_are_discarded() {
    let (mut display, id, mut client) = connected();
    let log = new_log();
    display
        .create_global(&POOL_INTERFACE, 1, pool_bind(Arc::clone(&log)))
        .unwrap();
    let (registry, _, _) = watch_registry(&mut client);
    roundtrip(&mut display, id, &mut client).unwrap();

    let pool = client.bind(registry, 1, &POOL_INTERFACE, 1).unwrap();
    let resized = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&resized);
    client
        .add_listener(
            pool,
            move |_: &mut ClientDisplay, _: ResourceHandle, _: Message| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
            None,
        )
        .unwrap();

    // The resized reply is still in flight when the proxy goes away.
    client.marshal(pool, POOL_RESIZE, &[Argument::Int(8)]).unwrap();
    client.marshal(pool, POOL_DESTROY, &[]).unwrap();
    assert!(client.is_zombie(pool.id()));
    roundtrip(&mut display, id, &mut client).unwrap();

    assert_eq!(resized.load(Ordering::SeqCst), 0);
    assert!(!client.is_zombie(pool.id()));
    assert_eq!(entries(&log), vec!["resize 8", "destroy request", "pool destroyed"]);
    assert!(display.client(id).unwrap().is_alive());
}

#[test]
fn test_roundtrip_with_display_thread() {
    let (mut display, id, mut client) = connected();
    display
        .create_global(&POOL_INTERFACE, 1, pool_bind(new_log()))
        .unwrap();

    let server = thread::spawn(move || loop {
        match display.process_client(id) {
            Ok(_) => {}
            Err(SockwireError::ConnectionClosed) => return display,
            Err(err) => panic!("display failed: {err}"),
        }
    });

    let (_registry, announced, _) = watch_registry(&mut client);
    client.roundtrip().unwrap();
    assert_eq!(announced.lock().unwrap().len(), 1);
    client.roundtrip().unwrap();
    drop(client);

    let display = server.join().unwrap();
    assert!(display.client(id).unwrap().is_alive());
}
