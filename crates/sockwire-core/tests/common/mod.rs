//! Shared fixtures: test interfaces and helpers stepping both peers on one thread.

#![allow(dead_code)]

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use sockwire::client::ClientDisplay;
use sockwire::config::ConnectionConfig;
use sockwire::server::{Client, ClientId, Display, RequestContext};
use sockwire::wire::{Argument, Interface, Message, MessageDesc};
use sockwire::{ResourceHandle, Result};

pub const POOL_CREATE_BUFFER: u16 = 0;
pub const POOL_RESIZE: u16 = 1;
pub const POOL_DESTROY: u16 = 2;
pub const POOL_RESIZED: u16 = 0;
pub const BUFFER_DESTROY: u16 = 0;

static CREATE_BUFFER_TYPES: [Option<&Interface>; 2] = [Some(&BUFFER_INTERFACE), None];

static POOL_REQUESTS: [MessageDesc; 3] = [
    MessageDesc::new("create_buffer", "ni", &CREATE_BUFFER_TYPES),
    MessageDesc::new("resize", "i", &[]),
    MessageDesc::new("destroy", "", &[]).destructor(),
];

static POOL_EVENTS: [MessageDesc; 1] = [MessageDesc::new("resized", "i", &[])];

pub static POOL_INTERFACE: Interface = Interface {
    name: "test_pool",
    version: 1,
    requests: &POOL_REQUESTS,
    events: &POOL_EVENTS,
};

static BUFFER_REQUESTS: [MessageDesc; 1] = [MessageDesc::new("destroy", "", &[]).destructor()];

pub static BUFFER_INTERFACE: Interface = Interface {
    name: "test_buffer",
    version: 1,
    requests: &BUFFER_REQUESTS,
    events: &[],
};

pub type Log = Arc<Mutex<Vec<String>>>;

pub fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn push(log: &Log, entry: impl Into<String>) {
    log.lock().unwrap().push(entry.into());
}

/// Bind callback for the pool global; every request and destruction is logged.
pub fn pool_bind(
    log: Log,
) -> impl Fn(&mut Client, u32, u32) -> Result<ResourceHandle> + Send + Sync + 'static {
    move |client: &mut Client, version: u32, id: u32| -> Result<ResourceHandle> {
        let pool = client.create_resource(&POOL_INTERFACE, version, id);
        let request_log = Arc::clone(&log);
        let destructor_log = Arc::clone(&log);
        client.set_implementation(
            pool,
            move |cx: &mut RequestContext<'_>, pool: ResourceHandle, message: Message| -> Result<()> {
                match message.opcode {
                    POOL_CREATE_BUFFER => {
                        let id = message.args[0].as_new_id().unwrap_or_default();
                        let buffer = cx.client.create_resource(&BUFFER_INTERFACE, 1, id);
                        let buffer_log = Arc::clone(&request_log);
                        cx.client.set_implementation(
                            buffer,
                            |_: &mut RequestContext<'_>, _: ResourceHandle, _: Message| -> Result<()> { Ok(()) },
                            None,
                            Some(Box::new(move |_, _| push(&buffer_log, "buffer destroyed"))),
                        )?;
                        push(&request_log, "create_buffer");
                    }
                    POOL_RESIZE => {
                        let size = message.args[0].as_int().unwrap_or_default();
                        push(&request_log, format!("resize {size}"));
                        cx.client.post_event(pool, POOL_RESIZED, &[Argument::Int(size)])?;
                    }
                    POOL_DESTROY => push(&request_log, "destroy request"),
                    _ => {}
                }
                Ok(())
            },
            None,
            Some(Box::new(move |_, _| push(&destructor_log, "pool destroyed"))),
        )?;
        Ok(pool)
    }
}

pub fn connected() -> (Display, ClientId, ClientDisplay) {
    let (server_end, client_end) = UnixStream::pair().unwrap();
    let mut display = Display::with_config(ConnectionConfig::default());
    let id = display.add_client(server_end);
    let client = ClientDisplay::with_config(client_end, ConnectionConfig::default());
    (display, id, client)
}

/// Let the display consume everything the client flushed, then flush replies.
pub fn pump(display: &mut Display, id: ClientId) {
    display
        .client(id)
        .unwrap()
        .connection()
        .set_nonblocking(true)
        .unwrap();
    loop {
        match display.read_client(id) {
            Ok(_) => {
                display.dispatch_client(id).unwrap();
            }
            Err(err) if err.is_would_block() => break,
            Err(err) => panic!("display read failed: {err}"),
        }
    }
    display.flush_client(id).unwrap();
}

/// Flush the client, let the display catch up, and dispatch until a sync
/// sent last comes back.
pub fn roundtrip(display: &mut Display, id: ClientId, client: &mut ClientDisplay) -> Result<()> {
    let done = Arc::new(AtomicBool::new(false));
    let callback = client.sync()?;
    let flag = Arc::clone(&done);
    client.add_listener(
        callback,
        move |_: &mut ClientDisplay, _: ResourceHandle, _: Message| flag.store(true, Ordering::SeqCst),
        None,
    )?;
    client.flush()?;
    pump(display, id);
    while !done.load(Ordering::SeqCst) {
        client.dispatch()?;
    }
    Ok(())
}

/// Globals announced to a registry listener, as `(name, interface, version)`.
pub type Announced = Arc<Mutex<Vec<(u32, String, u32)>>>;

/// Request a registry that records `global` and `global_remove` events.
pub fn watch_registry(client: &mut ClientDisplay) -> (ResourceHandle, Announced, Arc<Mutex<Vec<u32>>>) {
    let announced: Announced = Arc::new(Mutex::new(Vec::new()));
    let removed = Arc::new(Mutex::new(Vec::new()));
    let registry = client.get_registry().unwrap();
    let (add, remove) = (Arc::clone(&announced), Arc::clone(&removed));
    client
        .add_listener(
            registry,
            move |_: &mut ClientDisplay, _: ResourceHandle, message: Message| match message.opcode {
                sockwire::protocol::REGISTRY_GLOBAL => add.lock().unwrap().push((
                    message.args[0].as_uint().unwrap(),
                    message.args[1].as_str().unwrap().to_string(),
                    message.args[2].as_uint().unwrap(),
                )),
                sockwire::protocol::REGISTRY_GLOBAL_REMOVE => {
                    remove.lock().unwrap().push(message.args[0].as_uint().unwrap())
                }
                _ => {}
            },
            None,
        )
        .unwrap();
    (registry, announced, removed)
}
