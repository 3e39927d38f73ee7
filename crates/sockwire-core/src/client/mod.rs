//! Client side of the protocol.
//!
//! [`ClientDisplay`] is the client's view of one connection: the display
//! proxy at id 1, every other proxy the client created or was handed, and
//! the listeners receiving their events.
//!
//! Ids are allocated from 2 upward. When the client destroys a proxy the id
//! becomes a zombie: events still in flight for it are decoded against the
//! remembered interface (so their descriptors are consumed) and dropped,
//! until the display confirms with `delete_id` and the id is recycled.

use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::config::{ConnectionConfig, WireConfig};
use crate::connection::Connection;
use crate::error::{ProtocolError, Result, SockwireError};
use crate::protocol::{
    self, CALLBACK_INTERFACE, DISPLAY_INTERFACE, REGISTRY_INTERFACE,
};
use crate::registry::{ObjectRegistry, ResourceHandle, UserData};
use crate::wire::{ArgKind, Argument, Direction, Interface, Message};

/// Receives events addressed to one proxy.
pub trait EventHandler: Send {
    fn event(&mut self, display: &mut ClientDisplay, proxy: ResourceHandle, message: Message);
}

impl<F> EventHandler for F
where
    F: FnMut(&mut ClientDisplay, ResourceHandle, Message) + Send,
{
    fn event(&mut self, display: &mut ClientDisplay, proxy: ResourceHandle, message: Message) {
        self(display, proxy, message)
    }
}

/// Client end of a connection.
pub struct ClientDisplay {
    connection: Connection,
    proxies: ObjectRegistry<Box<dyn EventHandler>>,
    display: ResourceHandle,
    next_id: u32,
    free_ids: Vec<u32>,
    zombies: HashMap<u32, &'static Interface>,
    error: Option<ProtocolError>,
}

impl ClientDisplay {
    /// Wrap a connected socket, reading settings from the environment.
    pub fn connect(socket: UnixStream) -> Self {
        Self::with_config(socket, ConnectionConfig::from_env())
    }

    pub fn with_config(socket: UnixStream, config: ConnectionConfig) -> Self {
        let mut proxies = ObjectRegistry::new();
        let display = proxies.create(&DISPLAY_INTERFACE, 1, WireConfig::DISPLAY_ID);
        Self {
            connection: Connection::with_config(socket, config),
            proxies,
            display,
            next_id: WireConfig::CLIENT_ID_START,
            free_ids: Vec::new(),
            zombies: HashMap::new(),
            error: None,
        }
    }

    pub fn display(&self) -> ResourceHandle {
        self.display
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    pub fn proxies(&self) -> &ObjectRegistry<Box<dyn EventHandler>> {
        &self.proxies
    }

    /// Whether `id` was destroyed locally and still awaits `delete_id`.
    pub fn is_zombie(&self, id: u32) -> bool {
        self.zombies.contains_key(&id)
    }

    /// The fatal error reported by the display, if any.
    pub fn last_error(&self) -> Option<&ProtocolError> {
        self.error.as_ref()
    }

    fn check_error(&self) -> Result<()> {
        match &self.error {
            Some(err) => Err(err.clone().into()),
            None => Ok(()),
        }
    }

    fn allocate_id(&mut self) -> Result<u32> {
        if let Some(id) = self.free_ids.pop() {
            return Ok(id);
        }
        if self.next_id >= WireConfig::SERVER_ID_START {
            return Err(SockwireError::IdsExhausted {
                limit: WireConfig::SERVER_ID_START,
            });
        }
        let id = self.next_id;
        self.next_id += 1;
        Ok(id)
    }

    /// Create a local proxy with a fresh id, without telling the display.
    pub fn create_proxy(&mut self, interface: &'static Interface, version: u32) -> Result<ResourceHandle> {
        let id = self.allocate_id()?;
        Ok(self.proxies.create(interface, version, id))
    }

    pub fn add_listener<H>(&mut self, proxy: ResourceHandle, handler: H, user_data: Option<UserData>) -> Result<()>
    where
        H: EventHandler + 'static,
    {
        self.proxies
            .set_implementation(proxy, Box::new(handler), user_data, None)
    }

    pub fn user_data<T: std::any::Any>(&self, proxy: ResourceHandle) -> Option<&T> {
        self.proxies.user_data(proxy)
    }

    /// Send a request on `proxy`. A destructor request also destroys the proxy.
    pub fn marshal(&mut self, proxy: ResourceHandle, opcode: u16, args: &[Argument]) -> Result<()> {
        self.check_error()?;
        let interface = self
            .proxies
            .interface(proxy)
            .ok_or(SockwireError::StaleHandle { id: proxy.id() })?;
        let desc = interface.request(opcode).ok_or_else(|| {
            SockwireError::invalid_argument(format!("{} has no request {opcode}", interface.name))
        })?;
        self.connection
            .write_message(interface, proxy.id(), opcode, desc, args, &self.proxies)?;
        if desc.destructor {
            self.destroy_proxy(proxy)?;
        }
        Ok(())
    }

    /// Send a request creating a new object.
    ///
    /// The new proxy's id replaces the value of the single `n` argument in
    /// `args`.
    pub fn marshal_constructor(
        &mut self,
        proxy: ResourceHandle,
        opcode: u16,
        mut args: Vec<Argument>,
        interface: &'static Interface,
        version: u32,
    ) -> Result<ResourceHandle> {
        self.check_error()?;
        let slot = args
            .iter()
            .position(|arg| arg.kind() == ArgKind::NewId)
            .ok_or_else(|| SockwireError::invalid_argument("constructor without a new id argument"))?;

        let created = self.create_proxy(interface, version)?;
        args[slot] = Argument::NewId(created.id());
        if let Err(err) = self.marshal(proxy, opcode, &args) {
            self.proxies.destroy(created)?;
            self.free_ids.push(created.id());
            return Err(err);
        }
        Ok(created)
    }

    /// Destroy a proxy locally. Its id is reused once the display confirms.
    pub fn destroy_proxy(&mut self, proxy: ResourceHandle) -> Result<()> {
        let interface = self
            .proxies
            .interface(proxy)
            .ok_or(SockwireError::StaleHandle { id: proxy.id() })?;
        self.proxies.destroy(proxy)?;
        if self.proxies.lookup(proxy.id()).is_none() {
            self.zombies.insert(proxy.id(), interface);
        }
        Ok(())
    }

    pub fn get_registry(&mut self) -> Result<ResourceHandle> {
        let display = self.display;
        self.marshal_constructor(
            display,
            protocol::DISPLAY_GET_REGISTRY,
            vec![Argument::NewId(0)],
            &REGISTRY_INTERFACE,
            1,
        )
    }

    /// Ask the display for a `done` callback once it has processed everything sent so far.
    pub fn sync(&mut self) -> Result<ResourceHandle> {
        let display = self.display;
        self.marshal_constructor(
            display,
            protocol::DISPLAY_SYNC,
            vec![Argument::NewId(0)],
            &CALLBACK_INTERFACE,
            1,
        )
    }

    /// Bind global `name` through `registry`.
    pub fn bind(
        &mut self,
        registry: ResourceHandle,
        name: u32,
        interface: &'static Interface,
        version: u32,
    ) -> Result<ResourceHandle> {
        self.marshal_constructor(
            registry,
            protocol::REGISTRY_BIND,
            vec![
                Argument::Uint(name),
                Argument::string(interface.name),
                Argument::Uint(version),
                Argument::NewId(0),
            ],
            interface,
            version,
        )
    }

    pub fn flush(&mut self) -> Result<usize> {
        self.connection.flush()
    }

    /// Dispatch every complete buffered event without reading the socket.
    pub fn dispatch_pending(&mut self) -> Result<usize> {
        let mut dispatched = 0;
        loop {
            self.check_error()?;
            let Some(header) = self.connection.peek_header()? else {
                break;
            };

            if let Some(&interface) = self.zombies.get(&header.object_id) {
                let desc = interface.event(header.opcode).ok_or(SockwireError::InvalidMethod {
                    id: header.object_id,
                    interface: interface.name,
                    opcode: header.opcode,
                })?;
                let message = self.connection.read_message_as(header, desc, &self.proxies)?;
                trace!(
                    "discarding {}@{}.{} for deleted object",
                    interface.name,
                    message.object_id,
                    desc.name
                );
                continue;
            }

            let Some(message) = self.connection.read_message(&self.proxies, Direction::Event)? else {
                break;
            };
            self.dispatch_event(message);
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Flush, then block until at least one event was read and dispatch.
    pub fn dispatch(&mut self) -> Result<usize> {
        self.check_error()?;
        self.flush()?;
        let dispatched = self.dispatch_pending()?;
        if dispatched > 0 {
            return Ok(dispatched);
        }
        self.connection.read()?;
        self.dispatch_pending()
    }

    /// Block until the display has processed every request sent so far and
    /// every event it sent before has been dispatched.
    pub fn roundtrip(&mut self) -> Result<usize> {
        let done = Arc::new(AtomicBool::new(false));
        let callback = self.sync()?;
        let flag = Arc::clone(&done);
        self.add_listener(
            callback,
            move |_: &mut ClientDisplay, _: ResourceHandle, _: Message| {
                flag.store(true, Ordering::SeqCst);
            },
            None,
        )?;

        let mut dispatched = 0;
        while !done.load(Ordering::SeqCst) {
            dispatched += self.dispatch()?;
        }
        Ok(dispatched)
    }

    fn dispatch_event(&mut self, message: Message) {
        let Some(proxy) = self.proxies.lookup(message.object_id) else {
            return;
        };
        let Some(interface) = self.proxies.interface(proxy) else {
            return;
        };
        let Some(desc) = interface.event(message.opcode) else {
            return;
        };
        self.connection
            .trace(" <- ", interface, message.object_id, desc, &message.args);

        if proxy == self.display {
            self.handle_display_event(message);
            return;
        }

        if let Some(mut handler) = self.proxies.take_implementation(proxy) {
            handler.event(self, proxy, message);
            self.proxies.restore_implementation(proxy, handler);
        }
        if desc.destructor && self.proxies.is_live(proxy) {
            if let Err(err) = self.destroy_proxy(proxy) {
                debug!("destroying {}@{} failed: {}", interface.name, proxy.id(), err);
            }
        }
    }

    fn handle_display_event(&mut self, message: Message) {
        match message.opcode {
            protocol::DISPLAY_ERROR => {
                let (object_id, interface) = match message.arg(0).and_then(Argument::as_object) {
                    Some(object) => (
                        object.id(),
                        self.proxies
                            .interface(object)
                            .map(|i| i.name.to_string())
                            .unwrap_or_default(),
                    ),
                    None => (0, String::new()),
                };
                let error = ProtocolError {
                    object_id,
                    interface,
                    code: message.arg(1).and_then(Argument::as_uint).unwrap_or_default(),
                    message: message
                        .arg(2)
                        .and_then(Argument::as_str)
                        .unwrap_or_default()
                        .to_string(),
                };
                warn!("Protocol error from display: {}", error);
                self.error = Some(error);
            }
            protocol::DISPLAY_DELETE_ID => {
                let Some(id) = message.arg(0).and_then(Argument::as_uint) else {
                    return;
                };
                if self.zombies.remove(&id).is_some() {
                    self.free_ids.push(id);
                } else if let Some(proxy) = self.proxies.lookup(id) {
                    // The display destroyed an object the client still held.
                    let _ = self.proxies.destroy(proxy);
                    self.free_ids.push(id);
                } else {
                    debug!("delete_id for unknown object {}", id);
                }
            }
            opcode => debug!("Unknown display event {}", opcode),
        }
    }
}

impl Drop for ClientDisplay {
    fn drop(&mut self) {
        self.proxies.destroy_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (UnixStream, ClientDisplay) {
        let (display_end, client_end) = UnixStream::pair().unwrap();
        (display_end, ClientDisplay::connect(client_end))
    }

    #[test]
    fn test_ids_start_after_display() {
        let (_peer, mut client) = client();
        let proxy = client.create_proxy(&CALLBACK_INTERFACE, 1).unwrap();
        assert_eq!(proxy.id(), WireConfig::CLIENT_ID_START);
    }

    #[test]
    fn test_client_id_range_exhausted() {
        let (_peer, mut client) = client();
        client.next_id = WireConfig::SERVER_ID_START - 1;

        let last = client.create_proxy(&CALLBACK_INTERFACE, 1).unwrap();
        assert_eq!(last.id(), WireConfig::SERVER_ID_START - 1);
        assert!(matches!(
            client.create_proxy(&CALLBACK_INTERFACE, 1),
            Err(SockwireError::IdsExhausted { .. })
        ));
        assert!(matches!(client.sync(), Err(SockwireError::IdsExhausted { .. })));
    }

    #[test]
    fn test_recycled_id_survives_exhaustion() {
        let (_peer, mut client) = client();
        client.next_id = WireConfig::SERVER_ID_START;
        client.free_ids.push(7);

        let proxy = client.create_proxy(&CALLBACK_INTERFACE, 1).unwrap();
        assert_eq!(proxy.id(), 7);
        assert!(client.create_proxy(&CALLBACK_INTERFACE, 1).is_err());
    }
}
