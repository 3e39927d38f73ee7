//! Display side of the protocol.
//!
//! A [`Display`] owns the shared [`DisplayState`] (globals, event serial) and
//! every connected [`Client`]. Socket readiness is left to the caller: once a
//! client's socket is readable, call [`Display::process_client`] (or the
//! finer-grained `read_client` / `dispatch_client` / `flush_client`).

mod builtin;
mod client;

pub use client::{ClientId, Client, PostedError, RequestContext, RequestHandler};

use std::collections::{BTreeMap, HashMap};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::ConnectionConfig;
use crate::error::{Result, SockwireError};
use crate::protocol::{REGISTRY_GLOBAL, REGISTRY_GLOBAL_REMOVE};
use crate::registry::{GlobalList, GlobalName, ResourceHandle};
use crate::wire::{Argument, Interface};

/// Creates the resource for a bind request: `(client, version, id)`.
pub type BindFn = Arc<dyn Fn(&mut Client, u32, u32) -> Result<ResourceHandle> + Send + Sync>;

/// State shared by all clients of one display.
pub struct DisplayState {
    globals: GlobalList<BindFn>,
    bound: HashMap<GlobalName, Vec<(ClientId, ResourceHandle)>>,
    serial: u32,
}

impl DisplayState {
    fn new() -> Self {
        Self {
            globals: GlobalList::new(),
            bound: HashMap::new(),
            serial: 0,
        }
    }

    pub fn globals(&self) -> &GlobalList<BindFn> {
        &self.globals
    }

    /// Current event serial.
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Advance and return the event serial.
    pub fn next_serial(&mut self) -> u32 {
        self.serial = self.serial.wrapping_add(1);
        self.serial
    }

    fn record_binding(&mut self, name: GlobalName, client: ClientId, resource: ResourceHandle) {
        self.bound.entry(name).or_default().push((client, resource));
    }
}

/// The display: globals plus connected clients.
pub struct Display {
    state: DisplayState,
    clients: BTreeMap<ClientId, Client>,
    next_client: u64,
    config: ConnectionConfig,
}

impl Default for Display {
    fn default() -> Self {
        Self::new()
    }
}

impl Display {
    pub fn new() -> Self {
        Self::with_config(ConnectionConfig::from_env())
    }

    /// Use `config` for every client connection.
    pub fn with_config(config: ConnectionConfig) -> Self {
        Self {
            state: DisplayState::new(),
            clients: BTreeMap::new(),
            next_client: 1,
            config,
        }
    }

    pub fn state(&self) -> &DisplayState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut DisplayState {
        &mut self.state
    }

    pub fn next_serial(&mut self) -> u32 {
        self.state.next_serial()
    }

    /// Adopt a connected socket as a new client.
    pub fn add_client(&mut self, socket: UnixStream) -> ClientId {
        let id = ClientId(self.next_client);
        self.next_client += 1;
        self.clients
            .insert(id, Client::new(id, socket, self.config.clone()));
        info!("{} connected", id);
        id
    }

    pub fn client(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn client_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients.get_mut(&id)
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    fn client_or_err(&mut self, id: ClientId) -> Result<&mut Client> {
        self.clients
            .get_mut(&id)
            .ok_or(SockwireError::UnknownClient(id.0))
    }

    /// Advertise a global to every current and future registry.
    pub fn create_global<F>(&mut self, interface: &'static Interface, version: u32, bind: F) -> Result<GlobalName>
    where
        F: Fn(&mut Client, u32, u32) -> Result<ResourceHandle> + Send + Sync + 'static,
    {
        let name = self.state.globals.add(interface, version, Arc::new(bind))?;
        let args = [
            Argument::Uint(name),
            Argument::string(interface.name),
            Argument::Uint(version),
        ];
        self.broadcast_registry_event(REGISTRY_GLOBAL, &args);
        Ok(name)
    }

    /// Withdraw a global: announce `global_remove` and make every resource
    /// bound from it inert.
    pub fn remove_global(&mut self, name: GlobalName) -> Result<()> {
        self.state.globals.remove(name)?;
        self.broadcast_registry_event(REGISTRY_GLOBAL_REMOVE, &[Argument::Uint(name)]);

        for (client_id, resource) in self.state.bound.remove(&name).unwrap_or_default() {
            if let Some(client) = self.clients.get_mut(&client_id) {
                if client.objects().is_live(resource) {
                    client.set_inert(resource)?;
                }
            }
        }
        debug!("Removed global {}", name);
        Ok(())
    }

    /// Forget a global, withdrawing it first if still advertised.
    pub fn destroy_global(&mut self, name: GlobalName) -> Result<()> {
        let removed = self
            .state
            .globals
            .get(name)
            .ok_or(SockwireError::UnknownGlobal { name })?
            .is_removed();
        if !removed {
            self.remove_global(name)?;
        }
        self.state.globals.destroy(name);
        Ok(())
    }

    fn broadcast_registry_event(&mut self, opcode: u16, args: &[Argument]) {
        for client in self.clients.values_mut() {
            let registries: Vec<ResourceHandle> = client.registries().collect();
            for registry in registries {
                if let Err(err) = client.post_event(registry, opcode, args) {
                    debug!("{}: registry event failed: {}", client.id(), err);
                }
            }
        }
    }

    /// Receive pending bytes from a client's socket.
    pub fn read_client(&mut self, id: ClientId) -> Result<usize> {
        self.client_or_err(id)?.read()
    }

    /// Dispatch every complete request buffered for a client.
    pub fn dispatch_client(&mut self, id: ClientId) -> Result<usize> {
        let Display { state, clients, .. } = self;
        let client = clients
            .get_mut(&id)
            .ok_or(SockwireError::UnknownClient(id.0))?;
        Ok(client.dispatch_pending(state))
    }

    pub fn flush_client(&mut self, id: ClientId) -> Result<usize> {
        self.client_or_err(id)?.flush()
    }

    /// Read, dispatch and flush one client.
    pub fn process_client(&mut self, id: ClientId) -> Result<usize> {
        self.read_client(id)?;
        let dispatched = self.dispatch_client(id)?;
        self.flush_client(id)?;
        Ok(dispatched)
    }

    /// Flush every client, logging failures other than `WouldBlock`.
    pub fn flush_clients(&mut self) {
        for client in self.clients.values_mut() {
            if let Err(err) = client.flush() {
                if !err.is_would_block() {
                    debug!("{}: flush failed: {}", client.id(), err);
                }
            }
        }
    }

    /// Disconnect a client, destroying all of its resources.
    pub fn destroy_client(&mut self, id: ClientId) -> bool {
        let Some(mut client) = self.clients.remove(&id) else {
            return false;
        };
        let destroyed = client.teardown();
        for bound in self.state.bound.values_mut() {
            bound.retain(|(owner, _)| *owner != id);
        }
        info!("{} disconnected, {} resources destroyed", id, destroyed);
        true
    }

    /// Disconnect every client that received a fatal error.
    pub fn reap_dead_clients(&mut self) -> Vec<ClientId> {
        let dead: Vec<ClientId> = self
            .clients
            .values()
            .filter(|client| !client.is_alive())
            .map(Client::id)
            .collect();
        for &id in &dead {
            self.destroy_client(id);
        }
        dead
    }
}
