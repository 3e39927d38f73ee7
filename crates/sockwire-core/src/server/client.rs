//! Display-side state of one connected client.

use std::os::unix::net::UnixStream;

use tracing::{debug, trace, warn};

use super::builtin::DisplayHandler;
use super::DisplayState;
use crate::config::{ConnectionConfig, WireConfig};
use crate::connection::Connection;
use crate::error::{Result, SockwireError};
use crate::protocol::{self, DisplayErrorCode, DISPLAY_INTERFACE};
use crate::registry::{Destructor, ObjectRegistry, ResourceHandle, UserData};
use crate::wire::{ArgKind, Argument, Direction, Interface, Message, MessageDesc};

/// Identifies a client within its display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Handles requests addressed to one resource.
pub trait RequestHandler: Send {
    fn request(
        &mut self,
        cx: &mut RequestContext<'_>,
        resource: ResourceHandle,
        message: Message,
    ) -> Result<()>;
}

impl<F> RequestHandler for F
where
    F: FnMut(&mut RequestContext<'_>, ResourceHandle, Message) -> Result<()> + Send,
{
    fn request(
        &mut self,
        cx: &mut RequestContext<'_>,
        resource: ResourceHandle,
        message: Message,
    ) -> Result<()> {
        self(cx, resource, message)
    }
}

/// What a request handler may touch while it runs.
pub struct RequestContext<'a> {
    pub client: &'a mut Client,
    pub display: &'a mut DisplayState,
}

/// Fatal error posted to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedError {
    pub object_id: u32,
    pub code: u32,
    pub message: String,
}

/// A connected client: its transport and its object registry.
pub struct Client {
    id: ClientId,
    connection: Connection,
    objects: ObjectRegistry<Box<dyn RequestHandler>>,
    display: ResourceHandle,
    registries: Vec<ResourceHandle>,
    next_server_id: u32,
    error: Option<PostedError>,
}

impl Client {
    pub(crate) fn new(id: ClientId, socket: UnixStream, config: ConnectionConfig) -> Self {
        let mut objects: ObjectRegistry<Box<dyn RequestHandler>> = ObjectRegistry::new();
        let display = objects.create(&DISPLAY_INTERFACE, 1, WireConfig::DISPLAY_ID);
        // A freshly created entry always accepts an implementation.
        let _ = objects.set_implementation(display, Box::new(DisplayHandler), None, None);
        Self {
            id,
            connection: Connection::with_config(socket, config),
            objects,
            display,
            registries: Vec::new(),
            next_server_id: WireConfig::SERVER_ID_START,
            error: None,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    pub fn objects(&self) -> &ObjectRegistry<Box<dyn RequestHandler>> {
        &self.objects
    }

    pub fn objects_mut(&mut self) -> &mut ObjectRegistry<Box<dyn RequestHandler>> {
        &mut self.objects
    }

    /// The display resource at id 1.
    pub fn display_resource(&self) -> ResourceHandle {
        self.display
    }

    /// Live registry resources of this client.
    pub fn registries(&self) -> impl Iterator<Item = ResourceHandle> + '_ {
        self.registries
            .iter()
            .copied()
            .filter(|&handle| self.objects.is_live(handle))
    }

    pub(crate) fn add_registry(&mut self, handle: ResourceHandle) {
        self.registries.retain(|&h| self.objects.is_live(h));
        self.registries.push(handle);
    }

    /// Create a resource; id 0 allocates from the display's id range.
    pub fn create_resource(&mut self, interface: &'static Interface, version: u32, id: u32) -> ResourceHandle {
        let id = if id == 0 {
            let id = self.next_server_id;
            self.next_server_id = self.next_server_id.wrapping_add(1).max(WireConfig::SERVER_ID_START);
            id
        } else {
            id
        };
        self.objects.create(interface, version, id)
    }

    pub fn get_object(&self, id: u32) -> Option<ResourceHandle> {
        self.objects.lookup(id)
    }

    pub fn set_implementation<H>(
        &mut self,
        resource: ResourceHandle,
        handler: H,
        user_data: Option<UserData>,
        destructor: Option<Destructor>,
    ) -> Result<()>
    where
        H: RequestHandler + 'static,
    {
        self.objects
            .set_implementation(resource, Box::new(handler), user_data, destructor)
    }

    pub fn set_inert(&mut self, resource: ResourceHandle) -> Result<()> {
        self.objects.set_inert(resource)
    }

    pub fn is_alive(&self) -> bool {
        self.error.is_none()
    }

    /// The error that killed this client, if any.
    pub fn error(&self) -> Option<&PostedError> {
        self.error.as_ref()
    }

    /// Queue an event on `resource`.
    ///
    /// Events for a dead client are discarded.
    pub fn post_event(&mut self, resource: ResourceHandle, opcode: u16, args: &[Argument]) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        let interface = self
            .objects
            .interface(resource)
            .ok_or(SockwireError::StaleHandle { id: resource.id() })?;
        let desc = interface.event(opcode).ok_or_else(|| {
            SockwireError::invalid_argument(format!("{} has no event {opcode}", interface.name))
        })?;
        let version = self.objects.version(resource).unwrap_or(1);
        if desc.since() > version {
            return Err(SockwireError::invalid_argument(format!(
                "{}.{} needs version {}, resource has {}",
                interface.name,
                desc.name,
                desc.since(),
                version
            )));
        }
        self.connection
            .write_message(interface, resource.id(), opcode, desc, args, &self.objects)
    }

    /// Send a fatal error and mark the client dead.
    ///
    /// `resource` defaults to the display object when the offending object
    /// does not exist. Only the first error is sent.
    pub fn post_error(&mut self, resource: Option<ResourceHandle>, code: u32, message: impl Into<String>) {
        if !self.is_alive() {
            return;
        }
        let message = message.into();
        let resource = resource
            .filter(|&handle| self.objects.is_live(handle))
            .unwrap_or(self.display);
        warn!(
            "{}: error {} on object {}: {}",
            self.id,
            code,
            resource.id(),
            message
        );

        let args = [
            Argument::Object(Some(resource)),
            Argument::Uint(code),
            Argument::string(message.clone()),
        ];
        let display = self.display;
        if let Err(err) = self.post_event(display, protocol::DISPLAY_ERROR, &args) {
            debug!("{}: could not queue error event: {}", self.id, err);
        }
        if let Err(err) = self.connection.flush() {
            debug!("{}: could not flush error event: {}", self.id, err);
        }
        self.error = Some(PostedError {
            object_id: resource.id(),
            code,
            message,
        });
    }

    /// Post the display error matching a failed request.
    pub fn post_protocol_error(&mut self, resource: Option<ResourceHandle>, err: &SockwireError) {
        let resource = match err {
            SockwireError::InvalidObject { id, .. }
            | SockwireError::InvalidMethod { id, .. }
            | SockwireError::MalformedMessage { id, .. } => {
                self.objects.lookup(*id).or(resource)
            }
            _ => resource,
        };
        let code = err
            .display_error_code()
            .unwrap_or(DisplayErrorCode::Implementation);
        self.post_error(resource, code.code(), err.to_string());
    }

    /// Destroy a resource, telling the client its id is free again.
    pub fn destroy_resource(&mut self, resource: ResourceHandle) -> Result<()> {
        let id = resource.id();
        self.objects.destroy(resource)?;
        if id < WireConfig::SERVER_ID_START && self.objects.lookup(id).is_none() {
            let display = self.display;
            self.post_event(display, protocol::DISPLAY_DELETE_ID, &[Argument::Uint(id)])?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<usize> {
        self.connection.flush()
    }

    pub fn read(&mut self) -> Result<usize> {
        self.connection.read()
    }

    /// Decode and dispatch every complete buffered request.
    ///
    /// Stops at the first protocol error, which is posted to the client.
    pub(crate) fn dispatch_pending(&mut self, state: &mut DisplayState) -> usize {
        let mut dispatched = 0;
        while self.is_alive() {
            let message = match self.connection.read_message(&self.objects, Direction::Request) {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(err) => {
                    self.post_protocol_error(None, &err);
                    break;
                }
            };
            self.dispatch_message(state, message);
            dispatched += 1;
        }
        dispatched
    }

    fn dispatch_message(&mut self, state: &mut DisplayState, message: Message) {
        let Some((resource, interface, desc)) = self.resolve_request(&message) else {
            return;
        };
        self.connection
            .trace(" <- ", interface, message.object_id, desc, &message.args);

        if let Err(err) = self.check_version(resource, interface, desc, &message) {
            self.post_protocol_error(Some(resource), &err);
            return;
        }
        if let Err(err) = self.check_new_ids(&message) {
            // Reported on the display object, like any other bad id.
            let code = DisplayErrorCode::InvalidObject.code();
            self.post_error(None, code, err.to_string());
            return;
        }

        let inert = self.objects.is_inert(resource);
        if inert && !desc.destructor {
            trace!(
                "{}: dropping {}@{}.{} for inert object",
                self.id,
                interface.name,
                resource.id(),
                desc.name
            );
            self.adopt_new_ids(resource, desc, &message);
            return;
        }

        let result = match self.objects.take_implementation(resource) {
            Some(mut handler) => {
                let mut cx = RequestContext {
                    client: self,
                    display: state,
                };
                let result = handler.request(&mut cx, resource, message);
                self.objects.restore_implementation(resource, handler);
                result
            }
            None if inert => Ok(()),
            None => Err(SockwireError::Implementation {
                message: format!(
                    "{}@{} has no implementation for {}",
                    interface.name,
                    resource.id(),
                    desc.name
                ),
            }),
        };

        match result {
            Ok(()) => {
                if desc.destructor && self.objects.is_live(resource) {
                    if let Err(err) = self.destroy_resource(resource) {
                        debug!("{}: destroying {}@{} failed: {}", self.id, interface.name, resource.id(), err);
                    }
                }
            }
            Err(err) => self.post_protocol_error(Some(resource), &err),
        }
    }

    fn resolve_request(
        &self,
        message: &Message,
    ) -> Option<(ResourceHandle, &'static Interface, &'static MessageDesc)> {
        let resource = self.objects.lookup(message.object_id)?;
        let interface = self.objects.interface(resource)?;
        let desc = interface.request(message.opcode)?;
        Some((resource, interface, desc))
    }

    fn check_version(
        &self,
        resource: ResourceHandle,
        interface: &'static Interface,
        desc: &MessageDesc,
        message: &Message,
    ) -> Result<()> {
        let version = self.objects.version(resource).unwrap_or(1);
        if desc.since() > version {
            debug!(
                "{}: {}@{}.{} needs version {}, resource has {}",
                self.id,
                interface.name,
                resource.id(),
                desc.name,
                desc.since(),
                version
            );
            return Err(SockwireError::InvalidMethod {
                id: resource.id(),
                interface: interface.name,
                opcode: message.opcode,
            });
        }
        Ok(())
    }

    /// New ids must be unused and inside the client's range.
    fn check_new_ids(&self, message: &Message) -> Result<()> {
        for arg in &message.args {
            let Argument::NewId(id) = *arg else {
                continue;
            };
            if id == 0 {
                continue;
            }
            if id >= WireConfig::SERVER_ID_START {
                return Err(SockwireError::InvalidObject {
                    id,
                    message: format!("new id {id} is outside the client range"),
                });
            }
            if self.objects.lookup(id).is_some() {
                return Err(SockwireError::InvalidObject {
                    id,
                    message: format!("new id {id} is already in use"),
                });
            }
        }
        Ok(())
    }

    /// Register new ids of a dropped request as inert placeholders so that
    /// later requests on them are not unknown-object errors.
    fn adopt_new_ids(&mut self, parent: ResourceHandle, desc: &MessageDesc, message: &Message) {
        let version = self.objects.version(parent).unwrap_or(1);
        for (spec, arg) in desc.args().zip(&message.args) {
            let (Ok(spec), Argument::NewId(id)) = (spec, arg) else {
                continue;
            };
            if spec.kind != ArgKind::NewId || *id == 0 {
                continue;
            }
            let Some(interface) = spec.interface else {
                continue;
            };
            let placeholder = self.objects.create(interface, version, *id);
            let _ = self.objects.set_inert(placeholder);
        }
    }

    /// Destroy every remaining resource.
    pub(crate) fn teardown(&mut self) -> usize {
        self.registries.clear();
        self.objects.destroy_all()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.teardown();
    }
}
