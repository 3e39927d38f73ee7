//! Per-connection object registry.
//!
//! Each connection endpoint owns one [`ObjectRegistry`] mapping 32-bit wire
//! ids to resources. Entries are stored by a serial that is never reused, and
//! callers hold [`ResourceHandle`]s (`id` + `serial`), so a handle to a
//! destroyed or replaced entry can never alias a newer entry at the same id.
//!
//! Creating an entry at an id that is already mapped replaces the mapping.
//! The old entry stays alive and can still be destroyed through its handle;
//! destroying it does not disturb the new mapping.

mod global;

pub use global::{Global, GlobalList, GlobalName};

use std::any::Any;
use std::collections::HashMap;

use tracing::{debug, error};

use crate::error::{Result, SockwireError};
use crate::wire::{Interface, ObjectMap};

/// Reference to one registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    id: u32,
    serial: u64,
}

impl ResourceHandle {
    /// Wire id the entry was created at.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Unique creation serial of the entry.
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

/// Opaque per-resource data.
pub type UserData = Box<dyn Any + Send>;

/// Runs first when a resource is destroyed, receiving its user data.
pub type Destructor = Box<dyn FnOnce(ResourceHandle, Option<UserData>) + Send>;

/// Runs after the destructor, in registration order.
pub type DestroyListener = Box<dyn FnOnce(ResourceHandle) + Send>;

struct Entry<I> {
    id: u32,
    interface: &'static Interface,
    version: u32,
    implementation: Option<I>,
    user_data: Option<UserData>,
    destructor: Option<Destructor>,
    listeners: Vec<DestroyListener>,
    inert: bool,
}

/// Id-addressed object table of one connection endpoint.
///
/// `I` is the handler type stored per entry: request handlers on the display
/// side, event listeners on the client side.
pub struct ObjectRegistry<I> {
    ids: HashMap<u32, u64>,
    entries: HashMap<u64, Entry<I>>,
    next_serial: u64,
}

impl<I> Default for ObjectRegistry<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I> ObjectRegistry<I> {
    pub fn new() -> Self {
        Self {
            ids: HashMap::new(),
            entries: HashMap::new(),
            next_serial: 1,
        }
    }

    /// Create an entry at `id`, replacing any existing mapping.
    pub fn create(&mut self, interface: &'static Interface, version: u32, id: u32) -> ResourceHandle {
        let serial = self.next_serial;
        self.next_serial += 1;

        self.entries.insert(
            serial,
            Entry {
                id,
                interface,
                version,
                implementation: None,
                user_data: None,
                destructor: None,
                listeners: Vec::new(),
                inert: false,
            },
        );
        if let Some(previous) = self.ids.insert(id, serial) {
            debug!(
                "{}@{} replaces entry {} at the same id",
                interface.name, id, previous
            );
        }
        ResourceHandle { id, serial }
    }

    /// Live entry currently reachable at `id`.
    pub fn lookup(&self, id: u32) -> Option<ResourceHandle> {
        self.ids
            .get(&id)
            .map(|&serial| ResourceHandle { id, serial })
    }

    /// Whether the handle still refers to an undestroyed entry.
    ///
    /// A replaced entry is still live; it is only unreachable by id.
    pub fn is_live(&self, handle: ResourceHandle) -> bool {
        self.entries.contains_key(&handle.serial)
    }

    fn entry(&self, handle: ResourceHandle) -> Option<&Entry<I>> {
        self.entries.get(&handle.serial)
    }

    fn entry_mut(&mut self, handle: ResourceHandle) -> Result<&mut Entry<I>> {
        self.entries
            .get_mut(&handle.serial)
            .ok_or(SockwireError::StaleHandle { id: handle.id })
    }

    pub fn interface(&self, handle: ResourceHandle) -> Option<&'static Interface> {
        self.entry(handle).map(|entry| entry.interface)
    }

    pub fn version(&self, handle: ResourceHandle) -> Option<u32> {
        self.entry(handle).map(|entry| entry.version)
    }

    /// Install the handler, user data and destructor in one step.
    pub fn set_implementation(
        &mut self,
        handle: ResourceHandle,
        implementation: I,
        user_data: Option<UserData>,
        destructor: Option<Destructor>,
    ) -> Result<()> {
        let entry = self.entry_mut(handle)?;
        entry.implementation = Some(implementation);
        entry.user_data = user_data;
        entry.destructor = destructor;
        Ok(())
    }

    pub fn set_user_data(&mut self, handle: ResourceHandle, user_data: UserData) -> Result<()> {
        self.entry_mut(handle)?.user_data = Some(user_data);
        Ok(())
    }

    pub fn user_data<T: Any>(&self, handle: ResourceHandle) -> Option<&T> {
        self.entry(handle)?.user_data.as_ref()?.downcast_ref()
    }

    pub fn user_data_mut<T: Any>(&mut self, handle: ResourceHandle) -> Option<&mut T> {
        self.entries
            .get_mut(&handle.serial)?
            .user_data
            .as_mut()?
            .downcast_mut()
    }

    pub fn set_destructor(&mut self, handle: ResourceHandle, destructor: Destructor) -> Result<()> {
        self.entry_mut(handle)?.destructor = Some(destructor);
        Ok(())
    }

    /// Append a destroy listener; listeners accumulate.
    pub fn add_destroy_listener(
        &mut self,
        handle: ResourceHandle,
        listener: DestroyListener,
    ) -> Result<()> {
        self.entry_mut(handle)?.listeners.push(listener);
        Ok(())
    }

    /// Mark the entry inert. Runs no callbacks; idempotent.
    pub fn set_inert(&mut self, handle: ResourceHandle) -> Result<()> {
        self.entry_mut(handle)?.inert = true;
        Ok(())
    }

    pub fn is_inert(&self, handle: ResourceHandle) -> bool {
        self.entry(handle).is_some_and(|entry| entry.inert)
    }

    /// Borrow the handler out of the entry for a call.
    ///
    /// Put it back with [`restore_implementation`](Self::restore_implementation).
    pub fn take_implementation(&mut self, handle: ResourceHandle) -> Option<I> {
        self.entries.get_mut(&handle.serial)?.implementation.take()
    }

    /// Return a handler taken with [`take_implementation`](Self::take_implementation).
    ///
    /// Dropped if the entry was destroyed meanwhile or received a new handler.
    pub fn restore_implementation(&mut self, handle: ResourceHandle, implementation: I) {
        if let Some(entry) = self.entries.get_mut(&handle.serial) {
            if entry.implementation.is_none() {
                entry.implementation = Some(implementation);
            }
        }
    }

    pub fn has_implementation(&self, handle: ResourceHandle) -> bool {
        self.entry(handle)
            .is_some_and(|entry| entry.implementation.is_some())
    }

    /// Destroy the entry: destructor, listeners in order, unmap, free.
    ///
    /// Destroying a stale handle is a programming error. It panics in debug
    /// builds and returns [`SockwireError::StaleHandle`] otherwise; no other
    /// entry is touched either way.
    pub fn destroy(&mut self, handle: ResourceHandle) -> Result<()> {
        let Some(mut entry) = self.entries.remove(&handle.serial) else {
            error!("destroy of stale resource handle for id {}", handle.id);
            debug_assert!(false, "destroy of stale resource handle for id {}", handle.id);
            return Err(SockwireError::StaleHandle { id: handle.id });
        };

        if let Some(destructor) = entry.destructor.take() {
            destructor(handle, entry.user_data.take());
        }
        for listener in entry.listeners.drain(..) {
            listener(handle);
        }
        if self.ids.get(&entry.id) == Some(&handle.serial) {
            self.ids.remove(&entry.id);
        }
        drop(entry);
        Ok(())
    }

    /// Destroy every remaining entry in creation order.
    pub fn destroy_all(&mut self) -> usize {
        let mut serials: Vec<(u64, u32)> = self
            .entries
            .iter()
            .map(|(&serial, entry)| (serial, entry.id))
            .collect();
        serials.sort_unstable();

        let count = serials.len();
        for (serial, id) in serials {
            // A destructor may already have destroyed a later entry.
            if self.entries.contains_key(&serial) {
                let _ = self.destroy(ResourceHandle { id, serial });
            }
        }
        count
    }

    /// Number of live entries, replaced ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids currently mapped, in no particular order.
    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.ids.keys().copied()
    }
}

impl<I> ObjectMap for ObjectRegistry<I> {
    fn wire_id(&self, handle: ResourceHandle) -> Option<u32> {
        self.entry(handle).map(|entry| entry.id)
    }

    fn resolve(&self, id: u32) -> Option<(ResourceHandle, &'static Interface)> {
        let handle = self.lookup(id)?;
        Some((handle, self.entry(handle)?.interface))
    }
}
