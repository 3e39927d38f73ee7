//! Globals: advertised factories clients bind to.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{Result, SockwireError};
use crate::wire::Interface;

/// Numeric name a global is advertised under.
pub type GlobalName = u32;

/// One advertised `(interface, version, bind)` record.
pub struct Global<B> {
    name: GlobalName,
    interface: &'static Interface,
    version: u32,
    bind: B,
    removed: bool,
}

impl<B> Global<B> {
    pub fn name(&self) -> GlobalName {
        self.name
    }

    pub fn interface(&self) -> &'static Interface {
        self.interface
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn bind(&self) -> &B {
        &self.bind
    }

    /// Withdrawn from advertisement but not yet destroyed.
    pub fn is_removed(&self) -> bool {
        self.removed
    }
}

/// Name-keyed set of globals of one display.
///
/// Names start at 1 and are never reused.
pub struct GlobalList<B> {
    globals: BTreeMap<GlobalName, Global<B>>,
    next_name: GlobalName,
}

impl<B> Default for GlobalList<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B> GlobalList<B> {
    pub fn new() -> Self {
        Self {
            globals: BTreeMap::new(),
            next_name: 1,
        }
    }

    /// Add a global advertising `interface` at `version`.
    ///
    /// The version must be between 1 and the interface's own version.
    /// Several globals may share an interface.
    pub fn add(&mut self, interface: &'static Interface, version: u32, bind: B) -> Result<GlobalName> {
        if version == 0 || version > interface.version {
            return Err(SockwireError::InvalidGlobalVersion {
                interface: interface.name,
                version,
                max: interface.version,
            });
        }

        if self.iter_advertised().any(|g| g.interface == interface) {
            debug!("Adding another {} global", interface.name);
        }

        let name = self.next_name;
        self.next_name += 1;
        self.globals.insert(
            name,
            Global {
                name,
                interface,
                version,
                bind,
                removed: false,
            },
        );
        debug!("Added global {} {} v{}", name, interface.name, version);
        Ok(name)
    }

    /// Withdraw a global. The record stays so that binds already in flight
    /// still resolve.
    pub fn remove(&mut self, name: GlobalName) -> Result<&Global<B>> {
        let global = self
            .globals
            .get_mut(&name)
            .ok_or(SockwireError::UnknownGlobal { name })?;
        if global.removed {
            debug!("Global {} removed twice", name);
        }
        global.removed = true;
        Ok(global)
    }

    /// Forget a global entirely.
    pub fn destroy(&mut self, name: GlobalName) -> Option<Global<B>> {
        self.globals.remove(&name)
    }

    pub fn get(&self, name: GlobalName) -> Option<&Global<B>> {
        self.globals.get(&name)
    }

    /// Globals not withdrawn, in name order.
    pub fn iter_advertised(&self) -> impl Iterator<Item = &Global<B>> {
        self.globals.values().filter(|g| !g.removed)
    }

    pub fn len(&self) -> usize {
        self.globals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.globals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static OUTPUT: Interface = Interface {
        name: "test_output",
        version: 3,
        requests: &[],
        events: &[],
    };

    #[test]
    fn test_add_assigns_increasing_names() {
        let mut globals = GlobalList::new();
        assert_eq!(globals.add(&OUTPUT, 1, ()).unwrap(), 1);
        assert_eq!(globals.add(&OUTPUT, 3, ()).unwrap(), 2);
        assert_eq!(globals.len(), 2);
        assert_eq!(globals.get(2).map(Global::version), Some(3));
    }

    #[test]
    fn test_version_bounds() {
        let mut globals = GlobalList::new();
        assert!(matches!(
            globals.add(&OUTPUT, 0, ()),
            Err(SockwireError::InvalidGlobalVersion { version: 0, .. })
        ));
        assert!(matches!(
            globals.add(&OUTPUT, 4, ()),
            Err(SockwireError::InvalidGlobalVersion { version: 4, max: 3, .. })
        ));
        assert!(globals.is_empty());
    }

    #[test]
    fn test_remove_keeps_record() {
        let mut globals = GlobalList::new();
        let first = globals.add(&OUTPUT, 1, ()).unwrap();
        let second = globals.add(&OUTPUT, 1, ()).unwrap();

        assert!(globals.remove(first).unwrap().is_removed());
        assert!(globals.get(first).is_some());
        let advertised: Vec<_> = globals.iter_advertised().map(Global::name).collect();
        assert_eq!(advertised, vec![second]);

        assert!(globals.destroy(first).is_some());
        assert!(globals.get(first).is_none());
        assert!(matches!(
            globals.remove(first),
            Err(SockwireError::UnknownGlobal { name }) if name == first
        ));
    }
}
