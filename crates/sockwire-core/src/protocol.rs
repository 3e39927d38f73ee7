//! Built-in protocol objects shared by both peers.
//!
//! - `sw_display` (always id 1): `sync`, `get_registry`; events `error`, `delete_id`
//! - `sw_registry`: `bind`; events `global`, `global_remove`
//! - `sw_callback`: destructor event `done`

use crate::wire::{Interface, MessageDesc};

pub const DISPLAY_SYNC: u16 = 0;
pub const DISPLAY_GET_REGISTRY: u16 = 1;
pub const DISPLAY_ERROR: u16 = 0;
pub const DISPLAY_DELETE_ID: u16 = 1;

pub const REGISTRY_BIND: u16 = 0;
pub const REGISTRY_GLOBAL: u16 = 0;
pub const REGISTRY_GLOBAL_REMOVE: u16 = 1;

pub const CALLBACK_DONE: u16 = 0;

/// Error codes carried by the display `error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DisplayErrorCode {
    /// Unknown object, wrong interface or bad version.
    InvalidObject = 0,
    /// Unknown opcode or undecodable arguments.
    InvalidMethod = 1,
    NoMemory = 2,
    /// The display-side implementation failed.
    Implementation = 3,
}

impl DisplayErrorCode {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(DisplayErrorCode::InvalidObject),
            1 => Some(DisplayErrorCode::InvalidMethod),
            2 => Some(DisplayErrorCode::NoMemory),
            3 => Some(DisplayErrorCode::Implementation),
            _ => None,
        }
    }
}

static SYNC_TYPES: [Option<&Interface>; 1] = [Some(&CALLBACK_INTERFACE)];
static GET_REGISTRY_TYPES: [Option<&Interface>; 1] = [Some(&REGISTRY_INTERFACE)];
static ERROR_TYPES: [Option<&Interface>; 3] = [None, None, None];
static BIND_TYPES: [Option<&Interface>; 4] = [None, None, None, None];

static DISPLAY_REQUESTS: [MessageDesc; 2] = [
    MessageDesc::new("sync", "n", &SYNC_TYPES),
    MessageDesc::new("get_registry", "n", &GET_REGISTRY_TYPES),
];

static DISPLAY_EVENTS: [MessageDesc; 2] = [
    MessageDesc::new("error", "ous", &ERROR_TYPES),
    MessageDesc::new("delete_id", "u", &[]),
];

pub static DISPLAY_INTERFACE: Interface = Interface {
    name: "sw_display",
    version: 1,
    requests: &DISPLAY_REQUESTS,
    events: &DISPLAY_EVENTS,
};

static REGISTRY_REQUESTS: [MessageDesc; 1] = [MessageDesc::new("bind", "usun", &BIND_TYPES)];

static REGISTRY_EVENTS: [MessageDesc; 2] = [
    MessageDesc::new("global", "usu", &[]),
    MessageDesc::new("global_remove", "u", &[]),
];

pub static REGISTRY_INTERFACE: Interface = Interface {
    name: "sw_registry",
    version: 1,
    requests: &REGISTRY_REQUESTS,
    events: &REGISTRY_EVENTS,
};

static CALLBACK_EVENTS: [MessageDesc; 1] = [MessageDesc::new("done", "u", &[]).destructor()];

pub static CALLBACK_INTERFACE: Interface = Interface {
    name: "sw_callback",
    version: 1,
    requests: &[],
    events: &CALLBACK_EVENTS,
};
