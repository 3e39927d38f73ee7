//! Decoded message values.

use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};

use super::signature::{ArgKind, Interface, MessageDesc};
use crate::registry::ResourceHandle;

/// 24.8 signed fixed-point number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Fixed(i32);

impl Fixed {
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    pub const fn from_int(value: i32) -> Self {
        Self(value.wrapping_mul(256))
    }

    /// Integer part, rounded toward zero.
    pub const fn to_int(self) -> i32 {
        self.0 / 256
    }

    pub fn from_f64(value: f64) -> Self {
        Self((value * 256.0).round() as i32)
    }

    pub fn to_f64(self) -> f64 {
        f64::from(self.0) / 256.0
    }
}

impl fmt::Display for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

/// A single argument value.
#[derive(Debug)]
pub enum Argument {
    Int(i32),
    Uint(u32),
    Fixed(Fixed),
    /// `None` is the null string, distinct from the empty string.
    Str(Option<String>),
    Array(Vec<u8>),
    Object(Option<ResourceHandle>),
    NewId(u32),
    Fd(OwnedFd),
}

impl Argument {
    pub fn kind(&self) -> ArgKind {
        match self {
            Argument::Int(_) => ArgKind::Int,
            Argument::Uint(_) => ArgKind::Uint,
            Argument::Fixed(_) => ArgKind::Fixed,
            Argument::Str(_) => ArgKind::Str,
            Argument::Array(_) => ArgKind::Array,
            Argument::Object(_) => ArgKind::Object,
            Argument::NewId(_) => ArgKind::NewId,
            Argument::Fd(_) => ArgKind::Fd,
        }
    }

    /// Convenience constructor for a non-null string.
    pub fn string(value: impl Into<String>) -> Self {
        Argument::Str(Some(value.into()))
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Argument::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u32> {
        match self {
            Argument::Uint(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_fixed(&self) -> Option<Fixed> {
        match self {
            Argument::Fixed(value) => Some(*value),
            _ => None,
        }
    }

    /// The string value; `None` for null strings and other kinds.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Argument::Str(value) => value.as_deref(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[u8]> {
        match self {
            Argument::Array(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ResourceHandle> {
        match self {
            Argument::Object(handle) => *handle,
            _ => None,
        }
    }

    pub fn as_new_id(&self) -> Option<u32> {
        match self {
            Argument::NewId(id) => Some(*id),
            _ => None,
        }
    }

    pub fn into_fd(self) -> Option<OwnedFd> {
        match self {
            Argument::Fd(fd) => Some(fd),
            _ => None,
        }
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Argument::Int(value) => write!(f, "{value}"),
            Argument::Uint(value) => write!(f, "{value}"),
            Argument::Fixed(value) => write!(f, "{value}"),
            Argument::Str(Some(value)) => write!(f, "\"{value}\""),
            Argument::Str(None) | Argument::Object(None) => f.write_str("nil"),
            Argument::Array(bytes) => write!(f, "array[{}]", bytes.len()),
            Argument::Object(Some(handle)) => write!(f, "object {}", handle.id()),
            Argument::NewId(id) => write!(f, "new id {id}"),
            Argument::Fd(fd) => write!(f, "fd {}", fd.as_raw_fd()),
        }
    }
}

/// A decoded message.
#[derive(Debug)]
pub struct Message {
    /// Target object id.
    pub object_id: u32,
    pub opcode: u16,
    /// Encoded size including the 8-byte header.
    pub size: usize,
    pub args: Vec<Argument>,
}

impl Message {
    pub fn arg(&self, index: usize) -> Option<&Argument> {
        self.args.get(index)
    }

    /// Remove and return the descriptor at `index`, if that argument is one.
    pub fn take_fd(&mut self, index: usize) -> Option<OwnedFd> {
        match self.args.get(index) {
            Some(Argument::Fd(_)) => self.args.remove(index).into_fd(),
            _ => None,
        }
    }
}

/// Formats a message as `interface@id.name(args...)` for wire traces.
pub struct MessageTrace<'a> {
    pub interface: &'a Interface,
    pub object_id: u32,
    pub desc: &'a MessageDesc,
    pub args: &'a [Argument],
}

impl fmt::Display for MessageTrace<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}.{}(", self.interface.name, self.object_id, self.desc.name)?;
        for (index, arg) in self.args.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_conversions() {
        assert_eq!(Fixed::from_int(3).raw(), 768);
        assert_eq!(Fixed::from_int(-2).to_int(), -2);
        assert_eq!(Fixed::from_f64(1.5).raw(), 384);
        assert_eq!(Fixed::from_raw(-128).to_f64(), -0.5);
        assert_eq!(Fixed::from_f64(-0.5).to_f64(), -0.5);
    }

    #[test]
    fn test_accessors_are_kind_checked() {
        let arg = Argument::Uint(7);
        assert_eq!(arg.as_uint(), Some(7));
        assert_eq!(arg.as_int(), None);
        assert_eq!(arg.kind(), ArgKind::Uint);

        assert_eq!(Argument::Str(None).as_str(), None);
        assert_eq!(Argument::string("").as_str(), Some(""));
    }

    #[test]
    fn test_trace_format() {
        static DESC: MessageDesc = MessageDesc::new("frob", "usa?s", &[]);
        static IFACE: Interface = Interface {
            name: "test_frob",
            version: 1,
            requests: &[],
            events: &[],
        };
        let args = vec![
            Argument::Uint(4),
            Argument::string("hi"),
            Argument::Array(vec![1, 2, 3]),
            Argument::Str(None),
        ];
        let trace = MessageTrace {
            interface: &IFACE,
            object_id: 9,
            desc: &DESC,
            args: &args,
        };
        assert_eq!(trace.to_string(), "test_frob@9.frob(4, \"hi\", array[3], nil)");
    }

    #[test]
    fn test_take_fd_only_takes_descriptors() {
        let file = tempfile::tempfile().unwrap();
        let mut message = Message {
            object_id: 3,
            opcode: 0,
            size: 16,
            args: vec![Argument::Uint(1), Argument::Fd(OwnedFd::from(file))],
        };
        assert!(message.take_fd(0).is_none());
        assert!(message.take_fd(1).is_some());
        assert_eq!(message.args.len(), 1);
    }
}
