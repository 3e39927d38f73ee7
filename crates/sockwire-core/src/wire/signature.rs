//! Interface descriptions and message signatures.
//!
//! A signature is a compact string with one character per argument:
//!
//! | char | argument |
//! |------|----------|
//! | `i`  | signed 32-bit integer |
//! | `u`  | unsigned 32-bit integer |
//! | `f`  | 24.8 fixed point |
//! | `s`  | string |
//! | `a`  | byte array |
//! | `o`  | object reference |
//! | `n`  | new object id |
//! | `h`  | file descriptor |
//!
//! A `?` before a character marks the argument nullable. Leading decimal
//! digits give the interface version the message first appeared in.

use std::fmt;

use crate::error::{Result, SockwireError};

/// Kind of a single argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Int,
    Uint,
    Fixed,
    Str,
    Array,
    Object,
    NewId,
    Fd,
}

impl ArgKind {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            b'i' => Some(ArgKind::Int),
            b'u' => Some(ArgKind::Uint),
            b'f' => Some(ArgKind::Fixed),
            b's' => Some(ArgKind::Str),
            b'a' => Some(ArgKind::Array),
            b'o' => Some(ArgKind::Object),
            b'n' => Some(ArgKind::NewId),
            b'h' => Some(ArgKind::Fd),
            _ => None,
        }
    }

    pub fn code(self) -> char {
        match self {
            ArgKind::Int => 'i',
            ArgKind::Uint => 'u',
            ArgKind::Fixed => 'f',
            ArgKind::Str => 's',
            ArgKind::Array => 'a',
            ArgKind::Object => 'o',
            ArgKind::NewId => 'n',
            ArgKind::Fd => 'h',
        }
    }

    /// Whether a null value can be expressed for this kind at all.
    pub fn supports_null(self) -> bool {
        matches!(self, ArgKind::Str | ArgKind::Object | ArgKind::NewId)
    }
}

/// One parsed signature position.
#[derive(Debug, Clone, Copy)]
pub struct ArgSpec {
    pub kind: ArgKind,
    pub nullable: bool,
    /// Expected interface for `o` and `n` arguments; `None` accepts any.
    pub interface: Option<&'static Interface>,
}

/// Description of one request or event.
#[derive(Clone, Copy)]
pub struct MessageDesc {
    pub name: &'static str,
    pub signature: &'static str,
    /// One entry per argument, parallel to the signature.
    pub types: &'static [Option<&'static Interface>],
    /// Receiving this message destroys the target object.
    pub destructor: bool,
}

impl MessageDesc {
    pub const fn new(
        name: &'static str,
        signature: &'static str,
        types: &'static [Option<&'static Interface>],
    ) -> Self {
        Self {
            name,
            signature,
            types,
            destructor: false,
        }
    }

    /// Mark the message as a destructor.
    pub const fn destructor(mut self) -> Self {
        self.destructor = true;
        self
    }

    /// Interface version this message first appeared in (default 1).
    pub fn since(&self) -> u32 {
        let digits: String = self
            .signature
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();
        digits.parse().unwrap_or(1)
    }

    /// Iterate over the argument positions of the signature.
    pub fn args(&self) -> SignatureIter {
        SignatureIter {
            signature: self.signature,
            bytes: self.signature.as_bytes(),
            pos: self
                .signature
                .bytes()
                .take_while(u8::is_ascii_digit)
                .count(),
            index: 0,
            types: self.types,
        }
    }

    /// Number of arguments; malformed signatures count what parses.
    pub fn arg_count(&self) -> usize {
        self.args().filter(|spec| spec.is_ok()).count()
    }

    /// Number of file-descriptor arguments.
    pub fn fd_count(&self) -> usize {
        self.args()
            .filter(|spec| matches!(spec, Ok(spec) if spec.kind == ArgKind::Fd))
            .count()
    }

    /// Check that the signature parses and nullable markers sit on kinds that can be null.
    pub fn validate(&self) -> Result<()> {
        for spec in self.args() {
            let spec = spec?;
            if spec.nullable && !spec.kind.supports_null() {
                return Err(SockwireError::InvalidSignature {
                    signature: self.signature,
                    message: format!("'{}' cannot be nullable", spec.kind.code()),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for MessageDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types: Vec<Option<&str>> = self.types.iter().map(|t| t.map(|i| i.name)).collect();
        f.debug_struct("MessageDesc")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .field("types", &types)
            .field("destructor", &self.destructor)
            .finish()
    }
}

/// Iterator over the argument positions of a signature.
#[derive(Debug, Clone)]
pub struct SignatureIter {
    signature: &'static str,
    bytes: &'static [u8],
    pos: usize,
    index: usize,
    types: &'static [Option<&'static Interface>],
}

impl Iterator for SignatureIter {
    type Item = Result<ArgSpec>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut nullable = false;
        let code = loop {
            let code = *self.bytes.get(self.pos)?;
            self.pos += 1;
            if code == b'?' {
                nullable = true;
                continue;
            }
            break code;
        };

        let Some(kind) = ArgKind::from_code(code) else {
            // Stop after the first bad character.
            self.pos = self.bytes.len();
            return Some(Err(SockwireError::InvalidSignature {
                signature: self.signature,
                message: format!("unknown argument type '{}'", code as char),
            }));
        };

        let interface = self.types.get(self.index).copied().flatten();
        self.index += 1;
        Some(Ok(ArgSpec {
            kind,
            nullable,
            interface,
        }))
    }
}

/// Which table of an interface a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to display.
    Request,
    /// Display to client.
    Event,
}

/// A protocol interface: name, version and its request and event tables.
pub struct Interface {
    pub name: &'static str,
    pub version: u32,
    pub requests: &'static [MessageDesc],
    pub events: &'static [MessageDesc],
}

impl Interface {
    pub fn request(&self, opcode: u16) -> Option<&'static MessageDesc> {
        self.requests.get(opcode as usize)
    }

    pub fn event(&self, opcode: u16) -> Option<&'static MessageDesc> {
        self.events.get(opcode as usize)
    }

    pub fn message(&self, direction: Direction, opcode: u16) -> Option<&'static MessageDesc> {
        match direction {
            Direction::Request => self.request(opcode),
            Direction::Event => self.event(opcode),
        }
    }
}

// Interfaces are compared by name so that separately declared tables for the
// same protocol object interoperate.
impl PartialEq for Interface {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other) || self.name == other.name
    }
}

impl Eq for Interface {}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("requests", &self.requests.len())
            .field("events", &self.events.len())
            .finish()
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static TARGET: Interface = Interface {
        name: "test_target",
        version: 1,
        requests: &[],
        events: &[],
    };

    static MIXED_TYPES: [Option<&Interface>; 5] = [None, None, Some(&TARGET), None, None];

    #[test]
    fn test_parse_signature() {
        let desc = MessageDesc::new("mixed", "2is?ouh", &MIXED_TYPES);
        let kinds: Vec<(ArgKind, bool)> = desc
            .args()
            .map(|spec| spec.map(|s| (s.kind, s.nullable)).unwrap())
            .collect();
        assert_eq!(
            kinds,
            vec![
                (ArgKind::Int, false),
                (ArgKind::Str, false),
                (ArgKind::Object, true),
                (ArgKind::Uint, false),
                (ArgKind::Fd, false),
            ]
        );
        assert_eq!(desc.since(), 2);
        assert_eq!(desc.arg_count(), 5);
        assert_eq!(desc.fd_count(), 1);

        let object = desc.args().nth(2).unwrap().unwrap();
        assert_eq!(object.interface.map(|i| i.name), Some("test_target"));
    }

    #[test]
    fn test_since_defaults_to_one() {
        assert_eq!(MessageDesc::new("plain", "u", &[]).since(), 1);
        assert_eq!(MessageDesc::new("empty", "", &[]).since(), 1);
        assert_eq!(MessageDesc::new("late", "12", &[]).since(), 12);
    }

    #[test]
    fn test_unknown_code_is_an_error() {
        let desc = MessageDesc::new("bad", "ix", &[]);
        let results: Vec<_> = desc.args().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(SockwireError::InvalidSignature { .. })));
        assert!(desc.validate().is_err());
    }

    #[test]
    fn test_nullable_int_is_invalid() {
        assert!(MessageDesc::new("bad", "?i", &[]).validate().is_err());
        assert!(MessageDesc::new("good", "?s?o", &[]).validate().is_ok());
    }

    #[test]
    fn test_interface_lookup() {
        static REQUESTS: [MessageDesc; 1] = [MessageDesc::new("destroy", "", &[]).destructor()];
        static WITH_REQUESTS: Interface = Interface {
            name: "with_requests",
            version: 3,
            requests: &REQUESTS,
            events: &[],
        };
        assert!(WITH_REQUESTS.request(0).unwrap().destructor);
        assert!(WITH_REQUESTS.request(1).is_none());
        assert!(WITH_REQUESTS.message(Direction::Event, 0).is_none());
        assert_ne!(WITH_REQUESTS, TARGET);
    }
}
