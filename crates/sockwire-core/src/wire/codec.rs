//! Signature-driven encoding and decoding of protocol messages.
//!
//! Layout of a message on the wire, all integers in native byte order:
//!
//! ```text
//! [object id: u32][opcode: u16][size: u16][arguments...]
//! ```
//!
//! `size` counts the header. Strings are a `u32` length including the
//! terminating NUL, the bytes, the NUL, padded to 4; a null string has
//! length 0. Arrays are a `u32` length and the bytes, padded to 4. Objects
//! and new ids are `u32`s, 0 meaning null. File descriptors never appear in
//! the payload; they travel in `SCM_RIGHTS` control messages, one per `h`
//! argument, in signature order.

use std::collections::VecDeque;
use std::os::fd::OwnedFd;

use super::message::{Argument, Fixed, Message};
use super::signature::{ArgKind, ArgSpec, Direction, Interface, MessageDesc};
use crate::config::WireConfig;
use crate::error::{Result, SockwireError};
use crate::registry::ResourceHandle;
use crate::ring::RingBuffer;

/// Translation between local object handles and wire ids.
pub trait ObjectMap {
    /// Wire id of a live object, `None` if the handle is stale.
    fn wire_id(&self, handle: ResourceHandle) -> Option<u32>;

    /// Live object reachable at `id`, with its interface.
    fn resolve(&self, id: u32) -> Option<(ResourceHandle, &'static Interface)>;
}

/// Fixed 8-byte message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub object_id: u32,
    pub opcode: u16,
    pub size: u16,
}

impl Header {
    pub const SIZE: usize = WireConfig::HEADER_SIZE;

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            object_id: u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            opcode: u16::from_ne_bytes([bytes[4], bytes[5]]),
            size: u16::from_ne_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&self.object_id.to_ne_bytes());
        bytes[4..6].copy_from_slice(&self.opcode.to_ne_bytes());
        bytes[6..].copy_from_slice(&self.size.to_ne_bytes());
        bytes
    }

    /// Peek at the next header without consuming anything.
    ///
    /// Returns `Ok(None)` while fewer than 8 bytes, or fewer than the declared
    /// size, are buffered. A declared size below 8, not a multiple of 4 or
    /// larger than the ring is a protocol error.
    pub fn peek(ring: &RingBuffer) -> Result<Option<Header>> {
        if ring.size() < Self::SIZE {
            return Ok(None);
        }
        let mut raw = [0u8; 8];
        ring.copy(&mut raw);
        let header = Header::from_bytes(raw);

        let size = header.size as usize;
        if size < Self::SIZE || size % 4 != 0 || size > ring.capacity() {
            return Err(SockwireError::malformed(
                header.object_id,
                format!("invalid message size {size}"),
            ));
        }
        if ring.size() < size {
            return Ok(None);
        }
        Ok(Some(header))
    }
}

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

fn mismatch(desc: &MessageDesc, index: usize, expected: ArgKind, got: &Argument) -> SockwireError {
    SockwireError::invalid_argument(format!(
        "{} argument {index}: expected '{}', got '{}'",
        desc.name,
        expected.code(),
        got.kind().code()
    ))
}

/// Encode one message into `out`, queueing duplicated descriptors on `fds`.
///
/// `out` is cleared first. Descriptors are only queued once the whole message
/// encoded successfully. Returns the encoded size.
pub fn encode_message(
    object_id: u32,
    opcode: u16,
    desc: &MessageDesc,
    args: &[Argument],
    objects: &impl ObjectMap,
    out: &mut Vec<u8>,
    fds: &mut VecDeque<OwnedFd>,
) -> Result<usize> {
    out.clear();
    out.extend_from_slice(&[0u8; Header::SIZE]);

    let mut pending_fds = Vec::new();
    let mut count = 0;
    for (index, spec) in desc.args().enumerate() {
        let spec = spec?;
        let arg = args.get(index).ok_or_else(|| {
            SockwireError::invalid_argument(format!(
                "{} takes more than {} arguments",
                desc.name,
                args.len()
            ))
        })?;
        encode_argument(desc, index, &spec, arg, objects, out, &mut pending_fds)?;
        count += 1;
    }
    if args.len() != count {
        return Err(SockwireError::invalid_argument(format!(
            "{} takes {count} arguments, got {}",
            desc.name,
            args.len()
        )));
    }

    let size = out.len();
    if size > WireConfig::MAX_MESSAGE_SIZE {
        return Err(SockwireError::MessageTooLarge {
            size,
            max: WireConfig::MAX_MESSAGE_SIZE,
        });
    }
    let header = Header {
        object_id,
        opcode,
        size: size as u16,
    };
    out[..Header::SIZE].copy_from_slice(&header.to_bytes());
    fds.extend(pending_fds);
    Ok(size)
}

fn encode_argument(
    desc: &MessageDesc,
    index: usize,
    spec: &ArgSpec,
    arg: &Argument,
    objects: &impl ObjectMap,
    out: &mut Vec<u8>,
    fds: &mut Vec<OwnedFd>,
) -> Result<()> {
    let null_error = || {
        SockwireError::invalid_argument(format!(
            "{} argument {index} is not nullable",
            desc.name
        ))
    };

    match (spec.kind, arg) {
        (ArgKind::Int, Argument::Int(value)) => out.extend_from_slice(&value.to_ne_bytes()),
        (ArgKind::Uint, Argument::Uint(value)) => out.extend_from_slice(&value.to_ne_bytes()),
        (ArgKind::Fixed, Argument::Fixed(value)) => {
            out.extend_from_slice(&value.raw().to_ne_bytes())
        }
        (ArgKind::Str, Argument::Str(None)) => {
            if !spec.nullable {
                return Err(null_error());
            }
            out.extend_from_slice(&0u32.to_ne_bytes());
        }
        (ArgKind::Str, Argument::Str(Some(value))) => {
            let len = value.len() + 1;
            out.extend_from_slice(&(len as u32).to_ne_bytes());
            out.extend_from_slice(value.as_bytes());
            out.resize(out.len() + padded(len) - value.len(), 0);
        }
        (ArgKind::Array, Argument::Array(bytes)) => {
            out.extend_from_slice(&(bytes.len() as u32).to_ne_bytes());
            out.extend_from_slice(bytes);
            out.resize(out.len() + padded(bytes.len()) - bytes.len(), 0);
        }
        (ArgKind::Object, Argument::Object(None)) => {
            if !spec.nullable {
                return Err(null_error());
            }
            out.extend_from_slice(&0u32.to_ne_bytes());
        }
        (ArgKind::Object, Argument::Object(Some(handle))) => {
            let id = objects
                .wire_id(*handle)
                .ok_or(SockwireError::UnregisteredObject { id: handle.id() })?;
            out.extend_from_slice(&id.to_ne_bytes());
        }
        (ArgKind::NewId, Argument::NewId(id)) => {
            if *id == 0 && !spec.nullable {
                return Err(null_error());
            }
            out.extend_from_slice(&id.to_ne_bytes());
        }
        (ArgKind::Fd, Argument::Fd(fd)) => fds.push(fd.try_clone()?),
        (expected, got) => return Err(mismatch(desc, index, expected, got)),
    }
    Ok(())
}

/// Cursor over the payload of one message.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u32(&mut self) -> Option<u32> {
        let bytes = self.buf.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn padded_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(padded(len))?;
        let padded_slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(&padded_slice[..len])
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Decode the complete message described by `header` against `desc`.
///
/// The message bytes are consumed from `ring` only on success. Descriptors
/// are taken from the front of `fds` in signature order.
pub fn decode_message(
    header: Header,
    desc: &MessageDesc,
    ring: &mut RingBuffer,
    fds: &mut VecDeque<OwnedFd>,
    objects: &impl ObjectMap,
    scratch: &mut Vec<u8>,
) -> Result<Message> {
    let size = header.size as usize;
    let id = header.object_id;
    scratch.clear();
    scratch.resize(size, 0);
    ring.copy(scratch);

    let mut reader = Reader {
        buf: &scratch[Header::SIZE..],
        pos: 0,
    };
    let short = || SockwireError::malformed(id, format!("{} arguments exceed message size", desc.name));

    let mut args = Vec::with_capacity(desc.types.len());
    for spec in desc.args() {
        let spec = spec?;
        let arg = match spec.kind {
            ArgKind::Int => Argument::Int(reader.u32().ok_or_else(short)? as i32),
            ArgKind::Uint => Argument::Uint(reader.u32().ok_or_else(short)?),
            ArgKind::Fixed => Argument::Fixed(Fixed::from_raw(reader.u32().ok_or_else(short)? as i32)),
            ArgKind::Str => {
                let len = reader.u32().ok_or_else(short)? as usize;
                if len == 0 {
                    if !spec.nullable {
                        return Err(SockwireError::malformed(
                            id,
                            format!("null string in non-nullable argument of {}", desc.name),
                        ));
                    }
                    Argument::Str(None)
                } else {
                    let bytes = reader.padded_bytes(len).ok_or_else(short)?;
                    let text = &bytes[..len - 1];
                    if bytes[len - 1] != 0 {
                        return Err(SockwireError::malformed(
                            id,
                            format!("string in {} is not NUL terminated", desc.name),
                        ));
                    }
                    let text = std::str::from_utf8(text).map_err(|_| {
                        SockwireError::malformed(id, format!("string in {} is not UTF-8", desc.name))
                    })?;
                    Argument::Str(Some(text.to_owned()))
                }
            }
            ArgKind::Array => {
                let len = reader.u32().ok_or_else(short)? as usize;
                let bytes = reader.padded_bytes(len).ok_or_else(short)?;
                Argument::Array(bytes.to_vec())
            }
            ArgKind::Object => {
                let object_id = reader.u32().ok_or_else(short)?;
                Argument::Object(decode_object(id, desc, &spec, object_id, objects)?)
            }
            ArgKind::NewId => {
                let new_id = reader.u32().ok_or_else(short)?;
                if new_id == 0 && !spec.nullable {
                    return Err(SockwireError::InvalidObject {
                        id,
                        message: format!("null new id in {}", desc.name),
                    });
                }
                Argument::NewId(new_id)
            }
            ArgKind::Fd => {
                let fd = fds.pop_front().ok_or_else(|| {
                    SockwireError::malformed(id, format!("missing file descriptor for {}", desc.name))
                })?;
                Argument::Fd(fd)
            }
        };
        args.push(arg);
    }

    if reader.remaining() != 0 {
        return Err(SockwireError::malformed(
            id,
            format!(
                "declared size {size} does not match decoded size {} for {}",
                Header::SIZE + reader.pos,
                desc.name
            ),
        ));
    }

    ring.consume(size);
    Ok(Message {
        object_id: id,
        opcode: header.opcode,
        size,
        args,
    })
}

fn decode_object(
    sender: u32,
    desc: &MessageDesc,
    spec: &ArgSpec,
    object_id: u32,
    objects: &impl ObjectMap,
) -> Result<Option<ResourceHandle>> {
    if object_id == 0 {
        if spec.nullable {
            return Ok(None);
        }
        return Err(SockwireError::InvalidObject {
            id: sender,
            message: format!("null object in non-nullable argument of {}", desc.name),
        });
    }
    let (handle, interface) = objects.resolve(object_id).ok_or_else(|| SockwireError::InvalidObject {
        id: object_id,
        message: format!("unknown object referenced by {}", desc.name),
    })?;
    if let Some(expected) = spec.interface {
        if expected != interface {
            return Err(SockwireError::InvalidObject {
                id: object_id,
                message: format!(
                    "{} expects {}, object is {}",
                    desc.name, expected.name, interface.name
                ),
            });
        }
    }
    Ok(Some(handle))
}

/// Decode the next complete message, if one is buffered.
///
/// The target is resolved through `objects` and the opcode checked against
/// the request table (`Direction::Request`) or event table
/// (`Direction::Event`) of its interface. Nothing is consumed when the
/// message is incomplete.
pub fn try_decode(
    ring: &mut RingBuffer,
    fds: &mut VecDeque<OwnedFd>,
    objects: &impl ObjectMap,
    direction: Direction,
    scratch: &mut Vec<u8>,
) -> Result<Option<Message>> {
    let Some(header) = Header::peek(ring)? else {
        return Ok(None);
    };
    let (_, interface) = objects
        .resolve(header.object_id)
        .ok_or_else(|| SockwireError::InvalidObject {
            id: header.object_id,
            message: "unknown target object".into(),
        })?;
    let desc = interface
        .message(direction, header.opcode)
        .ok_or(SockwireError::InvalidMethod {
            id: header.object_id,
            interface: interface.name,
            opcode: header.opcode,
        })?;
    decode_message(header, desc, ring, fds, objects, scratch).map(Some)
}
