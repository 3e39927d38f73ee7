//! Wire format: interface descriptions, argument values and the message codec.

pub mod codec;
pub mod message;
pub mod signature;

pub use codec::{decode_message, encode_message, try_decode, Header, ObjectMap};
pub use message::{Argument, Fixed, Message, MessageTrace};
pub use signature::{ArgKind, ArgSpec, Direction, Interface, MessageDesc};
