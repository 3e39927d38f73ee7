//! Socket transport of one connection endpoint.
//!
//! A [`Connection`] owns the stream socket, one ring buffer and one
//! descriptor queue per direction. Outgoing messages are encoded into the
//! outbound ring and sent with `sendmsg`, queued descriptors riding along
//! as `SCM_RIGHTS`. Incoming bytes are received with `recvmsg` straight into
//! the free segments of the inbound ring.
//!
//! Readiness is the caller's business: with a blocking socket `read` waits
//! for data, with a non-blocking one it surfaces `WouldBlock`.

use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use tracing::{debug, trace};

use crate::config::{ConnectionConfig, WireConfig};
use crate::error::{Result, SockwireError};
use crate::ring::RingBuffer;
use crate::wire::{self, Argument, Direction, Header, Interface, Message, MessageDesc, MessageTrace, ObjectMap};

/// Transport state of one socket endpoint.
#[derive(Debug)]
pub struct Connection {
    socket: UnixStream,
    inbound: RingBuffer,
    outbound: RingBuffer,
    fds_in: VecDeque<OwnedFd>,
    fds_out: VecDeque<OwnedFd>,
    scratch: Vec<u8>,
    cmsg_buffer: Vec<u8>,
    config: ConnectionConfig,
}

impl Connection {
    /// Wrap a connected stream, reading settings from the environment.
    pub fn new(socket: UnixStream) -> Self {
        Self::with_config(socket, ConnectionConfig::from_env())
    }

    pub fn with_config(socket: UnixStream, config: ConnectionConfig) -> Self {
        Self {
            socket,
            inbound: RingBuffer::with_capacity(config.buffer_capacity),
            outbound: RingBuffer::with_capacity(config.buffer_capacity),
            fds_in: VecDeque::new(),
            fds_out: VecDeque::new(),
            scratch: Vec::with_capacity(WireConfig::MAX_MESSAGE_SIZE),
            cmsg_buffer: nix::cmsg_space!([RawFd; WireConfig::MAX_FDS_OUT]),
            config,
        }
    }

    pub fn socket(&self) -> &UnixStream {
        &self.socket
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.socket.set_nonblocking(nonblocking)?;
        Ok(())
    }

    pub fn inbound(&self) -> &RingBuffer {
        &self.inbound
    }

    pub fn outbound(&self) -> &RingBuffer {
        &self.outbound
    }

    /// Bytes received but not yet decoded.
    pub fn pending_input(&self) -> usize {
        self.inbound.size()
    }

    /// Bytes queued but not yet sent.
    pub fn pending_output(&self) -> usize {
        self.outbound.size()
    }

    /// Descriptors received but not yet claimed by a decoded message.
    pub fn pending_fds(&self) -> usize {
        self.fds_in.len()
    }

    /// Append raw bytes to the outbound ring, flushing first if they do not fit.
    pub fn queue(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.outbound.available() {
            self.flush()?;
        }
        if bytes.len() > self.outbound.available() {
            return Err(SockwireError::BufferFull {
                pending: self.outbound.size(),
                needed: bytes.len(),
            });
        }
        self.outbound.put(bytes);
        Ok(())
    }

    /// Encode a message and queue it for sending.
    pub fn write_message(
        &mut self,
        interface: &Interface,
        object_id: u32,
        opcode: u16,
        desc: &MessageDesc,
        args: &[Argument],
        objects: &impl ObjectMap,
    ) -> Result<()> {
        if self.fds_out.len() + desc.fd_count() > WireConfig::MAX_FDS_OUT {
            self.flush()?;
        }

        let queued_fds = self.fds_out.len();
        let mut scratch = std::mem::take(&mut self.scratch);
        let result = wire::encode_message(
            object_id,
            opcode,
            desc,
            args,
            objects,
            &mut scratch,
            &mut self.fds_out,
        )
        .and_then(|_| self.queue(&scratch));
        self.scratch = scratch;
        if result.is_err() {
            self.fds_out.truncate(queued_fds);
        }
        result?;

        self.trace(" -> ", interface, object_id, desc, args);
        Ok(())
    }

    /// Decode the next buffered message, if a complete one is available.
    pub fn read_message(
        &mut self,
        objects: &impl ObjectMap,
        direction: Direction,
    ) -> Result<Option<Message>> {
        wire::try_decode(
            &mut self.inbound,
            &mut self.fds_in,
            objects,
            direction,
            &mut self.scratch,
        )
    }

    /// Decode the next message against an explicitly chosen description.
    pub fn read_message_as(
        &mut self,
        header: Header,
        desc: &MessageDesc,
        objects: &impl ObjectMap,
    ) -> Result<Message> {
        wire::decode_message(
            header,
            desc,
            &mut self.inbound,
            &mut self.fds_in,
            objects,
            &mut self.scratch,
        )
    }

    /// Header of the next complete buffered message.
    pub fn peek_header(&self) -> Result<Option<Header>> {
        Header::peek(&self.inbound)
    }

    /// Log a message at trace level, or debug level when enabled.
    pub fn trace(
        &self,
        arrow: &str,
        interface: &Interface,
        object_id: u32,
        desc: &MessageDesc,
        args: &[Argument],
    ) {
        let message = MessageTrace {
            interface,
            object_id,
            desc,
            args,
        };
        if self.config.debug {
            debug!("{}{}", arrow, message);
        } else {
            trace!("{}{}", arrow, message);
        }
    }

    /// Send everything queued.
    ///
    /// Each `sendmsg` carries up to 28 queued descriptors. Returns the number
    /// of bytes written.
    pub fn flush(&mut self) -> Result<usize> {
        let mut total = 0;
        while !self.outbound.is_empty() {
            let count = self.fds_out.len().min(WireConfig::MAX_FDS_OUT);
            let mut raw = [0 as RawFd; WireConfig::MAX_FDS_OUT];
            for (slot, fd) in raw.iter_mut().zip(self.fds_out.iter()) {
                *slot = fd.as_raw_fd();
            }
            let rights = [ControlMessage::ScmRights(&raw[..count])];
            let cmsgs: &[ControlMessage<'_>] = if count > 0 { &rights } else { &[] };

            let sent = {
                let iov = self.outbound.get_iov();
                sendmsg::<()>(self.socket.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None)
            };
            match sent {
                Ok(written) => {
                    self.outbound.consume(written);
                    // The peer now holds its own copies; close ours.
                    self.fds_out.drain(..count);
                    total += written;
                }
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(total)
    }

    /// Receive available bytes and descriptors into the inbound buffers.
    ///
    /// Returns the number of bytes received. An orderly shutdown by the peer
    /// is [`SockwireError::ConnectionClosed`]; a full inbound ring is
    /// [`SockwireError::BufferFull`] and must be drained by decoding first.
    pub fn read(&mut self) -> Result<usize> {
        loop {
            let received = {
                let mut iov = self.inbound.put_iov();
                if iov.is_empty() {
                    return Err(SockwireError::BufferFull {
                        pending: self.inbound.size(),
                        needed: 1,
                    });
                }
                let msg = match recvmsg::<()>(
                    self.socket.as_raw_fd(),
                    &mut iov,
                    Some(&mut self.cmsg_buffer),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                ) {
                    Ok(msg) => msg,
                    Err(Errno::EINTR) => continue,
                    Err(err) => return Err(err.into()),
                };
                for cmsg in msg.cmsgs()? {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        self.fds_in.extend(fds.into_iter().map(adopt_fd));
                    }
                }
                msg.bytes
            };

            if received == 0 {
                return Err(SockwireError::ConnectionClosed);
            }
            self.inbound.commit(received);
            return Ok(received);
        }
    }
}

#[allow(unsafe_code)]
fn adopt_fd(fd: RawFd) -> OwnedFd {
    // SAFETY: the kernel installed this descriptor in our table while
    // delivering SCM_RIGHTS; nothing else refers to it yet.
    unsafe { OwnedFd::from_raw_fd(fd) }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ObjectRegistry;
    use std::io::{Read, Seek, SeekFrom, Write};

    static PIPE_REQUESTS: [MessageDesc; 2] = [
        MessageDesc::new("send_fd", "uh", &[]),
        MessageDesc::new("note", "s", &[]),
    ];

    static PIPE: Interface = Interface {
        name: "test_pipe",
        version: 1,
        requests: &PIPE_REQUESTS,
        events: &[],
    };

    fn pair() -> (Connection, Connection, ObjectRegistry<()>) {
        let (a, b) = UnixStream::pair().unwrap();
        let mut objects = ObjectRegistry::new();
        objects.create(&PIPE, 1, 4);
        (
            Connection::with_config(a, ConnectionConfig::default()),
            Connection::with_config(b, ConnectionConfig::default()),
            objects,
        )
    }

    #[test]
    fn test_bytes_round_trip() {
        let (mut tx, mut rx, objects) = pair();
        tx.write_message(&PIPE, 4, 1, &PIPE_REQUESTS[1], &[Argument::string("hi")], &objects)
            .unwrap();
        assert_eq!(tx.pending_output(), 16);
        assert_eq!(tx.flush().unwrap(), 16);
        assert_eq!(tx.pending_output(), 0);

        assert_eq!(rx.read().unwrap(), 16);
        let message = rx.read_message(&objects, Direction::Request).unwrap().unwrap();
        assert_eq!(message.args[0].as_str(), Some("hi"));
        assert!(rx.read_message(&objects, Direction::Request).unwrap().is_none());
    }

    #[test]
    fn test_fd_refers_to_same_file() {
        let (mut tx, mut rx, objects) = pair();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"through the socket").unwrap();

        tx.write_message(
            &PIPE,
            4,
            0,
            &PIPE_REQUESTS[0],
            &[Argument::Uint(1), Argument::Fd(OwnedFd::from(file.try_clone().unwrap()))],
            &objects,
        )
        .unwrap();
        tx.flush().unwrap();

        rx.read().unwrap();
        assert_eq!(rx.pending_fds(), 1);
        let mut message = rx.read_message(&objects, Direction::Request).unwrap().unwrap();
        let received = message.take_fd(1).unwrap();

        let flags = nix::fcntl::fcntl(received.as_raw_fd(), nix::fcntl::FcntlArg::F_GETFD).unwrap();
        assert_ne!(flags & libc::FD_CLOEXEC, 0);

        let mut received = std::fs::File::from(received);
        received.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        received.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "through the socket");
    }

    #[test]
    fn test_many_fds_split_across_sends() {
        let (mut tx, mut rx, objects) = pair();
        let file = tempfile::tempfile().unwrap();
        for serial in 0..40 {
            tx.write_message(
                &PIPE,
                4,
                0,
                &PIPE_REQUESTS[0],
                &[
                    Argument::Uint(serial),
                    Argument::Fd(OwnedFd::from(file.try_clone().unwrap())),
                ],
                &objects,
            )
            .unwrap();
        }
        tx.flush().unwrap();
        drop(tx);

        let mut seen = 0;
        loop {
            match rx.read() {
                Ok(_) => {}
                Err(SockwireError::ConnectionClosed) => break,
                Err(err) => panic!("read failed: {err}"),
            }
            while let Some(message) = rx.read_message(&objects, Direction::Request).unwrap() {
                assert_eq!(message.args[0].as_uint(), Some(seen));
                assert!(matches!(message.args[1], Argument::Fd(_)));
                seen += 1;
            }
        }
        assert_eq!(seen, 40);
        assert_eq!(rx.pending_fds(), 0);
    }

    #[test]
    fn test_queue_reports_buffer_full() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut tx = Connection::with_config(
            a,
            ConnectionConfig {
                buffer_capacity: 16,
                debug: false,
            },
        );
        tx.queue(&[1u8; 12]).unwrap();
        let err = tx.queue(&[1u8; 32]).unwrap_err();
        assert!(matches!(err, SockwireError::BufferFull { needed: 32, .. }));
        // The first chunk went out while trying to make room.
        assert_eq!(tx.pending_output(), 0);
    }

    #[test]
    fn test_peer_shutdown_is_connection_closed() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut rx = Connection::with_config(a, ConnectionConfig::default());
        drop(b);
        assert!(matches!(rx.read(), Err(SockwireError::ConnectionClosed)));
    }

    #[test]
    fn test_nonblocking_read_would_block() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut rx = Connection::with_config(a, ConnectionConfig::default());
        rx.set_nonblocking(true).unwrap();
        let err = rx.read().unwrap_err();
        assert!(err.is_would_block());
        assert!(!err.is_fatal());
    }
}
