//! Client-thread end of the control channel.
//!
//! Every call follows the same pattern: flush and dispatch the protocol
//! connection, write the request, interrupt the display runner, then block
//! until the display acknowledges.

use std::os::unix::net::UnixStream;

use sockwire::client::ClientDisplay;
use tracing::debug;

use crate::config::HarnessConfig;
use crate::control::{self, ControlFrame, ControlOp, ControlRequest};
use crate::error::{HarnessError, Result};
use crate::interrupt::InterruptToken;

/// Blocking control handle handed to the client body.
#[derive(Debug)]
pub struct ControlHandle {
    stream: UnixStream,
    token: InterruptToken,
}

impl ControlHandle {
    pub(crate) fn new(stream: UnixStream, token: InterruptToken) -> Result<Self> {
        stream.set_read_timeout(Some(HarnessConfig::CONTROL_TIMEOUT))?;
        Ok(Self { stream, token })
    }

    fn recv(&mut self, what: ControlOp) -> Result<ControlFrame> {
        control::recv_blocking(&mut self.stream).map_err(|err| match err {
            HarnessError::Io { source: Some(ref io), .. }
                if matches!(io.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) =>
            {
                HarnessError::Timeout {
                    what: format!("{what} from display"),
                }
            }
            other => other,
        })
    }

    /// Block until the display starts; returns whether the client may proceed.
    pub(crate) fn wait_can_continue(&mut self) -> Result<bool> {
        match self.recv(ControlOp::CanContinue)?.into_request()? {
            ControlRequest::CanContinue { proceed } => Ok(proceed),
            other => Err(HarnessError::UnexpectedFrame(format!(
                "{} before can_continue",
                other.op()
            ))),
        }
    }

    /// Make the display stop serving and look at `request`.
    fn kick(&mut self, client: &mut ClientDisplay, request: ControlRequest) -> Result<()> {
        client.flush()?;
        client.dispatch_pending()?;
        debug!("Kicking display with {}", request.op());
        control::send_blocking(&mut self.stream, &ControlFrame::Request(request))?;
        self.token.interrupt();
        Ok(())
    }

    fn request(&mut self, client: &mut ClientDisplay, request: ControlRequest) -> Result<u64> {
        let op = request.op();
        self.kick(client, request)?;
        self.recv(op)?.into_ack(op)
    }

    /// Run the display's user function and wait for it to finish.
    pub fn call_user_func(&mut self, client: &mut ClientDisplay) -> Result<()> {
        self.request(client, ControlRequest::RunFunc).map(drop)
    }

    /// Wait until the display has handled everything sent so far.
    pub fn barrier(&mut self, client: &mut ClientDisplay) -> Result<()> {
        self.request(client, ControlRequest::Barrier)?;
        debug!("Barrier: client synced");
        Ok(())
    }

    /// Hand bytes to the display, which keeps them as user data.
    pub fn send_data(&mut self, client: &mut ClientDisplay, data: &[u8]) -> Result<()> {
        let got = self.request(client, ControlRequest::SendBytes { data: data.to_vec() })?;
        if got != data.len() as u64 {
            return Err(HarnessError::CountMismatch {
                expected: data.len() as u64,
                got,
            });
        }
        Ok(())
    }

    /// Ask the display for bytes and wait for them.
    pub fn receive_data(&mut self, client: &mut ClientDisplay) -> Result<Vec<u8>> {
        self.kick(client, ControlRequest::ReceiveBytes)?;
        match self.recv(ControlOp::SendBytes)?.into_request()? {
            ControlRequest::SendBytes { data } => {
                let ack = ControlFrame::ack(ControlOp::SendBytes, data.len() as u64);
                control::send_blocking(&mut self.stream, &ack)?;
                Ok(data)
            }
            other => Err(HarnessError::UnexpectedFrame(format!(
                "{} while waiting for data",
                other.op()
            ))),
        }
    }

    /// Ask the display to emit `count` scripted events (0 for all).
    ///
    /// Returns how many were emitted; dispatch afterwards to receive them.
    pub fn ask_for_events(&mut self, client: &mut ClientDisplay, count: u32) -> Result<u64> {
        self.request(client, ControlRequest::EmitEvents { count })
    }

    /// Stop the display until its side resumes it.
    pub fn stop_display(&mut self, client: &mut ClientDisplay) -> Result<()> {
        self.request(client, ControlRequest::StopDisplay).map(drop)
    }
}
