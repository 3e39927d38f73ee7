//! Control channel between the display runner and its client thread.
//!
//! Every frame is a 4-byte big-endian length prefix followed by a UTF-8 JSON
//! payload:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! The client thread uses the blocking helpers, the display runner the tokio
//! ones. Both sides exchange [`ControlFrame`]s.

use std::fmt;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};

/// Operation named by a request or its acknowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlOp {
    CanContinue,
    Barrier,
    RunFunc,
    SendBytes,
    ReceiveBytes,
    EmitEvents,
    StopDisplay,
}

impl ControlOp {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlOp::CanContinue => "can_continue",
            ControlOp::Barrier => "barrier",
            ControlOp::RunFunc => "run_func",
            ControlOp::SendBytes => "send_bytes",
            ControlOp::ReceiveBytes => "receive_bytes",
            ControlOp::EmitEvents => "emit_events",
            ControlOp::StopDisplay => "stop_display",
        }
    }
}

impl fmt::Display for ControlOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request on the control channel.
///
/// `CanContinue` and `SendBytes` also travel from the display to the client:
/// the first releases the client at startup, the second answers
/// `ReceiveBytes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Whether the client may start talking to the display.
    CanContinue { proceed: bool },
    /// Wait until the display has caught up with the client.
    Barrier,
    /// Run the user function added to the display.
    RunFunc,
    /// Hand bytes to the other side.
    SendBytes { data: Vec<u8> },
    /// Ask the display for bytes.
    ReceiveBytes,
    /// Emit `count` scripted events; 0 means all remaining.
    EmitEvents { count: u32 },
    /// Stop serving until the display side resumes.
    StopDisplay,
}

impl ControlRequest {
    pub fn op(&self) -> ControlOp {
        match self {
            ControlRequest::CanContinue { .. } => ControlOp::CanContinue,
            ControlRequest::Barrier => ControlOp::Barrier,
            ControlRequest::RunFunc => ControlOp::RunFunc,
            ControlRequest::SendBytes { .. } => ControlOp::SendBytes,
            ControlRequest::ReceiveBytes => ControlOp::ReceiveBytes,
            ControlRequest::EmitEvents { .. } => ControlOp::EmitEvents,
            ControlRequest::StopDisplay => ControlOp::StopDisplay,
        }
    }
}

/// Acknowledge of a request, with the number of items processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub op: ControlOp,
    pub processed: u64,
}

/// Anything sent over the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum ControlFrame {
    Request(ControlRequest),
    Ack(Ack),
}

impl ControlFrame {
    pub fn ack(op: ControlOp, processed: u64) -> Self {
        ControlFrame::Ack(Ack { op, processed })
    }

    /// Unwrap an acknowledge of `expected`.
    pub fn into_ack(self, expected: ControlOp) -> Result<u64> {
        match self {
            ControlFrame::Ack(ack) if ack.op == expected => Ok(ack.processed),
            ControlFrame::Ack(ack) => Err(HarnessError::BadAcknowledge {
                expected,
                got: ack.op,
            }),
            ControlFrame::Request(request) => Err(HarnessError::UnexpectedFrame(format!(
                "request {} while waiting for {expected} acknowledge",
                request.op()
            ))),
        }
    }

    pub fn into_request(self) -> Result<ControlRequest> {
        match self {
            ControlFrame::Request(request) => Ok(request),
            ControlFrame::Ack(ack) => Err(HarnessError::UnexpectedFrame(format!(
                "acknowledge of {} while waiting for a request",
                ack.op
            ))),
        }
    }
}

fn check_frame_len(len: usize) -> Result<()> {
    if len > HarnessConfig::MAX_FRAME_SIZE {
        return Err(HarnessError::FrameTooLarge {
            size: len,
            max: HarnessConfig::MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    check_frame_len(len)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    check_frame_len(payload.len())?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Blocking counterpart of [`read_frame`].
pub fn read_frame_blocking<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    check_frame_len(len)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

/// Blocking counterpart of [`write_frame`].
pub fn write_frame_blocking<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    check_frame_len(payload.len())?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Serialize and send one frame.
pub async fn send<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &ControlFrame) -> Result<()> {
    let payload = serde_json::to_vec(frame)?;
    write_frame(writer, &payload).await
}

/// Receive one frame; a closed channel is [`HarnessError::ControlClosed`].
pub async fn recv<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<ControlFrame> {
    let payload = read_frame(reader).await?.ok_or(HarnessError::ControlClosed)?;
    Ok(serde_json::from_slice(&payload)?)
}

pub fn send_blocking<W: Write>(writer: &mut W, frame: &ControlFrame) -> Result<()> {
    let payload = serde_json::to_vec(frame)?;
    write_frame_blocking(writer, &payload)
}

pub fn recv_blocking<R: Read>(reader: &mut R) -> Result<ControlFrame> {
    let payload = read_frame_blocking(reader)?.ok_or(HarnessError::ControlClosed)?;
    Ok(serde_json::from_slice(&payload)?)
}
