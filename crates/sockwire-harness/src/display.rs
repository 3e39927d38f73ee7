//! Display runner serving one client thread until it is interrupted.
//!
//! [`HarnessDisplay::run`] serves the protocol socket until the client thread
//! interrupts it, either with a control request or by exiting. The caller
//! then inspects or changes display state and continues with
//! [`process_request`](HarnessDisplay::process_request),
//! [`resume`](HarnessDisplay::resume) or
//! [`send_data`](HarnessDisplay::send_data), each of which serves again
//! until the next interruption.
//!
//! # Example
//!
//! ```no_run
//! use sockwire_harness::{HarnessDisplay, RunOutcome};
//!
//! # async fn demo() -> sockwire_harness::Result<()> {
//! let mut display = HarnessDisplay::new();
//! display.add_user_func(|_: &mut sockwire::server::Display, _: sockwire::server::ClientId| {});
//! display.create_client(|client, control| {
//!     control.call_user_func(client).map(|_| 0).unwrap_or(1)
//! })?;
//!
//! let outcome = display.run().await?;
//! assert!(matches!(outcome, RunOutcome::Request(_)));
//! display.process_request().await?;
//! display.finish().await?;
//! # Ok(())
//! # }
//! ```

use std::os::unix::net::UnixStream as StdUnixStream;
use std::thread::JoinHandle;

use async_trait::async_trait;
use sockwire::client::ClientDisplay;
use sockwire::server::{ClientId, Display};
use sockwire::{ConnectionConfig, SockwireError};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use crate::client::ControlHandle;
use crate::config::HarnessConfig;
use crate::control::{self, ControlFrame, ControlOp, ControlRequest};
use crate::error::{HarnessError, Result};
use crate::events::EventQueue;
use crate::interrupt::{InterruptOnDrop, InterruptToken};

/// Code run on the display side for a `RunFunc` request.
#[async_trait]
pub trait UserFunc: Send {
    async fn run(&mut self, display: &mut Display, client: ClientId) -> Result<()>;
}

#[async_trait]
impl<F> UserFunc for F
where
    F: FnMut(&mut Display, ClientId) + Send,
{
    async fn run(&mut self, display: &mut Display, client: ClientId) -> Result<()> {
        self(display, client);
        Ok(())
    }
}

/// Why [`HarnessDisplay::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The client is blocked on a request of this kind.
    Request(ControlOp),
    /// The client thread ended with this exit status.
    ClientExited(i32),
}

/// Result of reading once from the client's protocol socket.
enum Served {
    /// Requests were read and dispatched.
    Progress,
    /// Nothing left to read.
    Idle,
    /// The client was disconnected and removed from the display.
    Lost,
}

fn service_client(display: &mut Display, id: ClientId) -> Result<Served> {
    match display.read_client(id) {
        Ok(_) => {
            display.dispatch_client(id)?;
            if let Err(err) = display.flush_client(id) {
                if !err.is_would_block() {
                    return Err(err.into());
                }
            }
            if display.reap_dead_clients().contains(&id) {
                warn!("{} was disconnected after a protocol error", id);
                return Ok(Served::Lost);
            }
            Ok(Served::Progress)
        }
        Err(err) if err.is_would_block() => Ok(Served::Idle),
        Err(SockwireError::ConnectionClosed) => {
            debug!("{} closed its connection", id);
            display.destroy_client(id);
            Ok(Served::Lost)
        }
        Err(err) => Err(err.into()),
    }
}

/// Client thread state kept by the runner.
struct ClientThread {
    handle: Option<JoinHandle<i32>>,
    control: UnixStream,
    protocol: Option<AsyncFd<StdUnixStream>>,
    id: Option<ClientId>,
}

/// A display plus one client running on its own thread.
pub struct HarnessDisplay {
    display: Display,
    token: InterruptToken,
    client: Option<ClientThread>,
    started: bool,
    pending: Option<ControlRequest>,
    exit_code: Option<i32>,
    user_func: Option<Box<dyn UserFunc>>,
    user_data: Option<Vec<u8>>,
    events: EventQueue,
}

impl Default for HarnessDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl HarnessDisplay {
    pub fn new() -> Self {
        Self::with_display(Display::with_config(ConnectionConfig::from_env()))
    }

    /// Wrap an existing display, keeping its globals.
    pub fn with_display(display: Display) -> Self {
        Self {
            display,
            token: InterruptToken::new(),
            client: None,
            started: false,
            pending: None,
            exit_code: None,
            user_func: None,
            user_data: None,
            events: EventQueue::new(),
        }
    }

    pub fn display(&self) -> &Display {
        &self.display
    }

    pub fn display_mut(&mut self) -> &mut Display {
        &mut self.display
    }

    /// Id of the protocol client while it is connected.
    pub fn client_id(&self) -> Option<ClientId> {
        self.client.as_ref().and_then(|client| client.id)
    }

    /// Exit status of the client thread, once it has exited.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Bytes last received through `SendBytes`.
    pub fn user_data(&self) -> Option<&[u8]> {
        self.user_data.as_deref()
    }

    pub fn add_user_func<F>(&mut self, func: F)
    where
        F: UserFunc + 'static,
    {
        if self.user_func.is_some() {
            debug!("Overwriting user func");
        }
        self.user_func = Some(Box::new(func));
    }

    /// Queue scripted events for `EmitEvents` requests.
    pub fn add_events(&mut self, events: EventQueue) {
        self.events.append(events);
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    /// Connect a client and start `body` on its own thread.
    ///
    /// The body blocks until the first [`run`](Self::run); its return value is
    /// the client's exit status. Must be called inside a tokio runtime.
    pub fn create_client<F>(&mut self, body: F) -> Result<ClientId>
    where
        F: FnOnce(&mut ClientDisplay, &mut ControlHandle) -> i32 + Send + 'static,
    {
        let (display_end, client_end) = StdUnixStream::pair()?;
        display_end.set_nonblocking(true)?;
        let watch = display_end.try_clone()?;
        let protocol = AsyncFd::with_interest(watch, Interest::READABLE)?;
        let id = self.display.add_client(display_end);

        let (control_display, control_client) = StdUnixStream::pair()?;
        control_display.set_nonblocking(true)?;
        let control = UnixStream::from_std(control_display)?;

        let token = self.token.clone();
        let handle = std::thread::Builder::new()
            .name(HarnessConfig::CLIENT_THREAD_NAME.to_string())
            .spawn(move || {
                let _exit = InterruptOnDrop(token.clone());
                let mut control = match ControlHandle::new(control_client, token) {
                    Ok(control) => control,
                    Err(err) => {
                        warn!("Client control setup failed: {}", err);
                        return HarnessConfig::EXIT_FAILURE;
                    }
                };
                match control.wait_can_continue() {
                    Ok(true) => {}
                    Ok(false) => return HarnessConfig::EXIT_FAILURE,
                    Err(err) => {
                        warn!("Client never released: {}", err);
                        return HarnessConfig::EXIT_FAILURE;
                    }
                }
                let mut client = ClientDisplay::connect(client_end);
                body(&mut client, &mut control)
            })?;

        self.client = Some(ClientThread {
            handle: Some(handle),
            control,
            protocol: Some(protocol),
            id: Some(id),
        });
        info!("Created harness client {}", id);
        Ok(id)
    }

    /// Serve the client until it interrupts the display.
    ///
    /// The first call releases the client thread.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        if let Some(code) = self.exit_code {
            return Ok(RunOutcome::ClientExited(code));
        }
        let client = self.client.as_mut().ok_or(HarnessError::NoClient)?;
        if !self.started {
            self.started = true;
            let release = ControlFrame::Request(ControlRequest::CanContinue { proceed: true });
            control::send(&mut client.control, &release).await?;
        }

        loop {
            if self.token.take() {
                if let Some(outcome) = self.on_interrupt().await? {
                    return Ok(outcome);
                }
                continue;
            }
            self.serve().await?;
        }
    }

    /// Wait for one protocol or interrupt event and handle it.
    async fn serve(&mut self) -> Result<()> {
        let HarnessDisplay {
            display,
            token,
            client,
            ..
        } = self;
        let Some(client) = client.as_mut() else {
            token.notified().await;
            return Ok(());
        };
        let (Some(protocol), Some(id)) = (client.protocol.as_ref(), client.id) else {
            token.notified().await;
            return Ok(());
        };

        let lost = tokio::select! {
            _ = token.notified() => false,
            ready = protocol.readable() => {
                let mut guard = ready?;
                match service_client(display, id)? {
                    Served::Progress => false,
                    Served::Idle => {
                        guard.clear_ready();
                        false
                    }
                    Served::Lost => true,
                }
            }
        };
        if lost {
            client.protocol = None;
            client.id = None;
        }
        Ok(())
    }

    /// Handle every protocol request already sent by the client.
    ///
    /// The client flushes before it writes a control request, so after the
    /// frame has been read the socket holds everything sent before it.
    fn drain_protocol(&mut self) -> Result<()> {
        let Some(client) = self.client.as_mut() else {
            return Ok(());
        };
        let Some(id) = client.id else {
            return Ok(());
        };
        loop {
            match service_client(&mut self.display, id)? {
                Served::Progress => {}
                Served::Idle => return Ok(()),
                Served::Lost => {
                    client.protocol = None;
                    client.id = None;
                    return Ok(());
                }
            }
        }
    }

    /// Decide what an interrupt meant: a request, or the client's exit.
    async fn on_interrupt(&mut self) -> Result<Option<RunOutcome>> {
        let client = self.client.as_mut().ok_or(HarnessError::NoClient)?;
        let finished = client.handle.as_ref().map_or(true, JoinHandle::is_finished);
        if !finished {
            let received =
                tokio::time::timeout(HarnessConfig::CONTROL_TIMEOUT, control::recv(&mut client.control)).await;
            match received {
                Ok(Ok(frame)) => {
                    let request = frame.into_request()?;
                    let op = request.op();
                    debug!("Display interrupted for {}", op);
                    self.drain_protocol()?;
                    self.display.flush_clients();
                    self.pending = Some(request);
                    return Ok(Some(RunOutcome::Request(op)));
                }
                // The thread closed its end on the way out.
                Ok(Err(err)) if err.is_disconnect() => {}
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    return Err(HarnessError::Timeout {
                        what: "control request from client".to_string(),
                    })
                }
            }
        }
        self.drain_protocol()?;
        self.reap_client_thread().await.map(Some)
    }

    /// Join the exited client thread and record its status.
    async fn reap_client_thread(&mut self) -> Result<RunOutcome> {
        let client = self.client.as_mut().ok_or(HarnessError::NoClient)?;
        let handle = client.handle.take().ok_or(HarnessError::NoClient)?;
        let code = tokio::task::spawn_blocking(move || handle.join())
            .await
            .map_err(|_| HarnessError::ClientPanicked)?
            .map_err(|_| HarnessError::ClientPanicked)?;
        info!("Harness client exited with {}", code);
        self.exit_code = Some(code);
        Ok(RunOutcome::ClientExited(code))
    }

    async fn acknowledge(&mut self, op: ControlOp, processed: u64) -> Result<()> {
        let client = self.client.as_mut().ok_or(HarnessError::NoClient)?;
        control::send(&mut client.control, &ControlFrame::ack(op, processed)).await
    }

    /// Handle the pending request, acknowledge it and serve again.
    pub async fn process_request(&mut self) -> Result<RunOutcome> {
        let request = self.pending.take().ok_or(HarnessError::NoPendingRequest)?;
        let op = request.op();
        self.display.flush_clients();

        let processed = match request {
            ControlRequest::RunFunc => {
                let id = self.client_id().ok_or(HarnessError::NoClient)?;
                let func = self.user_func.as_mut().ok_or(HarnessError::NoUserFunc)?;
                debug!("Running user's function");
                func.run(&mut self.display, id).await?;
                0
            }
            ControlRequest::EmitEvents { count } => {
                let id = self.client_id().ok_or(HarnessError::NoClient)?;
                let client = self
                    .display
                    .client_mut(id)
                    .ok_or(HarnessError::NoClient)?;
                let emitted = self.events.emit(client, count)?;
                self.display.flush_client(id)?;
                emitted
            }
            ControlRequest::SendBytes { data } => {
                if self.user_data.is_some() {
                    debug!("SendBytes: overwriting user data");
                }
                let len = data.len() as u64;
                self.user_data = Some(data);
                len
            }
            ControlRequest::Barrier | ControlRequest::StopDisplay => 0,
            other @ (ControlRequest::ReceiveBytes | ControlRequest::CanContinue { .. }) => {
                let op = other.op();
                self.pending = Some(other);
                return Err(HarnessError::UnexpectedRequest(op));
            }
        };

        self.acknowledge(op, processed).await?;
        self.run().await
    }

    /// Acknowledge the pending request without acting on it and serve again.
    ///
    /// Used after `StopDisplay` once display state has been changed.
    pub async fn resume(&mut self) -> Result<RunOutcome> {
        let request = self.pending.take().ok_or(HarnessError::NoPendingRequest)?;
        self.display.flush_clients();
        self.acknowledge(request.op(), 0).await?;
        self.run().await
    }

    /// Answer a pending `ReceiveBytes` with `data` and serve again.
    pub async fn send_data(&mut self, data: &[u8]) -> Result<RunOutcome> {
        match self.pending.take() {
            Some(ControlRequest::ReceiveBytes) => {}
            Some(other) => {
                let op = other.op();
                self.pending = Some(other);
                return Err(HarnessError::UnexpectedRequest(op));
            }
            None => return Err(HarnessError::NoPendingRequest),
        }

        let client = self.client.as_mut().ok_or(HarnessError::NoClient)?;
        let frame = ControlFrame::Request(ControlRequest::SendBytes { data: data.to_vec() });
        control::send(&mut client.control, &frame).await?;
        let reply = tokio::time::timeout(HarnessConfig::CONTROL_TIMEOUT, control::recv(&mut client.control))
            .await
            .map_err(|_| HarnessError::Timeout {
                what: "data acknowledge from client".to_string(),
            })??;
        let got = reply.into_ack(ControlOp::SendBytes)?;
        if got != data.len() as u64 {
            return Err(HarnessError::CountMismatch {
                expected: data.len() as u64,
                got,
            });
        }
        self.run().await
    }

    /// Serve until the client exits, then check its status and tear down.
    ///
    /// A request arriving meanwhile is an error: the client expected the
    /// display side to handle it.
    pub async fn finish(mut self) -> Result<()> {
        let code = match self.run().await? {
            RunOutcome::ClientExited(code) => code,
            RunOutcome::Request(op) => return Err(HarnessError::UnexpectedRequest(op)),
        };
        if let Some(id) = self.client_id() {
            self.display.destroy_client(id);
        }
        if code != HarnessConfig::EXIT_SUCCESS {
            return Err(HarnessError::ClientFailed { code });
        }
        Ok(())
    }
}
