//! sockwire-harness - drive a display and a client thread step by step.
//!
//! A [`HarnessDisplay`] serves one client whose body runs on its own thread
//! with a connected [`ClientDisplay`](sockwire::client::ClientDisplay) and a
//! [`ControlHandle`]. The display runs until the client interrupts it through
//! the control channel; the test then inspects or changes display state
//! before letting it continue. This orders display-side code between client
//! requests without signals or sleeps.

pub mod client;
pub mod config;
pub mod control;
pub mod display;
pub mod error;
pub mod events;
pub mod interrupt;
pub mod logging;

pub use client::ControlHandle;
pub use config::HarnessConfig;
pub use control::{Ack, ControlFrame, ControlOp, ControlRequest};
pub use display::{HarnessDisplay, RunOutcome, UserFunc};
pub use error::{HarnessError, Result};
pub use events::{EventQueue, ScriptedEvent};
pub use interrupt::InterruptToken;
