//! Scripted events emitted by the display on request.

use std::collections::VecDeque;

use sockwire::server::Client;
use sockwire::Argument;
use tracing::debug;

use crate::error::{HarnessError, Result};

/// One event to post: target object id, event opcode and arguments.
#[derive(Debug)]
pub struct ScriptedEvent {
    pub object_id: u32,
    pub opcode: u16,
    pub args: Vec<Argument>,
}

/// Events waiting to be emitted, in order.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<ScriptedEvent>,
    emitted: usize,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, object_id: u32, opcode: u16, args: Vec<Argument>) -> &mut Self {
        self.events.push_back(ScriptedEvent {
            object_id,
            opcode,
            args,
        });
        self
    }

    /// Events not yet emitted.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events emitted so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Move every event of `other` to the back of this queue.
    pub fn append(&mut self, other: EventQueue) {
        self.events.extend(other.events);
    }

    /// Post the next event to `client`. Returns false when the queue is empty.
    pub fn emit_one(&mut self, client: &mut Client) -> Result<bool> {
        let Some(event) = self.events.pop_front() else {
            return Ok(false);
        };
        let resource = client
            .get_object(event.object_id)
            .ok_or(HarnessError::UnknownObject { id: event.object_id })?;
        client.post_event(resource, event.opcode, &event.args)?;
        self.emitted += 1;
        Ok(true)
    }

    /// Post up to `count` events, or all of them when `count` is 0.
    pub fn emit(&mut self, client: &mut Client, count: u32) -> Result<u64> {
        let limit = if count == 0 { usize::MAX } else { count as usize };
        let mut emitted = 0u64;
        while (emitted as usize) < limit && self.emit_one(client)? {
            emitted += 1;
        }
        debug!("Emitted {} events (asked for {})", emitted, count);
        Ok(emitted)
    }
}
