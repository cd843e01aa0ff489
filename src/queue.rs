// MIT License - Copyright (c) 2026 Peter Wright
// Bounded FIFO of decoded inbound commands

use std::collections::VecDeque;

use serde_json::Value;
use tracing::warn;

use crate::error::{BridgeError, Result};

/// A decoded command waiting for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    pub topic: String,
    pub message: Value,
}

/// Commands received between two dispatch turns.
///
/// Never holds more than `capacity` entries; a push beyond that is rejected
/// and counted.
#[derive(Debug)]
pub struct CommandQueue {
    items: VecDeque<PendingCommand>,
    capacity: usize,
    dropped: u64,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, command: PendingCommand) -> Result<()> {
        if self.items.len() >= self.capacity {
            self.dropped += 1;
            warn!(
                "Command queue full ({} entries), dropping message on {}",
                self.capacity, command.topic
            );
            return Err(BridgeError::QueueFull {
                capacity: self.capacity,
            });
        }
        self.items.push_back(command);
        Ok(())
    }

    /// Oldest queued command.
    pub fn pop(&mut self) -> Option<PendingCommand> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of commands rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
