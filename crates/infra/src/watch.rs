//! Per-call report subscriptions.

use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use conductor_calls::CallState;
use conductor_core::Value;

/// Change to a watched call's report.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportEvent {
    Progress { key: String, value: Value },
    StateChanged(CallState),
}

/// Receiving side of [`Dispatcher::watch`](crate::Dispatcher::watch).
///
/// Events for one call arrive in the order they happened. The channel closes
/// after the terminal `StateChanged` event, so `recv` then returns an error
/// and iteration ends.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn iter(&self) -> impl Iterator<Item = M> + '_ {
        self.receiver.iter()
    }
}
