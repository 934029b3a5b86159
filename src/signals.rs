// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::UnboundedReceiver;

/// Source of interrupt notifications for a supervisor run
#[async_trait]
pub trait Interrupts: Send {
    /// Wait for the next interrupt, `None` once no more can arrive
    async fn recv(&mut self) -> Option<Signal>;
}

/// SIGINT and SIGTERM delivered to this process
///
/// Once created the default disposition of both signals is replaced, the process
/// will no longer exit on Ctrl-C.
#[derive(Debug)]
pub struct OsInterrupts {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

impl OsInterrupts {
    /// Must be called from within a tokio runtime
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }
}

#[async_trait]
impl Interrupts for OsInterrupts {
    async fn recv(&mut self) -> Option<Signal> {
        tokio::select! {
            Some(()) = self.interrupt.recv() => Some(Signal::SIGINT),
            Some(()) = self.terminate.recv() => Some(Signal::SIGTERM),
            else => None,
        }
    }
}

/// Signals sent over a channel, for driving a supervisor without real signals
#[async_trait]
impl Interrupts for UnboundedReceiver<Signal> {
    async fn recv(&mut self) -> Option<Signal> {
        UnboundedReceiver::recv(self).await
    }
}
