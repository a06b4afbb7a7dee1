//! Counting operation
//!
//! Both endpoints send strictly incrementing numbers up to their configured
//! targets and verify the peer's sequence. The counter is the workhorse of
//! the terminal and crane tests, and doubles as a liveness check.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use flotilla_core::{Error, Result};

use crate::op::{register_op_type, OpParams, OpTerminal, Operation};

/// Type name of the counting operation
pub const COUNTER_OP_TYPE: &str = "count";

/// Counter configuration, sent to the peer in the op init
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CounterOpts {
    /// How many numbers the initiating side sends
    pub client_count_to: u64,
    /// How many numbers the accepting side sends
    pub server_count_to: u64,
    /// Flush the terminal after every send
    pub flush: bool,
    /// Pause between sends in milliseconds
    pub wait_ms: u64,
}

/// A running counter operation
pub struct CounterOp {
    id: u32,
    terminal: Arc<dyn OpTerminal>,
    opts: CounterOpts,
    is_client: bool,
    /// Last number we sent
    sent: AtomicU64,
    /// Last number we received
    received: AtomicU64,
    done: AtomicBool,
    error: parking_lot::Mutex<Option<Error>>,
    finished: Notify,
}

impl CounterOp {
    /// Start a counter on `terminal` as the initiating side.
    pub async fn start(terminal: Arc<dyn OpTerminal>, opts: CounterOpts) -> Result<Arc<Self>> {
        let id = terminal.allocate_op_id();
        let op = Arc::new(Self::new(id, terminal.clone(), opts, true));

        let data = postcard::to_allocvec(&opts)
            .map_err(|err| Error::Internal(format!("failed to encode counter opts: {err}")))?;
        terminal.op_init(op.clone(), data).await?;

        tokio::spawn(op.clone().counter_worker());
        Ok(op)
    }

    /// Register the accepting side in the op-type registry.
    pub fn register() {
        register_op_type(OpParams {
            type_name: COUNTER_OP_TYPE,
            requires: crate::op::TerminalPermission::empty(),
            start: Arc::new(|terminal, op_id, data| {
                let opts: CounterOpts = postcard::from_bytes(&data).map_err(|err| {
                    Error::MalformedData(format!("invalid counter opts: {err}"))
                })?;
                let op = Arc::new(CounterOp::new(op_id, terminal, opts, false));
                tokio::spawn(op.clone().counter_worker());
                Ok(op as Arc<dyn Operation>)
            }),
        });
    }

    fn new(id: u32, terminal: Arc<dyn OpTerminal>, opts: CounterOpts, is_client: bool) -> Self {
        Self {
            id,
            terminal,
            opts,
            is_client,
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            done: AtomicBool::new(false),
            error: parking_lot::Mutex::new(None),
            finished: Notify::new(),
        }
    }

    fn send_target(&self) -> u64 {
        if self.is_client {
            self.opts.client_count_to
        } else {
            self.opts.server_count_to
        }
    }

    fn recv_target(&self) -> u64 {
        if self.is_client {
            self.opts.server_count_to
        } else {
            self.opts.client_count_to
        }
    }

    /// Wait until the operation ends, returning its error if any.
    pub async fn wait(&self) -> Option<Error> {
        loop {
            let notified = self.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.done.load(Ordering::SeqCst) {
                return self.error.lock().clone();
            }
            notified.await;
        }
    }

    /// Numbers received from the peer so far.
    pub fn counted(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    async fn counter_worker(self: Arc<Self>) {
        let cancel = self.terminal.cancellation();

        for next in 1..=self.send_target() {
            if self.done.load(Ordering::SeqCst) {
                return;
            }

            let data = postcard::to_allocvec(&next).expect("u64 encoding cannot fail");
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(Error::Stopping("terminal stopped".to_string())),
                result = self.terminal.op_send(self.id, data) => result,
            };
            if let Err(err) = result {
                let err = err.wrap("counter send failed");
                self.terminal.op_end(self.id, Some(err)).await;
                return;
            }
            self.sent.store(next, Ordering::SeqCst);

            if self.opts.flush {
                self.terminal.flush().await;
            }
            if self.opts.wait_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.opts.wait_ms)).await;
            }
        }

        debug!(op = self.id, target = self.send_target(), "counter done sending");
        self.maybe_finish();
    }

    /// The initiating side ends the op once both directions are complete.
    fn maybe_finish(&self) {
        if self.sent.load(Ordering::SeqCst) >= self.send_target()
            && self.received.load(Ordering::SeqCst) >= self.recv_target()
            && self.is_client
        {
            let terminal = self.terminal.clone();
            let id = self.id;
            tokio::spawn(async move {
                terminal.op_end(id, None).await;
            });
        }
    }
}

impl Operation for CounterOp {
    fn id(&self) -> u32 {
        self.id
    }

    fn type_name(&self) -> &'static str {
        COUNTER_OP_TYPE
    }

    fn deliver(&self, data: Vec<u8>) -> Result<()> {
        let number: u64 = postcard::from_bytes(&data)
            .map_err(|err| Error::MalformedData(format!("invalid counter number: {err}")))?;

        let expected = self.received.load(Ordering::SeqCst) + 1;
        if number != expected {
            return Err(Error::IncorrectUsage(format!(
                "counter out of sequence: got {number}, expected {expected}"
            )));
        }
        if number > self.recv_target() {
            return Err(Error::IncorrectUsage(format!(
                "counter beyond target: got {number}, target {}",
                self.recv_target()
            )));
        }

        self.received.store(number, Ordering::SeqCst);
        if number == self.recv_target() {
            self.maybe_finish();
        }
        Ok(())
    }

    fn end(&self, err: Option<Error>) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(err) = err {
            *self.error.lock() = Some(err);
        } else if self.received.load(Ordering::SeqCst) < self.recv_target() {
            *self.error.lock() = Some(Error::IncorrectUsage(format!(
                "counter ended early at {} of {}",
                self.received.load(Ordering::SeqCst),
                self.recv_target()
            )));
        }
        self.finished.notify_waiters();
    }
}
