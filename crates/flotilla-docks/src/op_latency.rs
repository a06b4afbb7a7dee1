//! Latency probe operation
//!
//! Runs on a crane controller: the client sends nonce pings at a fixed
//! interval, the server echoes them, and the minimum round-trip time of
//! the run is stored as the connected hub's latency measurement.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use flotilla_core::{Error, Result};
use flotilla_terminal::op::{register_op_type, OpParams, OpTerminal, Operation, TerminalPermission};

use crate::crane::Crane;

/// Type name of the latency probe
pub const LATENCY_OP_TYPE: &str = "latency";

const PING_REQUEST: u8 = 1;
const PING_RESPONSE: u8 = 2;
const NONCE_SIZE: usize = 16;

/// Client-side probe configuration
#[derive(Clone, Copy, Debug)]
pub struct LatencyOpts {
    /// Number of pings per run
    pub runs: usize,
    /// Pause between pings
    pub interval: Duration,
    /// Overall deadline for the run
    pub timeout: Duration,
}

impl Default for LatencyOpts {
    fn default() -> Self {
        Self {
            runs: 10,
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Register the echoing side in the op-type registry.
pub fn register_latency_op() {
    register_op_type(OpParams {
        type_name: LATENCY_OP_TYPE,
        requires: TerminalPermission::IS_CRANE_CONTROLLER,
        start: Arc::new(|terminal, op_id, data| {
            let op = Arc::new(LatencyEchoOp { id: op_id, terminal: terminal.clone() });
            op.deliver(data)?;
            Ok(op as Arc<dyn Operation>)
        }),
    });
}

/// Server side: echoes pings back with the response marker.
struct LatencyEchoOp {
    id: u32,
    terminal: Arc<dyn OpTerminal>,
}

impl Operation for LatencyEchoOp {
    fn id(&self) -> u32 {
        self.id
    }

    fn type_name(&self) -> &'static str {
        LATENCY_OP_TYPE
    }

    fn deliver(&self, data: Vec<u8>) -> Result<()> {
        match data.split_first() {
            Some((&PING_REQUEST, nonce)) => {
                let mut response = Vec::with_capacity(1 + nonce.len());
                response.push(PING_RESPONSE);
                response.extend_from_slice(nonce);

                let terminal = self.terminal.clone();
                let op_id = self.id;
                tokio::spawn(async move {
                    if let Err(err) = terminal.op_send(op_id, response).await {
                        warn!(%err, "failed to send ping response");
                        return;
                    }
                    terminal.flush().await;
                });
                Ok(())
            }
            _ => Err(Error::IncorrectUsage("unknown request type".to_string())),
        }
    }

    fn end(&self, _err: Option<Error>) {}
}

/// Client side of the latency probe
pub struct LatencyTestOp {
    id: u32,
    terminal: Arc<dyn OpTerminal>,
    opts: LatencyOpts,
    responses_tx: mpsc::Sender<Vec<u8>>,
    responses_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    last_nonce: Mutex<Option<Vec<u8>>>,
    last_sent: Mutex<Instant>,
    measured: Mutex<Vec<Duration>>,
    result: Mutex<Option<Option<Error>>>,
    finished: Notify,
}

impl LatencyTestOp {
    /// Start a latency probe run on a controller terminal.
    pub async fn start(terminal: Arc<dyn OpTerminal>, opts: LatencyOpts) -> Result<Arc<Self>> {
        if !terminal
            .permissions()
            .contains(TerminalPermission::IS_CRANE_CONTROLLER)
        {
            return Err(Error::PermissionDenied(
                "latency probes run on crane controllers only".to_string(),
            ));
        }

        let (responses_tx, responses_rx) = mpsc::channel(opts.runs.max(1));
        let op = Arc::new(Self {
            id: terminal.allocate_op_id(),
            terminal: terminal.clone(),
            opts,
            responses_tx,
            responses_rx: tokio::sync::Mutex::new(Some(responses_rx)),
            last_nonce: Mutex::new(None),
            last_sent: Mutex::new(Instant::now()),
            measured: Mutex::new(Vec::with_capacity(opts.runs)),
            result: Mutex::new(None),
            finished: Notify::new(),
        });

        let ping = op.next_ping();
        terminal.op_init(op.clone(), ping).await?;
        terminal.flush().await;

        tokio::spawn(op.clone().handler());
        Ok(op)
    }

    /// Wait for the run to finish, returning its error if any.
    pub async fn wait(&self) -> Option<Error> {
        loop {
            let notified = self.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(result) = self.result.lock().clone() {
                return result;
            }
            notified.await;
        }
    }

    /// Round-trip samples measured so far.
    pub fn samples(&self) -> Vec<Duration> {
        self.measured.lock().clone()
    }

    fn next_ping(&self) -> Vec<u8> {
        let nonce: [u8; NONCE_SIZE] = rand::random();
        *self.last_nonce.lock() = Some(nonce.to_vec());
        *self.last_sent.lock() = Instant::now();

        let mut ping = Vec::with_capacity(1 + NONCE_SIZE);
        ping.push(PING_REQUEST);
        ping.extend_from_slice(&nonce);
        ping
    }

    fn handle_response(&self, data: &[u8]) -> Result<()> {
        match data.split_first() {
            Some((&PING_RESPONSE, nonce)) => {
                let expected = self.last_nonce.lock().take();
                if expected.as_deref() != Some(nonce) {
                    return Err(Error::Integrity("ping nonce mismatch".to_string()));
                }
                let rtt = self.last_sent.lock().elapsed();
                self.measured.lock().push(rtt);
                Ok(())
            }
            _ => Err(Error::IncorrectUsage("unknown response type".to_string())),
        }
    }

    /// Store the minimum RTT as the connected hub's latency measurement.
    fn report(&self) -> Result<()> {
        let samples = self.measured.lock().clone();
        let Some(min) = samples.iter().min().copied() else {
            return Err(Error::Internal("latency run without samples".to_string()));
        };

        let crane = self
            .terminal
            .host()
            .and_then(|host| host.downcast::<Crane>().ok());
        match crane {
            Some(crane) => match crane.connected_hub() {
                Some(hub) => {
                    hub.measurements.set_latency(min);
                    info!(hub = %hub, latency = ?min, "measured latency");
                }
                // We dialed this connection, so a missing hub means the
                // measurement has nowhere to go; surface it for a retry.
                None if crane.is_mine() => {
                    return Err(Error::Internal(format!(
                        "latency probe ran on crane {} without a connected hub",
                        crane.id()
                    )));
                }
                None => {
                    debug!(crane = %crane.id(), latency = ?min, "no connected hub to record latency on");
                }
            },
            None => debug!(latency = ?min, "latency probe without crane host"),
        }
        Ok(())
    }

    async fn handler(self: Arc<Self>) {
        let mut responses = self
            .responses_rx
            .lock()
            .await
            .take()
            .expect("latency handler started twice");
        let cancel = self.terminal.cancellation();
        let deadline = Instant::now() + self.opts.timeout;

        let outcome = loop {
            let response = tokio::select! {
                _ = cancel.cancelled() => break Some(Error::Stopping("terminal stopped".to_string())),
                _ = tokio::time::sleep_until(deadline) => {
                    break Some(Error::Timeout("latency run deadline exceeded".to_string()));
                }
                response = responses.recv() => match response {
                    Some(response) => response,
                    // Channel closed: the op ended underneath us.
                    None => return,
                },
            };

            if let Err(err) = self.handle_response(&response) {
                break Some(err);
            }

            if self.measured.lock().len() >= self.opts.runs {
                break self.report().err();
            }

            tokio::time::sleep(self.opts.interval).await;
            let ping = self.next_ping();
            if let Err(err) = self.terminal.op_send(self.id, ping).await {
                break Some(err.wrap("failed to send ping"));
            }
            self.terminal.flush().await;
        };

        self.terminal.op_end(self.id, outcome).await;
    }
}

impl Operation for LatencyTestOp {
    fn id(&self) -> u32 {
        self.id
    }

    fn type_name(&self) -> &'static str {
        LATENCY_OP_TYPE
    }

    fn deliver(&self, data: Vec<u8>) -> Result<()> {
        self.responses_tx
            .try_send(data)
            .map_err(|_| Error::Timeout("latency response queue full".to_string()))
    }

    fn end(&self, err: Option<Error>) {
        *self.result.lock() = Some(err);
        self.finished.notify_waiters();
    }
}
