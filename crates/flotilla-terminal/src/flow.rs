//! Credit-based duplex flow control
//!
//! Each endpoint grants the peer `queue_size` credits on creation. Sending
//! a data unit consumes one credit; consuming a received unit frees space
//! that is reported back, batched to at least an eighth of the queue or
//! after [`REPORT_MAX_WAIT`] without outbound traffic. For every live pair
//! `(A, B)`: `A.send_space + in_flight == B.reported_space`.
//!
//! Endpoints run a three-state lifecycle `Open → Draining → Closed`:
//! draining starts on local end or on the peer's EOF, forbids new
//! outbound sends, and keeps accepting inbound until the EOF is consumed.

use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use flotilla_core::{Error, Result};

/// Default number of messages an endpoint is willing to buffer
pub const DEFAULT_QUEUE_SIZE: u32 = 100;

/// Maximum wait before pending credits are reported standalone
pub const REPORT_MAX_WAIT: Duration = Duration::from_millis(100);

/// Local send buffer ceiling, as a multiple of the queue size
const SEND_CEILING_FACTOR: usize = 2;

/// Lifecycle state of a flow queue endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FlowState {
    /// Both directions running
    Open = 0,
    /// Outbound forbidden, inbound drains until the peer's EOF
    Draining = 1,
    /// Fully stopped
    Closed = 2,
}

impl FlowState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

/// What the flow queue hands upstream
pub enum FlowSubmission {
    /// A flow-controlled data unit
    Data(Vec<u8>),
    /// A credit delta for the peer
    SpaceReport(u32),
}

/// Upstream submission callback
pub type SubmitFn = Box<dyn Fn(FlowSubmission) + Send + Sync>;

/// One endpoint of a flow-controlled duplex stream
pub struct DuplexFlowQueue {
    queue_size: u32,
    state: AtomicU8,
    /// Credits we hold for sending to the peer
    send_space: AtomicI32,
    /// Credits we have granted the peer and not yet seen used
    reported_space: AtomicI32,
    /// Received units not yet consumed by the owner
    recv_pending: AtomicI32,
    send_tx: mpsc::Sender<Vec<u8>>,
    send_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    /// Taken on peer EOF or close, so the receiver drains then ends
    recv_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    recv_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    ready: Notify,
    report_nudge: Notify,
    cancel: CancellationToken,
    submit: SubmitFn,
}

impl DuplexFlowQueue {
    /// Create a new flow queue endpoint.
    ///
    /// `cancel` scopes the queue to its terminal; pending senders return
    /// [`Error::Stopping`] once it fires. The owner must drive
    /// [`DuplexFlowQueue::flow_handler`] in a worker.
    pub fn new(queue_size: u32, cancel: CancellationToken, submit: SubmitFn) -> Arc<Self> {
        let (send_tx, send_rx) = mpsc::channel(queue_size as usize * SEND_CEILING_FACTOR);
        let (recv_tx, recv_rx) = mpsc::channel(queue_size as usize);

        Arc::new(Self {
            queue_size,
            state: AtomicU8::new(FlowState::Open as u8),
            send_space: AtomicI32::new(queue_size as i32),
            reported_space: AtomicI32::new(queue_size as i32),
            recv_pending: AtomicI32::new(0),
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            recv_tx: Mutex::new(Some(recv_tx)),
            recv_rx: tokio::sync::Mutex::new(recv_rx),
            ready: Notify::new(),
            report_nudge: Notify::new(),
            cancel,
            submit,
        })
    }

    /// Configured queue size.
    pub fn queue_size(&self) -> u32 {
        self.queue_size
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FlowState {
        FlowState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Credits we currently hold for sending.
    pub fn send_space(&self) -> i32 {
        self.send_space.load(Ordering::SeqCst)
    }

    /// Credits we have granted the peer.
    pub fn reported_space(&self) -> i32 {
        self.reported_space.load(Ordering::SeqCst)
    }

    /// Send a data unit, waiting for peer credit.
    ///
    /// Fails with [`Error::Stopping`] once the endpoint is draining or
    /// closed, and with [`Error::QueueOverflow`] when the local buffer
    /// exceeds its ceiling.
    pub async fn send(&self, data: Vec<u8>) -> Result<()> {
        loop {
            match self.state() {
                FlowState::Open => {}
                FlowState::Draining => {
                    return Err(Error::Stopping("flow queue draining".to_string()));
                }
                FlowState::Closed => {
                    return Err(Error::Stopping("flow queue closed".to_string()));
                }
            }

            let prev = self.send_space.fetch_sub(1, Ordering::SeqCst);
            if prev > 0 {
                if prev > 1 {
                    // More credit left, cascade to other waiting senders.
                    self.ready.notify_one();
                }
                break;
            }
            self.send_space.fetch_add(1, Ordering::SeqCst);

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(Error::Stopping("flow queue closed".to_string()));
                }
                _ = self.ready.notified() => {}
            }
        }

        match self.send_tx.try_send(data) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.send_space.fetch_add(1, Ordering::SeqCst);
                Err(Error::QueueOverflow(format!(
                    "send queue exceeded ceiling of {}",
                    self.queue_size as usize * SEND_CEILING_FACTOR
                )))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::Stopping("flow queue closed".to_string()))
            }
        }
    }

    /// Deliver a data unit received from the peer.
    ///
    /// Accepted while open or draining; units arriving after the peer's
    /// EOF are dropped. Fails when the peer sends beyond the credits we
    /// granted, which is a flow-control protocol violation.
    pub fn deliver(&self, data: Vec<u8>) -> Result<()> {
        let recv_tx = self.recv_tx.lock().clone();
        let Some(recv_tx) = recv_tx else {
            // EOF already seen or fully closed.
            return Ok(());
        };

        let prev = self.reported_space.fetch_sub(1, Ordering::SeqCst);
        if prev <= 0 {
            self.reported_space.fetch_add(1, Ordering::SeqCst);
            return Err(Error::IncorrectUsage(
                "peer exceeded granted flow credits".to_string(),
            ));
        }

        self.recv_pending.fetch_add(1, Ordering::SeqCst);
        recv_tx.try_send(data).map_err(|_| {
            Error::Internal("receive queue full despite credit accounting".to_string())
        })
    }

    /// Credit the peer's space report.
    ///
    /// Reports are idempotent monotone increments and may arrive reordered
    /// relative to data.
    pub fn handle_space_report(&self, credits: u32) {
        self.send_space.fetch_add(credits as i32, Ordering::SeqCst);
        self.ready.notify_one();
    }

    /// Consume the next received data unit.
    ///
    /// Buffered units keep arriving while draining; `None` marks the end
    /// of the inbound stream and closes the endpoint.
    pub async fn receive(&self) -> Option<Vec<u8>> {
        let data = {
            let mut rx = self.recv_rx.lock().await;
            rx.recv().await
        };

        match data {
            Some(data) => {
                self.recv_pending.fetch_sub(1, Ordering::SeqCst);
                self.report_nudge.notify_one();
                Some(data)
            }
            None => {
                self.state.store(FlowState::Closed as u8, Ordering::SeqCst);
                None
            }
        }
    }

    /// Enter the draining state: forbid new outbound sends while inbound
    /// keeps flowing. Used when the local side ends the stream.
    pub fn start_draining(&self) {
        let _ = self.state.compare_exchange(
            FlowState::Open as u8,
            FlowState::Draining as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        // Unblock senders so they observe the state change.
        self.ready.notify_waiters();
    }

    /// The peer's EOF arrived: stop accepting inbound, let the receiver
    /// drain what is buffered, then end its stream.
    pub fn handle_eof(&self) {
        self.start_draining();
        self.recv_tx.lock().take();
    }

    /// Shut the queue down entirely; pending senders return
    /// [`Error::Stopping`] and the receiver ends after draining.
    pub fn close(&self) {
        self.state.store(FlowState::Closed as u8, Ordering::SeqCst);
        self.recv_tx.lock().take();
        self.cancel.cancel();
    }

    /// Report all pending credits immediately.
    pub fn flush(&self) {
        let credits = self.take_report(true);
        if credits > 0 {
            (self.submit)(FlowSubmission::SpaceReport(credits));
        }
    }

    fn reportable(&self) -> i32 {
        self.queue_size as i32
            - self.recv_pending.load(Ordering::SeqCst)
            - self.reported_space.load(Ordering::SeqCst)
    }

    fn report_threshold(&self) -> i32 {
        (self.queue_size as i32 / 8).max(1)
    }

    /// Claim pending credits for reporting; below the batching threshold
    /// nothing is claimed unless `force` is set.
    fn take_report(&self, force: bool) -> u32 {
        loop {
            let reported = self.reported_space.load(Ordering::SeqCst);
            let reportable =
                self.queue_size as i32 - self.recv_pending.load(Ordering::SeqCst) - reported;
            if reportable <= 0 || (!force && reportable < self.report_threshold()) {
                return 0;
            }
            if self
                .reported_space
                .compare_exchange(
                    reported,
                    reported + reportable,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return reportable as u32;
            }
        }
    }

    /// Drive the outbound side: forward queued data with piggybacked space
    /// reports, and emit standalone reports after [`REPORT_MAX_WAIT`].
    ///
    /// Returns when the queue is closed.
    pub async fn flow_handler(self: Arc<Self>) {
        let mut send_rx = self
            .send_rx
            .lock()
            .take()
            .expect("flow handler started twice");
        let mut report_deadline: Option<Instant> = None;

        loop {
            // Credits beyond the batching threshold go out right away; the
            // deadline only covers the below-threshold remainder.
            let credits = self.take_report(false);
            if credits > 0 {
                (self.submit)(FlowSubmission::SpaceReport(credits));
            }
            match self.reportable() {
                0 => report_deadline = None,
                _ if report_deadline.is_none() => {
                    report_deadline = Some(Instant::now() + REPORT_MAX_WAIT);
                }
                _ => {}
            }
            let deadline = report_deadline.unwrap_or_else(Instant::now);

            tokio::select! {
                _ = self.cancel.cancelled() => return,

                maybe = send_rx.recv() => {
                    let Some(data) = maybe else { return };
                    let credits = self.take_report(false);
                    if credits > 0 {
                        (self.submit)(FlowSubmission::SpaceReport(credits));
                    }
                    (self.submit)(FlowSubmission::Data(data));
                    if self.reportable() == 0 {
                        report_deadline = None;
                    }
                }

                _ = self.report_nudge.notified() => {}

                _ = tokio::time::sleep_until(deadline), if report_deadline.is_some() => {
                    let credits = self.take_report(true);
                    if credits > 0 {
                        (self.submit)(FlowSubmission::SpaceReport(credits));
                    }
                    report_deadline = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Wire two flow queues back to back through forwarding tasks.
    fn paired_queues(queue_size: u32) -> (Arc<DuplexFlowQueue>, Arc<DuplexFlowQueue>) {
        let (a_out, mut a_wire) = mpsc::unbounded_channel();
        let (b_out, mut b_wire) = mpsc::unbounded_channel();

        let a = DuplexFlowQueue::new(
            queue_size,
            CancellationToken::new(),
            Box::new(move |s| {
                let _ = a_out.send(s);
            }),
        );
        let b = DuplexFlowQueue::new(
            queue_size,
            CancellationToken::new(),
            Box::new(move |s| {
                let _ = b_out.send(s);
            }),
        );

        let b2 = b.clone();
        tokio::spawn(async move {
            while let Some(submission) = a_wire.recv().await {
                match submission {
                    FlowSubmission::Data(data) => {
                        b2.deliver(data).unwrap();
                    }
                    FlowSubmission::SpaceReport(credits) => b2.handle_space_report(credits),
                }
            }
        });
        let a2 = a.clone();
        tokio::spawn(async move {
            while let Some(submission) = b_wire.recv().await {
                match submission {
                    FlowSubmission::Data(data) => {
                        a2.deliver(data).unwrap();
                    }
                    FlowSubmission::SpaceReport(credits) => a2.handle_space_report(credits),
                }
            }
        });

        tokio::spawn(a.clone().flow_handler());
        tokio::spawn(b.clone().flow_handler());

        (a, b)
    }

    #[tokio::test]
    async fn space_counters_match_after_traffic() {
        let (a, b) = paired_queues(16);

        for round in 0..200u32 {
            a.send(round.to_be_bytes().to_vec()).await.unwrap();
            let got = b.receive().await.unwrap();
            assert_eq!(got, round.to_be_bytes());
        }

        // Let the final space report travel.
        tokio::time::sleep(REPORT_MAX_WAIT * 3).await;

        assert_eq!(a.send_space(), b.reported_space());
        assert_eq!(b.send_space(), a.reported_space());
        assert_eq!(a.send_space(), 16);
    }

    #[tokio::test]
    async fn duplex_traffic_keeps_invariant() {
        let (a, b) = paired_queues(8);

        let b2 = b.clone();
        let echo = tokio::spawn(async move {
            for _ in 0..50 {
                let data = b2.receive().await.unwrap();
                b2.send(data).await.unwrap();
            }
        });

        for round in 0..50u32 {
            a.send(vec![round as u8]).await.unwrap();
            let echoed = a.receive().await.unwrap();
            assert_eq!(echoed, vec![round as u8]);
        }
        echo.await.unwrap();

        tokio::time::sleep(REPORT_MAX_WAIT * 3).await;
        assert_eq!(a.send_space(), b.reported_space());
        assert_eq!(b.send_space(), a.reported_space());
    }

    #[tokio::test]
    async fn close_unblocks_senders() {
        let cancel = CancellationToken::new();
        let dfq = DuplexFlowQueue::new(2, cancel, Box::new(|_| {}));

        // Exhaust credit.
        dfq.send(vec![1]).await.unwrap();
        dfq.send(vec![2]).await.unwrap();

        let dfq2 = dfq.clone();
        let blocked = tokio::spawn(async move { dfq2.send(vec![3]).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        dfq.close();

        let result = blocked.await.unwrap();
        assert!(matches!(result, Err(Error::Stopping(_))));
        assert_eq!(dfq.state(), FlowState::Closed);
    }

    #[tokio::test]
    async fn draining_forbids_outbound_but_drains_inbound() {
        let dfq = DuplexFlowQueue::new(4, CancellationToken::new(), Box::new(|_| {}));

        // Buffered inbound before the stream ends.
        dfq.deliver(vec![1]).unwrap();
        dfq.deliver(vec![2]).unwrap();

        dfq.start_draining();
        assert_eq!(dfq.state(), FlowState::Draining);
        assert!(matches!(dfq.send(vec![9]).await, Err(Error::Stopping(_))));

        // Inbound is still accepted until the peer's EOF.
        dfq.deliver(vec![3]).unwrap();
        dfq.handle_eof();
        dfq.deliver(vec![4]).unwrap(); // after EOF: dropped, not an error

        // Everything buffered before the EOF drains deterministically.
        assert_eq!(dfq.receive().await.unwrap(), vec![1]);
        assert_eq!(dfq.receive().await.unwrap(), vec![2]);
        assert_eq!(dfq.receive().await.unwrap(), vec![3]);
        assert_eq!(dfq.receive().await, None);
        assert_eq!(dfq.state(), FlowState::Closed);
    }

    #[tokio::test]
    async fn draining_unblocks_waiting_senders() {
        let dfq = DuplexFlowQueue::new(1, CancellationToken::new(), Box::new(|_| {}));

        dfq.send(vec![1]).await.unwrap();
        let dfq2 = dfq.clone();
        let blocked = tokio::spawn(async move { dfq2.send(vec![2]).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        dfq.start_draining();
        let result = blocked.await.unwrap();
        assert!(matches!(result, Err(Error::Stopping(_))));
    }

    #[tokio::test]
    async fn peer_exceeding_credits_is_rejected() {
        let dfq = DuplexFlowQueue::new(2, CancellationToken::new(), Box::new(|_| {}));

        dfq.deliver(vec![1]).unwrap();
        dfq.deliver(vec![2]).unwrap();
        assert!(matches!(
            dfq.deliver(vec![3]),
            Err(Error::IncorrectUsage(_))
        ));
    }
}
