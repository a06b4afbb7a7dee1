//! Expand operation: relay a terminal across another crane
//!
//! The relay side wires two flow queues back to back: one toward the
//! origin (as op-scoped messages inside the origin terminal) and one
//! toward the relay crane (as terminal frames addressed to a freshly
//! allocated terminal ID). Payloads pass through opaquely; the end-to-end
//! session between the origin and the destination hub is never opened
//! here.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use flotilla_core::frame::{MsgType, TerminalMsg, TERMINAL_SCOPE_OP_ID};
use flotilla_core::session::Session;
use flotilla_core::{Error, Result};
use flotilla_hub::{Hub, HubId};
use flotilla_terminal::flow::{DuplexFlowQueue, FlowSubmission};
use flotilla_terminal::op::{register_op_type, OpParams, OpTerminal, Operation, TerminalPermission};
use flotilla_terminal::terminal::{
    decode_end_err, Terminal, TerminalHandle, TerminalOpts, TerminalUpstream,
};

use crate::crane::Crane;
use crate::registry;

/// Type name of the expand operation
pub const EXPAND_OP_TYPE: &str = "expand";

/// Session derivation context for end-to-end expanded terminals
pub(crate) const E2E_SESSION_CONTEXT: &[u8] = b"expanded terminal";

static ACTIVE_EXPAND_OPS: AtomicI64 = AtomicI64::new(0);

/// Number of expand operations currently relaying.
pub fn active_expand_ops() -> i64 {
    ACTIVE_EXPAND_OPS.load(Ordering::SeqCst)
}

/// Expand request carried in the op init
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExpandRequest {
    /// Destination hub to relay to
    pub dst: HubId,
    /// Options for the expanded terminal
    pub opts: TerminalOpts,
    /// End-to-end session key for the destination
    pub ephemeral: Option<[u8; 32]>,
}

/// Register the relay side in the op-type registry.
pub fn register_expand_op() {
    register_op_type(OpParams {
        type_name: EXPAND_OP_TYPE,
        requires: TerminalPermission::MAY_EXPAND,
        start: Arc::new(|terminal, op_id, data| {
            let op = ExpandOp::start(terminal, op_id, data)?;
            Ok(op as Arc<dyn Operation>)
        }),
    });
}

/// Relay side of an expansion
pub struct ExpandOp {
    id: u32,
    terminal: Arc<dyn OpTerminal>,
    /// Flow queue toward the origin terminal
    origin_dfq: Arc<DuplexFlowQueue>,
    relay_terminal: Arc<ExpansionRelayTerminal>,
    data_relayed: Arc<AtomicU64>,
    ended: AtomicBool,
    cancel: CancellationToken,
}

/// The stub registered in the relay crane's terminal table
pub struct ExpansionRelayTerminal {
    id: u32,
    crane: Arc<Crane>,
    /// Flow queue toward the relay crane
    dfq: Arc<DuplexFlowQueue>,
    op: parking_lot::Mutex<Option<Arc<ExpandOp>>>,
    /// Set when the destination's terminal end arrives; consumed after
    /// the backward direction drained
    peer_end: parking_lot::Mutex<Option<Option<Error>>>,
    abandoned: AtomicBool,
}

impl ExpandOp {
    fn start(
        terminal: Arc<dyn OpTerminal>,
        op_id: u32,
        data: Vec<u8>,
    ) -> Result<Arc<Self>> {
        // Expanding is only allowed on public hubs.
        let crane = terminal
            .host()
            .and_then(|host| host.downcast::<Crane>().ok())
            .ok_or_else(|| Error::Internal("expand op without crane host".to_string()))?;
        if !crane.is_public_hub() {
            return Err(Error::PermissionDenied(
                "expanding is only allowed on public hubs".to_string(),
            ));
        }

        let request: ExpandRequest = postcard::from_bytes(&data)
            .map_err(|err| Error::MalformedData(format!("invalid expand request: {err}")))?;

        let relay_crane = registry::get_assigned_crane(&request.dst)
            .ok_or_else(|| Error::HubUnavailable(format!("no crane assigned to {}", request.dst)))?;

        let cancel = terminal.cancellation().child_token();
        let relay_id = relay_crane.allocate_terminal_id();
        let queue_size = request.opts.queue_size;

        // Origin-side queue: submissions become op-scoped messages inside
        // the origin terminal.
        let (back_tx, back_rx) = mpsc::unbounded_channel::<FlowSubmission>();
        let origin_dfq = DuplexFlowQueue::new(
            queue_size,
            cancel.child_token(),
            Box::new(move |submission| {
                let _ = back_tx.send(submission);
            }),
        );

        // Relay-side queue: submissions become terminal frames on the
        // relay crane's wire.
        let forward_crane = relay_crane.clone();
        let relay_dfq = DuplexFlowQueue::new(
            queue_size,
            cancel.child_token(),
            Box::new(move |submission| match submission {
                FlowSubmission::Data(payload) => {
                    forward_crane.submit_payload(relay_id, payload);
                }
                FlowSubmission::SpaceReport(credits) => {
                    let report = TerminalMsg::space_report(TERMINAL_SCOPE_OP_ID, credits);
                    forward_crane
                        .submit_payload(relay_id, TerminalMsg::encode_sequence(&[report]));
                }
            }),
        );

        let relay_terminal = Arc::new(ExpansionRelayTerminal {
            id: relay_id,
            crane: relay_crane.clone(),
            dfq: relay_dfq.clone(),
            op: parking_lot::Mutex::new(None),
            peer_end: parking_lot::Mutex::new(None),
            abandoned: AtomicBool::new(false),
        });

        let op = Arc::new(Self {
            id: op_id,
            terminal: terminal.clone(),
            origin_dfq: origin_dfq.clone(),
            relay_terminal: relay_terminal.clone(),
            data_relayed: Arc::new(AtomicU64::new(0)),
            ended: AtomicBool::new(false),
            cancel: cancel.clone(),
        });
        *relay_terminal.op.lock() = Some(op.clone());

        // Establish the terminal on the destination crane.
        let init = flotilla_terminal::terminal::TerminalInit {
            opts: request.opts,
            ephemeral: request.ephemeral,
        }
        .encode()?;
        relay_crane.establish_new_terminal(relay_terminal.clone(), init)?;

        ACTIVE_EXPAND_OPS.fetch_add(1, Ordering::SeqCst);
        debug!(op = op_id, dst = %request.dst, relay = relay_id, "expansion established");

        tokio::spawn(origin_dfq.clone().flow_handler());
        tokio::spawn(relay_dfq.clone().flow_handler());
        tokio::spawn(op.clone().backstream_pump(back_rx));
        tokio::spawn(op.clone().forward_worker());
        tokio::spawn(op.clone().backward_worker());

        Ok(op)
    }

    /// Total payload bytes relayed in both directions.
    pub fn data_relayed(&self) -> u64 {
        self.data_relayed.load(Ordering::SeqCst)
    }

    /// Origin-side submissions go out as op-scoped terminal messages.
    async fn backstream_pump(
        self: Arc<Self>,
        mut back_rx: mpsc::UnboundedReceiver<FlowSubmission>,
    ) {
        loop {
            let submission = tokio::select! {
                _ = self.cancel.cancelled() => return,
                submission = back_rx.recv() => match submission {
                    Some(submission) => submission,
                    None => return,
                },
            };

            let result = match submission {
                FlowSubmission::Data(payload) => {
                    self.terminal.op_send(self.id, payload).await
                }
                FlowSubmission::SpaceReport(credits) => {
                    self.terminal.op_space_report(self.id, credits).await
                }
            };
            if let Err(err) = result {
                let err = err.wrap("failed to send from relay op");
                self.terminal.op_end(self.id, Some(err)).await;
                return;
            }
        }
    }

    /// Origin → relay.
    async fn forward_worker(self: Arc<Self>) {
        loop {
            let Some(payload) = self.origin_dfq.receive().await else {
                return;
            };
            self.data_relayed
                .fetch_add(payload.len() as u64, Ordering::SeqCst);
            if let Err(err) = self.relay_dfq().send(payload).await {
                if !err.is_stopping() {
                    warn!(op = self.id, %err, "forward relay failed");
                }
                self.teardown(Some(err), true, true);
                return;
            }
        }
    }

    /// Relay → origin.
    async fn backward_worker(self: Arc<Self>) {
        loop {
            let Some(payload) = self.relay_dfq().receive().await else {
                // Backward stream drained; finish a destination-initiated
                // end now.
                if let Some(err) = self.relay_terminal.peer_end.lock().take() {
                    let err = err.map(|err| err.wrap("relay failed"));
                    self.teardown(err, true, false);
                }
                return;
            };
            self.data_relayed
                .fetch_add(payload.len() as u64, Ordering::SeqCst);
            if let Err(err) = self.origin_dfq.send(payload).await {
                if !err.is_stopping() {
                    warn!(op = self.id, %err, "backward relay failed");
                }
                self.teardown(Some(err), true, true);
                return;
            }
        }
    }

    fn relay_dfq(&self) -> &Arc<DuplexFlowQueue> {
        &self.relay_terminal.dfq
    }

    /// Tear the relay down once: stop workers, detach the relay terminal,
    /// and notify whichever sides did not initiate the end.
    fn teardown(&self, err: Option<Error>, notify_origin: bool, notify_relay: bool) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        ACTIVE_EXPAND_OPS.fetch_sub(1, Ordering::SeqCst);
        self.cancel.cancel();
        self.relay_terminal.mark_abandoned();
        self.origin_dfq.close();
        self.relay_terminal.dfq.close();

        if notify_relay {
            // The stub is not a real terminal, so the wire-level end to the
            // destination is sent here.
            let end = TerminalMsg::new(
                TERMINAL_SCOPE_OP_ID,
                MsgType::TerminalEnd,
                flotilla_terminal::terminal::encode_end_err(&err),
            );
            self.relay_terminal.crane.submit_payload(
                self.relay_terminal.id,
                TerminalMsg::encode_sequence(&[end]),
            );
            self.relay_terminal.crane.flush_wire();
        }
        self.relay_terminal
            .crane
            .abandon_terminal(self.relay_terminal.id, None);

        if notify_origin {
            let terminal = self.terminal.clone();
            let op_id = self.id;
            let err = err.clone();
            tokio::spawn(async move {
                terminal.op_end(op_id, err).await;
            });
        }
    }
}

impl Operation for ExpandOp {
    fn id(&self) -> u32 {
        self.id
    }

    fn type_name(&self) -> &'static str {
        EXPAND_OP_TYPE
    }

    fn deliver(&self, data: Vec<u8>) -> Result<()> {
        self.origin_dfq.deliver(data)
    }

    fn deliver_space_report(&self, credits: u32) -> Result<()> {
        self.origin_dfq.handle_space_report(credits);
        Ok(())
    }

    fn end(&self, err: Option<Error>) {
        // The origin side ended the op; pass the end on to the destination.
        self.teardown(err, false, true);
    }
}

impl ExpansionRelayTerminal {
    fn mark_abandoned(&self) -> bool {
        self.abandoned.swap(true, Ordering::SeqCst)
    }
}

impl TerminalHandle for ExpansionRelayTerminal {
    fn id(&self) -> u32 {
        self.id
    }

    fn deliver(&self, payload: Vec<u8>) -> Result<()> {
        if self.abandoned.load(Ordering::SeqCst) {
            return Ok(());
        }

        // Terminal-scoped control addressed to the relay stub itself.
        if let Ok(msgs) = TerminalMsg::parse_sequence(&payload) {
            if let [only] = msgs.as_slice() {
                if only.op_id == TERMINAL_SCOPE_OP_ID {
                    match only.msg_type {
                        MsgType::SpaceReport => {
                            self.dfq.handle_space_report(only.credits()?);
                            return Ok(());
                        }
                        MsgType::TerminalEnd => {
                            // Destination EOF: drain the backward direction
                            // before tearing the relay down.
                            let err = decode_end_err(&only.body);
                            *self.peer_end.lock() = Some(err);
                            self.dfq.handle_eof();
                            return Ok(());
                        }
                        _ => {}
                    }
                }
            }
        }

        self.dfq.deliver(payload)
    }

    fn abandon(&self, err: Option<Error>) {
        if self.mark_abandoned() {
            return;
        }
        let op = self.op.lock().clone();
        if let Some(op) = op {
            let err = err.map(|err| err.wrap("relay failed"));
            op.teardown(err, true, false);
        }
    }
}

/// Client side of an expansion: a full terminal tunnelled through the
/// expand op toward the destination hub.
///
/// The expanded terminal's own flow queue pairs with the relay's
/// origin-side queue; its data units and credit grants travel as
/// op-scoped messages on the hosting terminal. End-to-end, only the
/// session spans the relay.
pub struct ExpandClientOp {
    id: u32,
    terminal: Arc<dyn OpTerminal>,
    expanded: parking_lot::Mutex<Option<Arc<Terminal>>>,
    ended: AtomicBool,
    cancel: CancellationToken,
}

enum TunnelItem {
    Data(Vec<u8>),
    Report(u32),
}

/// Upstream of the expanded terminal: payloads and credit grants become
/// op messages instead of crane frames.
struct TunnelUpstream {
    tx: mpsc::UnboundedSender<TunnelItem>,
}

impl TerminalUpstream for TunnelUpstream {
    fn submit(&self, _terminal_id: u32, payload: Vec<u8>) {
        let _ = self.tx.send(TunnelItem::Data(payload));
    }

    fn submit_report(&self, _terminal_id: u32, credits: u32) {
        let _ = self.tx.send(TunnelItem::Report(credits));
    }
}

impl ExpandClientOp {
    /// Expand through `terminal` to `dst_hub`, returning the client op and
    /// the tunnelled terminal connected to the destination.
    pub async fn start(
        terminal: Arc<dyn OpTerminal>,
        dst_hub: &Hub,
        opts: TerminalOpts,
    ) -> Result<(Arc<Self>, Arc<Terminal>)> {
        // End-to-end session against the destination's exchange key.
        let (session, ephemeral) = match dst_hub.exchange_key() {
            Some(key) => {
                let (session, ephemeral) = Session::initiate(&key, E2E_SESSION_CONTEXT)?;
                (Some(session), Some(ephemeral))
            }
            None => (None, None),
        };

        let cancel = terminal.cancellation().child_token();
        let op_id = terminal.allocate_op_id();

        let op = Arc::new(Self {
            id: op_id,
            terminal: terminal.clone(),
            expanded: parking_lot::Mutex::new(None),
            ended: AtomicBool::new(false),
            cancel: cancel.clone(),
        });

        let request = ExpandRequest { dst: dst_hub.id, opts, ephemeral };
        let data = postcard::to_allocvec(&request)
            .map_err(|err| Error::Internal(format!("failed to encode expand request: {err}")))?;
        terminal.op_init(op.clone(), data).await?;

        // The tunnelled terminal; its init packet is reconstructed by the
        // relay from the expand request, so the local copy is dropped.
        let (tunnel_tx, tunnel_rx) = mpsc::unbounded_channel::<TunnelItem>();
        let (expanded, _init) = Terminal::new_local(
            flotilla_core::frame::FIRST_DATA_TERMINAL_ID,
            format!("{}>exp", terminal.fmt_id()),
            opts,
            session,
            None,
            TerminalPermission::empty(),
            Arc::new(TunnelUpstream { tx: tunnel_tx }),
            &cancel,
        )?;
        *op.expanded.lock() = Some(expanded.clone());
        // The relay may have rejected the op before the terminal existed.
        if op.ended.load(Ordering::SeqCst) {
            expanded.abandon(Some(Error::Stopping("expansion already ended".to_string())));
        }

        tokio::spawn(op.clone().outgoing_pump(tunnel_rx));

        Ok((op, expanded))
    }

    /// Close the expansion: ends the op and abandons the tunnelled terminal.
    pub async fn close(&self) {
        self.terminal.op_end(self.id, None).await;
    }

    /// Tunnel submissions become op messages on the hosting terminal.
    async fn outgoing_pump(self: Arc<Self>, mut tunnel_rx: mpsc::UnboundedReceiver<TunnelItem>) {
        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => return,
                item = tunnel_rx.recv() => match item {
                    Some(item) => item,
                    None => return,
                },
            };
            let result = match item {
                TunnelItem::Data(payload) => self.terminal.op_send(self.id, payload).await,
                TunnelItem::Report(credits) => {
                    self.terminal.op_space_report(self.id, credits).await
                }
            };
            if let Err(err) = result {
                if !err.is_stopping() {
                    warn!(op = self.id, %err, "expand client send failed");
                }
                self.terminal.op_end(self.id, Some(err)).await;
                return;
            }
        }
    }

    fn expanded(&self) -> Option<Arc<Terminal>> {
        self.expanded.lock().clone()
    }
}

impl Operation for ExpandClientOp {
    fn id(&self) -> u32 {
        self.id
    }

    fn type_name(&self) -> &'static str {
        EXPAND_OP_TYPE
    }

    fn deliver(&self, data: Vec<u8>) -> Result<()> {
        match self.expanded() {
            Some(expanded) => expanded.deliver(data),
            None => Ok(()),
        }
    }

    fn deliver_space_report(&self, credits: u32) -> Result<()> {
        if let Some(expanded) = self.expanded() {
            expanded.flow_queue().handle_space_report(credits);
        }
        Ok(())
    }

    fn end(&self, err: Option<Error>) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let expanded = self.expanded.lock().take();
        if let Some(expanded) = expanded {
            // Drain what the relay already delivered, then abandon.
            expanded.peer_ended(err);
        }
    }
}
