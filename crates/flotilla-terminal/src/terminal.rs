//! The terminal: an encrypted, message-framed, multi-operation session
//!
//! A terminal rides one [`DuplexFlowQueue`]. Outbound op messages are
//! encoded as a sequence, optionally padded, sealed by the session and
//! flow-controlled as one unit. Terminal-scoped control messages
//! (space reports, terminal end) travel outside the flow queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use flotilla_core::frame::{MsgType, TerminalMsg, TERMINAL_SCOPE_OP_ID};
use flotilla_core::session::Session;
use flotilla_core::varint;
use flotilla_core::{Error, Result};

use crate::flow::{DuplexFlowQueue, FlowSubmission, DEFAULT_QUEUE_SIZE};
use crate::op::{self, OpInitMsg, OpTerminal, Operation, TerminalPermission};

/// First op ID allocated by the terminal initiator; the remote side starts
/// one above and both step by two, so the id spaces never collide.
const FIRST_LOCAL_OP_ID: u32 = 8;
const FIRST_REMOTE_OP_ID: u32 = 9;

/// Options negotiated at terminal creation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalOpts {
    /// Flow-control queue size in messages
    pub queue_size: u32,
    /// Pad outbound payloads to a multiple of this size, 0 disables
    pub padding: u16,
}

impl Default for TerminalOpts {
    fn default() -> Self {
        Self { queue_size: DEFAULT_QUEUE_SIZE, padding: 0 }
    }
}

/// The initial packet sent to the peer when opening a terminal
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TerminalInit {
    /// Negotiated options
    pub opts: TerminalOpts,
    /// Ephemeral key for an end-to-end session, when the initiator wants one
    pub ephemeral: Option<[u8; 32]>,
}

impl TerminalInit {
    /// Encode for the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self)
            .map_err(|err| Error::Internal(format!("failed to encode terminal init: {err}")))
    }

    /// Parse from the wire.
    pub fn parse(data: &[u8]) -> Result<Self> {
        postcard::from_bytes(data)
            .map_err(|err| Error::MalformedData(format!("invalid terminal init: {err}")))
    }
}

/// Where a terminal's wire payloads go
pub trait TerminalUpstream: Send + Sync {
    /// Submit a payload addressed to `terminal_id` on the wire.
    fn submit(&self, terminal_id: u32, payload: Vec<u8>);

    /// Submit a flow-control credit grant for this terminal.
    ///
    /// By default the report travels as a terminal-scoped message on the
    /// wire; tunnelling upstreams (the expand client) reroute it so hop
    /// and end flow control stay separate.
    fn submit_report(&self, terminal_id: u32, credits: u32) {
        let report = TerminalMsg::space_report(TERMINAL_SCOPE_OP_ID, credits);
        self.submit(terminal_id, TerminalMsg::encode_sequence(&[report]));
    }

    /// Ask the wire to push batched frames out now.
    fn flush(&self, terminal_id: u32) {
        let _ = terminal_id;
    }
}

/// The surface a crane needs from anything registered in its terminal table
pub trait TerminalHandle: Send + Sync {
    /// The terminal ID
    fn id(&self) -> u32;

    /// Deliver a payload received from the wire.
    fn deliver(&self, payload: Vec<u8>) -> Result<()>;

    /// Abandon the terminal; delivery becomes a no-op.
    fn abandon(&self, err: Option<Error>);
}

/// A live terminal endpoint
pub struct Terminal {
    id: u32,
    name: String,
    opts: TerminalOpts,
    permissions: TerminalPermission,
    dfq: Arc<DuplexFlowQueue>,
    session: Option<Mutex<Session>>,
    send_lock: tokio::sync::Mutex<()>,
    ops: Mutex<HashMap<u32, Arc<dyn Operation>>>,
    next_op_id: AtomicU32,
    abandoned: AtomicBool,
    /// Set when the peer's terminal end arrives; consumed after draining
    peer_end: Mutex<Option<Option<Error>>>,
    cancel: CancellationToken,
    upstream: Arc<dyn TerminalUpstream>,
    host: Mutex<Option<Arc<dyn std::any::Any + Send + Sync>>>,
}

impl Terminal {
    /// Create the initiating side of a terminal.
    ///
    /// Returns the terminal and the init packet the peer needs for
    /// [`Terminal::new_remote`]. `ephemeral` is included in the init packet
    /// when the caller established an end-to-end session.
    #[allow(clippy::too_many_arguments)]
    pub fn new_local(
        id: u32,
        name: impl Into<String>,
        opts: TerminalOpts,
        session: Option<Session>,
        ephemeral: Option<[u8; 32]>,
        permissions: TerminalPermission,
        upstream: Arc<dyn TerminalUpstream>,
        parent: &CancellationToken,
    ) -> Result<(Arc<Self>, Vec<u8>)> {
        let init = TerminalInit { opts, ephemeral }.encode()?;
        let terminal = Self::new(
            id,
            name.into(),
            opts,
            session,
            permissions,
            upstream,
            parent,
            FIRST_LOCAL_OP_ID,
        );
        Ok((terminal, init))
    }

    /// Create the accepting side of a terminal from parsed init options.
    ///
    /// The caller parses [`TerminalInit`] first, since building the session
    /// may need the embedded ephemeral key.
    pub fn new_remote(
        id: u32,
        name: impl Into<String>,
        opts: TerminalOpts,
        session: Option<Session>,
        permissions: TerminalPermission,
        upstream: Arc<dyn TerminalUpstream>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        Self::new(
            id,
            name.into(),
            opts,
            session,
            permissions,
            upstream,
            parent,
            FIRST_REMOTE_OP_ID,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        id: u32,
        name: String,
        opts: TerminalOpts,
        session: Option<Session>,
        permissions: TerminalPermission,
        upstream: Arc<dyn TerminalUpstream>,
        parent: &CancellationToken,
        first_op_id: u32,
    ) -> Arc<Self> {
        let cancel = parent.child_token();
        let dfq_upstream = upstream.clone();
        let dfq = DuplexFlowQueue::new(
            opts.queue_size,
            cancel.child_token(),
            Box::new(move |submission| match submission {
                FlowSubmission::Data(payload) => dfq_upstream.submit(id, payload),
                FlowSubmission::SpaceReport(credits) => {
                    dfq_upstream.submit_report(id, credits);
                }
            }),
        );

        let terminal = Arc::new(Self {
            id,
            name,
            opts,
            permissions,
            dfq: dfq.clone(),
            session: session.map(Mutex::new),
            send_lock: tokio::sync::Mutex::new(()),
            ops: Mutex::new(HashMap::new()),
            next_op_id: AtomicU32::new(first_op_id),
            abandoned: AtomicBool::new(false),
            peer_end: Mutex::new(None),
            cancel,
            upstream,
            host: Mutex::new(None),
        });

        tokio::spawn(dfq.flow_handler());
        tokio::spawn(terminal.clone().recv_worker());

        terminal
    }

    /// The flow queue, exposed for tests and the crane loader.
    pub fn flow_queue(&self) -> &Arc<DuplexFlowQueue> {
        &self.dfq
    }

    /// Negotiated options.
    pub fn opts(&self) -> TerminalOpts {
        self.opts
    }

    /// Whether the terminal has been abandoned.
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// Attach the hosting component, exposed to operations via
    /// [`OpTerminal::host`].
    pub fn set_host(&self, host: Arc<dyn std::any::Any + Send + Sync>) {
        *self.host.lock() = Some(host);
    }

    /// Encode, pad, seal and flow-control a batch of op messages.
    async fn send_msgs(&self, msgs: &[TerminalMsg]) -> Result<()> {
        if self.is_abandoned() {
            return Err(Error::Stopping(format!("terminal {} abandoned", self.fmt_id())));
        }

        // The lock serializes sealing and queueing so session counters
        // stay aligned with delivery order.
        let _guard = self.send_lock.lock().await;

        let mut payload = TerminalMsg::encode_sequence(msgs);
        if self.opts.padding > 0 {
            pad_sequence(&mut payload, self.opts.padding as usize);
        }
        if let Some(session) = &self.session {
            let sealed = session.lock().seal(&payload, b"")?;
            payload = TerminalMsg::encode_sequence(&[TerminalMsg::new(
                TERMINAL_SCOPE_OP_ID,
                MsgType::Data,
                sealed,
            )]);
        }

        self.dfq.send(payload).await
    }

    async fn recv_worker(self: Arc<Self>) {
        loop {
            let Some(payload) = self.dfq.receive().await else {
                // Inbound stream drained; finish a peer-initiated end now.
                if let Some(err) = self.peer_end.lock().take() {
                    debug!(terminal = %self.fmt_id(), ?err, "peer end drained");
                    self.abandon_with(err, false);
                }
                return;
            };

            let msgs = match self.decode_payload(payload) {
                Ok(msgs) => msgs,
                Err(err) => {
                    warn!(terminal = %self.fmt_id(), %err, "abandoning terminal on bad payload");
                    self.abandon_with(Some(err), true);
                    return;
                }
            };

            for msg in msgs {
                self.dispatch(msg).await;
            }
        }
    }

    /// Turn a delivered wire payload into the plaintext message sequence.
    fn decode_payload(&self, payload: Vec<u8>) -> Result<Vec<TerminalMsg>> {
        match &self.session {
            None => TerminalMsg::parse_sequence(&payload),
            Some(session) => {
                let msgs = TerminalMsg::parse_sequence(&payload)?;
                let [outer] = msgs.as_slice() else {
                    return Err(Error::MalformedData(
                        "sealed payload must carry exactly one message".to_string(),
                    ));
                };
                if outer.op_id != TERMINAL_SCOPE_OP_ID || outer.msg_type != MsgType::Data {
                    return Err(Error::MalformedData("unexpected sealed wrapper".to_string()));
                }
                let plain = session.lock().open(&outer.body, b"")?;
                TerminalMsg::parse_sequence(&plain)
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, msg: TerminalMsg) {
        if self.is_abandoned() {
            return;
        }

        if msg.op_id == TERMINAL_SCOPE_OP_ID {
            match msg.msg_type {
                // Zero-filled padding message, see pad_sequence.
                MsgType::Data => {}
                MsgType::SpaceReport => match msg.credits() {
                    Ok(credits) => self.dfq.handle_space_report(credits),
                    Err(err) => self.abandon_with(Some(err), true),
                },
                MsgType::TerminalEnd => {
                    let err = decode_end_err(&msg.body);
                    debug!(terminal = %self.fmt_id(), ?err, "peer ended terminal");
                    self.peer_ended(err);
                }
                _ => {
                    self.abandon_with(
                        Some(Error::IncorrectUsage(format!(
                            "unexpected terminal-scoped {:?}",
                            msg.msg_type
                        ))),
                        true,
                    );
                }
            }
            return;
        }

        match msg.msg_type {
            MsgType::Init => self.handle_op_init(msg.op_id, msg.body).await,
            MsgType::Data => {
                let op = self.ops.lock().get(&msg.op_id).cloned();
                match op {
                    Some(op) => {
                        if let Err(err) = op.deliver(msg.body) {
                            // Per-op errors are isolated; only this op ends.
                            self.op_end(msg.op_id, Some(err)).await;
                        }
                    }
                    None => {
                        debug!(
                            terminal = %self.fmt_id(),
                            op_id = msg.op_id,
                            "dropping data for unknown op"
                        );
                    }
                }
            }
            MsgType::SpaceReport => {
                let op = self.ops.lock().get(&msg.op_id).cloned();
                if let Some(op) = op {
                    match msg.credits() {
                        Ok(credits) => {
                            if let Err(err) = op.deliver_space_report(credits) {
                                self.op_end(msg.op_id, Some(err)).await;
                            }
                        }
                        Err(err) => self.op_end(msg.op_id, Some(err)).await,
                    }
                }
            }
            MsgType::End => {
                let err = decode_end_err(&msg.body);
                if let Some(op) = self.ops.lock().remove(&msg.op_id) {
                    op.end(err);
                }
            }
            MsgType::TerminalEnd => {
                self.abandon_with(
                    Some(Error::IncorrectUsage("op-scoped terminal end".to_string())),
                    true,
                );
            }
        }
    }

    async fn handle_op_init(self: &Arc<Self>, op_id: u32, body: Vec<u8>) {
        let result = postcard::from_bytes::<OpInitMsg>(&body)
            .map_err(|err| Error::MalformedData(format!("invalid op init: {err}")))
            .and_then(|init| {
                if self.ops.lock().contains_key(&op_id) {
                    return Err(Error::IncorrectUsage(format!("op id {op_id} already in use")));
                }
                op::start_op(
                    self.clone() as Arc<dyn OpTerminal>,
                    &init.op_type,
                    op_id,
                    init.data,
                )
            });

        match result {
            Ok(op) => {
                debug!(terminal = %self.fmt_id(), op_id, op_type = op.type_name(), "op started");
                self.ops.lock().insert(op_id, op);
            }
            Err(err) => {
                debug!(terminal = %self.fmt_id(), op_id, %err, "rejecting op init");
                let end = TerminalMsg::new(op_id, MsgType::End, encode_end_err(&Some(err)));
                if let Err(send_err) = self.send_msgs(&[end]).await {
                    warn!(terminal = %self.fmt_id(), %send_err, "failed to reject op init");
                }
            }
        }
    }

    /// The peer ended the terminal: enter the draining state, keep
    /// delivering what is already buffered, and abandon once the inbound
    /// stream is drained.
    pub fn peer_ended(&self, err: Option<Error>) {
        if self.is_abandoned() {
            return;
        }
        *self.peer_end.lock() = Some(err);
        self.dfq.handle_eof();
    }

    /// Abandon the terminal: end all live operations, optionally notify the
    /// peer, and stop the workers. Idempotent.
    fn abandon_with(&self, err: Option<Error>, notify_peer: bool) {
        if self.abandoned.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(terminal = %self.fmt_id(), ?err, "terminal abandoned");

        // Local end: outbound is forbidden from here on.
        self.dfq.start_draining();

        let ops: Vec<Arc<dyn Operation>> = self.ops.lock().drain().map(|(_, op)| op).collect();
        for op in ops {
            op.end(err.clone());
        }

        if notify_peer {
            let msg = TerminalMsg::new(
                TERMINAL_SCOPE_OP_ID,
                MsgType::TerminalEnd,
                encode_end_err(&err),
            );
            self.upstream.submit(self.id, TerminalMsg::encode_sequence(&[msg]));
            self.upstream.flush(self.id);
        }

        self.cancel.cancel();
        self.dfq.close();
    }
}

impl TerminalHandle for Terminal {
    fn id(&self) -> u32 {
        self.id
    }

    fn deliver(&self, payload: Vec<u8>) -> Result<()> {
        if self.is_abandoned() {
            return Ok(());
        }

        // Terminal-scoped control messages bypass the flow queue.
        if let Ok(msgs) = TerminalMsg::parse_sequence(&payload) {
            if let [only] = msgs.as_slice() {
                if only.op_id == TERMINAL_SCOPE_OP_ID {
                    match only.msg_type {
                        MsgType::SpaceReport => {
                            self.dfq.handle_space_report(only.credits()?);
                            return Ok(());
                        }
                        MsgType::TerminalEnd => {
                            let err = decode_end_err(&only.body);
                            self.peer_ended(err);
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
        self.abandon_with(err, true);
    }
}

#[async_trait]
impl OpTerminal for Terminal {
    fn terminal_id(&self) -> u32 {
        self.id
    }

    fn fmt_id(&self) -> String {
        format!("{}#{}", self.name, self.id)
    }

    fn permissions(&self) -> TerminalPermission {
        self.permissions
    }

    fn host(&self) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        self.host.lock().clone()
    }

    fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn allocate_op_id(&self) -> u32 {
        self.next_op_id.fetch_add(2, Ordering::SeqCst)
    }

    async fn op_init(&self, op: Arc<dyn Operation>, data: Vec<u8>) -> Result<()> {
        if self.is_abandoned() {
            return Err(Error::Stopping(format!("terminal {} abandoned", self.fmt_id())));
        }

        let op_id = op.id();
        let init = OpInitMsg { op_type: op.type_name().to_string(), data };
        let body = postcard::to_allocvec(&init)
            .map_err(|err| Error::Internal(format!("failed to encode op init: {err}")))?;

        self.ops.lock().insert(op_id, op);
        let result = self
            .send_msgs(&[TerminalMsg::new(op_id, MsgType::Init, body)])
            .await;
        if result.is_err() {
            self.ops.lock().remove(&op_id);
        }
        result
    }

    async fn op_send(&self, op_id: u32, data: Vec<u8>) -> Result<()> {
        self.send_msgs(&[TerminalMsg::new(op_id, MsgType::Data, data)]).await
    }

    async fn op_space_report(&self, op_id: u32, credits: u32) -> Result<()> {
        self.send_msgs(&[TerminalMsg::space_report(op_id, credits)]).await
    }

    async fn op_end(&self, op_id: u32, err: Option<Error>) {
        let Some(op) = self.ops.lock().remove(&op_id) else {
            return;
        };

        let msg = TerminalMsg::new(op_id, MsgType::End, encode_end_err(&err));
        if let Err(send_err) = self.send_msgs(&[msg]).await {
            if !send_err.is_stopping() {
                warn!(terminal = %self.fmt_id(), op_id, %send_err, "failed to send op end");
            }
        }
        op.end(err);
    }

    async fn flush(&self) {
        self.dfq.flush();
        self.upstream.flush(self.id);
    }
}

/// Encode an optional end error for the wire.
pub fn encode_end_err(err: &Option<Error>) -> Vec<u8> {
    postcard::to_allocvec(err).unwrap_or_default()
}

/// Decode an optional end error; unreadable bodies read as no error.
pub fn decode_end_err(body: &[u8]) -> Option<Error> {
    postcard::from_bytes(body).unwrap_or(None)
}

/// Pad an encoded message sequence to a multiple of `unit` by appending a
/// zero-filled terminal-scoped data message, which dispatch skips.
fn pad_sequence(payload: &mut Vec<u8>, unit: usize) {
    let len = payload.len();
    if len % unit == 0 {
        return;
    }
    let mut need = unit - (len % unit);
    // A padding message occupies at least 6 bytes.
    while need < 6 {
        need += unit;
    }
    for header in 6..=5 + varint::MAX_LEN {
        let Some(body_len) = need.checked_sub(header) else { break };
        if 5 + varint::encoded_len(body_len as u64) == header {
            let msg = TerminalMsg::new(TERMINAL_SCOPE_OP_ID, MsgType::Data, vec![0; body_len]);
            let mut buf = bytes::BytesMut::new();
            msg.encode(&mut buf);
            payload.extend_from_slice(&buf);
            return;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex as PMutex;

    #[test]
    fn padding_reaches_multiple() {
        for (len, unit) in [(1usize, 8usize), (7, 8), (8, 8), (13, 16), (100, 128), (130, 128)] {
            let mut payload = vec![0xaa; len];
            pad_sequence(&mut payload, unit);
            assert_eq!(payload.len() % unit, 0, "len {len} unit {unit}");
        }
    }

    #[test]
    fn padded_sequence_still_parses() {
        let msgs = vec![TerminalMsg::new(8, MsgType::Data, b"content".to_vec())];
        let mut payload = TerminalMsg::encode_sequence(&msgs);
        pad_sequence(&mut payload, 64);

        let parsed = TerminalMsg::parse_sequence(&payload).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], msgs[0]);
        assert_eq!(parsed[1].op_id, TERMINAL_SCOPE_OP_ID);
        assert_eq!(parsed[1].msg_type, MsgType::Data);
    }

    #[test]
    fn end_err_roundtrip() {
        let err = Some(Error::Integrity("nonce mismatch".to_string()));
        assert_eq!(decode_end_err(&encode_end_err(&err)), err);
        assert_eq!(decode_end_err(&encode_end_err(&None)), None);
    }

    /// Upstream that forwards payloads into a late-bound peer terminal.
    pub(crate) struct TestWire {
        peer: PMutex<Option<Arc<Terminal>>>,
    }

    impl TestWire {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self { peer: PMutex::new(None) })
        }

        pub(crate) fn connect(&self, peer: Arc<Terminal>) {
            *self.peer.lock() = Some(peer);
        }
    }

    impl TerminalUpstream for TestWire {
        fn submit(&self, _terminal_id: u32, payload: Vec<u8>) {
            let peer = self.peer.lock().clone();
            if let Some(peer) = peer {
                if let Err(err) = peer.deliver(payload) {
                    peer.abandon(Some(err));
                }
            }
        }
    }

    /// Build a connected local/remote terminal pair for op tests.
    pub(crate) fn terminal_pair(
        opts: TerminalOpts,
        encrypted: bool,
        local_permissions: TerminalPermission,
        remote_permissions: TerminalPermission,
    ) -> (Arc<Terminal>, Arc<Terminal>) {
        let exchange = flotilla_core::session::StaticExchangeKey::from_seed(&[9; 32]);
        let (local_session, ephemeral) = if encrypted {
            let (session, ephemeral) =
                Session::initiate(&exchange.public_bytes(), b"test").unwrap();
            (Some(session), Some(ephemeral))
        } else {
            (None, None)
        };

        let wire1 = TestWire::new();
        let wire2 = TestWire::new();
        let cancel = CancellationToken::new();

        let (t1, init) = Terminal::new_local(
            4,
            "t1",
            opts,
            local_session,
            ephemeral,
            local_permissions,
            wire1.clone(),
            &cancel,
        )
        .unwrap();

        let init = TerminalInit::parse(&init).unwrap();
        let remote_session = init
            .ephemeral
            .map(|eph| Session::accept(&exchange, &eph, b"test").unwrap());
        let t2 = Terminal::new_remote(
            4,
            "t2",
            init.opts,
            remote_session,
            remote_permissions,
            wire2.clone(),
            &cancel,
        );

        wire1.connect(t2.clone());
        wire2.connect(t1.clone());
        (t1, t2)
    }

    struct SinkOp {
        id: u32,
        received: Arc<PMutex<Vec<Vec<u8>>>>,
        ended: Arc<PMutex<Option<Option<Error>>>>,
    }

    impl Operation for SinkOp {
        fn id(&self) -> u32 {
            self.id
        }
        fn type_name(&self) -> &'static str {
            "sink"
        }
        fn deliver(&self, data: Vec<u8>) -> Result<()> {
            self.received.lock().push(data);
            Ok(())
        }
        fn end(&self, err: Option<Error>) {
            *self.ended.lock() = Some(err);
        }
    }

    fn register_sink(received: Arc<PMutex<Vec<Vec<u8>>>>) {
        op::register_op_type(op::OpParams {
            type_name: "sink",
            requires: TerminalPermission::empty(),
            start: Arc::new(move |_, op_id, first| {
                let op = SinkOp {
                    id: op_id,
                    received: received.clone(),
                    ended: Arc::new(PMutex::new(None)),
                };
                op.received.lock().push(first);
                Ok(Arc::new(op) as Arc<dyn Operation>)
            }),
        });
    }

    async fn streaming_roundtrip(encrypted: bool, padding: u16) {
        let received = Arc::new(PMutex::new(Vec::new()));
        register_sink(received.clone());

        let opts = TerminalOpts { queue_size: 16, padding };
        let (t1, _t2) = terminal_pair(
            opts,
            encrypted,
            TerminalPermission::empty(),
            TerminalPermission::empty(),
        );

        let client = SinkOp {
            id: t1.allocate_op_id(),
            received: Arc::new(PMutex::new(Vec::new())),
            ended: Arc::new(PMutex::new(None)),
        };
        let op_id = client.id;
        t1.op_init(Arc::new(client), b"first".to_vec()).await.unwrap();

        for round in 0..100u32 {
            t1.op_send(op_id, round.to_be_bytes().to_vec()).await.unwrap();
        }
        t1.flush().await;

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        let got = received.lock().clone();
        assert_eq!(got.len(), 101);
        assert_eq!(got[0], b"first");
        for (i, data) in got[1..].iter().enumerate() {
            assert_eq!(data, &(i as u32).to_be_bytes());
        }

        // Flow-control invariant across the pair.
        assert_eq!(t1.flow_queue().send_space(), _t2.flow_queue().reported_space());
    }

    #[tokio::test]
    async fn plain_streaming() {
        streaming_roundtrip(false, 0).await;
    }

    #[tokio::test]
    async fn encrypted_streaming_with_padding() {
        streaming_roundtrip(true, 32).await;
    }

    #[tokio::test]
    async fn permission_denied_ends_op() {
        op::register_op_type(op::OpParams {
            type_name: "privileged",
            requires: TerminalPermission::IS_CRANE_CONTROLLER,
            start: Arc::new(|_, op_id, _| {
                Ok(Arc::new(SinkOp {
                    id: op_id,
                    received: Arc::new(PMutex::new(Vec::new())),
                    ended: Arc::new(PMutex::new(None)),
                }) as Arc<dyn Operation>)
            }),
        });

        let (t1, _t2) = terminal_pair(
            TerminalOpts::default(),
            false,
            TerminalPermission::empty(),
            TerminalPermission::empty(),
        );

        struct Probe {
            id: u32,
            ended: Arc<PMutex<Option<Option<Error>>>>,
        }
        impl Operation for Probe {
            fn id(&self) -> u32 {
                self.id
            }
            fn type_name(&self) -> &'static str {
                "privileged"
            }
            fn deliver(&self, _data: Vec<u8>) -> Result<()> {
                Ok(())
            }
            fn end(&self, err: Option<Error>) {
                *self.ended.lock() = Some(err);
            }
        }

        let ended = Arc::new(PMutex::new(None));
        let probe = Probe { id: t1.allocate_op_id(), ended: ended.clone() };
        t1.op_init(Arc::new(probe), vec![]).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let outcome = ended.lock().clone().expect("op should have ended");
        assert!(matches!(outcome, Some(Error::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn abandon_ends_ops_on_both_sides() {
        let received = Arc::new(PMutex::new(Vec::new()));
        register_sink(received.clone());

        let (t1, t2) = terminal_pair(
            TerminalOpts::default(),
            false,
            TerminalPermission::empty(),
            TerminalPermission::empty(),
        );

        let ended = Arc::new(PMutex::new(None));
        let client = SinkOp {
            id: t1.allocate_op_id(),
            received: Arc::new(PMutex::new(Vec::new())),
            ended: ended.clone(),
        };
        t1.op_init(Arc::new(client), vec![]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        t1.abandon(Some(Error::ShipSunk("test teardown".to_string())));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert!(t1.is_abandoned());
        assert!(t2.is_abandoned());
        assert!(ended.lock().is_some());

        // Idempotent.
        t1.abandon(None);
    }
}
