//! The crane: owns one ship and multiplexes terminals over it
//!
//! Lifecycle: `Initializing → Starting → Running → Stopping → Stopped`.
//! The initiating side performs the session handshake, creates the
//! controller terminal (ID 0) and sends its init packet as the first
//! frame. Two workers drive the wire: the unloader reads frames off the
//! ship and routes them to terminals, the loader batches and pads
//! outbound frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flotilla_core::frame::{
    CraneFrame, CraneFrameCodec, MsgType, TerminalMsg, CONTROLLER_TERMINAL_ID,
    FIRST_DATA_TERMINAL_ID, HANDSHAKE_TERMINAL_ID, TERMINAL_SCOPE_OP_ID,
};
use flotilla_core::session::{accept_shared, initiate_shared, Session};
use flotilla_core::{Error, Result};
use flotilla_hub::{Hub, Identity};
use flotilla_terminal::op::TerminalPermission;
use flotilla_terminal::terminal::{
    encode_end_err, Terminal, TerminalHandle, TerminalInit, TerminalOpts, TerminalUpstream,
};

use crate::gossip::GossipContext;
use crate::op_expand::E2E_SESSION_CONTEXT;
use crate::registry;
use crate::ship::Ship;

/// Crane configuration
#[derive(Clone)]
pub struct CraneOpts {
    /// Whether the local hub is public; grants expand permission
    pub public_hub: bool,
    /// Maximum number of live terminals
    pub max_terminals: usize,
    /// Options for terminals this crane creates
    pub terminal_opts: TerminalOpts,
    /// How long the loader waits for more frames before writing a small load
    pub batch_max_wait: Duration,
    /// Gossip import context, when this crane relays hub records
    pub gossip: Option<Arc<GossipContext>>,
}

impl Default for CraneOpts {
    fn default() -> Self {
        Self {
            public_hub: false,
            max_terminals: 64,
            terminal_opts: TerminalOpts::default(),
            batch_max_wait: Duration::from_millis(10),
            gossip: None,
        }
    }
}

/// Crane lifecycle states
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CraneState {
    /// Created, not yet started
    Initializing,
    /// Handshake and controller setup in progress
    Starting,
    /// Workers running, terminals usable
    Running,
    /// Teardown in progress
    Stopping,
    /// Fully stopped; terminal state is final
    Stopped,
}

enum LoaderCmd {
    Frame(CraneFrame),
    Flush,
    Drain(oneshot::Sender<()>),
}

/// A crane multiplexing terminals over one ship
pub struct Crane {
    id: String,
    ship: Arc<dyn Ship>,
    /// Whether we initiated the underlying connection
    mine: bool,
    opts: CraneOpts,
    identity: Option<Identity>,
    connected_hub: Mutex<Option<Hub>>,
    shared_secret: Mutex<Option<[u8; 32]>>,
    state: Mutex<CraneState>,
    terminals: Mutex<HashMap<u32, Arc<dyn TerminalHandle>>>,
    next_terminal_id: AtomicU32,
    controller: Mutex<Option<Arc<Terminal>>>,
    loader_tx: mpsc::UnboundedSender<LoaderCmd>,
    loader_rx: Mutex<Option<mpsc::UnboundedReceiver<LoaderCmd>>>,
    read_buf: Mutex<BytesMut>,
    cancel: CancellationToken,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    stopping: AtomicBool,
}

impl Crane {
    /// Create a crane on `ship`.
    ///
    /// The initiating side passes the hub it is connecting to; the
    /// accepting side passes its identity.
    pub fn new(
        ship: Arc<dyn Ship>,
        connected_hub: Option<Hub>,
        identity: Option<Identity>,
        opts: CraneOpts,
    ) -> Arc<Self> {
        let mine = ship.is_mine();
        let id = hex::encode(rand::random::<[u8; 4]>());
        let (loader_tx, loader_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            id,
            ship,
            mine,
            opts,
            identity,
            connected_hub: Mutex::new(connected_hub),
            shared_secret: Mutex::new(None),
            state: Mutex::new(CraneState::Initializing),
            terminals: Mutex::new(HashMap::new()),
            next_terminal_id: AtomicU32::new(if mine {
                FIRST_DATA_TERMINAL_ID
            } else {
                FIRST_DATA_TERMINAL_ID + 1
            }),
            controller: Mutex::new(None),
            loader_tx,
            loader_rx: Mutex::new(Some(loader_rx)),
            read_buf: Mutex::new(BytesMut::new()),
            cancel: CancellationToken::new(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
        })
    }

    /// The crane's random short ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether we initiated the underlying connection.
    pub fn is_mine(&self) -> bool {
        self.mine
    }

    /// Whether the local hub is public.
    pub fn is_public_hub(&self) -> bool {
        self.opts.public_hub
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CraneState {
        *self.state.lock()
    }

    /// Whether teardown has begun.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// The hub this crane is connected to, if known.
    pub fn connected_hub(&self) -> Option<Hub> {
        self.connected_hub.lock().clone()
    }

    /// Set or replace the connected hub.
    pub fn set_connected_hub(&self, hub: Hub) {
        *self.connected_hub.lock() = Some(hub);
    }

    /// Mark the connected hub's advertised IPs as verified.
    pub fn mark_hub_verified(&self) {
        if let Some(hub) = self.connected_hub.lock().as_mut() {
            hub.verified_ips = true;
        }
    }

    /// The local identity, on the accepting side.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// The controller terminal; present from `Running` on.
    pub fn controller(&self) -> Option<Arc<Terminal>> {
        self.controller.lock().clone()
    }

    /// The gossip import context, when configured.
    pub fn gossip_context(&self) -> Option<Arc<GossipContext>> {
        self.opts.gossip.clone()
    }

    /// Bytes read off the ship.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::SeqCst)
    }

    /// Bytes written to the ship.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::SeqCst)
    }

    /// Number of live terminals, including the controller.
    pub fn terminal_count(&self) -> usize {
        self.terminals.lock().len()
    }

    /// Allocate a fresh terminal ID with this side's parity.
    pub fn allocate_terminal_id(&self) -> u32 {
        self.next_terminal_id.fetch_add(2, Ordering::SeqCst)
    }

    /// Start the crane: handshake, controller terminal, workers.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        *self.state.lock() = CraneState::Starting;

        match self.start_inner().await {
            Ok(()) => {
                *self.state.lock() = CraneState::Running;
                info!(crane = %self.id, mine = self.mine, "crane running");
                registry::notify_update(self);
                Ok(())
            }
            Err(err) => {
                warn!(crane = %self.id, %err, "crane start failed");
                self.stop(Some(err.clone())).await;
                Err(err)
            }
        }
    }

    async fn start_inner(self: &Arc<Self>) -> Result<()> {
        // 1. Session handshake, unless the transport is already encrypted.
        if !self.ship.is_secure() {
            if self.mine {
                let hub = self.connected_hub().ok_or_else(|| {
                    Error::Internal("connecting out without a connected hub".to_string())
                })?;
                let their_key = hub.exchange_key().ok_or_else(|| {
                    Error::Internal(format!("{hub} has no exchange key"))
                })?;
                let (shared, ephemeral) = initiate_shared(&their_key);
                *self.shared_secret.lock() = Some(shared);
                self.submit_frame(CraneFrame::new(HANDSHAKE_TERMINAL_ID, ephemeral.to_vec()));
            } else {
                let identity = self.identity.clone().ok_or_else(|| {
                    Error::Internal("accepting side without an identity".to_string())
                })?;
                let frame = self.read_frame().await?;
                if frame.terminal_id != HANDSHAKE_TERMINAL_ID {
                    return Err(Error::MalformedData(format!(
                        "expected handshake frame, got terminal {}",
                        frame.terminal_id
                    )));
                }
                let ephemeral: [u8; 32] = frame.payload.try_into().map_err(|_| {
                    Error::MalformedData("handshake key must be 32 bytes".to_string())
                })?;
                *self.shared_secret.lock() =
                    Some(accept_shared(identity.exchange_key(), &ephemeral));
            }
        }

        // 2. Controller terminal (ID 0), created once and never re-bound.
        if self.mine {
            let session = self.terminal_session(CONTROLLER_TERMINAL_ID)?;
            let (controller, init) = Terminal::new_local(
                CONTROLLER_TERMINAL_ID,
                self.id.clone(),
                self.opts.terminal_opts,
                session,
                None,
                self.controller_permissions(),
                self.clone() as Arc<dyn TerminalUpstream>,
                &self.cancel,
            )?;
            controller.set_host(self.clone());
            self.terminals
                .lock()
                .insert(CONTROLLER_TERMINAL_ID, controller.clone());
            *self.controller.lock() = Some(controller);
            self.submit_frame(CraneFrame::new(CONTROLLER_TERMINAL_ID, init));
            self.flush_wire();
        } else {
            let frame = self.read_frame().await?;
            if frame.terminal_id != CONTROLLER_TERMINAL_ID {
                return Err(Error::MalformedData(format!(
                    "expected controller init, got terminal {}",
                    frame.terminal_id
                )));
            }
            let init = TerminalInit::parse(&frame.payload)?;
            let session = self.terminal_session(CONTROLLER_TERMINAL_ID)?;
            let controller = Terminal::new_remote(
                CONTROLLER_TERMINAL_ID,
                self.id.clone(),
                init.opts,
                session,
                self.controller_permissions(),
                self.clone() as Arc<dyn TerminalUpstream>,
                &self.cancel,
            );
            controller.set_host(self.clone());
            self.terminals
                .lock()
                .insert(CONTROLLER_TERMINAL_ID, controller.clone());
            *self.controller.lock() = Some(controller);
        }

        // 3. Long-lived workers.
        tokio::spawn(self.clone().unloader());
        tokio::spawn(self.clone().loader());
        Ok(())
    }

    fn controller_permissions(&self) -> TerminalPermission {
        let mut permissions = TerminalPermission::IS_CRANE_CONTROLLER;
        if self.opts.public_hub {
            permissions |= TerminalPermission::MAY_EXPAND;
        }
        permissions
    }

    fn data_permissions(&self) -> TerminalPermission {
        if self.opts.public_hub {
            TerminalPermission::MAY_EXPAND
        } else {
            TerminalPermission::empty()
        }
    }

    /// Derive the per-terminal session from the crane handshake secret.
    fn terminal_session(&self, terminal_id: u32) -> Result<Option<Session>> {
        let Some(shared) = *self.shared_secret.lock() else {
            return Ok(None);
        };
        let context = format!("terminal {terminal_id}");
        Session::from_shared(&shared, self.mine, context.as_bytes()).map(Some)
    }

    /// Read one frame off the ship, used during startup before the
    /// unloader owns the read side.
    async fn read_frame(&self) -> Result<CraneFrame> {
        let mut codec = CraneFrameCodec;
        loop {
            {
                let mut buf = self.read_buf.lock();
                while let Some(frame) = codec.decode(&mut buf)? {
                    if !frame.is_padding() {
                        return Ok(frame);
                    }
                }
            }

            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(Error::Stopping(format!("crane {} stopping", self.id)));
                }
                result = self.ship.unload() => result?,
            };
            self.bytes_in.fetch_add(chunk.len() as u64, Ordering::SeqCst);
            self.read_buf.lock().extend_from_slice(&chunk);
        }
    }

    fn submit_frame(&self, frame: CraneFrame) {
        let _ = self.loader_tx.send(LoaderCmd::Frame(frame));
    }

    /// Submit a terminal payload onto the wire.
    pub fn submit_payload(&self, terminal_id: u32, payload: Vec<u8>) {
        self.submit_frame(CraneFrame::new(terminal_id, payload));
    }

    /// Ask the loader to write batched frames now.
    pub fn flush_wire(&self) {
        let _ = self.loader_tx.send(LoaderCmd::Flush);
    }

    /// Register a terminal handle without sending an init packet.
    ///
    /// Both sides must agree on the ID out of band; used by tests and by
    /// components that do their own terminal setup.
    pub fn register_terminal(&self, handle: Arc<dyn TerminalHandle>) {
        self.terminals.lock().insert(handle.id(), handle);
    }

    /// Register a locally built terminal handle and send its init packet
    /// to the peer. Used by the expand operation.
    pub fn establish_new_terminal(
        &self,
        handle: Arc<dyn TerminalHandle>,
        init_data: Vec<u8>,
    ) -> Result<()> {
        if self.is_stopping() {
            return Err(Error::Stopping(format!("crane {} stopping", self.id)));
        }
        let id = handle.id();
        self.terminals.lock().insert(id, handle);
        self.submit_payload(id, init_data);
        self.flush_wire();
        debug!(crane = %self.id, terminal = id, "established new terminal");
        Ok(())
    }

    /// Remove a terminal and abandon it.
    pub fn abandon_terminal(&self, terminal_id: u32, err: Option<Error>) {
        let handle = self.terminals.lock().remove(&terminal_id);
        if let Some(handle) = handle {
            handle.abandon(err);
        }
    }

    async fn unloader(self: Arc<Self>) {
        let mut codec = CraneFrameCodec;
        loop {
            loop {
                let decoded = {
                    let mut buf = self.read_buf.lock();
                    codec.decode(&mut buf)
                };
                match decoded {
                    Ok(Some(frame)) => self.route_frame(frame),
                    Ok(None) => break,
                    Err(err) => {
                        self.die(err.wrap("unloader")).await;
                        return;
                    }
                }
            }

            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = self.ship.unload() => match result {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        self.die(err).await;
                        return;
                    }
                },
            };
            self.bytes_in.fetch_add(chunk.len() as u64, Ordering::SeqCst);
            self.read_buf.lock().extend_from_slice(&chunk);
        }
    }

    fn route_frame(self: &Arc<Self>, frame: CraneFrame) {
        if frame.is_padding() || frame.terminal_id == HANDSHAKE_TERMINAL_ID {
            return;
        }

        let handle = self.terminals.lock().get(&frame.terminal_id).cloned();
        match handle {
            Some(handle) => {
                if let Err(err) = handle.deliver(frame.payload) {
                    warn!(
                        crane = %self.id,
                        terminal = frame.terminal_id,
                        %err,
                        "terminal rejected delivery"
                    );
                    self.abandon_terminal(frame.terminal_id, Some(err));
                }
            }
            None => self.accept_remote_terminal(frame),
        }
    }

    /// A frame for an unknown terminal: if it parses as an init and we have
    /// capacity, create the remote terminal; otherwise drop it.
    fn accept_remote_terminal(self: &Arc<Self>, frame: CraneFrame) {
        if frame.terminal_id < FIRST_DATA_TERMINAL_ID {
            debug!(crane = %self.id, terminal = frame.terminal_id, "dropping reserved-id frame");
            return;
        }
        // Only the peer's ID parity may create terminals here; the
        // initiating side allocates even IDs, the accepting side odd ones.
        let peer_parity = u32::from(self.mine);
        if frame.terminal_id % 2 != peer_parity {
            debug!(
                crane = %self.id,
                terminal = frame.terminal_id,
                "dropping own-parity frame for unknown terminal"
            );
            return;
        }
        let init = match TerminalInit::parse(&frame.payload) {
            Ok(init) if (1..=4096).contains(&init.opts.queue_size) => init,
            _ => {
                debug!(
                    crane = %self.id,
                    terminal = frame.terminal_id,
                    "dropping frame for unknown terminal"
                );
                return;
            }
        };

        if self.terminals.lock().len() >= self.opts.max_terminals {
            let err = Some(Error::TryAgainLater("terminal capacity reached".to_string()));
            let end = TerminalMsg::new(
                TERMINAL_SCOPE_OP_ID,
                MsgType::TerminalEnd,
                encode_end_err(&err),
            );
            self.submit_payload(frame.terminal_id, TerminalMsg::encode_sequence(&[end]));
            return;
        }

        let session = match init.ephemeral {
            // End-to-end session requested by an expanding peer.
            Some(ephemeral) => match self.identity.as_ref() {
                Some(identity) => {
                    match Session::accept(identity.exchange_key(), &ephemeral, E2E_SESSION_CONTEXT)
                    {
                        Ok(session) => Some(session),
                        Err(err) => {
                            warn!(crane = %self.id, %err, "failed to accept terminal session");
                            return;
                        }
                    }
                }
                None => {
                    debug!(crane = %self.id, "dropping e2e terminal init without identity");
                    return;
                }
            },
            None => match self.terminal_session(frame.terminal_id) {
                Ok(session) => session,
                Err(err) => {
                    warn!(crane = %self.id, %err, "failed to derive terminal session");
                    return;
                }
            },
        };

        let terminal = Terminal::new_remote(
            frame.terminal_id,
            self.id.clone(),
            init.opts,
            session,
            self.data_permissions(),
            self.clone() as Arc<dyn TerminalUpstream>,
            &self.cancel,
        );
        terminal.set_host(self.clone());
        self.terminals.lock().insert(frame.terminal_id, terminal);
        debug!(crane = %self.id, terminal = frame.terminal_id, "accepted remote terminal");
    }

    async fn loader(self: Arc<Self>) {
        let mut rx = self
            .loader_rx
            .lock()
            .take()
            .expect("loader started twice");
        let mut codec = CraneFrameCodec;
        let mut batch = BytesMut::new();
        let mut deadline: Option<tokio::time::Instant> = None;

        loop {
            let sleep_to = deadline.unwrap_or_else(tokio::time::Instant::now);

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = self.write_batch(&mut batch).await;
                    return;
                }

                cmd = rx.recv() => {
                    let Some(cmd) = cmd else {
                        let _ = self.write_batch(&mut batch).await;
                        return;
                    };
                    match cmd {
                        LoaderCmd::Frame(frame) => {
                            if let Err(err) = codec.encode(frame, &mut batch) {
                                warn!(crane = %self.id, %err, "dropping oversized frame");
                                continue;
                            }
                            if batch.len() >= self.ship.optimal_min_load_size() {
                                if self.write_or_die(&mut batch).await.is_err() {
                                    return;
                                }
                                deadline = None;
                            } else if deadline.is_none() {
                                deadline = Some(
                                    tokio::time::Instant::now() + self.opts.batch_max_wait,
                                );
                            }
                        }
                        LoaderCmd::Flush => {
                            if self.write_or_die(&mut batch).await.is_err() {
                                return;
                            }
                            deadline = None;
                        }
                        LoaderCmd::Drain(ack) => {
                            let _ = self.write_batch(&mut batch).await;
                            let _ = ack.send(());
                            deadline = None;
                        }
                    }
                }

                _ = tokio::time::sleep_until(sleep_to), if deadline.is_some() => {
                    if self.write_or_die(&mut batch).await.is_err() {
                        return;
                    }
                    deadline = None;
                }
            }
        }
    }

    async fn write_or_die(self: &Arc<Self>, batch: &mut BytesMut) -> Result<()> {
        match self.write_batch(batch).await {
            Ok(()) => Ok(()),
            Err(err) => {
                // The loader cannot await its own drain; stop in the background.
                let crane = self.clone();
                let err2 = err.clone();
                tokio::spawn(async move { crane.stop(Some(err2)).await });
                Err(err)
            }
        }
    }

    /// Pad the batch to a multiple of the load size and write it out.
    async fn write_batch(&self, batch: &mut BytesMut) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let load_size = self.ship.load_size().max(8);
        let target = batch.len().div_ceil(load_size) * load_size;
        let mut need = target - batch.len();
        if need > 0 && need < 5 {
            // Too small for a padding frame header, spill into another load.
            need += load_size;
        }
        if need > 0 {
            if let Some(pad) = CraneFrame::padding(need) {
                CraneFrameCodec.encode(pad, batch)?;
            }
        }

        while !batch.is_empty() {
            let take = batch.len().min(load_size);
            let chunk = batch.split_to(take);
            self.ship.load(&chunk).await?;
            self.bytes_out.fetch_add(chunk.len() as u64, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn die(self: &Arc<Self>, err: Error) {
        if !self.is_stopping() {
            warn!(crane = %self.id, %err, "crane failed");
        }
        self.stop(Some(err)).await;
    }

    /// Stop the crane: abandon terminals, drain outgoing frames for up to
    /// two seconds, sink the ship. Idempotent.
    pub async fn stop(self: &Arc<Self>, err: Option<Error>) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock() = CraneState::Stopping;
        info!(crane = %self.id, ?err, "crane stopping");

        let terminals: Vec<Arc<dyn TerminalHandle>> =
            self.terminals.lock().drain().map(|(_, t)| t).collect();
        let abandon_err = err.clone().unwrap_or_else(|| {
            Error::Stopping(format!("crane {} stopping", self.id))
        });
        for terminal in terminals {
            terminal.abandon(Some(abandon_err.clone()));
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.loader_tx.send(LoaderCmd::Drain(ack_tx)).is_ok() {
            let _ = tokio::time::timeout(Duration::from_secs(2), ack_rx).await;
        }

        self.cancel.cancel();
        self.ship.sink().await;
        *self.state.lock() = CraneState::Stopped;
        registry::notify_update(self);
    }
}

impl TerminalUpstream for Crane {
    fn submit(&self, terminal_id: u32, payload: Vec<u8>) {
        self.submit_payload(terminal_id, payload);
    }

    fn flush(&self, _terminal_id: u32) {
        self.flush_wire();
    }
}

impl std::fmt::Display for Crane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "crane {}", self.id)
    }
}
