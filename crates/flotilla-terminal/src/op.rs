//! Pluggable terminal operations
//!
//! Operation types are registered process-wide by type name, together with
//! the terminal permissions they require. An incoming op init is dispatched
//! through the registry; a missing permission fails with
//! `PermissionDenied` before the constructor runs.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bitflags::bitflags;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use flotilla_core::{Error, Result};

bitflags! {
    /// Permissions granted to a terminal
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct TerminalPermission: u8 {
        /// The terminal is a crane controller
        const IS_CRANE_CONTROLLER = 0b0000_0001;
        /// The terminal may start expand operations
        const MAY_EXPAND = 0b0000_0010;
    }
}

/// A running operation inside a terminal
pub trait Operation: Send + Sync {
    /// The operation ID, unique within its terminal
    fn id(&self) -> u32;

    /// The registered type name
    fn type_name(&self) -> &'static str;

    /// Deliver a data message to the operation.
    ///
    /// An error ends this operation only; the terminal survives.
    fn deliver(&self, data: Vec<u8>) -> Result<()>;

    /// Deliver an op-scoped flow-control credit delta.
    fn deliver_space_report(&self, _credits: u32) -> Result<()> {
        Ok(())
    }

    /// The operation has ended; no further messages will be delivered.
    fn end(&self, err: Option<Error>);
}

/// The sending surface a terminal exposes to its operations
#[async_trait]
pub trait OpTerminal: Send + Sync {
    /// The terminal ID
    fn terminal_id(&self) -> u32;

    /// A short ID hierarchy for logging, e.g. `rkYs#4`
    fn fmt_id(&self) -> String;

    /// Permissions granted to this terminal
    fn permissions(&self) -> TerminalPermission;

    /// The component hosting this terminal, usually its crane.
    ///
    /// Operations that need more than the sending surface downcast this.
    fn host(&self) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        None
    }

    /// Cancellation scope; operation workers derive child tokens from it
    fn cancellation(&self) -> CancellationToken;

    /// Allocate a fresh operation ID.
    fn allocate_op_id(&self) -> u32;

    /// Register `op` and send the init message starting it on the peer.
    async fn op_init(&self, op: Arc<dyn Operation>, data: Vec<u8>) -> Result<()>;

    /// Send a data message for a running operation.
    async fn op_send(&self, op_id: u32, data: Vec<u8>) -> Result<()>;

    /// Send an op-scoped space report.
    async fn op_space_report(&self, op_id: u32, credits: u32) -> Result<()>;

    /// End an operation: notify the peer and unregister locally.
    async fn op_end(&self, op_id: u32, err: Option<Error>);

    /// Push any batched frames out immediately.
    async fn flush(&self);
}

/// Body of an op init message
#[derive(Debug, Serialize, Deserialize)]
pub struct OpInitMsg {
    /// Registered operation type name
    pub op_type: String,
    /// Constructor payload
    pub data: Vec<u8>,
}

/// Constructor for remotely initiated operations
pub type OpStartFn =
    Arc<dyn Fn(Arc<dyn OpTerminal>, u32, Vec<u8>) -> Result<Arc<dyn Operation>> + Send + Sync>;

/// A registered operation type
#[derive(Clone)]
pub struct OpParams {
    /// Type name carried in op init messages
    pub type_name: &'static str,
    /// Permissions the hosting terminal must have
    pub requires: TerminalPermission,
    /// Constructor invoked on op init
    pub start: OpStartFn,
}

fn registry() -> &'static RwLock<HashMap<&'static str, OpParams>> {
    static REGISTRY: OnceLock<RwLock<HashMap<&'static str, OpParams>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register an operation type. Re-registering a name replaces the entry.
pub fn register_op_type(params: OpParams) {
    registry().write().insert(params.type_name, params);
}

/// Start a remotely initiated operation through the registry.
pub fn start_op(
    terminal: Arc<dyn OpTerminal>,
    op_type: &str,
    op_id: u32,
    data: Vec<u8>,
) -> Result<Arc<dyn Operation>> {
    let params = registry()
        .read()
        .get(op_type)
        .cloned()
        .ok_or_else(|| Error::IncorrectUsage(format!("unknown op type {op_type:?}")))?;

    if !terminal.permissions().contains(params.requires) {
        return Err(Error::PermissionDenied(format!(
            "op type {op_type:?} requires {:?}",
            params.requires
        )));
    }

    (params.start)(terminal, op_id, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NoopOp {
        id: u32,
    }

    impl Operation for NoopOp {
        fn id(&self) -> u32 {
            self.id
        }
        fn type_name(&self) -> &'static str {
            "noop"
        }
        fn deliver(&self, _data: Vec<u8>) -> Result<()> {
            Ok(())
        }
        fn end(&self, _err: Option<Error>) {}
    }

    struct StubTerminal {
        permissions: TerminalPermission,
        next_op_id: AtomicU32,
    }

    #[async_trait]
    impl OpTerminal for StubTerminal {
        fn terminal_id(&self) -> u32 {
            7
        }
        fn fmt_id(&self) -> String {
            "stub#7".to_string()
        }
        fn permissions(&self) -> TerminalPermission {
            self.permissions
        }
        fn cancellation(&self) -> CancellationToken {
            CancellationToken::new()
        }
        fn allocate_op_id(&self) -> u32 {
            self.next_op_id.fetch_add(2, Ordering::SeqCst)
        }
        async fn op_init(&self, _op: Arc<dyn Operation>, _data: Vec<u8>) -> Result<()> {
            Ok(())
        }
        async fn op_send(&self, _op_id: u32, _data: Vec<u8>) -> Result<()> {
            Ok(())
        }
        async fn op_space_report(&self, _op_id: u32, _credits: u32) -> Result<()> {
            Ok(())
        }
        async fn op_end(&self, _op_id: u32, _err: Option<Error>) {}
        async fn flush(&self) {}
    }

    #[test]
    fn permission_gate() {
        register_op_type(OpParams {
            type_name: "needs-controller",
            requires: TerminalPermission::IS_CRANE_CONTROLLER,
            start: Arc::new(|_, op_id, _| Ok(Arc::new(NoopOp { id: op_id }) as Arc<dyn Operation>)),
        });

        let plain = Arc::new(StubTerminal {
            permissions: TerminalPermission::empty(),
            next_op_id: AtomicU32::new(8),
        });
        let err = match start_op(plain, "needs-controller", 8, vec![]) {
            Err(e) => e,
            Ok(_) => panic!("expected start_op to fail"),
        };
        assert!(matches!(err, Error::PermissionDenied(_)));

        let controller = Arc::new(StubTerminal {
            permissions: TerminalPermission::IS_CRANE_CONTROLLER,
            next_op_id: AtomicU32::new(8),
        });
        assert!(start_op(controller, "needs-controller", 8, vec![]).is_ok());
    }

    #[test]
    fn unknown_type_is_incorrect_usage() {
        let terminal = Arc::new(StubTerminal {
            permissions: TerminalPermission::all(),
            next_op_id: AtomicU32::new(8),
        });
        let err = match start_op(terminal, "no-such-op", 8, vec![]) {
            Err(e) => e,
            Ok(_) => panic!("expected start_op to fail"),
        };
        assert!(matches!(err, Error::IncorrectUsage(_)));
    }
}
