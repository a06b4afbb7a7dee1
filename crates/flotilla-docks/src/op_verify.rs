//! Connected-hub verification
//!
//! A public hub connecting out challenges the peer to prove it holds the
//! identity key behind the hub record: the client sends a random
//! challenge, the peer signs it together with its verifying key, and the
//! client checks both the signature and that the key hashes to the
//! expected hub ID. On success the hub's advertised IPs count as
//! verified; on failure the crane is torn down with `Integrity`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{info, warn};

use flotilla_core::{Error, Result};
use flotilla_hub::{HubId, Identity};
use flotilla_terminal::op::{register_op_type, OpParams, OpTerminal, Operation, TerminalPermission};

use crate::crane::Crane;

/// Type name of the verification operation
pub const VERIFY_OP_TYPE: &str = "verify";

const CHALLENGE_SIZE: usize = 32;
const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);
const SIGNING_DOMAIN: &[u8] = b"flotilla-hub-verification-v1:";

#[derive(Debug, Serialize, Deserialize)]
struct VerifyResponse {
    public_key: [u8; 32],
    signature: Vec<u8>,
}

/// Register the responding side in the op-type registry.
pub fn register_verify_op() {
    register_op_type(OpParams {
        type_name: VERIFY_OP_TYPE,
        requires: TerminalPermission::IS_CRANE_CONTROLLER,
        start: Arc::new(|terminal, op_id, challenge| {
            if challenge.len() != CHALLENGE_SIZE {
                return Err(Error::MalformedData(format!(
                    "challenge must be {CHALLENGE_SIZE} bytes"
                )));
            }
            let identity = terminal
                .host()
                .and_then(|host| host.downcast::<Crane>().ok())
                .and_then(|crane| crane.identity().cloned())
                .ok_or_else(|| {
                    Error::IncorrectUsage("cannot verify a crane without an identity".to_string())
                })?;

            let mut message = SIGNING_DOMAIN.to_vec();
            message.extend_from_slice(&challenge);
            let response = VerifyResponse {
                public_key: identity.public_key(),
                signature: identity.sign(&message).to_vec(),
            };
            let data = postcard::to_allocvec(&response)
                .map_err(|err| Error::Internal(format!("failed to encode response: {err}")))?;

            let terminal2 = terminal.clone();
            tokio::spawn(async move {
                if let Err(err) = terminal2.op_send(op_id, data).await {
                    warn!(%err, "failed to send verification response");
                    return;
                }
                terminal2.flush().await;
                terminal2.op_end(op_id, None).await;
            });

            Ok(Arc::new(VerifyRespondOp { id: op_id }) as Arc<dyn Operation>)
        }),
    });
}

struct VerifyRespondOp {
    id: u32,
}

impl Operation for VerifyRespondOp {
    fn id(&self) -> u32 {
        self.id
    }

    fn type_name(&self) -> &'static str {
        VERIFY_OP_TYPE
    }

    fn deliver(&self, _data: Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn end(&self, _err: Option<Error>) {}
}

struct VerifyChallengeOp {
    id: u32,
    expected_hub: HubId,
    challenge: [u8; CHALLENGE_SIZE],
    outcome: Mutex<Option<Result<()>>>,
    done: Notify,
}

impl VerifyChallengeOp {
    fn check(&self, data: &[u8]) -> Result<()> {
        let response: VerifyResponse = postcard::from_bytes(data)
            .map_err(|err| Error::MalformedData(format!("invalid verify response: {err}")))?;

        if HubId::from_public_key(&response.public_key) != self.expected_hub {
            return Err(Error::Integrity(
                "peer key does not match the expected hub".to_string(),
            ));
        }

        let mut message = SIGNING_DOMAIN.to_vec();
        message.extend_from_slice(&self.challenge);
        Identity::verify(&response.public_key, &message, &response.signature)
            .map_err(|err| err.wrap("challenge signature"))
    }
}

impl Operation for VerifyChallengeOp {
    fn id(&self) -> u32 {
        self.id
    }

    fn type_name(&self) -> &'static str {
        VERIFY_OP_TYPE
    }

    fn deliver(&self, data: Vec<u8>) -> Result<()> {
        let result = self.check(&data);
        *self.outcome.lock() = Some(result.clone());
        self.done.notify_waiters();
        result
    }

    fn end(&self, err: Option<Error>) {
        let mut outcome = self.outcome.lock();
        if outcome.is_none() {
            *outcome = Some(Err(err.unwrap_or_else(|| {
                Error::Integrity("verification ended without a response".to_string())
            })));
        }
        drop(outcome);
        self.done.notify_waiters();
    }
}

/// Challenge the connected hub to prove its identity.
///
/// On success the hub's IPs are marked verified on the crane. Errors are
/// returned to the caller, which is expected to tear the crane down.
pub async fn verify_connected_hub(crane: &Arc<Crane>) -> Result<()> {
    let hub = crane.connected_hub().ok_or_else(|| {
        Error::IncorrectUsage("no connected hub to verify".to_string())
    })?;
    let controller = crane
        .controller()
        .ok_or_else(|| Error::Stopping(format!("crane {} has no controller", crane.id())))?;

    let challenge: [u8; CHALLENGE_SIZE] = rand::random();
    let op = Arc::new(VerifyChallengeOp {
        id: controller.allocate_op_id(),
        expected_hub: hub.id,
        challenge,
        outcome: Mutex::new(None),
        done: Notify::new(),
    });

    controller.op_init(op.clone(), challenge.to_vec()).await?;
    controller.flush().await;

    let deadline = tokio::time::sleep(VERIFY_TIMEOUT);
    tokio::pin!(deadline);
    let result = loop {
        let notified = op.done.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if let Some(result) = op.outcome.lock().clone() {
            break result;
        }
        tokio::select! {
            _ = &mut deadline => {
                break Err(Error::Timeout("hub verification timed out".to_string()));
            }
            _ = &mut notified => {}
        }
    };

    match result {
        Ok(()) => {
            crane.mark_hub_verified();
            info!(hub = %hub, crane = %crane.id(), "verified connected hub");
            Ok(())
        }
        Err(err) => Err(err),
    }
}
