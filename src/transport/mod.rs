pub mod invite;
pub mod memory;
pub mod tcp;

use anyhow::Result;
use async_trait::async_trait;

use crate::protocol::SignedInvite;

/// A message delivered from a sidechannel. `payload` is the wire JSON
/// of a signed envelope; `seq` is a per-connection delivery counter,
/// not a channel ordering guarantee.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel: String,
    pub payload: String,
    pub seq: u64,
}

#[derive(Debug, Clone)]
pub struct ChannelStats {
    pub channel: String,
    pub members: usize,
}

#[derive(Debug, Clone, Default)]
pub struct JoinOptions {
    /// Create/own the channel: the joiner becomes the gatekeeper whose
    /// signed invites admit later members.
    pub welcome: bool,
    pub invite: Option<SignedInvite>,
}

impl JoinOptions {
    pub fn welcome() -> Self {
        Self {
            welcome: true,
            invite: None,
        }
    }

    pub fn with_invite(invite: SignedInvite) -> Self {
        Self {
            welcome: false,
            invite: Some(invite),
        }
    }
}

/// Best-effort pub/sub. Messages may be dropped, duplicated, reordered
/// or echoed back to the sender; there is no server-side history, so a
/// late joiner only sees what is emitted after it joined. Correctness
/// lives in the trade state machine, not here.
#[async_trait]
pub trait Sidechannel: Send + Sync {
    async fn join(&self, channel: &str, opts: JoinOptions) -> Result<()>;

    async fn leave(&self, channel: &str) -> Result<()>;

    async fn subscribe(&self, channels: &[String]) -> Result<()>;

    async fn send(&self, channel: &str, payload: &str) -> Result<()>;

    async fn stats(&self) -> Result<Vec<ChannelStats>>;
}
