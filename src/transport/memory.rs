use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ChannelStats, InboundMessage, JoinOptions, Sidechannel};
use crate::protocol::envelope::now_ms;
use crate::transport::invite::verify_invite;

/// In-process sidechannel hub. Faithful to the production transport's
/// contract: no history for late joiners, sender echo, and invite
/// gating on `swap:*` channels. Used by tests and local rehearsals.
pub struct MemoryHub {
    inner: Mutex<HubInner>,
}

#[derive(Default)]
struct HubInner {
    channels: HashMap<String, ChannelState>,
    peers: HashMap<String, PeerState>,
    seq: u64,
}

#[derive(Default)]
struct ChannelState {
    owner: Option<String>,
    members: HashSet<String>,
}

struct PeerState {
    tx: mpsc::UnboundedSender<InboundMessage>,
    subscribed: HashSet<String>,
}

fn is_gated(channel: &str) -> bool {
    channel.starts_with("swap:")
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HubInner::default()),
        })
    }

    pub fn connect(
        self: &Arc<Self>,
        pubkey_hex: &str,
    ) -> (MemoryPeer, mpsc::UnboundedReceiver<InboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .expect("hub mutex poisoned")
            .peers
            .insert(
                pubkey_hex.to_string(),
                PeerState {
                    tx,
                    subscribed: HashSet::new(),
                },
            );
        (
            MemoryPeer {
                hub: Arc::clone(self),
                pubkey: pubkey_hex.to_string(),
            },
            rx,
        )
    }
}

pub struct MemoryPeer {
    hub: Arc<MemoryHub>,
    pubkey: String,
}

#[async_trait]
impl Sidechannel for MemoryPeer {
    async fn join(&self, channel: &str, opts: JoinOptions) -> Result<()> {
        let mut inner = self.hub.inner.lock().expect("hub mutex poisoned");
        let state = inner.channels.entry(channel.to_string()).or_default();

        if is_gated(channel) {
            if opts.welcome {
                match &state.owner {
                    None => state.owner = Some(self.pubkey.clone()),
                    Some(owner) if *owner == self.pubkey => {}
                    Some(_) => anyhow::bail!("channel {channel} already has an owner"),
                }
            } else {
                let owner = state
                    .owner
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("channel {channel} has no owner yet"))?;
                let invite = opts
                    .invite
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("channel {channel} requires an invite"))?;
                verify_invite(invite, &self.pubkey, &owner, now_ms())
                    .map_err(|e| anyhow::anyhow!("join {channel}: {e}"))?;
            }
        }

        state.members.insert(self.pubkey.clone());
        Ok(())
    }

    async fn leave(&self, channel: &str) -> Result<()> {
        let mut inner = self.hub.inner.lock().expect("hub mutex poisoned");
        if let Some(state) = inner.channels.get_mut(channel) {
            state.members.remove(&self.pubkey);
        }
        if let Some(peer) = inner.peers.get_mut(&self.pubkey) {
            peer.subscribed.remove(channel);
        }
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<()> {
        let mut inner = self.hub.inner.lock().expect("hub mutex poisoned");
        if let Some(peer) = inner.peers.get_mut(&self.pubkey) {
            peer.subscribed.extend(channels.iter().cloned());
        }
        Ok(())
    }

    async fn send(&self, channel: &str, payload: &str) -> Result<()> {
        let mut inner = self.hub.inner.lock().expect("hub mutex poisoned");
        inner.seq += 1;
        let seq = inner.seq;

        let Some(state) = inner.channels.get(channel) else {
            // Best-effort: sending into a channel nobody created is a
            // silent no-op, like publishing to an empty topic.
            return Ok(());
        };
        anyhow::ensure!(
            state.members.contains(&self.pubkey),
            "not a member of {channel}"
        );

        let members: Vec<String> = state.members.iter().cloned().collect();
        for member in members {
            if let Some(peer) = inner.peers.get(&member)
                && peer.subscribed.contains(channel)
            {
                // Receiver dropped means the peer is gone; losing the
                // message is within the transport contract.
                let _ = peer.tx.send(InboundMessage {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                    seq,
                });
            }
        }
        Ok(())
    }

    async fn stats(&self) -> Result<Vec<ChannelStats>> {
        let inner = self.hub.inner.lock().expect("hub mutex poisoned");
        let mut out: Vec<ChannelStats> = inner
            .channels
            .iter()
            .filter(|(_, state)| state.members.contains(&self.pubkey))
            .map(|(name, state)| ChannelStats {
                channel: name.clone(),
                members: state.members.len(),
            })
            .collect();
        out.sort_by(|a, b| a.channel.cmp(&b.channel));
        Ok(out)
    }
}
