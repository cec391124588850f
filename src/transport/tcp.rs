//! Line-delimited-JSON relay transport for running maker and taker as
//! separate processes. Development-grade: a single relay process fans
//! messages out to subscribed members and enforces invite gating on
//! `swap:*` channels. Delivery is best-effort, same as any other
//! sidechannel backend.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use super::{ChannelStats, InboundMessage, JoinOptions, Sidechannel};
use crate::protocol::envelope::now_ms;
use crate::protocol::SignedInvite;
use crate::transport::invite::verify_invite;

const STATS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ClientOp {
    Hello {
        pubkey: String,
    },
    Join {
        channel: String,
        welcome: bool,
        #[serde(default)]
        invite: Option<SignedInvite>,
    },
    Leave {
        channel: String,
    },
    Subscribe {
        channels: Vec<String>,
    },
    Send {
        channel: String,
        payload: String,
    },
    Stats {
        id: u64,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "ev", rename_all = "snake_case")]
enum ServerEvent {
    Msg {
        channel: String,
        payload: String,
        seq: u64,
    },
    Stats {
        id: u64,
        channels: Vec<StatEntry>,
    },
    Err {
        detail: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatEntry {
    channel: String,
    members: usize,
}

// ---------------------------------------------------------------------
// Relay server
// ---------------------------------------------------------------------

#[derive(Default)]
struct RelayState {
    channels: HashMap<String, RelayChannel>,
    conns: HashMap<u64, RelayConn>,
    next_conn: u64,
    seq: u64,
}

#[derive(Default)]
struct RelayChannel {
    owner: Option<String>,
    members: HashSet<u64>,
}

struct RelayConn {
    pubkey: String,
    subscribed: HashSet<String>,
    tx: mpsc::UnboundedSender<String>,
}

/// Accept loop. Runs until the listener errors or the task is dropped.
pub async fn serve_relay(listener: TcpListener) -> Result<()> {
    let state = Arc::new(Mutex::new(RelayState::default()));
    loop {
        let (socket, remote) = listener.accept().await.context("accept relay conn")?;
        tracing::debug!(%remote, "relay connection");
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, state).await {
                tracing::debug!(error = %err, "relay connection closed");
            }
        });
    }
}

async fn handle_conn(socket: TcpStream, state: Arc<Mutex<RelayState>>) -> Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let hello = lines.next_line().await?.context("connection closed")?;
    let pubkey = match serde_json::from_str::<ClientOp>(&hello) {
        Ok(ClientOp::Hello { pubkey }) => pubkey,
        _ => anyhow::bail!("first frame must be hello"),
    };

    let conn_id = {
        let mut st = state.lock().expect("relay mutex poisoned");
        st.next_conn += 1;
        let id = st.next_conn;
        st.conns.insert(
            id,
            RelayConn {
                pubkey,
                subscribed: HashSet::new(),
                tx,
            },
        );
        id
    };

    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if write_half.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    let result = conn_loop(&mut lines, conn_id, &state).await;

    let mut st = state.lock().expect("relay mutex poisoned");
    st.conns.remove(&conn_id);
    for channel in st.channels.values_mut() {
        channel.members.remove(&conn_id);
    }
    drop(st);
    writer.abort();
    result
}

async fn conn_loop(
    lines: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    conn_id: u64,
    state: &Arc<Mutex<RelayState>>,
) -> Result<()> {
    while let Some(line) = lines.next_line().await? {
        let op = match serde_json::from_str::<ClientOp>(&line) {
            Ok(op) => op,
            Err(err) => {
                reply(
                    state,
                    conn_id,
                    &ServerEvent::Err {
                        detail: format!("bad frame: {err}"),
                    },
                );
                continue;
            }
        };
        if let Err(err) = apply_op(state, conn_id, op) {
            reply(
                state,
                conn_id,
                &ServerEvent::Err {
                    detail: format!("{err:#}"),
                },
            );
        }
    }
    Ok(())
}

fn reply(state: &Arc<Mutex<RelayState>>, conn_id: u64, event: &ServerEvent) {
    let st = state.lock().expect("relay mutex poisoned");
    if let Some(conn) = st.conns.get(&conn_id) {
        let _ = conn
            .tx
            .send(serde_json::to_string(event).expect("event encodes"));
    }
}

fn apply_op(state: &Arc<Mutex<RelayState>>, conn_id: u64, op: ClientOp) -> Result<()> {
    let mut st = state.lock().expect("relay mutex poisoned");
    match op {
        ClientOp::Hello { .. } => anyhow::bail!("duplicate hello"),
        ClientOp::Join {
            channel,
            welcome,
            invite,
        } => {
            let pubkey = st
                .conns
                .get(&conn_id)
                .map(|c| c.pubkey.clone())
                .context("unknown connection")?;
            let entry = st.channels.entry(channel.clone()).or_default();
            if channel.starts_with("swap:") {
                if welcome {
                    match &entry.owner {
                        None => entry.owner = Some(pubkey.clone()),
                        Some(owner) if *owner == pubkey => {}
                        Some(_) => anyhow::bail!("channel {channel} already has an owner"),
                    }
                } else {
                    let owner = entry
                        .owner
                        .clone()
                        .ok_or_else(|| anyhow::anyhow!("channel {channel} has no owner yet"))?;
                    let invite = invite
                        .as_ref()
                        .ok_or_else(|| anyhow::anyhow!("channel {channel} requires an invite"))?;
                    verify_invite(invite, &pubkey, &owner, now_ms())
                        .map_err(|e| anyhow::anyhow!("join {channel}: {e}"))?;
                }
            }
            entry.members.insert(conn_id);
        }
        ClientOp::Leave { channel } => {
            if let Some(entry) = st.channels.get_mut(&channel) {
                entry.members.remove(&conn_id);
            }
            if let Some(conn) = st.conns.get_mut(&conn_id) {
                conn.subscribed.remove(&channel);
            }
        }
        ClientOp::Subscribe { channels } => {
            if let Some(conn) = st.conns.get_mut(&conn_id) {
                conn.subscribed.extend(channels);
            }
        }
        ClientOp::Send { channel, payload } => {
            st.seq += 1;
            let seq = st.seq;
            let Some(entry) = st.channels.get(&channel) else {
                return Ok(());
            };
            anyhow::ensure!(entry.members.contains(&conn_id), "not a member of {channel}");
            let members: Vec<u64> = entry.members.iter().copied().collect();
            let line = serde_json::to_string(&ServerEvent::Msg {
                channel: channel.clone(),
                payload,
                seq,
            })
            .expect("event encodes");
            for member in members {
                if let Some(conn) = st.conns.get(&member)
                    && conn.subscribed.contains(&channel)
                {
                    let _ = conn.tx.send(line.clone());
                }
            }
        }
        ClientOp::Stats { id } => {
            let channels: Vec<StatEntry> = st
                .channels
                .iter()
                .filter(|(_, entry)| entry.members.contains(&conn_id))
                .map(|(name, entry)| StatEntry {
                    channel: name.clone(),
                    members: entry.members.len(),
                })
                .collect();
            if let Some(conn) = st.conns.get(&conn_id) {
                let _ = conn.tx.send(
                    serde_json::to_string(&ServerEvent::Stats { id, channels })
                        .expect("event encodes"),
                );
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Relay client
// ---------------------------------------------------------------------

struct Pending {
    next_id: u64,
    stats: HashMap<u64, oneshot::Sender<Vec<StatEntry>>>,
}

pub struct TcpSidechannel {
    out: mpsc::UnboundedSender<String>,
    pending: Arc<Mutex<Pending>>,
}

impl TcpSidechannel {
    /// Connect to a relay and identify as `pubkey_hex`. Returns the
    /// handle and the inbound delivery stream.
    pub async fn connect(
        addr: &str,
        pubkey_hex: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<InboundMessage>)> {
        let socket = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect relay {addr}"))?;
        let (read_half, mut write_half) = socket.into_split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<InboundMessage>();
        let pending = Arc::new(Mutex::new(Pending {
            next_id: 0,
            stats: HashMap::new(),
        }));

        tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if write_half.write_all(b"\n").await.is_err() {
                    break;
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<ServerEvent>(&line) {
                    Ok(ServerEvent::Msg {
                        channel,
                        payload,
                        seq,
                    }) => {
                        let _ = in_tx.send(InboundMessage {
                            channel,
                            payload,
                            seq,
                        });
                    }
                    Ok(ServerEvent::Stats { id, channels }) => {
                        let waiter = reader_pending
                            .lock()
                            .expect("pending mutex poisoned")
                            .stats
                            .remove(&id);
                        if let Some(waiter) = waiter {
                            let _ = waiter.send(channels);
                        }
                    }
                    Ok(ServerEvent::Err { detail }) => {
                        tracing::warn!(detail, "relay error");
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "unparseable relay frame");
                    }
                }
            }
        });

        let client = Self {
            out: out_tx,
            pending,
        };
        client.emit(&ClientOp::Hello {
            pubkey: pubkey_hex.to_string(),
        })?;
        Ok((client, in_rx))
    }

    fn emit(&self, op: &ClientOp) -> Result<()> {
        self.out
            .send(serde_json::to_string(op).expect("op encodes"))
            .map_err(|_| anyhow::anyhow!("relay connection closed"))
    }
}

#[async_trait]
impl Sidechannel for TcpSidechannel {
    async fn join(&self, channel: &str, opts: JoinOptions) -> Result<()> {
        self.emit(&ClientOp::Join {
            channel: channel.to_string(),
            welcome: opts.welcome,
            invite: opts.invite,
        })
    }

    async fn leave(&self, channel: &str) -> Result<()> {
        self.emit(&ClientOp::Leave {
            channel: channel.to_string(),
        })
    }

    async fn subscribe(&self, channels: &[String]) -> Result<()> {
        self.emit(&ClientOp::Subscribe {
            channels: channels.to_vec(),
        })
    }

    async fn send(&self, channel: &str, payload: &str) -> Result<()> {
        self.emit(&ClientOp::Send {
            channel: channel.to_string(),
            payload: payload.to_string(),
        })
    }

    async fn stats(&self) -> Result<Vec<ChannelStats>> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut pending = self.pending.lock().expect("pending mutex poisoned");
            pending.next_id += 1;
            let id = pending.next_id;
            pending.stats.insert(id, tx);
            id
        };
        self.emit(&ClientOp::Stats { id })?;

        let entries = tokio::time::timeout(STATS_TIMEOUT, rx)
            .await
            .context("relay stats timeout")?
            .context("relay connection closed")?;
        Ok(entries
            .into_iter()
            .map(|e| ChannelStats {
                channel: e.channel,
                members: e.members,
            })
            .collect())
    }
}
