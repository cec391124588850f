mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use solana_sdk::pubkey::Pubkey;

use ln_spl_swap::engine::hygiene::{self, ChannelTracker, HygieneConfig};
use ln_spl_swap::engine::taker::{RfqParams, Taker};
use ln_spl_swap::engine::TakerConfig;
use ln_spl_swap::protocol::envelope::{now_ms, PeerKeypair};
use ln_spl_swap::protocol::{
    swap_channel, EnvelopeBody, SwapInviteBody, RFQ_CHANNEL,
};
use ln_spl_swap::receipts::ReceiptsStore;
use ln_spl_swap::transport::invite::sign_invite;
use ln_spl_swap::transport::memory::{MemoryHub, MemoryPeer};
use ln_spl_swap::transport::{ChannelStats, JoinOptions, Sidechannel};

use support::mock_chain::MockLedger;
use support::mock_ln::MockLightning;
use support::wait::wait_for;

/// Pass-through transport that records every `leave` call.
struct RecordingTransport {
    inner: MemoryPeer,
    leaves: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Sidechannel for RecordingTransport {
    async fn join(&self, channel: &str, opts: JoinOptions) -> Result<()> {
        self.inner.join(channel, opts).await
    }

    async fn leave(&self, channel: &str) -> Result<()> {
        self.leaves
            .lock()
            .expect("leaves mutex poisoned")
            .push(channel.to_string());
        self.inner.leave(channel).await
    }

    async fn subscribe(&self, channels: &[String]) -> Result<()> {
        self.inner.subscribe(channels).await
    }

    async fn send(&self, channel: &str, payload: &str) -> Result<()> {
        self.inner.send(channel, payload).await
    }

    async fn stats(&self) -> Result<Vec<ChannelStats>> {
        self.inner.stats().await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_invite_channel_is_left_within_two_seconds() -> Result<()> {
    let tmp = tempfile::tempdir().context("tempdir")?;
    let program_id = Pubkey::new_unique();
    let mint = Pubkey::new_unique();
    let taker_sol = Pubkey::new_unique();
    let ledger = MockLedger::new(program_id);
    let hub = MemoryHub::new();

    let maker_keys = PeerKeypair::from_seed(&[0xaa; 32]);
    let taker_keys = PeerKeypair::from_seed(&[0xbb; 32]);

    let (maker_peer, _maker_rx) = hub.connect(&maker_keys.pubkey_hex());
    maker_peer.join(RFQ_CHANNEL, JoinOptions::default()).await?;
    maker_peer.subscribe(&[RFQ_CHANNEL.into()]).await?;

    let leaves = Arc::new(Mutex::new(Vec::new()));
    let (taker_peer, taker_rx) = hub.connect(&taker_keys.pubkey_hex());
    let transport: Arc<dyn Sidechannel> = Arc::new(RecordingTransport {
        inner: taker_peer,
        leaves: Arc::clone(&leaves),
    });

    let tracker = ChannelTracker::new();
    let store = Arc::new(Mutex::new(
        ReceiptsStore::open(tmp.path().join("taker.sqlite3")).context("open store")?,
    ));
    let cfg = TakerConfig {
        app_hash: ln_spl_swap::protocol::app_hash(&program_id.to_string()),
        sol_recipient: taker_sol.to_string(),
        taker_token_account: Pubkey::new_unique().to_string(),
        tick_ms: 50,
        rfq_resend_ms: 60_000,
        ..TakerConfig::default()
    };
    let mut taker = Taker::new(
        cfg,
        taker_keys,
        Arc::clone(&transport),
        taker_rx,
        MockLightning::new(),
        ledger.connect(taker_sol),
        store,
        Arc::clone(&tracker),
    );
    let trade_id = taker
        .request_swap(RfqParams {
            pair: "BTCUSDT".into(),
            btc_sats: 10_000,
            usdt_amount: "1000000".into(),
            usdt_decimals: 6,
            sol_mint: mint.to_string(),
            valid_for_sec: 120,
        })
        .await?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(taker.run(shutdown_rx.clone()));
    tokio::spawn(hygiene::run(
        HygieneConfig {
            hygiene_interval_ms: 1_000,
            swap_auto_leave_cooldown_ms: 100,
        },
        Arc::clone(&transport),
        tracker,
        shutdown_rx,
    ));

    // An invite that expired ten seconds ago. The taker must not join,
    // and hygiene must retire the channel promptly.
    let channel = swap_channel(&trade_id);
    let invite = sign_invite(
        &maker_keys,
        &PeerKeypair::from_seed(&[0xbb; 32]).pubkey_hex(),
        now_ms() - 10_000,
    );
    let invite_env = maker_keys.seal(
        &trade_id,
        EnvelopeBody::SwapInvite(SwapInviteBody {
            quote_id: "11".repeat(32),
            channel: channel.clone(),
            invite,
        }),
    );
    // Give the taker a moment to subscribe to the RFQ channel first.
    tokio::time::sleep(Duration::from_millis(300)).await;
    maker_peer.send(RFQ_CHANNEL, &invite_env.to_wire_json()).await?;

    wait_for("hygiene leave", Duration::from_secs(2), || async {
        Ok(leaves
            .lock()
            .expect("leaves mutex poisoned")
            .iter()
            .any(|c| c == &channel)
            .then_some(()))
    })
    .await?;

    let _ = shutdown_tx.send(true);
    Ok(())
}
