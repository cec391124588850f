mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use solana_sdk::pubkey::Pubkey;
use tokio::sync::mpsc::UnboundedReceiver;

use ln_spl_swap::engine::hygiene::ChannelTracker;
use ln_spl_swap::engine::maker::Maker;
use ln_spl_swap::engine::taker::{RfqParams, Taker};
use ln_spl_swap::engine::{MakerConfig, TakerConfig};
use ln_spl_swap::protocol::envelope::{hash_unsigned_hex, now_unix, PeerKeypair};
use ln_spl_swap::protocol::{
    app_hash, Envelope, EnvelopeBody, EnvelopeKind, QuoteAcceptBody, QuoteBody, RfqBody,
    SwapDirection, RFQ_CHANNEL,
};
use ln_spl_swap::receipts::ReceiptsStore;
use ln_spl_swap::transport::memory::MemoryHub;
use ln_spl_swap::transport::{InboundMessage, JoinOptions, Sidechannel};

use support::mock_chain::MockLedger;
use support::mock_ln::MockLightning;

async fn next_of_kind(
    rx: &mut UnboundedReceiver<InboundMessage>,
    kind: EnvelopeKind,
    not_from: &str,
    timeout: Duration,
) -> Result<Envelope> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .context("timed out waiting for envelope")?;
        let msg = tokio::time::timeout(remaining, rx.recv())
            .await
            .context("timed out waiting for envelope")?
            .context("transport closed")?;
        if let Ok(env) = Envelope::from_wire_json(&msg.payload)
            && env.kind == kind
            && env.signer != not_from
        {
            return Ok(env);
        }
    }
}

fn drain_of_kind(
    rx: &mut UnboundedReceiver<InboundMessage>,
    kind: EnvelopeKind,
    not_from: &str,
) -> Vec<Envelope> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        if let Ok(env) = Envelope::from_wire_json(&msg.payload)
            && env.kind == kind
            && env.signer != not_from
        {
            out.push(env);
        }
    }
    out
}

struct MakerNet {
    hub: Arc<MemoryHub>,
    app_hash: String,
    mint: Pubkey,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    _tmp: tempfile::TempDir,
}

async fn start_maker_engine() -> Result<MakerNet> {
    let tmp = tempfile::tempdir().context("tempdir")?;
    let program_id = Pubkey::new_unique();
    let mint = Pubkey::new_unique();
    let maker_sol = Pubkey::new_unique();
    let collector = Pubkey::new_unique();

    let ledger = MockLedger::new(program_id);
    ledger.init_config(collector, collector, 100);
    let maker_token = ledger.create_token_account(maker_sol, mint, 10_000_000);

    let hub = MemoryHub::new();
    let maker_keys = PeerKeypair::from_seed(&[0xaa; 32]);
    let (maker_peer, maker_rx) = hub.connect(&maker_keys.pubkey_hex());
    let store = Arc::new(Mutex::new(
        ReceiptsStore::open(tmp.path().join("maker.sqlite3")).context("open store")?,
    ));

    let cfg = MakerConfig {
        app_hash: app_hash(&program_id.to_string()),
        sol_mint: mint.to_string(),
        sol_refund: maker_sol.to_string(),
        maker_token_account: maker_token.to_string(),
        platform_fee_collector: collector.to_string(),
        trade_fee_collector: Pubkey::new_unique().to_string(),
        tick_ms: 50,
        resend_base_ms: 200,
        resend_widened_ms: 400,
        announce_interval_ms: 60_000,
        ..MakerConfig::default()
    };
    let the_app_hash = cfg.app_hash.clone();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let maker = Maker::new(
        cfg,
        maker_keys,
        Arc::new(maker_peer),
        maker_rx,
        MockLightning::new(),
        ledger.connect(maker_sol),
        store,
        ChannelTracker::new(),
    );
    tokio::spawn(maker.run(shutdown_rx));

    Ok(MakerNet {
        hub,
        app_hash: the_app_hash,
        mint,
        shutdown_tx,
        _tmp: tmp,
    })
}

fn rfq_body(net: &MakerNet, recipient: &Pubkey) -> RfqBody {
    RfqBody {
        pair: "BTCUSDT".into(),
        direction: SwapDirection::LnToSpl,
        app_hash: net.app_hash.clone(),
        btc_sats: 10_000,
        usdt_amount: "1000000".into(),
        usdt_decimals: 6,
        sol_mint: net.mint.to_string(),
        sol_recipient: recipient.to_string(),
        max_platform_fee_bps: 100,
        max_trade_fee_bps: 100,
        max_total_fee_bps: 150,
        min_sol_refund_window_sec: 600,
        max_sol_refund_window_sec: 86_400,
        valid_until_unix: now_unix() + 120,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn reposted_rfq_reemits_the_identical_signed_quote() -> Result<()> {
    let net = start_maker_engine().await?;
    let taker_keys = PeerKeypair::from_seed(&[0xbb; 32]);
    let (peer, mut rx) = net.hub.connect(&taker_keys.pubkey_hex());
    peer.join(RFQ_CHANNEL, JoinOptions::default()).await?;
    peer.subscribe(&[RFQ_CHANNEL.into()]).await?;

    let rfq = taker_keys.seal(
        "trade-idem",
        EnvelopeBody::Rfq(rfq_body(&net, &Pubkey::new_unique())),
    );
    peer.send(RFQ_CHANNEL, &rfq.to_wire_json()).await?;
    let quote_a = next_of_kind(
        &mut rx,
        EnvelopeKind::Quote,
        &taker_keys.pubkey_hex(),
        Duration::from_secs(5),
    )
    .await
    .context("first quote")?;

    // Same RFQ again (transport duplication): the lock serves the very
    // same signed envelope instead of minting a second quote.
    peer.send(RFQ_CHANNEL, &rfq.to_wire_json()).await?;
    let quote_b = next_of_kind(
        &mut rx,
        EnvelopeKind::Quote,
        &taker_keys.pubkey_hex(),
        Duration::from_secs(5),
    )
    .await
    .context("re-emitted quote")?;

    assert_eq!(quote_a.to_wire_json(), quote_b.to_wire_json());

    let _ = net.shutdown_tx.send(true);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn quote_accept_from_a_stranger_is_ignored() -> Result<()> {
    let net = start_maker_engine().await?;
    let taker_keys = PeerKeypair::from_seed(&[0xbb; 32]);
    let interloper_keys = PeerKeypair::from_seed(&[0xcc; 32]);

    let (taker_peer, mut taker_rx) = net.hub.connect(&taker_keys.pubkey_hex());
    taker_peer.join(RFQ_CHANNEL, JoinOptions::default()).await?;
    taker_peer.subscribe(&[RFQ_CHANNEL.into()]).await?;
    let (interloper_peer, mut interloper_rx) = net.hub.connect(&interloper_keys.pubkey_hex());
    interloper_peer.join(RFQ_CHANNEL, JoinOptions::default()).await?;
    interloper_peer.subscribe(&[RFQ_CHANNEL.into()]).await?;

    let trade_id = "trade-hijack";
    let rfq = taker_keys.seal(trade_id, EnvelopeBody::Rfq(rfq_body(&net, &Pubkey::new_unique())));
    taker_peer.send(RFQ_CHANNEL, &rfq.to_wire_json()).await?;
    let quote = next_of_kind(
        &mut taker_rx,
        EnvelopeKind::Quote,
        &taker_keys.pubkey_hex(),
        Duration::from_secs(5),
    )
    .await?;
    let quote_id = hash_unsigned_hex(&quote);

    // A third party races to accept the quote it observed publicly.
    let hijack = interloper_keys.seal(
        trade_id,
        EnvelopeBody::QuoteAccept(QuoteAcceptBody {
            quote_id: quote_id.clone(),
        }),
    );
    interloper_peer.send(RFQ_CHANNEL, &hijack.to_wire_json()).await?;
    tokio::time::sleep(Duration::from_millis(700)).await;
    let invites = drain_of_kind(
        &mut interloper_rx,
        EnvelopeKind::SwapInvite,
        &interloper_keys.pubkey_hex(),
    );
    assert!(invites.is_empty(), "maker answered a hijacked accept");

    // The RFQ signer's own accept goes through.
    let accept = taker_keys.seal(
        trade_id,
        EnvelopeBody::QuoteAccept(QuoteAcceptBody { quote_id }),
    );
    taker_peer.send(RFQ_CHANNEL, &accept.to_wire_json()).await?;
    let invite = next_of_kind(
        &mut taker_rx,
        EnvelopeKind::SwapInvite,
        &taker_keys.pubkey_hex(),
        Duration::from_secs(5),
    )
    .await?;
    let EnvelopeBody::SwapInvite(body) = &invite.body else {
        panic!("expected SWAP_INVITE body");
    };
    assert_eq!(body.invite.payload.invitee_pub_key, taker_keys.pubkey_hex());

    let _ = net.shutdown_tx.send(true);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn waiting_terms_replays_carry_the_latest_quote_id() -> Result<()> {
    let tmp = tempfile::tempdir().context("tempdir")?;
    let program_id = Pubkey::new_unique();
    let mint = Pubkey::new_unique();
    let taker_sol = Pubkey::new_unique();
    let ledger = MockLedger::new(program_id);
    let hub = MemoryHub::new();

    let maker_keys = PeerKeypair::from_seed(&[0xaa; 32]);
    let taker_keys = PeerKeypair::from_seed(&[0xbb; 32]);

    let (maker_peer, mut maker_rx) = hub.connect(&maker_keys.pubkey_hex());
    maker_peer.join(RFQ_CHANNEL, JoinOptions::default()).await?;
    maker_peer.subscribe(&[RFQ_CHANNEL.into()]).await?;

    let (taker_peer, taker_rx) = hub.connect(&taker_keys.pubkey_hex());
    let store = Arc::new(Mutex::new(
        ReceiptsStore::open(tmp.path().join("taker.sqlite3")).context("open store")?,
    ));
    let cfg = TakerConfig {
        app_hash: app_hash(&program_id.to_string()),
        sol_recipient: taker_sol.to_string(),
        taker_token_account: Pubkey::new_unique().to_string(),
        tick_ms: 50,
        rfq_resend_ms: 60_000,
        waiting_terms_ping_cooldown_ms: 250,
        waiting_terms_max_pings: 6,
        waiting_terms_max_wait_ms: 60_000,
        ..TakerConfig::default()
    };
    let mut taker = Taker::new(
        cfg,
        taker_keys,
        Arc::new(taker_peer),
        taker_rx,
        MockLightning::new(),
        ledger.connect(taker_sol),
        store,
        ChannelTracker::new(),
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
    tokio::spawn(taker.run(shutdown_rx));

    let rfq = next_of_kind(
        &mut maker_rx,
        EnvelopeKind::Rfq,
        &maker_keys.pubkey_hex(),
        Duration::from_secs(5),
    )
    .await
    .context("observe RFQ")?;

    let quote = |valid_until: i64| -> Envelope {
        maker_keys.seal(
            &trade_id,
            EnvelopeBody::Quote(QuoteBody {
                rfq_id: hash_unsigned_hex(&rfq),
                pair: "BTCUSDT".into(),
                direction: SwapDirection::LnToSpl,
                app_hash: app_hash(&program_id.to_string()),
                btc_sats: 10_000,
                usdt_amount: "1000000".into(),
                usdt_decimals: 6,
                sol_mint: mint.to_string(),
                platform_fee_bps: 50,
                platform_fee_collector: Pubkey::new_unique().to_string(),
                trade_fee_bps: 50,
                trade_fee_collector: Pubkey::new_unique().to_string(),
                sol_refund_window_sec: 1_200,
                valid_until_unix: valid_until,
            }),
        )
    };

    // First quote gets accepted, but this maker never posts TERMS.
    let quote_one = quote(now_unix() + 60);
    maker_peer.send(RFQ_CHANNEL, &quote_one.to_wire_json()).await?;
    let accept_one = next_of_kind(
        &mut maker_rx,
        EnvelopeKind::QuoteAccept,
        &maker_keys.pubkey_hex(),
        Duration::from_secs(5),
    )
    .await
    .context("first accept")?;
    let EnvelopeBody::QuoteAccept(body) = &accept_one.body else {
        panic!("expected QUOTE_ACCEPT body");
    };
    assert_eq!(body.quote_id, hash_unsigned_hex(&quote_one));

    // A replacement quote supersedes the first.
    let quote_two = quote(now_unix() + 90);
    maker_peer.send(RFQ_CHANNEL, &quote_two.to_wire_json()).await?;
    let latest_quote_id = hash_unsigned_hex(&quote_two);
    let accept_two = next_of_kind(
        &mut maker_rx,
        EnvelopeKind::QuoteAccept,
        &maker_keys.pubkey_hex(),
        Duration::from_secs(5),
    )
    .await
    .context("second accept")?;
    let EnvelopeBody::QuoteAccept(body) = &accept_two.body else {
        panic!("expected QUOTE_ACCEPT body");
    };
    assert_eq!(body.quote_id, latest_quote_id);

    // Still no TERMS: waiting-terms pings replay the accept, and every
    // replay references the latest quote, never the superseded one.
    tokio::time::sleep(Duration::from_millis(900)).await;
    let replays = drain_of_kind(
        &mut maker_rx,
        EnvelopeKind::QuoteAccept,
        &maker_keys.pubkey_hex(),
    );
    assert!(!replays.is_empty(), "expected waiting-terms replays");
    for replay in &replays {
        let EnvelopeBody::QuoteAccept(body) = &replay.body else {
            panic!("expected QUOTE_ACCEPT body");
        };
        assert_eq!(body.quote_id, latest_quote_id);
    }

    let _ = shutdown_tx.send(true);
    Ok(())
}
