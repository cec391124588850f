use std::path::PathBuf;
use std::str::FromStr as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser as _;
use ln_spl_swap::engine::hygiene::{self, ChannelTracker, HygieneConfig};
use ln_spl_swap::engine::taker::{RfqParams, Taker};
use ln_spl_swap::engine::TakerConfig;
use ln_spl_swap::lightning::ldk::LdkLightningClient;
use ln_spl_swap::protocol::envelope::PeerKeypair;
use ln_spl_swap::protocol::{app_hash, RFQ_CHANNEL};
use ln_spl_swap::receipts::ReceiptsStore;
use ln_spl_swap::solana::RpcEscrowClient;
use ln_spl_swap::transport::tcp::TcpSidechannel;
use serde_json::json;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signer::keypair::read_keypair_file;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, default_value = "127.0.0.1:7700")]
    relay_addr: String,

    #[arg(long)]
    peer_seed_hex: Option<String>,

    #[arg(long, default_value = RFQ_CHANNEL)]
    rfq_channel: String,

    #[arg(long, default_value = "http://127.0.0.1:8899")]
    solana_rpc_url: String,

    #[arg(long)]
    program_id: String,

    /// The taker's Solana keypair; must be the escrow recipient.
    #[arg(long)]
    solana_keypair: PathBuf,

    #[arg(long)]
    mint: String,

    #[arg(long)]
    taker_token_account: String,

    #[arg(long)]
    ldk_rest_addr: String,

    #[arg(long, default_value = "receipts/taker.sqlite3")]
    store_path: PathBuf,

    #[arg(long, default_value = "BTCUSDT")]
    pair: String,

    #[arg(long)]
    btc_sats: u64,

    /// Net SPL amount expected, in base units.
    #[arg(long)]
    usdt_amount: String,

    #[arg(long, default_value_t = 6)]
    usdt_decimals: u8,

    #[arg(long, default_value_t = 100)]
    max_platform_fee_bps: u16,

    #[arg(long, default_value_t = 100)]
    max_trade_fee_bps: u16,

    #[arg(long, default_value_t = 150)]
    max_total_fee_bps: u16,

    #[arg(long, default_value_t = 600)]
    min_refund_window_sec: u64,

    #[arg(long, default_value_t = 86_400)]
    max_refund_window_sec: u64,

    #[arg(long, default_value_t = 900)]
    swap_timeout_sec: u64,

    #[arg(long, default_value_t = 120)]
    rfq_valid_sec: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    ln_spl_swap::logging::init().ok();
    let args = Args::parse();

    let keys = match &args.peer_seed_hex {
        Some(seed) => PeerKeypair::from_seed_hex(seed)
            .map_err(|e| anyhow::anyhow!("parse peer_seed_hex: {e}"))?,
        None => PeerKeypair::generate(),
    };
    tracing::info!(peer = %keys.pubkey_hex(), "taker identity ready");

    let program_id = Pubkey::from_str(&args.program_id).context("parse program_id")?;
    let solana_keypair = read_keypair_file(&args.solana_keypair)
        .map_err(|e| anyhow::anyhow!("read solana keypair: {e}"))?;
    let chain = Arc::new(RpcEscrowClient::new(
        args.solana_rpc_url.clone(),
        program_id,
        solana_keypair,
    ));
    let sol_recipient = chain.signer_pubkey().to_string();
    tracing::info!(recipient = %sol_recipient, "solana signer ready");

    let ln = Arc::new(LdkLightningClient::new(args.ldk_rest_addr.clone()));
    let store = Arc::new(Mutex::new(
        ReceiptsStore::open(args.store_path.clone()).context("open receipts store")?,
    ));

    let (transport, inbound) = TcpSidechannel::connect(&args.relay_addr, &keys.pubkey_hex())
        .await
        .context("connect sidechannel relay")?;
    let transport: Arc<dyn ln_spl_swap::transport::Sidechannel> = Arc::new(transport);

    let cfg = TakerConfig {
        rfq_channel: args.rfq_channel,
        app_hash: app_hash(&args.program_id),
        sol_recipient,
        taker_token_account: args.taker_token_account,
        max_platform_fee_bps: args.max_platform_fee_bps,
        max_trade_fee_bps: args.max_trade_fee_bps,
        max_total_fee_bps: args.max_total_fee_bps,
        min_sol_refund_window_sec: args.min_refund_window_sec,
        max_sol_refund_window_sec: args.max_refund_window_sec,
        swap_timeout_sec: args.swap_timeout_sec,
        ..TakerConfig::default()
    };

    let tracker = ChannelTracker::new();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(hygiene::run(
        HygieneConfig::default(),
        Arc::clone(&transport),
        Arc::clone(&tracker),
        shutdown_rx.clone(),
    ));

    let mut taker = Taker::new(
        cfg,
        keys,
        transport,
        inbound,
        ln,
        chain,
        Arc::clone(&store),
        tracker,
    );
    let trade_id = taker
        .request_swap(RfqParams {
            pair: args.pair,
            btc_sats: args.btc_sats,
            usdt_amount: args.usdt_amount,
            usdt_decimals: args.usdt_decimals,
            sol_mint: args.mint,
            valid_for_sec: args.rfq_valid_sec,
        })
        .await
        .context("post RFQ")?;
    tracing::info!(%trade_id, "RFQ posted");

    // One-shot driver: stop once the trade is terminal (or on ctrl-c)
    // and print the durable record.
    let watch_store = Arc::clone(&store);
    let watch_trade = trade_id.clone();
    let watcher_shutdown = shutdown_tx.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let record = watch_store
                .lock()
                .expect("store mutex poisoned")
                .get(&watch_trade)
                .ok()
                .flatten();
            if let Some(record) = record
                && matches!(record.state.as_str(), "claimed" | "refunded" | "canceled")
            {
                let _ = watcher_shutdown.send(true);
                return;
            }
        }
    });
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    taker.run(shutdown_rx).await?;

    let record = store
        .lock()
        .expect("store mutex poisoned")
        .get(&trade_id)
        .context("read final record")?;
    let out = match record {
        Some(record) => json!({
            "trade_id": record.trade_id,
            "state": record.state,
            "payment_hash_hex": record.payment_hash_hex,
            "claim_tx_sig": record.claim_tx_sig,
            "refund_tx_sig": record.refund_tx_sig,
            "ln_paid": record.ln_paid,
            "last_error": record.last_error,
        }),
        None => json!({ "trade_id": trade_id, "state": "unknown" }),
    };
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
