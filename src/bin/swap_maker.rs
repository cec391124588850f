use std::path::PathBuf;
use std::str::FromStr as _;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use clap::Parser as _;
use ln_spl_swap::engine::hygiene::{self, ChannelTracker, HygieneConfig};
use ln_spl_swap::engine::maker::Maker;
use ln_spl_swap::engine::MakerConfig;
use ln_spl_swap::lightning::ldk::LdkLightningClient;
use ln_spl_swap::protocol::envelope::PeerKeypair;
use ln_spl_swap::protocol::{app_hash, RFQ_CHANNEL};
use ln_spl_swap::receipts::ReceiptsStore;
use ln_spl_swap::solana::RpcEscrowClient;
use ln_spl_swap::transport::tcp::{serve_relay, TcpSidechannel};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signer::keypair::read_keypair_file;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, default_value = "127.0.0.1:7700")]
    relay_addr: String,

    /// Also host the relay on `relay_addr` before connecting to it.
    #[arg(long, default_value_t = false)]
    serve_relay: bool,

    /// 64-hex Ed25519 seed for the peer identity. Generated fresh when
    /// omitted.
    #[arg(long)]
    peer_seed_hex: Option<String>,

    #[arg(long, default_value = RFQ_CHANNEL)]
    rfq_channel: String,

    #[arg(long, default_value = "http://127.0.0.1:8899")]
    solana_rpc_url: String,

    #[arg(long)]
    program_id: String,

    /// Path to the maker's Solana keypair (funds escrows, receives
    /// refunds).
    #[arg(long)]
    solana_keypair: PathBuf,

    #[arg(long)]
    mint: String,

    #[arg(long)]
    maker_token_account: String,

    #[arg(long)]
    ldk_rest_addr: String,

    #[arg(long, default_value = "receipts/maker.sqlite3")]
    store_path: PathBuf,

    #[arg(long, default_value = "BTCUSDT")]
    pair: String,

    #[arg(long, default_value_t = 50)]
    platform_fee_bps: u16,

    #[arg(long)]
    platform_fee_collector: String,

    #[arg(long, default_value_t = 50)]
    trade_fee_bps: u16,

    #[arg(long)]
    trade_fee_collector: String,

    #[arg(long, default_value_t = 1_000)]
    min_btc_sats: u64,

    #[arg(long, default_value_t = 10_000_000)]
    max_btc_sats: u64,

    #[arg(long, default_value_t = 60)]
    quote_valid_sec: i64,

    #[arg(long, default_value_t = 3_600)]
    refund_window_sec: u64,

    #[arg(long, default_value_t = 900)]
    swap_timeout_sec: u64,

    #[arg(long, default_value_t = 3_600)]
    invoice_expiry_sec: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    ln_spl_swap::logging::init().ok();
    let args = Args::parse();

    if args.serve_relay {
        let listener = tokio::net::TcpListener::bind(&args.relay_addr)
            .await
            .with_context(|| format!("bind relay {}", args.relay_addr))?;
        tracing::info!(relay_addr = %args.relay_addr, "hosting sidechannel relay");
        tokio::spawn(async move {
            if let Err(err) = serve_relay(listener).await {
                tracing::error!(error = %err, "relay stopped");
            }
        });
    }

    let keys = match &args.peer_seed_hex {
        Some(seed) => PeerKeypair::from_seed_hex(seed)
            .map_err(|e| anyhow::anyhow!("parse peer_seed_hex: {e}"))?,
        None => PeerKeypair::generate(),
    };
    tracing::info!(peer = %keys.pubkey_hex(), "maker identity ready");

    let program_id = Pubkey::from_str(&args.program_id).context("parse program_id")?;
    let solana_keypair = read_keypair_file(&args.solana_keypair)
        .map_err(|e| anyhow::anyhow!("read solana keypair: {e}"))?;
    let chain = Arc::new(RpcEscrowClient::new(
        args.solana_rpc_url.clone(),
        program_id,
        solana_keypair,
    ));
    tracing::info!(refund_authority = %chain.signer_pubkey(), "solana signer ready");

    let ln = Arc::new(LdkLightningClient::new(args.ldk_rest_addr.clone()));
    let store = Arc::new(Mutex::new(
        ReceiptsStore::open(args.store_path.clone()).context("open receipts store")?,
    ));

    let (transport, inbound) = TcpSidechannel::connect(&args.relay_addr, &keys.pubkey_hex())
        .await
        .context("connect sidechannel relay")?;
    let transport: Arc<dyn ln_spl_swap::transport::Sidechannel> = Arc::new(transport);

    let cfg = MakerConfig {
        rfq_channel: args.rfq_channel,
        pair: args.pair,
        app_hash: app_hash(&args.program_id),
        sol_mint: args.mint,
        sol_refund: chain.signer_pubkey().to_string(),
        maker_token_account: args.maker_token_account,
        platform_fee_bps: args.platform_fee_bps,
        platform_fee_collector: args.platform_fee_collector,
        trade_fee_bps: args.trade_fee_bps,
        trade_fee_collector: args.trade_fee_collector,
        min_btc_sats: args.min_btc_sats,
        max_btc_sats: args.max_btc_sats,
        quote_valid_sec: args.quote_valid_sec,
        sol_refund_window_sec: args.refund_window_sec,
        swap_timeout_sec: args.swap_timeout_sec,
        invoice_expiry_sec: args.invoice_expiry_sec,
        ..MakerConfig::default()
    };

    let tracker = ChannelTracker::new();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(hygiene::run(
        HygieneConfig::default(),
        Arc::clone(&transport),
        Arc::clone(&tracker),
        shutdown_rx.clone(),
    ));
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    tracing::info!("maker engine starting");
    Maker::new(cfg, keys, transport, inbound, ln, chain, store, tracker)
        .run(shutdown_rx)
        .await
}
