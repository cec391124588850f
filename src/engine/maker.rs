use std::collections::HashMap;
use std::str::FromStr as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use solana_sdk::pubkey::Pubkey;
use tokio::sync::{mpsc, watch};

use super::hygiene::ChannelTracker;
use super::{
    resend_floor_ms, LockState, LockTable, MakerConfig, ResendPacer, RfqLock, RfqLockKey,
};
use crate::lightning::LightningClient;
use crate::protocol::envelope::{hash_unsigned_hex, now_ms, now_unix, PeerKeypair};
use crate::protocol::state::{initial, TradePhase, TradeState};
use crate::protocol::validate::{amount_units, Validator};
use crate::protocol::{
    swap_channel, CancelBody, Envelope, EnvelopeBody, EnvelopeKind, EscrowCreatedBody,
    LnInvoiceBody, QuoteBody, RfqBody, StatusBody, SvcAnnounceBody, SwapDirection, TermsBody,
};
use crate::receipts::{ReceiptsStore, TradePatch};
use crate::solana::escrow::{derive_escrow_pda, derive_vault_ata};
use crate::solana::{CreateEscrowArgs, EscrowChain, RefundEscrowArgs};
use crate::transport::{InboundMessage, JoinOptions, Sidechannel};

struct MakerSwap {
    channel: String,
    peer: String,
    lock_key: RfqLockKey,
    state: TradeState,
    invite_env: Envelope,
    terms_env: Envelope,
    terms: TermsBody,
    ln_invoice_env: Option<Envelope>,
    escrow_env: Option<Envelope>,
    payment_hash: Option<[u8; 32]>,
    deadline_ms: u64,
    peer_last_seen_ms: u64,
    retry_last_ms: u64,
    pacer: ResendPacer,
}

/// RFQ → quote → invite → terms → invoice → escrow control loop.
pub struct Maker {
    cfg: MakerConfig,
    keys: PeerKeypair,
    validator: Validator,
    transport: Arc<dyn Sidechannel>,
    ln: Arc<dyn LightningClient>,
    chain: Arc<dyn EscrowChain>,
    store: Arc<Mutex<ReceiptsStore>>,
    tracker: Arc<ChannelTracker>,
    inbound: mpsc::UnboundedReceiver<InboundMessage>,
    locks: LockTable,
    swaps: HashMap<String, MakerSwap>,
}

impl Maker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: MakerConfig,
        keys: PeerKeypair,
        transport: Arc<dyn Sidechannel>,
        inbound: mpsc::UnboundedReceiver<InboundMessage>,
        ln: Arc<dyn LightningClient>,
        chain: Arc<dyn EscrowChain>,
        store: Arc<Mutex<ReceiptsStore>>,
        tracker: Arc<ChannelTracker>,
    ) -> Self {
        let validator = Validator {
            min_refund_window_sec: cfg.min_refund_window_sec,
        };
        Self {
            cfg,
            keys,
            validator,
            transport,
            ln,
            chain,
            store,
            tracker,
            inbound,
            locks: LockTable::default(),
            swaps: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.transport
            .join(&self.cfg.rfq_channel, JoinOptions::default())
            .await
            .context("join RFQ channel")?;
        self.transport
            .subscribe(&[self.cfg.rfq_channel.clone()])
            .await
            .context("subscribe RFQ channel")?;
        self.announce().await;

        let mut tick = tokio::time::interval(Duration::from_millis(self.cfg.tick_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut prune =
            tokio::time::interval(Duration::from_millis(self.cfg.lock_prune_interval_ms));
        prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut announce =
            tokio::time::interval(Duration::from_millis(self.cfg.announce_interval_ms));
        announce.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    self.stop("shutdown").await;
                    return Ok(());
                }
                msg = self.inbound.recv() => match msg {
                    Some(msg) => self.handle_inbound(msg).await,
                    None => {
                        self.stop("transport closed").await;
                        return Ok(());
                    }
                },
                _ = tick.tick() => self.tick().await,
                _ = prune.tick() => {
                    let dropped = self.locks.prune(now_ms(), now_unix());
                    if dropped > 0 {
                        tracing::debug!(dropped, "pruned RFQ locks");
                    }
                }
                _ = announce.tick() => self.announce().await,
            }
        }
    }

    async fn handle_inbound(&mut self, msg: InboundMessage) {
        let env = match Envelope::from_wire_json(&msg.payload) {
            Ok(env) => env,
            Err(err) => {
                tracing::debug!(channel = %msg.channel, error = %err, "undecodable envelope");
                return;
            }
        };
        if env.signer == self.keys.pubkey_hex() {
            return;
        }
        if let Err(err) = self.validator.validate(&env) {
            tracing::debug!(trade_id = %env.trade_id, kind = ?env.kind, error = %err, "invalid envelope dropped");
            return;
        }

        if msg.channel == self.cfg.rfq_channel {
            match env.body.clone() {
                EnvelopeBody::Rfq(body) => self.handle_rfq(&env, &body).await,
                EnvelopeBody::QuoteAccept(body) => self.handle_quote_accept(&env, &body.quote_id).await,
                _ => {}
            }
        } else if self.swaps.contains_key(&env.trade_id)
            && msg.channel == swap_channel(&env.trade_id)
        {
            self.handle_swap_msg(env).await;
        }
    }

    async fn handle_rfq(&mut self, env: &Envelope, body: &RfqBody) {
        let now = now_ms();
        let now_s = now_unix();

        if body.app_hash != self.cfg.app_hash {
            tracing::debug!(trade_id = %env.trade_id, "RFQ for a different deployment");
            return;
        }
        if body.direction != SwapDirection::LnToSpl {
            tracing::debug!(trade_id = %env.trade_id, "unsupported direction");
            return;
        }
        if body.valid_until_unix <= now_s {
            tracing::debug!(trade_id = %env.trade_id, "expired RFQ");
            return;
        }
        if self.cfg.enable_settlement && body.sol_recipient.is_empty() {
            tracing::debug!(trade_id = %env.trade_id, "RFQ missing sol_recipient");
            return;
        }
        if body.sol_mint != self.cfg.sol_mint || body.pair != self.cfg.pair {
            tracing::debug!(trade_id = %env.trade_id, "RFQ pair/mint not served");
            return;
        }
        if body.btc_sats < self.cfg.min_btc_sats || body.btc_sats > self.cfg.max_btc_sats {
            tracing::debug!(trade_id = %env.trade_id, btc_sats = body.btc_sats, "RFQ size out of bounds");
            return;
        }
        if amount_units(&body.usdt_amount).is_err() {
            return;
        }

        // Fee ceilings and refund-window bounds this maker cannot meet.
        let total_bps = self.cfg.platform_fee_bps + self.cfg.trade_fee_bps;
        if self.cfg.platform_fee_bps > body.max_platform_fee_bps
            || self.cfg.trade_fee_bps > body.max_trade_fee_bps
            || total_bps > body.max_total_fee_bps
        {
            tracing::debug!(trade_id = %env.trade_id, "RFQ fee ceilings below our fees");
            return;
        }
        let window = self
            .cfg
            .sol_refund_window_sec
            .clamp(body.min_sol_refund_window_sec, body.max_sol_refund_window_sec);
        if window < body.min_sol_refund_window_sec || window > body.max_sol_refund_window_sec {
            return;
        }

        let key = RfqLockKey::from_rfq(&env.signer, &env.trade_id, body);
        if let Some(lock) = self.locks.get_mut(&key) {
            lock.last_seen_ms = now;
            match lock.state {
                LockState::Quoted if lock.quote_valid_until_unix > now_s => {
                    let quote = lock.signed_quote.clone();
                    tracing::debug!(trade_id = %env.trade_id, "re-emitting existing quote");
                    self.send_on(&self.cfg.rfq_channel.clone(), &quote).await;
                    return;
                }
                LockState::Quoted => {
                    // Quote expired under the same key; fall through and
                    // issue a fresh one.
                }
                LockState::Accepting | LockState::Swapping => return,
            }
        }

        let quote_body = QuoteBody {
            rfq_id: hash_unsigned_hex(env),
            pair: body.pair.clone(),
            direction: body.direction,
            app_hash: self.cfg.app_hash.clone(),
            btc_sats: body.btc_sats,
            usdt_amount: body.usdt_amount.clone(),
            usdt_decimals: body.usdt_decimals,
            sol_mint: body.sol_mint.clone(),
            platform_fee_bps: self.cfg.platform_fee_bps,
            platform_fee_collector: self.cfg.platform_fee_collector.clone(),
            trade_fee_bps: self.cfg.trade_fee_bps,
            trade_fee_collector: self.cfg.trade_fee_collector.clone(),
            sol_refund_window_sec: window,
            valid_until_unix: now_s + self.cfg.quote_valid_sec,
        };
        let quote = self
            .keys
            .seal(&env.trade_id, EnvelopeBody::Quote(quote_body));
        let quote_id = hash_unsigned_hex(&quote);

        self.append_event(&env.trade_id, "rfq.quoted", serde_json::json!({ "quote_id": quote_id }));
        self.send_on(&self.cfg.rfq_channel.clone(), &quote).await;

        self.locks.insert(
            key,
            RfqLock {
                state: LockState::Quoted,
                quote_id,
                signed_quote: quote,
                quote_valid_until_unix: now_s + self.cfg.quote_valid_sec,
                swap_channel: None,
                invitee_pubkey: env.signer.clone(),
                lock_deadline_ms: now + self.cfg.swap_timeout_sec * 1000,
                created_at_ms: now,
                last_seen_ms: now,
            },
        );
        tracing::info!(trade_id = %env.trade_id, "quoted RFQ");
    }

    async fn handle_quote_accept(&mut self, env: &Envelope, quote_id: &str) {
        let now = now_ms();
        let trade_id = env.trade_id.clone();

        // An already-running swap means this accept is a retry: the
        // taker missed our invite or terms. Re-emit both, throttled.
        if let Some(swap) = self.swaps.get_mut(&trade_id) {
            if env.signer != swap.peer {
                return;
            }
            swap.peer_last_seen_ms = now;
            let floor = self.cfg.retry_resend_min_ms.max(5_000);
            if now.saturating_sub(swap.retry_last_ms) < floor {
                return;
            }
            swap.retry_last_ms = now;
            let invite = swap.invite_env.clone();
            let terms = swap.terms_env.clone();
            let channel = swap.channel.clone();
            tracing::info!(%trade_id, "re-sending invite and terms for retried accept");
            self.send_on(&self.cfg.rfq_channel.clone(), &invite).await;
            self.send_on(&channel, &terms).await;
            return;
        }

        let Some((key, lock)) = self.locks.find_by_trade(&trade_id) else {
            tracing::debug!(%trade_id, "accept for unknown or pruned quote");
            return;
        };
        // Only the peer that posted the RFQ may accept its quote.
        if env.signer != key.signer {
            tracing::debug!(%trade_id, "accept signer differs from RFQ signer");
            return;
        }
        if lock.quote_id != quote_id {
            tracing::debug!(%trade_id, "accept references a superseded quote");
            return;
        }
        if lock.state != LockState::Quoted {
            return;
        }

        let key = key.clone();
        let quote = lock.signed_quote.clone();
        let EnvelopeBody::Quote(quote_body) = quote.body.clone() else {
            return;
        };
        {
            let lock = self.locks.get_mut(&key).expect("lock present");
            lock.state = LockState::Accepting;
            lock.last_seen_ms = now;
        }

        let channel = swap_channel(&trade_id);
        let invite = crate::transport::invite::sign_invite(
            &self.keys,
            &env.signer,
            now + self.cfg.invite_valid_ms,
        );
        if let Err(err) = self.transport.join(&channel, JoinOptions::welcome()).await {
            tracing::warn!(%trade_id, error = %err, "failed to open swap channel");
            if let Some(lock) = self.locks.get_mut(&key) {
                lock.state = LockState::Quoted;
            }
            return;
        }
        let _ = self.transport.subscribe(&[channel.clone()]).await;
        self.tracker.mark_active(&channel);
        self.tracker
            .track_invite(&channel, invite.payload.expires_at);

        let invite_env = self.keys.seal(
            &trade_id,
            EnvelopeBody::SwapInvite(crate::protocol::SwapInviteBody {
                quote_id: quote_id.to_string(),
                channel: channel.clone(),
                invite,
            }),
        );
        self.send_on(&self.cfg.rfq_channel.clone(), &invite_env).await;

        let terms = TermsBody {
            pair: quote_body.pair.clone(),
            direction: quote_body.direction,
            app_hash: quote_body.app_hash.clone(),
            btc_sats: quote_body.btc_sats,
            usdt_amount: quote_body.usdt_amount.clone(),
            usdt_decimals: quote_body.usdt_decimals,
            sol_mint: quote_body.sol_mint.clone(),
            sol_recipient: key.sol_recipient.clone(),
            sol_refund: self.cfg.sol_refund.clone(),
            sol_refund_after_unix: now_unix() + quote_body.sol_refund_window_sec as i64,
            platform_fee_bps: quote_body.platform_fee_bps,
            platform_fee_collector: quote_body.platform_fee_collector.clone(),
            trade_fee_bps: quote_body.trade_fee_bps,
            trade_fee_collector: quote_body.trade_fee_collector.clone(),
            ln_receiver_peer: self.keys.pubkey_hex(),
            ln_payer_peer: env.signer.clone(),
            terms_valid_until_unix: now_unix() + self.cfg.quote_valid_sec,
        };
        let terms_env = self
            .keys
            .seal(&trade_id, EnvelopeBody::Terms(terms.clone()));

        let mut state = initial(&trade_id);
        if let Err(err) = state.apply(&terms_env) {
            tracing::error!(%trade_id, error = %err, "own terms rejected by state machine");
            return;
        }

        self.upsert(
            &trade_id,
            TradePatch {
                state: Some(state.phase.as_str().to_string()),
                role: Some("maker".into()),
                counterparty: Some(env.signer.clone()),
                terms_json: serde_json::to_string(&terms).ok(),
                ..TradePatch::default()
            },
        );
        self.append_event(&trade_id, "swap.terms_posted", serde_json::json!({ "channel": channel }));

        self.send_on(&channel, &terms_env).await;

        let mut pacer = ResendPacer::default();
        pacer.mark(EnvelopeKind::Terms, now);
        self.swaps.insert(
            trade_id.clone(),
            MakerSwap {
                channel,
                peer: env.signer.clone(),
                lock_key: key.clone(),
                state,
                invite_env,
                terms_env,
                terms,
                ln_invoice_env: None,
                escrow_env: None,
                payment_hash: None,
                deadline_ms: now + self.cfg.swap_timeout_sec * 1000,
                peer_last_seen_ms: now,
                retry_last_ms: now,
                pacer,
            },
        );
        if let Some(lock) = self.locks.get_mut(&key) {
            lock.state = LockState::Swapping;
            lock.swap_channel = Some(swap_channel(&trade_id));
        }
        tracing::info!(%trade_id, "swap started");
    }

    async fn handle_swap_msg(&mut self, env: Envelope) {
        let trade_id = env.trade_id.clone();
        let Some(swap) = self.swaps.get_mut(&trade_id) else {
            return;
        };
        if env.signer != swap.peer {
            tracing::debug!(%trade_id, "swap message from a non-participant");
            return;
        }
        swap.peer_last_seen_ms = now_ms();

        // The taker joined but has not seen TERMS yet; converge by
        // re-sending rather than waiting a full resend period.
        if env.kind == EnvelopeKind::Status && swap.state.phase == TradePhase::Terms {
            let terms = swap.terms_env.clone();
            let channel = swap.channel.clone();
            self.send_on(&channel, &terms).await;
            return;
        }

        let applied = match swap.state.apply(&env) {
            Ok(crate::protocol::state::Applied::Advanced) => true,
            Ok(crate::protocol::state::Applied::Duplicate) => false,
            Err(err) => {
                tracing::debug!(%trade_id, kind = ?env.kind, error = %err, "envelope rejected");
                return;
            }
        };
        if !applied {
            return;
        }
        let phase = swap.state.phase;
        let claim_tx_sig = swap.state.claim_tx_sig.clone();

        match &env.body {
            EnvelopeBody::Accept(_) => {
                self.upsert(
                    &trade_id,
                    TradePatch {
                        state: Some(TradePhase::Accepted.as_str().into()),
                        ..TradePatch::default()
                    },
                );
                self.append_event(&trade_id, "swap.accepted", serde_json::json!({}));
                self.settle(&trade_id).await;
            }
            EnvelopeBody::Status(status) => {
                if status.ln_paid == Some(true) && phase == TradePhase::Escrow {
                    self.upsert(
                        &trade_id,
                        TradePatch {
                            ln_paid: Some(true),
                            ..TradePatch::default()
                        },
                    );
                    self.append_event(&trade_id, "swap.ln_paid", serde_json::json!({}));
                }
                if phase == TradePhase::Claimed {
                    self.finish(
                        &trade_id,
                        TradePhase::Claimed,
                        TradePatch {
                            state: Some(TradePhase::Claimed.as_str().into()),
                            claim_tx_sig,
                            ..TradePatch::default()
                        },
                    )
                    .await;
                }
            }
            EnvelopeBody::Cancel(body) => {
                tracing::info!(%trade_id, reason = %body.reason, "trade canceled by peer");
                self.finish(
                    &trade_id,
                    TradePhase::Canceled,
                    TradePatch {
                        state: Some(TradePhase::Canceled.as_str().into()),
                        last_error: Some(format!("peer_cancel: {}", body.reason)),
                        ..TradePatch::default()
                    },
                )
                .await;
            }
            _ => {}
        }
    }

    /// ACCEPT observed: create the Lightning invoice, then the on-chain
    /// escrow, persisting each step before it is broadcast.
    async fn settle(&mut self, trade_id: &str) {
        let Some(swap) = self.swaps.get(trade_id) else {
            return;
        };
        let terms = swap.terms.clone();
        let channel = swap.channel.clone();

        let invoice_env = if let Some(env) = self.swaps[trade_id].ln_invoice_env.clone() {
            env
        } else {
            let amount_msat = terms.btc_sats * 1000;
            let created = match self
                .ln
                .invoice(
                    amount_msat,
                    &format!("swap:{trade_id}"),
                    &format!("{} {} sats", terms.pair, terms.btc_sats),
                    self.cfg.invoice_expiry_sec,
                )
                .await
            {
                Ok(created) => created,
                Err(err) => {
                    tracing::warn!(%trade_id, error = %err, "invoice creation failed");
                    self.upsert(
                        trade_id,
                        TradePatch {
                            last_error: Some(format!("ln_invoice_failed: {err:#}")),
                            ..TradePatch::default()
                        },
                    );
                    return;
                }
            };
            let env = self.keys.seal(
                trade_id,
                EnvelopeBody::LnInvoice(LnInvoiceBody {
                    bolt11: created.bolt11.clone(),
                    payment_hash_hex: created.payment_hash_hex.clone(),
                    amount_msat: created.amount_msat,
                    expires_at_unix: created.expires_at_unix,
                }),
            );
            self.upsert(
                trade_id,
                TradePatch {
                    state: Some(TradePhase::Invoice.as_str().into()),
                    bolt11: Some(created.bolt11.clone()),
                    payment_hash_hex: Some(created.payment_hash_hex.clone()),
                    amount_msat: Some(created.amount_msat),
                    ..TradePatch::default()
                },
            );
            self.append_event(
                trade_id,
                "swap.invoice_created",
                serde_json::json!({ "payment_hash_hex": created.payment_hash_hex }),
            );
            env
        };

        {
            let swap = self.swaps.get_mut(trade_id).expect("swap present");
            if swap.ln_invoice_env.is_none() {
                if let Err(err) = swap.state.apply(&invoice_env) {
                    tracing::error!(%trade_id, error = %err, "own invoice rejected");
                    return;
                }
                swap.ln_invoice_env = Some(invoice_env.clone());
                let EnvelopeBody::LnInvoice(body) = &invoice_env.body else {
                    return;
                };
                let mut hash = [0u8; 32];
                if let Ok(bytes) = hex::decode(&body.payment_hash_hex)
                    && bytes.len() == 32
                {
                    hash.copy_from_slice(&bytes);
                }
                swap.payment_hash = Some(hash);
                swap.pacer.mark(EnvelopeKind::LnInvoice, now_ms());
            }
        }
        self.send_on(&channel, &invoice_env).await;

        self.create_escrow(trade_id).await;
    }

    async fn create_escrow(&mut self, trade_id: &str) {
        let Some(swap) = self.swaps.get(trade_id) else {
            return;
        };
        if swap.escrow_env.is_some() || swap.state.phase != TradePhase::Invoice {
            return;
        }
        let Some(payment_hash) = swap.payment_hash else {
            return;
        };
        let terms = swap.terms.clone();
        let channel = swap.channel.clone();

        let (Ok(mint), Ok(recipient), Ok(refund), Ok(payer_token)) = (
            Pubkey::from_str(&terms.sol_mint),
            Pubkey::from_str(&terms.sol_recipient),
            Pubkey::from_str(&terms.sol_refund),
            Pubkey::from_str(&self.cfg.maker_token_account),
        ) else {
            tracing::error!(%trade_id, "terms carry unparseable pubkeys");
            return;
        };
        let Ok(net_amount) = amount_units(&terms.usdt_amount) else {
            return;
        };

        // Durable intent first: a crash between submit and broadcast is
        // recovered from the receipts store plus chain state.
        self.append_event(
            trade_id,
            "escrow.intent",
            serde_json::json!({
                "payment_hash_hex": hex::encode(payment_hash),
                "net_amount": terms.usdt_amount,
                "refund_after_unix": terms.sol_refund_after_unix,
            }),
        );

        let result = self
            .chain
            .create_escrow(CreateEscrowArgs {
                payer_token_account: payer_token,
                mint,
                payment_hash,
                recipient,
                refund,
                refund_after_unix: terms.sol_refund_after_unix,
                net_amount,
                expected_platform_fee_bps: terms.platform_fee_bps,
                expected_trade_fee_bps: terms.trade_fee_bps,
            })
            .await;

        let tx_sig = match result {
            Ok(tx_sig) => tx_sig,
            Err(err) => {
                tracing::warn!(%trade_id, error = %err, "escrow creation failed, lock rolled back");
                self.upsert(
                    trade_id,
                    TradePatch {
                        last_error: Some(format!("chain_submit_failed: {err:#}")),
                        ..TradePatch::default()
                    },
                );
                let key = self.swaps[trade_id].lock_key.clone();
                if let Some(lock) = self.locks.get_mut(&key) {
                    lock.state = LockState::Quoted;
                }
                return;
            }
        };

        self.upsert(
            trade_id,
            TradePatch {
                state: Some(TradePhase::Escrow.as_str().into()),
                escrow_tx_sig: Some(tx_sig.clone()),
                ..TradePatch::default()
            },
        );
        self.append_event(trade_id, "escrow.created", serde_json::json!({ "tx_sig": tx_sig }));

        let program_id = self.chain.program_id();
        let (escrow_pda, _) = derive_escrow_pda(&payment_hash, &program_id);
        let vault = derive_vault_ata(&escrow_pda, &mint);
        let escrow_env = self.keys.seal(
            trade_id,
            EnvelopeBody::SolEscrowCreated(EscrowCreatedBody {
                program_id: program_id.to_string(),
                escrow_pda: escrow_pda.to_string(),
                vault_ata: vault.to_string(),
                mint: terms.sol_mint.clone(),
                amount: terms.usdt_amount.clone(),
                payment_hash_hex: hex::encode(payment_hash),
                refund_after_unix: terms.sol_refund_after_unix,
                recipient: terms.sol_recipient.clone(),
                refund: terms.sol_refund.clone(),
                platform_fee_bps: terms.platform_fee_bps,
                trade_fee_bps: terms.trade_fee_bps,
                tx_sig,
            }),
        );

        {
            let swap = self.swaps.get_mut(trade_id).expect("swap present");
            if let Err(err) = swap.state.apply(&escrow_env) {
                tracing::error!(%trade_id, error = %err, "own escrow envelope rejected");
                return;
            }
            swap.escrow_env = Some(escrow_env.clone());
            swap.pacer.mark(EnvelopeKind::SolEscrowCreated, now_ms());
        }
        self.send_on(&channel, &escrow_env).await;
        tracing::info!(%trade_id, "escrow funded and announced");
    }

    async fn tick(&mut self) {
        let now = now_ms();
        let trade_ids: Vec<String> = self.swaps.keys().cloned().collect();

        for trade_id in trade_ids {
            let Some(swap) = self.swaps.get(&trade_id) else {
                continue;
            };
            let phase = swap.state.phase;

            if phase.is_terminal() {
                continue;
            }

            if now >= swap.deadline_ms {
                self.timeout(&trade_id).await;
                continue;
            }

            // Stalled invoice creation (earlier LN failure): retry.
            if phase == TradePhase::Accepted {
                let floor = resend_floor_ms(
                    now,
                    swap.peer_last_seen_ms,
                    self.cfg.resend_base_ms,
                    self.cfg.resend_widened_ms,
                    self.cfg.peer_silent_after_ms,
                );
                if swap.pacer.due(EnvelopeKind::LnInvoice, now, floor) {
                    self.swaps
                        .get_mut(&trade_id)
                        .expect("swap present")
                        .pacer
                        .mark(EnvelopeKind::LnInvoice, now);
                    self.settle(&trade_id).await;
                }
                continue;
            }

            // Stalled escrow creation (earlier chain failure): retry.
            if phase == TradePhase::Invoice && swap.escrow_env.is_none() {
                let floor = resend_floor_ms(
                    now,
                    swap.peer_last_seen_ms,
                    self.cfg.resend_base_ms,
                    self.cfg.resend_widened_ms,
                    self.cfg.peer_silent_after_ms,
                );
                if swap.pacer.due(EnvelopeKind::SolEscrowCreated, now, floor) {
                    if let Some((_, lock)) = self.locks.find_by_trade_mut(&trade_id) {
                        lock.state = LockState::Swapping;
                    }
                    self.swaps
                        .get_mut(&trade_id)
                        .expect("swap present")
                        .pacer
                        .mark(EnvelopeKind::SolEscrowCreated, now);
                    self.create_escrow(&trade_id).await;
                }
                continue;
            }

            if phase == TradePhase::Escrow {
                self.maybe_refund(&trade_id).await;
            }

            let Some(swap) = self.swaps.get_mut(&trade_id) else {
                continue;
            };
            let floor = resend_floor_ms(
                now,
                swap.peer_last_seen_ms,
                self.cfg.resend_base_ms,
                self.cfg.resend_widened_ms,
                self.cfg.peer_silent_after_ms,
            );
            let mut resend: Vec<(EnvelopeKind, Envelope)> = Vec::new();
            match swap.state.phase {
                TradePhase::Terms => {
                    resend.push((EnvelopeKind::Terms, swap.terms_env.clone()));
                }
                // Resend the invoice alongside the escrow: a taker that
                // lost LN_INVOICE rejects SOL_ESCROW_CREATED as early
                // until it has caught up.
                TradePhase::Escrow => {
                    if let Some(env) = swap.ln_invoice_env.clone() {
                        resend.push((EnvelopeKind::LnInvoice, env));
                    }
                    if let Some(env) = swap.escrow_env.clone() {
                        resend.push((EnvelopeKind::SolEscrowCreated, env));
                    }
                }
                _ => {}
            }
            let channel = swap.channel.clone();
            let due: Vec<(EnvelopeKind, Envelope)> = resend
                .into_iter()
                .filter(|(kind, _)| swap.pacer.due(*kind, now, floor))
                .collect();
            for (kind, env) in due {
                self.swaps
                    .get_mut(&trade_id)
                    .expect("swap present")
                    .pacer
                    .mark(kind, now);
                tracing::debug!(%trade_id, ?kind, "resending");
                self.send_on(&channel, &env).await;
            }
        }
    }

    /// Past the refund timer with no claim observed: reclaim the escrow
    /// and publish the terminal status.
    async fn maybe_refund(&mut self, trade_id: &str) {
        let Some(swap) = self.swaps.get(trade_id) else {
            return;
        };
        let Some(payment_hash) = swap.payment_hash else {
            return;
        };
        let terms = swap.terms.clone();
        let channel = swap.channel.clone();

        let chain_now = match self.chain.now_unix().await {
            Ok(now) => now,
            Err(_) => return,
        };
        if chain_now < terms.sol_refund_after_unix {
            return;
        }

        let (Ok(mint), Ok(refund_token)) = (
            Pubkey::from_str(&terms.sol_mint),
            Pubkey::from_str(&self.cfg.maker_token_account),
        ) else {
            return;
        };

        match self
            .chain
            .refund_escrow(RefundEscrowArgs {
                refund_token_account: refund_token,
                mint,
                payment_hash,
            })
            .await
        {
            Ok(tx_sig) => {
                let status_env = self.keys.seal(
                    trade_id,
                    EnvelopeBody::Status(StatusBody {
                        refunded: Some(true),
                        tx_sig: Some(tx_sig.clone()),
                        ..StatusBody::default()
                    }),
                );
                if let Some(swap) = self.swaps.get_mut(trade_id)
                    && let Err(err) = swap.state.apply(&status_env)
                {
                    tracing::error!(%trade_id, error = %err, "own refund status rejected");
                }
                self.send_on(&channel, &status_env).await;
                self.finish(
                    trade_id,
                    TradePhase::Refunded,
                    TradePatch {
                        state: Some(TradePhase::Refunded.as_str().into()),
                        refund_tx_sig: Some(tx_sig),
                        ..TradePatch::default()
                    },
                )
                .await;
            }
            Err(err) => {
                tracing::warn!(%trade_id, error = %err, "refund attempt failed");
            }
        }
    }

    async fn timeout(&mut self, trade_id: &str) {
        let Some(swap) = self.swaps.get_mut(trade_id) else {
            return;
        };
        tracing::warn!(%trade_id, "swap timed out");
        let channel = swap.channel.clone();
        let cancel_env = self.keys.seal(
            trade_id,
            EnvelopeBody::Cancel(CancelBody {
                reason: "swap_timeout".into(),
            }),
        );
        // Only accepted pre-escrow; past that the refund timer owns the
        // exit and this instance just stops driving the trade.
        let _ = swap.state.apply(&cancel_env);
        self.send_on(&channel, &cancel_env).await;

        let phase = self.swaps[trade_id].state.phase;
        self.finish(
            trade_id,
            phase,
            TradePatch {
                state: Some(phase.as_str().into()),
                last_error: Some("swap_timeout".into()),
                ..TradePatch::default()
            },
        )
        .await;
    }

    async fn finish(&mut self, trade_id: &str, terminal: TradePhase, patch: TradePatch) {
        self.upsert(trade_id, patch);
        self.append_event(
            trade_id,
            "swap.terminal",
            serde_json::json!({ "state": terminal.as_str() }),
        );
        if let Some(swap) = self.swaps.get_mut(trade_id) {
            swap.pacer.clear();
            let channel = swap.channel.clone();
            self.tracker.mark_terminal(&channel);
            let _ = self.transport.leave(&channel).await;
        }
        self.locks.remove_by_trade(trade_id);
        self.swaps.remove(trade_id);
    }

    async fn announce(&mut self) {
        if !self.cfg.enable_settlement {
            return;
        }
        let body = SvcAnnounceBody {
            pair: self.cfg.pair.clone(),
            app_hash: self.cfg.app_hash.clone(),
            platform_fee_bps: self.cfg.platform_fee_bps,
            trade_fee_bps: self.cfg.trade_fee_bps,
            min_btc_sats: self.cfg.min_btc_sats,
            max_btc_sats: self.cfg.max_btc_sats,
        };
        let env = self.keys.seal("svc", EnvelopeBody::SvcAnnounce(body));
        self.send_on(&self.cfg.rfq_channel.clone(), &env).await;
    }

    async fn stop(&mut self, reason: &str) {
        tracing::info!(reason, "maker stopping");
        let trade_ids: Vec<String> = self.swaps.keys().cloned().collect();
        for trade_id in trade_ids {
            self.append_event(&trade_id, "shutdown", serde_json::json!({ "reason": reason }));
            if let Some(swap) = self.swaps.get(&trade_id) {
                let channel = swap.channel.clone();
                let _ = self.transport.leave(&channel).await;
            }
        }
        let _ = self.transport.leave(&self.cfg.rfq_channel).await;
        self.swaps.clear();
    }

    async fn send_on(&self, channel: &str, env: &Envelope) {
        // Send errors are absorbed; the resend cadence retries them.
        if let Err(err) = self.transport.send(channel, &env.to_wire_json()).await {
            tracing::debug!(%channel, kind = ?env.kind, error = %err, "send failed");
        }
    }

    fn upsert(&self, trade_id: &str, patch: TradePatch) {
        let mut store = self.store.lock().expect("store mutex poisoned");
        if let Err(err) = store.upsert_trade(trade_id, &patch, now_ms()) {
            tracing::error!(%trade_id, error = %err, "receipts upsert failed");
        }
    }

    fn append_event(&self, trade_id: &str, kind: &str, payload: serde_json::Value) {
        let mut store = self.store.lock().expect("store mutex poisoned");
        if let Err(err) = store.append_event(trade_id, kind, &payload, now_ms()) {
            tracing::error!(%trade_id, error = %err, "receipts event failed");
        }
    }
}
