use std::collections::HashMap;
use std::str::FromStr as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use solana_sdk::pubkey::Pubkey;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::hygiene::ChannelTracker;
use super::{resend_floor_ms, ResendPacer, TakerConfig};
use crate::lightning::{sha256_preimage, LightningClient};
use crate::protocol::envelope::{hash_unsigned, hash_unsigned_hex, now_ms, now_unix, PeerKeypair};
use crate::protocol::state::{initial, TradePhase, TradeState};
use crate::protocol::validate::{expect_ref, Validator};
use crate::protocol::{
    swap_channel, CancelBody, Envelope, EnvelopeBody, EnvelopeKind, QuoteBody, RfqBody,
    StatusBody, SwapDirection, SwapInviteBody, TermsBody,
};
use crate::receipts::{ReceiptsStore, TradePatch};
use crate::solana::{verify_escrow_on_chain, ClaimEscrowArgs, EscrowChain, EscrowCheck};
use crate::transport::{InboundMessage, JoinOptions, Sidechannel};

const TERMINAL_RESEND_WINDOW_MS: u64 = 60_000;

/// What the taker wants swapped; everything else comes from
/// [`TakerConfig`].
#[derive(Debug, Clone)]
pub struct RfqParams {
    pub pair: String,
    pub btc_sats: u64,
    pub usdt_amount: String,
    pub usdt_decimals: u8,
    pub sol_mint: String,
    pub valid_for_sec: i64,
}

struct TakerTrade {
    state: TradeState,
    rfq_env: Envelope,
    rfq_body: RfqBody,
    latest_quote: Option<Envelope>,
    quote_accept_env: Option<Envelope>,
    maker: Option<String>,
    channel: Option<String>,
    joined: bool,
    waiting_terms_since_ms: Option<u64>,
    last_ping_ms: u64,
    pings_sent: u32,
    preimage: Option<[u8; 32]>,
    claim_failed_fatal: bool,
    terminal_status_env: Option<Envelope>,
    terminal_at_ms: Option<u64>,
    deadline_ms: u64,
    peer_last_seen_ms: u64,
    pacer: ResendPacer,
}

/// Join-invite → accept-terms → pay → claim control loop, plus the
/// waiting-terms recovery that re-asserts a possibly-missed accept.
pub struct Taker {
    cfg: TakerConfig,
    keys: PeerKeypair,
    validator: Validator,
    transport: Arc<dyn Sidechannel>,
    ln: Arc<dyn LightningClient>,
    chain: Arc<dyn EscrowChain>,
    store: Arc<Mutex<ReceiptsStore>>,
    tracker: Arc<ChannelTracker>,
    inbound: mpsc::UnboundedReceiver<InboundMessage>,
    trades: HashMap<String, TakerTrade>,
}

impl Taker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: TakerConfig,
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
            trades: HashMap::new(),
        }
    }

    /// Post an RFQ on the public channel and start tracking the trade.
    /// Returns the freshly minted `trade_id`.
    pub async fn request_swap(&mut self, params: RfqParams) -> Result<String> {
        let trade_id = Uuid::new_v4().to_string();
        let body = RfqBody {
            pair: params.pair,
            direction: SwapDirection::LnToSpl,
            app_hash: self.cfg.app_hash.clone(),
            btc_sats: params.btc_sats,
            usdt_amount: params.usdt_amount,
            usdt_decimals: params.usdt_decimals,
            sol_mint: params.sol_mint,
            sol_recipient: self.cfg.sol_recipient.clone(),
            max_platform_fee_bps: self.cfg.max_platform_fee_bps,
            max_trade_fee_bps: self.cfg.max_trade_fee_bps,
            max_total_fee_bps: self.cfg.max_total_fee_bps,
            min_sol_refund_window_sec: self.cfg.min_sol_refund_window_sec,
            max_sol_refund_window_sec: self.cfg.max_sol_refund_window_sec,
            valid_until_unix: now_unix() + params.valid_for_sec,
        };
        let env = self.keys.seal(&trade_id, EnvelopeBody::Rfq(body.clone()));

        self.upsert(
            &trade_id,
            TradePatch {
                state: Some(TradePhase::New.as_str().into()),
                role: Some("taker".into()),
                ..TradePatch::default()
            },
        );
        self.append_event(&trade_id, "rfq.posted", serde_json::json!({ "btc_sats": body.btc_sats }));

        self.send_on(&self.cfg.rfq_channel.clone(), &env).await;

        let now = now_ms();
        let mut pacer = ResendPacer::default();
        pacer.mark(EnvelopeKind::Rfq, now);
        self.trades.insert(
            trade_id.clone(),
            TakerTrade {
                state: initial(&trade_id),
                rfq_env: env,
                rfq_body: body,
                latest_quote: None,
                quote_accept_env: None,
                maker: None,
                channel: None,
                joined: false,
                waiting_terms_since_ms: None,
                last_ping_ms: 0,
                pings_sent: 0,
                preimage: None,
                claim_failed_fatal: false,
                terminal_status_env: None,
                terminal_at_ms: None,
                deadline_ms: now + self.cfg.swap_timeout_sec * 1000,
                peer_last_seen_ms: now,
                pacer,
            },
        );
        Ok(trade_id)
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

        let mut tick = tokio::time::interval(Duration::from_millis(self.cfg.tick_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

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
                EnvelopeBody::Quote(body) => self.handle_quote(&env, &body).await,
                EnvelopeBody::SwapInvite(body) => self.handle_invite(&env, &body).await,
                _ => {}
            }
        } else if msg.channel == swap_channel(&env.trade_id) {
            self.handle_swap_msg(env).await;
        }
    }

    async fn handle_quote(&mut self, env: &Envelope, body: &QuoteBody) {
        let trade_id = env.trade_id.clone();
        let Some(trade) = self.trades.get_mut(&trade_id) else {
            return;
        };
        if trade.state.phase != TradePhase::New {
            return;
        }
        if expect_ref("rfq_id", &body.rfq_id, hash_unsigned(&trade.rfq_env)).is_err() {
            tracing::debug!(%trade_id, "quote references a different RFQ");
            return;
        }
        if body.app_hash != self.cfg.app_hash {
            return;
        }
        if body.btc_sats != trade.rfq_body.btc_sats
            || body.usdt_amount != trade.rfq_body.usdt_amount
            || body.sol_mint != trade.rfq_body.sol_mint
        {
            tracing::debug!(%trade_id, "quote amounts differ from our RFQ");
            return;
        }
        if body.valid_until_unix <= now_unix() {
            return;
        }
        if let Err(reason) = self.check_fee_caps(
            body.platform_fee_bps,
            body.trade_fee_bps,
            body.sol_refund_window_sec,
        ) {
            tracing::info!(%trade_id, reason, "quote outside our caps, ignoring");
            return;
        }

        let trade = self.trades.get_mut(&trade_id).expect("trade present");
        let quote_id = hash_unsigned_hex(env);
        let is_new_quote = trade
            .latest_quote
            .as_ref()
            .map(hash_unsigned_hex)
            .as_deref()
            != Some(quote_id.as_str());
        trade.latest_quote = Some(env.clone());
        trade.maker = Some(env.signer.clone());
        trade.peer_last_seen_ms = now_ms();

        if is_new_quote {
            let accept = self.keys.seal(
                &trade_id,
                EnvelopeBody::QuoteAccept(crate::protocol::QuoteAcceptBody {
                    quote_id: quote_id.clone(),
                }),
            );
            let trade = self.trades.get_mut(&trade_id).expect("trade present");
            trade.quote_accept_env = Some(accept.clone());
            // Fresh quote resets the waiting-terms ping budget; replays
            // must always carry the latest quote id.
            trade.waiting_terms_since_ms = Some(now_ms());
            trade.pings_sent = 0;
            trade.last_ping_ms = now_ms();

            self.append_event(&trade_id, "quote.accepted", serde_json::json!({ "quote_id": quote_id }));
            self.send_on(&self.cfg.rfq_channel.clone(), &accept).await;
        }
    }

    async fn handle_invite(&mut self, env: &Envelope, body: &SwapInviteBody) {
        let trade_id = env.trade_id.clone();
        let Some(trade) = self.trades.get_mut(&trade_id) else {
            return;
        };
        if body.invite.payload.invitee_pub_key != self.keys.pubkey_hex() {
            return;
        }
        if let Some(maker) = &trade.maker
            && maker != &env.signer
        {
            tracing::debug!(%trade_id, "invite from an unexpected maker");
            return;
        }

        trade.peer_last_seen_ms = now_ms();
        trade.channel = Some(body.channel.clone());
        self.tracker
            .track_invite(&body.channel, body.invite.payload.expires_at);

        if now_ms() >= body.invite.payload.expires_at {
            tracing::info!(%trade_id, "invite already expired; hygiene will clean up");
            return;
        }
        if self.trades[&trade_id].joined {
            return;
        }

        match self
            .transport
            .join(&body.channel, JoinOptions::with_invite(body.invite.clone()))
            .await
        {
            Ok(()) => {
                let _ = self.transport.subscribe(&[body.channel.clone()]).await;
                self.tracker.mark_active(&body.channel);
                let trade = self.trades.get_mut(&trade_id).expect("trade present");
                trade.joined = true;
                self.append_event(&trade_id, "swap.joined", serde_json::json!({ "channel": body.channel }));
            }
            Err(err) => {
                tracing::warn!(%trade_id, error = %err, "swap channel join failed");
            }
        }
    }

    async fn handle_swap_msg(&mut self, env: Envelope) {
        let trade_id = env.trade_id.clone();
        let Some(trade) = self.trades.get_mut(&trade_id) else {
            return;
        };
        if let Some(maker) = &trade.maker
            && maker != &env.signer
        {
            return;
        }
        trade.peer_last_seen_ms = now_ms();

        let applied = match trade.state.apply(&env) {
            Ok(crate::protocol::state::Applied::Advanced) => true,
            Ok(crate::protocol::state::Applied::Duplicate) => false,
            Err(err) => {
                tracing::debug!(%trade_id, kind = ?env.kind, error = %err, "envelope rejected");
                return;
            }
        };
        if !applied {
            // A duplicate escrow announcement while we already claimed
            // means the maker missed our terminal status; repeat it.
            if env.kind == EnvelopeKind::SolEscrowCreated {
                let resend = self.trades[&trade_id].terminal_status_env.clone();
                if let Some(status) = resend {
                    let channel = swap_channel(&trade_id);
                    self.send_on(&channel, &status).await;
                }
            }
            return;
        }

        match env.body.clone() {
            EnvelopeBody::Terms(terms) => self.handle_terms(&trade_id, &env, &terms).await,
            EnvelopeBody::LnInvoice(_) => {
                let trade = self.trades.get_mut(&trade_id).expect("trade present");
                let invoice = trade.state.ln_invoice.clone();
                self.upsert(
                    &trade_id,
                    TradePatch {
                        state: Some(TradePhase::Invoice.as_str().into()),
                        bolt11: invoice.as_ref().map(|i| i.bolt11.clone()),
                        payment_hash_hex: invoice.as_ref().map(|i| i.payment_hash_hex.clone()),
                        amount_msat: invoice.as_ref().map(|i| i.amount_msat),
                        ..TradePatch::default()
                    },
                );
            }
            EnvelopeBody::SolEscrowCreated(_) => {
                self.upsert(
                    &trade_id,
                    TradePatch {
                        state: Some(TradePhase::Escrow.as_str().into()),
                        ..TradePatch::default()
                    },
                );
                self.append_event(&trade_id, "escrow.observed", serde_json::json!({}));
                self.verify_and_pay(&trade_id).await;
            }
            EnvelopeBody::Status(_) => {
                let phase = self.trades[&trade_id].state.phase;
                if phase == TradePhase::Refunded {
                    let refund_tx_sig = self.trades[&trade_id].state.refund_tx_sig.clone();
                    self.finish(
                        &trade_id,
                        TradePatch {
                            state: Some(TradePhase::Refunded.as_str().into()),
                            refund_tx_sig,
                            last_error: Some("maker_refunded".into()),
                            ..TradePatch::default()
                        },
                    )
                    .await;
                }
            }
            EnvelopeBody::Cancel(body) => {
                tracing::info!(%trade_id, reason = %body.reason, "trade canceled by maker");
                self.finish(
                    &trade_id,
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

    async fn handle_terms(&mut self, trade_id: &str, env: &Envelope, terms: &TermsBody) {
        // TERMS arrived; waiting-terms recovery is over.
        {
            let trade = self.trades.get_mut(trade_id).expect("trade present");
            trade.waiting_terms_since_ms = None;
        }

        let caps_violation = self
            .check_fee_caps(
                terms.platform_fee_bps,
                terms.trade_fee_bps,
                (terms.sol_refund_after_unix - now_unix()).max(0) as u64,
            )
            .err()
            .or_else(|| {
                let trade = &self.trades[trade_id];
                if terms.sol_recipient != self.cfg.sol_recipient {
                    Some("terms name a different recipient")
                } else if terms.sol_mint != trade.rfq_body.sol_mint
                    || terms.usdt_amount != trade.rfq_body.usdt_amount
                    || terms.btc_sats != trade.rfq_body.btc_sats
                {
                    Some("terms amounts differ from our RFQ")
                } else if terms.app_hash != self.cfg.app_hash {
                    Some("terms bind a different deployment")
                } else if terms.ln_payer_peer != self.keys.pubkey_hex() {
                    Some("terms name a different LN payer")
                } else {
                    None
                }
            });

        if let Some(reason) = caps_violation {
            tracing::warn!(%trade_id, reason, "terms rejected, canceling");
            self.cancel_trade(trade_id, reason).await;
            return;
        }

        let accept = self.keys.seal(
            trade_id,
            EnvelopeBody::Accept(crate::protocol::AcceptBody {
                terms_hash: hash_unsigned_hex(env),
            }),
        );
        {
            let trade = self.trades.get_mut(trade_id).expect("trade present");
            if let Err(err) = trade.state.apply(&accept) {
                tracing::error!(%trade_id, error = %err, "own accept rejected");
                return;
            }
            trade.pacer.mark(EnvelopeKind::Accept, now_ms());
        }

        self.upsert(
            trade_id,
            TradePatch {
                state: Some(TradePhase::Accepted.as_str().into()),
                counterparty: Some(env.signer.clone()),
                terms_json: serde_json::to_string(terms).ok(),
                ..TradePatch::default()
            },
        );
        self.append_event(trade_id, "terms.accepted", serde_json::json!({}));

        let channel = swap_channel(trade_id);
        self.send_on(&channel, &accept).await;
    }

    /// Escrow announced: verify it on chain, then pay the invoice and
    /// claim with the revealed preimage.
    async fn verify_and_pay(&mut self, trade_id: &str) {
        let Some(trade) = self.trades.get(trade_id) else {
            return;
        };
        let Some(escrow) = trade.state.sol_escrow.clone() else {
            return;
        };
        let Some(invoice) = trade.state.ln_invoice.clone() else {
            return;
        };
        let channel = swap_channel(trade_id);

        match verify_escrow_on_chain(self.chain.as_ref(), &escrow).await {
            Ok(EscrowCheck::Ok(_)) => {}
            Ok(EscrowCheck::Mismatch(what)) => {
                // The refund timer may have fired while we were still
                // retrying; that is a terminal outcome, not a lie.
                if self.escrow_was_refunded(&escrow).await {
                    tracing::info!(%trade_id, "escrow refunded on chain before payment");
                    self.finish(
                        trade_id,
                        TradePatch {
                            state: Some(TradePhase::Refunded.as_str().into()),
                            last_error: Some("maker_refunded".into()),
                            ..TradePatch::default()
                        },
                    )
                    .await;
                    return;
                }
                tracing::warn!(%trade_id, mismatch = %what, "escrow does not match, aborting before payment");
                self.cancel_trade(trade_id, "escrow_mismatch").await;
                return;
            }
            Err(err) => {
                tracing::warn!(%trade_id, error = %err, "escrow verification unavailable, will retry");
                return;
            }
        }
        self.append_event(trade_id, "escrow.verified", serde_json::json!({}));

        let preimage = if let Some(preimage) = self.trades[trade_id].preimage {
            preimage
        } else {
            let preimage = match self.ln.pay(&invoice.bolt11).await {
                Ok(preimage) => preimage,
                Err(err) => {
                    tracing::warn!(%trade_id, error = %err, "ln payment failed, will retry");
                    self.upsert(
                        trade_id,
                        TradePatch {
                            last_error: Some(format!("ln_pay_failed: {err:#}")),
                            ..TradePatch::default()
                        },
                    );
                    return;
                }
            };
            if hex::encode(sha256_preimage(&preimage)) != invoice.payment_hash_hex {
                tracing::error!(%trade_id, "node returned a preimage for a different hash");
                return;
            }

            self.upsert(
                trade_id,
                TradePatch {
                    ln_paid: Some(true),
                    ..TradePatch::default()
                },
            );
            self.append_event(trade_id, "ln.paid", serde_json::json!({}));

            let paid_status = self.keys.seal(
                trade_id,
                EnvelopeBody::Status(StatusBody {
                    ln_paid: Some(true),
                    ..StatusBody::default()
                }),
            );
            {
                let trade = self.trades.get_mut(trade_id).expect("trade present");
                trade.preimage = Some(preimage);
                let _ = trade.state.apply(&paid_status);
            }
            self.send_on(&channel, &paid_status).await;
            preimage
        };

        self.claim(trade_id, preimage).await;
    }

    async fn claim(&mut self, trade_id: &str, preimage: [u8; 32]) {
        let Some(trade) = self.trades.get(trade_id) else {
            return;
        };
        let Some(escrow) = trade.state.sol_escrow.clone() else {
            return;
        };
        let channel = swap_channel(trade_id);

        let (Ok(mint), Ok(recipient_token)) = (
            Pubkey::from_str(&escrow.mint),
            Pubkey::from_str(&self.cfg.taker_token_account),
        ) else {
            return;
        };
        let Ok(payment_hash) = hex::decode(&escrow.payment_hash_hex) else {
            return;
        };
        let Ok(payment_hash) = <[u8; 32]>::try_from(payment_hash) else {
            return;
        };

        let tx_sig = match self
            .chain
            .claim_escrow(ClaimEscrowArgs {
                recipient_token_account: recipient_token,
                mint,
                payment_hash,
                preimage,
            })
            .await
        {
            Ok(tx_sig) => tx_sig,
            Err(err) => {
                tracing::warn!(%trade_id, error = %err, "claim failed");
                self.upsert(
                    trade_id,
                    TradePatch {
                        last_error: Some(format!("claim_failed: {err:#}")),
                        ..TradePatch::default()
                    },
                );
                self.escalate_if_claim_window_closed(trade_id, &escrow).await;
                return;
            }
        };

        let status = self.keys.seal(
            trade_id,
            EnvelopeBody::Status(StatusBody {
                claimed: Some(true),
                tx_sig: Some(tx_sig.clone()),
                ..StatusBody::default()
            }),
        );
        {
            let trade = self.trades.get_mut(trade_id).expect("trade present");
            if let Err(err) = trade.state.apply(&status) {
                tracing::error!(%trade_id, error = %err, "own claim status rejected");
            }
            trade.terminal_status_env = Some(status.clone());
            trade.terminal_at_ms = Some(now_ms());
            trade.pacer.mark(EnvelopeKind::Status, now_ms());
        }
        self.send_on(&channel, &status).await;

        self.upsert(
            trade_id,
            TradePatch {
                state: Some(TradePhase::Claimed.as_str().into()),
                claim_tx_sig: Some(tx_sig.clone()),
                ..TradePatch::default()
            },
        );
        self.append_event(trade_id, "escrow.claimed", serde_json::json!({ "tx_sig": tx_sig }));
        self.tracker.mark_terminal(&channel);
        tracing::info!(%trade_id, %tx_sig, "claimed escrow");
    }

    async fn escrow_was_refunded(&self, escrow: &crate::protocol::EscrowCreatedBody) -> bool {
        let Ok(bytes) = hex::decode(&escrow.payment_hash_hex) else {
            return false;
        };
        let Ok(payment_hash) = <[u8; 32]>::try_from(bytes) else {
            return false;
        };
        matches!(
            self.chain.get_escrow_state(&payment_hash).await,
            Ok(Some(state)) if state.status == crate::solana::escrow::STATUS_REFUNDED
        )
    }

    /// The operator-visible worst case: LN is paid but the claim window
    /// has closed without a successful claim.
    async fn escalate_if_claim_window_closed(
        &mut self,
        trade_id: &str,
        escrow: &crate::protocol::EscrowCreatedBody,
    ) {
        let Ok(chain_now) = self.chain.now_unix().await else {
            return;
        };
        if chain_now < escrow.refund_after_unix {
            return;
        }
        let Some(trade) = self.trades.get_mut(trade_id) else {
            return;
        };
        if trade.claim_failed_fatal {
            return;
        }
        trade.claim_failed_fatal = true;
        tracing::error!(
            %trade_id,
            "FATAL: LN paid but claim did not land before the refund timer; operator action required"
        );
        self.upsert(
            trade_id,
            TradePatch {
                last_error: Some("claim_window_closed_after_ln_payment".into()),
                ..TradePatch::default()
            },
        );
        self.append_event(
            trade_id,
            "claim.window_closed",
            serde_json::json!({ "refund_after_unix": escrow.refund_after_unix }),
        );
    }

    async fn tick(&mut self) {
        let now = now_ms();
        let trade_ids: Vec<String> = self.trades.keys().cloned().collect();

        for trade_id in trade_ids {
            let Some(trade) = self.trades.get(&trade_id) else {
                continue;
            };
            let phase = trade.state.phase;

            if phase.is_terminal() {
                // Keep repeating the terminal status for a bounded
                // window, then retire the trade; the receipts store is
                // the durable record.
                if trade
                    .terminal_at_ms
                    .is_some_and(|at| now.saturating_sub(at) >= TERMINAL_RESEND_WINDOW_MS)
                {
                    self.trades.remove(&trade_id);
                    continue;
                }
                if let Some(status) = trade.terminal_status_env.clone() {
                    let floor = resend_floor_ms(
                        now,
                        trade.peer_last_seen_ms,
                        self.cfg.resend_base_ms,
                        self.cfg.resend_widened_ms,
                        self.cfg.peer_silent_after_ms,
                    );
                    if trade.joined && trade.pacer.due(EnvelopeKind::Status, now, floor) {
                        self.trades
                            .get_mut(&trade_id)
                            .expect("trade present")
                            .pacer
                            .mark(EnvelopeKind::Status, now);
                        let channel = swap_channel(&trade_id);
                        self.send_on(&channel, &status).await;
                    }
                }
                continue;
            }

            if now >= trade.deadline_ms {
                self.timeout(&trade_id).await;
                continue;
            }

            match phase {
                TradePhase::New => {
                    if trade.quote_accept_env.is_some() {
                        self.waiting_terms_tick(&trade_id, now).await;
                    } else if trade.pacer.due(EnvelopeKind::Rfq, now, self.cfg.rfq_resend_ms) {
                        // No quote yet; re-post the RFQ.
                        let rfq = trade.rfq_env.clone();
                        self.trades
                            .get_mut(&trade_id)
                            .expect("trade present")
                            .pacer
                            .mark(EnvelopeKind::Rfq, now);
                        self.send_on(&self.cfg.rfq_channel.clone(), &rfq).await;
                    }
                }
                TradePhase::Escrow => {
                    let preimage = trade.preimage;
                    let fatal = trade.claim_failed_fatal;
                    if fatal {
                        continue;
                    }
                    if trade.pacer.due(EnvelopeKind::SolEscrowCreated, now, self.cfg.claim_retry_ms) {
                        self.trades
                            .get_mut(&trade_id)
                            .expect("trade present")
                            .pacer
                            .mark(EnvelopeKind::SolEscrowCreated, now);
                        match preimage {
                            Some(preimage) => self.claim(&trade_id, preimage).await,
                            None => self.verify_and_pay(&trade_id).await,
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// QUOTE_ACCEPT is out but TERMS has not arrived. Replay the latest
    /// accept (never an older one) within the ping budget; on timeout,
    /// leave and mark the trade abandoned.
    async fn waiting_terms_tick(&mut self, trade_id: &str, now: u64) {
        let Some(trade) = self.trades.get_mut(trade_id) else {
            return;
        };
        let Some(since) = trade.waiting_terms_since_ms else {
            return;
        };

        if now.saturating_sub(since) >= self.cfg.waiting_terms_max_wait_ms {
            tracing::warn!(%trade_id, "waiting_terms timed out");
            let channel = trade.channel.clone();
            trade.waiting_terms_since_ms = None;
            self.upsert(
                trade_id,
                TradePatch {
                    state: Some(TradePhase::Canceled.as_str().into()),
                    last_error: Some("waiting_terms_timeout".into()),
                    ..TradePatch::default()
                },
            );
            self.append_event(trade_id, "waiting_terms.timeout", serde_json::json!({}));
            if self.cfg.waiting_terms_leave_on_timeout {
                if let Some(channel) = channel {
                    self.tracker.mark_terminal(&channel);
                    let _ = self.transport.leave(&channel).await;
                }
                self.trades.remove(trade_id);
            }
            return;
        }

        if trade.pings_sent >= self.cfg.waiting_terms_max_pings {
            return;
        }
        if now.saturating_sub(trade.last_ping_ms) < self.cfg.waiting_terms_ping_cooldown_ms {
            return;
        }
        let Some(accept) = trade.quote_accept_env.clone() else {
            return;
        };
        trade.last_ping_ms = now;
        trade.pings_sent += 1;
        tracing::debug!(%trade_id, pings = self.trades[trade_id].pings_sent, "replaying quote accept");
        self.send_on(&self.cfg.rfq_channel.clone(), &accept).await;
    }

    async fn cancel_trade(&mut self, trade_id: &str, reason: &str) {
        let cancel = self.keys.seal(
            trade_id,
            EnvelopeBody::Cancel(CancelBody {
                reason: reason.to_string(),
            }),
        );
        if let Some(trade) = self.trades.get_mut(trade_id) {
            let _ = trade.state.apply(&cancel);
        }
        let channel = swap_channel(trade_id);
        self.send_on(&channel, &cancel).await;
        self.finish(
            trade_id,
            TradePatch {
                state: Some(TradePhase::Canceled.as_str().into()),
                last_error: Some(reason.to_string()),
                ..TradePatch::default()
            },
        )
        .await;
    }

    async fn timeout(&mut self, trade_id: &str) {
        let phase = self.trades[trade_id].state.phase;
        tracing::warn!(%trade_id, phase = phase.as_str(), "swap timed out");
        if matches!(
            phase,
            TradePhase::New | TradePhase::Terms | TradePhase::Accepted
        ) {
            self.cancel_trade(trade_id, "swap_timeout").await;
        } else {
            self.finish(
                trade_id,
                TradePatch {
                    last_error: Some("swap_timeout".into()),
                    ..TradePatch::default()
                },
            )
            .await;
        }
    }

    async fn finish(&mut self, trade_id: &str, patch: TradePatch) {
        self.upsert(trade_id, patch);
        self.append_event(trade_id, "swap.terminal", serde_json::json!({}));
        if let Some(trade) = self.trades.get(trade_id)
            && let Some(channel) = trade.channel.clone()
        {
            self.tracker.mark_terminal(&channel);
            if trade.joined {
                let _ = self.transport.leave(&channel).await;
            }
        }
        self.trades.remove(trade_id);
    }

    fn check_fee_caps(
        &self,
        platform_fee_bps: u16,
        trade_fee_bps: u16,
        refund_window_sec: u64,
    ) -> std::result::Result<(), &'static str> {
        if platform_fee_bps > self.cfg.max_platform_fee_bps {
            return Err("platform fee above our cap");
        }
        if trade_fee_bps > self.cfg.max_trade_fee_bps {
            return Err("trade fee above our cap");
        }
        if platform_fee_bps + trade_fee_bps > self.cfg.max_total_fee_bps {
            return Err("total fee above our cap");
        }
        if refund_window_sec < self.cfg.min_sol_refund_window_sec {
            return Err("refund window too short");
        }
        if refund_window_sec > self.cfg.max_sol_refund_window_sec {
            return Err("refund window too long");
        }
        Ok(())
    }

    async fn stop(&mut self, reason: &str) {
        tracing::info!(reason, "taker stopping");
        let trade_ids: Vec<String> = self.trades.keys().cloned().collect();
        for trade_id in trade_ids {
            self.append_event(&trade_id, "shutdown", serde_json::json!({ "reason": reason }));
            if let Some(trade) = self.trades.get(&trade_id)
                && trade.joined
                && let Some(channel) = trade.channel.clone()
            {
                let _ = self.transport.leave(&channel).await;
            }
        }
        let _ = self.transport.leave(&self.cfg.rfq_channel).await;
        self.trades.clear();
    }

    async fn send_on(&self, channel: &str, env: &Envelope) {
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
