pub mod hygiene;
pub mod maker;
pub mod taker;

use std::collections::HashMap;

use crate::protocol::{Envelope, EnvelopeKind, RfqBody, SwapDirection, RFQ_CHANNEL};

/// Maker-side tunables. Defaults carry the protocol's cadence floors;
/// tests shrink them.
#[derive(Debug, Clone)]
pub struct MakerConfig {
    pub rfq_channel: String,
    pub pair: String,
    pub app_hash: String,
    pub sol_mint: String,
    /// Refund authority for escrows this maker funds.
    pub sol_refund: String,
    /// The maker's SPL token account debited at escrow creation.
    pub maker_token_account: String,
    pub platform_fee_bps: u16,
    pub platform_fee_collector: String,
    pub trade_fee_bps: u16,
    pub trade_fee_collector: String,
    pub min_btc_sats: u64,
    pub max_btc_sats: u64,
    pub quote_valid_sec: i64,
    /// Refund window the maker prefers; clamped into the RFQ's bounds.
    pub sol_refund_window_sec: u64,
    pub swap_timeout_sec: u64,
    pub invite_valid_ms: u64,
    pub invoice_expiry_sec: u32,
    /// Throttle for re-sending SWAP_INVITE/TERMS on a retried
    /// QUOTE_ACCEPT. Floored at 5s.
    pub retry_resend_min_ms: u64,
    pub resend_base_ms: u64,
    pub resend_widened_ms: u64,
    pub peer_silent_after_ms: u64,
    pub lock_prune_interval_ms: u64,
    pub announce_interval_ms: u64,
    pub min_refund_window_sec: i64,
    pub enable_settlement: bool,
    pub tick_ms: u64,
}

impl Default for MakerConfig {
    fn default() -> Self {
        Self {
            rfq_channel: RFQ_CHANNEL.to_string(),
            pair: "BTCUSDT".to_string(),
            app_hash: String::new(),
            sol_mint: String::new(),
            sol_refund: String::new(),
            maker_token_account: String::new(),
            platform_fee_bps: 50,
            platform_fee_collector: String::new(),
            trade_fee_bps: 50,
            trade_fee_collector: String::new(),
            min_btc_sats: 1_000,
            max_btc_sats: 10_000_000,
            quote_valid_sec: 60,
            sol_refund_window_sec: 3_600,
            swap_timeout_sec: 900,
            invite_valid_ms: 600_000,
            invoice_expiry_sec: 3_600,
            retry_resend_min_ms: 5_000,
            resend_base_ms: 10_000,
            resend_widened_ms: 22_500,
            peer_silent_after_ms: 30_000,
            lock_prune_interval_ms: 5_000,
            announce_interval_ms: 30_000,
            min_refund_window_sec: 300,
            enable_settlement: true,
            tick_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TakerConfig {
    pub rfq_channel: String,
    pub app_hash: String,
    /// Where claimed SPL funds land; also the recipient the escrow must
    /// name on chain.
    pub sol_recipient: String,
    pub taker_token_account: String,
    pub max_platform_fee_bps: u16,
    pub max_trade_fee_bps: u16,
    pub max_total_fee_bps: u16,
    pub min_sol_refund_window_sec: u64,
    pub max_sol_refund_window_sec: u64,
    pub rfq_resend_ms: u64,
    pub waiting_terms_ping_cooldown_ms: u64,
    pub waiting_terms_max_pings: u32,
    pub waiting_terms_max_wait_ms: u64,
    pub waiting_terms_leave_on_timeout: bool,
    pub swap_timeout_sec: u64,
    pub claim_retry_ms: u64,
    pub resend_base_ms: u64,
    pub resend_widened_ms: u64,
    pub peer_silent_after_ms: u64,
    pub min_refund_window_sec: i64,
    pub tick_ms: u64,
}

impl Default for TakerConfig {
    fn default() -> Self {
        Self {
            rfq_channel: RFQ_CHANNEL.to_string(),
            app_hash: String::new(),
            sol_recipient: String::new(),
            taker_token_account: String::new(),
            max_platform_fee_bps: 100,
            max_trade_fee_bps: 100,
            max_total_fee_bps: 150,
            min_sol_refund_window_sec: 600,
            max_sol_refund_window_sec: 86_400,
            rfq_resend_ms: 15_000,
            waiting_terms_ping_cooldown_ms: 10_000,
            waiting_terms_max_pings: 6,
            waiting_terms_max_wait_ms: 120_000,
            waiting_terms_leave_on_timeout: true,
            swap_timeout_sec: 900,
            claim_retry_ms: 5_000,
            resend_base_ms: 10_000,
            resend_widened_ms: 22_500,
            peer_silent_after_ms: 30_000,
            min_refund_window_sec: 300,
            tick_ms: 1_000,
        }
    }
}

/// Everything economically material about an RFQ, so a byte-different
/// repost of the same ask maps onto the same lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RfqLockKey {
    pub signer: String,
    pub trade_id: String,
    pub pair: String,
    pub direction: SwapDirection,
    pub btc_sats: u64,
    pub usdt_amount: String,
    pub max_platform_fee_bps: u16,
    pub max_trade_fee_bps: u16,
    pub max_total_fee_bps: u16,
    pub min_sol_refund_window_sec: u64,
    pub max_sol_refund_window_sec: u64,
    pub sol_recipient: String,
    pub sol_mint: String,
    pub app_hash: String,
}

impl RfqLockKey {
    pub fn from_rfq(signer: &str, trade_id: &str, body: &RfqBody) -> Self {
        Self {
            signer: signer.to_string(),
            trade_id: trade_id.to_string(),
            pair: body.pair.clone(),
            direction: body.direction,
            btc_sats: body.btc_sats,
            usdt_amount: body.usdt_amount.clone(),
            max_platform_fee_bps: body.max_platform_fee_bps,
            max_trade_fee_bps: body.max_trade_fee_bps,
            max_total_fee_bps: body.max_total_fee_bps,
            min_sol_refund_window_sec: body.min_sol_refund_window_sec,
            max_sol_refund_window_sec: body.max_sol_refund_window_sec,
            sol_recipient: body.sol_recipient.clone(),
            sol_mint: body.sol_mint.clone(),
            app_hash: body.app_hash.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Quoted,
    Accepting,
    Swapping,
}

/// Serializes concurrent acceptances of one RFQ and remembers the
/// signed quote for idempotent re-emission.
#[derive(Debug, Clone)]
pub struct RfqLock {
    pub state: LockState,
    pub quote_id: String,
    pub signed_quote: Envelope,
    pub quote_valid_until_unix: i64,
    pub swap_channel: Option<String>,
    pub invitee_pubkey: String,
    pub lock_deadline_ms: u64,
    pub created_at_ms: u64,
    pub last_seen_ms: u64,
}

#[derive(Debug, Default)]
pub struct LockTable {
    locks: HashMap<RfqLockKey, RfqLock>,
}

impl LockTable {
    pub fn get(&self, key: &RfqLockKey) -> Option<&RfqLock> {
        self.locks.get(key)
    }

    pub fn get_mut(&mut self, key: &RfqLockKey) -> Option<&mut RfqLock> {
        self.locks.get_mut(key)
    }

    pub fn insert(&mut self, key: RfqLockKey, lock: RfqLock) {
        self.locks.insert(key, lock);
    }

    pub fn remove_by_trade(&mut self, trade_id: &str) {
        self.locks.retain(|key, _| key.trade_id != trade_id);
    }

    pub fn find_by_trade(&self, trade_id: &str) -> Option<(&RfqLockKey, &RfqLock)> {
        self.locks.iter().find(|(key, _)| key.trade_id == trade_id)
    }

    pub fn find_by_trade_mut(&mut self, trade_id: &str) -> Option<(&RfqLockKey, &mut RfqLock)> {
        self.locks
            .iter_mut()
            .find(|(key, _)| key.trade_id == trade_id)
            .map(|(key, lock)| (key, lock))
    }

    /// Drop quoted locks whose quote expired and in-flight locks past
    /// their deadline.
    pub fn prune(&mut self, now_ms: u64, now_unix: i64) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| match lock.state {
            LockState::Quoted => lock.quote_valid_until_unix > now_unix,
            LockState::Accepting | LockState::Swapping => lock.lock_deadline_ms > now_ms,
        });
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Bounded-cooperative resend pacing: a per-kind floor that widens when
/// the peer has gone quiet, so two stalled peers do not saturate the
/// channel re-asserting themselves.
#[derive(Debug, Default)]
pub struct ResendPacer {
    last_sent: HashMap<EnvelopeKind, u64>,
}

impl ResendPacer {
    pub fn due(
        &self,
        kind: EnvelopeKind,
        now_ms: u64,
        floor_ms: u64,
    ) -> bool {
        match self.last_sent.get(&kind) {
            Some(last) => now_ms.saturating_sub(*last) >= floor_ms,
            None => true,
        }
    }

    pub fn mark(&mut self, kind: EnvelopeKind, now_ms: u64) {
        self.last_sent.insert(kind, now_ms);
    }

    pub fn clear(&mut self) {
        self.last_sent.clear();
    }
}

/// Resend floor selection: base cadence, widened once the peer has been
/// silent for longer than the threshold.
pub fn resend_floor_ms(
    now_ms: u64,
    peer_last_seen_ms: u64,
    base_ms: u64,
    widened_ms: u64,
    silent_after_ms: u64,
) -> u64 {
    if now_ms.saturating_sub(peer_last_seen_ms) > silent_after_ms {
        widened_ms
    } else {
        base_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_prune_drops_expired_quotes_and_deadlined_swaps() {
        let mut table = LockTable::default();
        let quote = crate::protocol::envelope::PeerKeypair::from_seed(&[1; 32]).seal(
            "t1",
            crate::protocol::EnvelopeBody::Cancel(crate::protocol::CancelBody {
                reason: "placeholder".into(),
            }),
        );
        let mk_key = |trade: &str| RfqLockKey {
            signer: "s".into(),
            trade_id: trade.into(),
            pair: "BTCUSDT".into(),
            direction: SwapDirection::LnToSpl,
            btc_sats: 1,
            usdt_amount: "1".into(),
            max_platform_fee_bps: 0,
            max_trade_fee_bps: 0,
            max_total_fee_bps: 0,
            min_sol_refund_window_sec: 0,
            max_sol_refund_window_sec: 0,
            sol_recipient: "r".into(),
            sol_mint: "m".into(),
            app_hash: "a".into(),
        };
        let mk_lock = |state, valid_until_unix, deadline_ms| RfqLock {
            state,
            quote_id: "q".into(),
            signed_quote: quote.clone(),
            quote_valid_until_unix: valid_until_unix,
            swap_channel: None,
            invitee_pubkey: String::new(),
            lock_deadline_ms: deadline_ms,
            created_at_ms: 0,
            last_seen_ms: 0,
        };

        table.insert(mk_key("fresh"), mk_lock(LockState::Quoted, 2_000, 0));
        table.insert(mk_key("stale"), mk_lock(LockState::Quoted, 500, 0));
        table.insert(mk_key("live"), mk_lock(LockState::Swapping, 0, 10_000));
        table.insert(mk_key("dead"), mk_lock(LockState::Swapping, 0, 100));

        let dropped = table.prune(1_000, 1_000);
        assert_eq!(dropped, 2);
        assert!(table.find_by_trade("fresh").is_some());
        assert!(table.find_by_trade("live").is_some());
        assert!(table.find_by_trade("stale").is_none());
        assert!(table.find_by_trade("dead").is_none());
    }

    #[test]
    fn pacer_floors_and_widens() {
        let mut pacer = ResendPacer::default();
        assert!(pacer.due(EnvelopeKind::Terms, 0, 10_000));
        pacer.mark(EnvelopeKind::Terms, 0);
        assert!(!pacer.due(EnvelopeKind::Terms, 9_999, 10_000));
        assert!(pacer.due(EnvelopeKind::Terms, 10_000, 10_000));

        assert_eq!(resend_floor_ms(40_000, 5_000, 10_000, 22_500, 30_000), 22_500);
        assert_eq!(resend_floor_ms(20_000, 5_000, 10_000, 22_500, 30_000), 10_000);
    }
}
