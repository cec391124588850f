pub mod envelope;
pub mod state;
pub mod validate;

use serde::{Deserialize, Serialize};

/// Wire protocol version carried in every envelope.
pub const PROTOCOL_V: u32 = 1;

/// Public request-for-quote channel. Open membership; carries
/// `SVC_ANNOUNCE`, `RFQ`, `QUOTE`, `QUOTE_ACCEPT` and `SWAP_INVITE`.
pub const RFQ_CHANNEL: &str = "0000intercomswapbtcusdt";

/// Name of the invite-gated per-trade channel.
pub fn swap_channel(trade_id: &str) -> String {
    format!("swap:{trade_id}")
}

/// Deployment binding: peers only talk to peers running the same
/// protocol version against the same escrow program.
pub fn app_hash(solana_program_id: &str) -> String {
    use sha2::{Digest as _, Sha256};
    let digest = Sha256::digest(format!("{PROTOCOL_V}|{solana_program_id}").as_bytes());
    hex::encode(digest)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeKind {
    SvcAnnounce,
    Rfq,
    Quote,
    QuoteAccept,
    SwapInvite,
    Terms,
    Accept,
    LnInvoice,
    SolEscrowCreated,
    Status,
    Cancel,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::SvcAnnounce => "SVC_ANNOUNCE",
            EnvelopeKind::Rfq => "RFQ",
            EnvelopeKind::Quote => "QUOTE",
            EnvelopeKind::QuoteAccept => "QUOTE_ACCEPT",
            EnvelopeKind::SwapInvite => "SWAP_INVITE",
            EnvelopeKind::Terms => "TERMS",
            EnvelopeKind::Accept => "ACCEPT",
            EnvelopeKind::LnInvoice => "LN_INVOICE",
            EnvelopeKind::SolEscrowCreated => "SOL_ESCROW_CREATED",
            EnvelopeKind::Status => "STATUS",
            EnvelopeKind::Cancel => "CANCEL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapDirection {
    LnToSpl,
    SplToLn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SvcAnnounceBody {
    pub pair: String,
    pub app_hash: String,
    pub platform_fee_bps: u16,
    pub trade_fee_bps: u16,
    pub min_btc_sats: u64,
    pub max_btc_sats: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfqBody {
    pub pair: String,
    pub direction: SwapDirection,
    pub app_hash: String,
    pub btc_sats: u64,
    /// Net SPL amount in base units, as a decimal integer string.
    pub usdt_amount: String,
    pub usdt_decimals: u8,
    pub sol_mint: String,
    pub sol_recipient: String,
    pub max_platform_fee_bps: u16,
    pub max_trade_fee_bps: u16,
    pub max_total_fee_bps: u16,
    pub min_sol_refund_window_sec: u64,
    pub max_sol_refund_window_sec: u64,
    pub valid_until_unix: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteBody {
    /// Hash of the unsigned RFQ envelope this quote answers.
    pub rfq_id: String,
    pub pair: String,
    pub direction: SwapDirection,
    pub app_hash: String,
    pub btc_sats: u64,
    pub usdt_amount: String,
    pub usdt_decimals: u8,
    pub sol_mint: String,
    pub platform_fee_bps: u16,
    pub platform_fee_collector: String,
    pub trade_fee_bps: u16,
    pub trade_fee_collector: String,
    pub sol_refund_window_sec: u64,
    pub valid_until_unix: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteAcceptBody {
    /// Hash of the unsigned QUOTE envelope being accepted.
    pub quote_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitePayload {
    pub invitee_pub_key: String,
    pub inviter_pub_key: String,
    /// Millisecond expiry of the invite.
    pub expires_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedInvite {
    pub payload: InvitePayload,
    pub sig: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapInviteBody {
    pub quote_id: String,
    pub channel: String,
    pub invite: SignedInvite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermsBody {
    pub pair: String,
    pub direction: SwapDirection,
    pub app_hash: String,
    pub btc_sats: u64,
    pub usdt_amount: String,
    pub usdt_decimals: u8,
    pub sol_mint: String,
    pub sol_recipient: String,
    pub sol_refund: String,
    pub sol_refund_after_unix: i64,
    pub platform_fee_bps: u16,
    pub platform_fee_collector: String,
    pub trade_fee_bps: u16,
    pub trade_fee_collector: String,
    pub ln_receiver_peer: String,
    pub ln_payer_peer: String,
    pub terms_valid_until_unix: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptBody {
    /// Hash of the unsigned TERMS envelope being acknowledged.
    pub terms_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LnInvoiceBody {
    pub bolt11: String,
    pub payment_hash_hex: String,
    pub amount_msat: u64,
    pub expires_at_unix: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowCreatedBody {
    pub program_id: String,
    pub escrow_pda: String,
    pub vault_ata: String,
    pub mint: String,
    /// Net escrowed amount in base units, decimal integer string.
    pub amount: String,
    pub payment_hash_hex: String,
    pub refund_after_unix: i64,
    pub recipient: String,
    pub refund: String,
    pub platform_fee_bps: u16,
    pub trade_fee_bps: u16,
    pub tx_sig: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ln_paid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refunded: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_sig: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelBody {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeBody {
    SvcAnnounce(SvcAnnounceBody),
    Rfq(RfqBody),
    Quote(QuoteBody),
    QuoteAccept(QuoteAcceptBody),
    SwapInvite(SwapInviteBody),
    Terms(TermsBody),
    Accept(AcceptBody),
    LnInvoice(LnInvoiceBody),
    SolEscrowCreated(EscrowCreatedBody),
    Status(StatusBody),
    Cancel(CancelBody),
}

impl EnvelopeBody {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            EnvelopeBody::SvcAnnounce(_) => EnvelopeKind::SvcAnnounce,
            EnvelopeBody::Rfq(_) => EnvelopeKind::Rfq,
            EnvelopeBody::Quote(_) => EnvelopeKind::Quote,
            EnvelopeBody::QuoteAccept(_) => EnvelopeKind::QuoteAccept,
            EnvelopeBody::SwapInvite(_) => EnvelopeKind::SwapInvite,
            EnvelopeBody::Terms(_) => EnvelopeKind::Terms,
            EnvelopeBody::Accept(_) => EnvelopeKind::Accept,
            EnvelopeBody::LnInvoice(_) => EnvelopeKind::LnInvoice,
            EnvelopeBody::SolEscrowCreated(_) => EnvelopeKind::SolEscrowCreated,
            EnvelopeBody::Status(_) => EnvelopeKind::Status,
            EnvelopeBody::Cancel(_) => EnvelopeKind::Cancel,
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        let encoded = match self {
            EnvelopeBody::SvcAnnounce(b) => serde_json::to_value(b),
            EnvelopeBody::Rfq(b) => serde_json::to_value(b),
            EnvelopeBody::Quote(b) => serde_json::to_value(b),
            EnvelopeBody::QuoteAccept(b) => serde_json::to_value(b),
            EnvelopeBody::SwapInvite(b) => serde_json::to_value(b),
            EnvelopeBody::Terms(b) => serde_json::to_value(b),
            EnvelopeBody::Accept(b) => serde_json::to_value(b),
            EnvelopeBody::LnInvoice(b) => serde_json::to_value(b),
            EnvelopeBody::SolEscrowCreated(b) => serde_json::to_value(b),
            EnvelopeBody::Status(b) => serde_json::to_value(b),
            EnvelopeBody::Cancel(b) => serde_json::to_value(b),
        };
        encoded.expect("envelope bodies are plain data and always encode")
    }

    /// Decode a body for `kind`. Unknown fields are dropped, so they can
    /// never influence the canonical hash.
    pub fn from_value(
        kind: EnvelopeKind,
        value: serde_json::Value,
    ) -> Result<Self, ProtocolError> {
        fn de<T: serde::de::DeserializeOwned>(
            kind: EnvelopeKind,
            value: serde_json::Value,
        ) -> Result<T, ProtocolError> {
            serde_json::from_value(value)
                .map_err(|e| ProtocolError::SchemaInvalid(format!("{} body: {e}", kind.as_str())))
        }

        Ok(match kind {
            EnvelopeKind::SvcAnnounce => EnvelopeBody::SvcAnnounce(de(kind, value)?),
            EnvelopeKind::Rfq => EnvelopeBody::Rfq(de(kind, value)?),
            EnvelopeKind::Quote => EnvelopeBody::Quote(de(kind, value)?),
            EnvelopeKind::QuoteAccept => EnvelopeBody::QuoteAccept(de(kind, value)?),
            EnvelopeKind::SwapInvite => EnvelopeBody::SwapInvite(de(kind, value)?),
            EnvelopeKind::Terms => EnvelopeBody::Terms(de(kind, value)?),
            EnvelopeKind::Accept => EnvelopeBody::Accept(de(kind, value)?),
            EnvelopeKind::LnInvoice => EnvelopeBody::LnInvoice(de(kind, value)?),
            EnvelopeKind::SolEscrowCreated => EnvelopeBody::SolEscrowCreated(de(kind, value)?),
            EnvelopeKind::Status => EnvelopeBody::Status(de(kind, value)?),
            EnvelopeKind::Cancel => EnvelopeBody::Cancel(de(kind, value)?),
        })
    }
}

/// A signed inter-peer message. Immutable once sealed.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub v: u32,
    pub kind: EnvelopeKind,
    pub trade_id: String,
    /// Millisecond wall clock at the sender.
    pub ts: u64,
    /// Unique within `(signer, kind, trade_id)`.
    pub nonce: String,
    pub body: EnvelopeBody,
    /// 64-hex Ed25519 public key.
    pub signer: String,
    /// 128-hex Ed25519 signature over the canonical unsigned encoding.
    pub sig: String,
}

/// Protocol-level rejection reasons. All of these translate to a local
/// drop or a single-negotiation abort; none of them tears down a peer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("signature_invalid: {0}")]
    SignatureInvalid(String),
    #[error("schema_invalid: {0}")]
    SchemaInvalid(String),
    #[error("wrong_state: {kind:?} not applicable in {phase}")]
    WrongState { kind: EnvelopeKind, phase: &'static str },
    #[error("conflicting_replay: second distinct {0:?} for this trade")]
    ConflictingReplay(EnvelopeKind),
    #[error("expired_envelope: {0}")]
    ExpiredEnvelope(String),
    #[error("fee_cap_exceeded: {0}")]
    FeeCapExceeded(String),
    #[error("refund_window_violation: {0}")]
    RefundWindowViolation(String),
    #[error("escrow_mismatch: {0}")]
    EscrowMismatch(String),
    #[error("terms_mismatch: {0}")]
    TermsMismatch(String),
    #[error("invite_expired")]
    InviteExpired,
}
