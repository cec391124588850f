use super::envelope;
use super::{
    Envelope, EnvelopeBody, EscrowCreatedBody, LnInvoiceBody, ProtocolError, QuoteBody, RfqBody,
    StatusBody, SwapInviteBody, TermsBody, PROTOCOL_V,
};

pub const MAX_BPS: u16 = 10_000;

/// Schema and value-range checks per envelope kind, plus the signature
/// check. Coherence against a prior envelope (`rfq_id`, `quote_id`,
/// `terms_hash`) is checked by whoever holds that envelope, via
/// [`expect_ref`].
#[derive(Debug, Clone)]
pub struct Validator {
    /// Floor on how far in the future `sol_refund_after_unix` must sit
    /// relative to the sender's `ts`, in seconds.
    pub min_refund_window_sec: i64,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            min_refund_window_sec: 300,
        }
    }
}

impl Validator {
    pub fn validate(&self, env: &Envelope) -> Result<(), ProtocolError> {
        if env.v != PROTOCOL_V {
            return Err(ProtocolError::SchemaInvalid(format!(
                "unsupported protocol version {}",
                env.v
            )));
        }
        if env.trade_id.is_empty() || !env.trade_id.is_ascii() {
            return Err(ProtocolError::SchemaInvalid(
                "trade_id must be non-empty ASCII".into(),
            ));
        }
        if env.nonce.is_empty() {
            return Err(ProtocolError::SchemaInvalid("nonce must be non-empty".into()));
        }
        if env.ts == 0 {
            return Err(ProtocolError::SchemaInvalid("ts must be set".into()));
        }

        envelope::verify(env)?;

        match &env.body {
            EnvelopeBody::SvcAnnounce(body) => {
                require_hex32("app_hash", &body.app_hash)?;
                require_bps("platform_fee_bps", body.platform_fee_bps)?;
                require_bps("trade_fee_bps", body.trade_fee_bps)?;
            }
            EnvelopeBody::Rfq(body) => self.validate_rfq(body)?,
            EnvelopeBody::Quote(body) => self.validate_quote(body)?,
            EnvelopeBody::QuoteAccept(body) => require_hex32("quote_id", &body.quote_id)?,
            EnvelopeBody::SwapInvite(body) => validate_swap_invite(env, body)?,
            EnvelopeBody::Terms(body) => self.validate_terms(env, body)?,
            EnvelopeBody::Accept(body) => require_hex32("terms_hash", &body.terms_hash)?,
            EnvelopeBody::LnInvoice(body) => validate_ln_invoice(body)?,
            EnvelopeBody::SolEscrowCreated(body) => validate_escrow_created(body)?,
            EnvelopeBody::Status(body) => validate_status(body)?,
            EnvelopeBody::Cancel(body) => {
                if body.reason.is_empty() {
                    return Err(ProtocolError::SchemaInvalid("cancel reason required".into()));
                }
            }
        }
        Ok(())
    }

    fn validate_rfq(&self, body: &RfqBody) -> Result<(), ProtocolError> {
        require_hex32("app_hash", &body.app_hash)?;
        if body.btc_sats < 1 {
            return Err(ProtocolError::SchemaInvalid("btc_sats must be >= 1".into()));
        }
        require_amount_string("usdt_amount", &body.usdt_amount)?;
        require_bps("max_platform_fee_bps", body.max_platform_fee_bps)?;
        require_bps("max_trade_fee_bps", body.max_trade_fee_bps)?;
        require_bps("max_total_fee_bps", body.max_total_fee_bps)?;
        if body.min_sol_refund_window_sec > body.max_sol_refund_window_sec {
            return Err(ProtocolError::SchemaInvalid(
                "refund window bounds inverted".into(),
            ));
        }
        if body.valid_until_unix <= 0 {
            return Err(ProtocolError::SchemaInvalid(
                "valid_until_unix must be positive".into(),
            ));
        }
        Ok(())
    }

    fn validate_quote(&self, body: &QuoteBody) -> Result<(), ProtocolError> {
        require_hex32("rfq_id", &body.rfq_id)?;
        require_hex32("app_hash", &body.app_hash)?;
        if body.btc_sats < 1 {
            return Err(ProtocolError::SchemaInvalid("btc_sats must be >= 1".into()));
        }
        require_amount_string("usdt_amount", &body.usdt_amount)?;
        require_bps("platform_fee_bps", body.platform_fee_bps)?;
        require_bps("trade_fee_bps", body.trade_fee_bps)?;
        if body.valid_until_unix <= 0 {
            return Err(ProtocolError::SchemaInvalid(
                "valid_until_unix must be positive".into(),
            ));
        }
        Ok(())
    }

    fn validate_terms(&self, env: &Envelope, body: &TermsBody) -> Result<(), ProtocolError> {
        require_hex32("app_hash", &body.app_hash)?;
        if body.btc_sats < 1 {
            return Err(ProtocolError::SchemaInvalid("btc_sats must be >= 1".into()));
        }
        require_amount_string("usdt_amount", &body.usdt_amount)?;
        require_bps("platform_fee_bps", body.platform_fee_bps)?;
        require_bps("trade_fee_bps", body.trade_fee_bps)?;
        require_hex32("ln_receiver_peer", &body.ln_receiver_peer)?;
        require_hex32("ln_payer_peer", &body.ln_payer_peer)?;
        if body.sol_recipient.is_empty() || body.sol_refund.is_empty() || body.sol_mint.is_empty()
        {
            return Err(ProtocolError::SchemaInvalid(
                "terms must carry mint, recipient and refund authority".into(),
            ));
        }

        let sender_unix = (env.ts / 1000) as i64;
        if body.sol_refund_after_unix < sender_unix + self.min_refund_window_sec {
            return Err(ProtocolError::RefundWindowViolation(format!(
                "refund_after {} is under the {}s floor from ts {}",
                body.sol_refund_after_unix, self.min_refund_window_sec, sender_unix
            )));
        }
        Ok(())
    }
}

fn validate_swap_invite(env: &Envelope, body: &SwapInviteBody) -> Result<(), ProtocolError> {
    require_hex32("quote_id", &body.quote_id)?;
    if body.channel != super::swap_channel(&env.trade_id) {
        return Err(ProtocolError::SchemaInvalid(format!(
            "invite channel {} does not match trade {}",
            body.channel, env.trade_id
        )));
    }
    require_hex32("invite.inviteePubKey", &body.invite.payload.invitee_pub_key)?;
    require_hex32("invite.inviterPubKey", &body.invite.payload.inviter_pub_key)?;
    if body.invite.payload.inviter_pub_key != env.signer {
        return Err(ProtocolError::SchemaInvalid(
            "invite must be issued by the envelope signer".into(),
        ));
    }
    if body.invite.payload.expires_at == 0 {
        return Err(ProtocolError::SchemaInvalid("invite expiresAt required".into()));
    }
    Ok(())
}

fn validate_ln_invoice(body: &LnInvoiceBody) -> Result<(), ProtocolError> {
    if body.bolt11.is_empty() {
        return Err(ProtocolError::SchemaInvalid("bolt11 required".into()));
    }
    require_hex32("payment_hash_hex", &body.payment_hash_hex)?;
    if body.amount_msat < 1 {
        return Err(ProtocolError::SchemaInvalid("amount_msat must be >= 1".into()));
    }
    Ok(())
}

fn validate_escrow_created(body: &EscrowCreatedBody) -> Result<(), ProtocolError> {
    require_hex32("payment_hash_hex", &body.payment_hash_hex)?;
    require_amount_string("amount", &body.amount)?;
    require_bps("platform_fee_bps", body.platform_fee_bps)?;
    require_bps("trade_fee_bps", body.trade_fee_bps)?;
    for (label, value) in [
        ("program_id", &body.program_id),
        ("escrow_pda", &body.escrow_pda),
        ("vault_ata", &body.vault_ata),
        ("mint", &body.mint),
        ("recipient", &body.recipient),
        ("refund", &body.refund),
        ("tx_sig", &body.tx_sig),
    ] {
        if value.is_empty() {
            return Err(ProtocolError::SchemaInvalid(format!("{label} required")));
        }
    }
    Ok(())
}

fn validate_status(body: &StatusBody) -> Result<(), ProtocolError> {
    let claimed = body.claimed == Some(true);
    let refunded = body.refunded == Some(true);
    if claimed && refunded {
        return Err(ProtocolError::SchemaInvalid(
            "status cannot be both claimed and refunded".into(),
        ));
    }
    if (claimed || refunded) && body.tx_sig.as_deref().is_none_or(str::is_empty) {
        return Err(ProtocolError::SchemaInvalid(
            "terminal status requires tx_sig".into(),
        ));
    }
    if !claimed && !refunded && body.ln_paid != Some(true) {
        return Err(ProtocolError::SchemaInvalid("status carries no signal".into()));
    }
    Ok(())
}

/// Assert that a hash reference (`rfq_id`, `quote_id`, `terms_hash`)
/// names the envelope we hold.
pub fn expect_ref(label: &str, actual_hex: &str, expected: [u8; 32]) -> Result<(), ProtocolError> {
    if actual_hex != hex::encode(expected) {
        return Err(ProtocolError::SchemaInvalid(format!(
            "{label} does not reference the expected envelope"
        )));
    }
    Ok(())
}

fn require_hex32(label: &str, value: &str) -> Result<(), ProtocolError> {
    let lower_hex = value.len() == 64
        && value
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
    if !lower_hex {
        return Err(ProtocolError::SchemaInvalid(format!(
            "{label} must be 64 lowercase hex chars"
        )));
    }
    Ok(())
}

fn require_bps(label: &str, value: u16) -> Result<(), ProtocolError> {
    if value > MAX_BPS {
        return Err(ProtocolError::SchemaInvalid(format!(
            "{label} must be within [0, {MAX_BPS}]"
        )));
    }
    Ok(())
}

fn require_amount_string(label: &str, value: &str) -> Result<(), ProtocolError> {
    let ok = !value.is_empty()
        && value.len() <= 20
        && value.chars().all(|c| c.is_ascii_digit())
        && (value == "0" || !value.starts_with('0'));
    if !ok || value.parse::<u64>().is_err() {
        return Err(ProtocolError::SchemaInvalid(format!(
            "{label} must be a non-negative integer string"
        )));
    }
    Ok(())
}

/// Parse a validated amount string into base units.
pub fn amount_units(value: &str) -> Result<u64, ProtocolError> {
    value.parse::<u64>().map_err(|_| {
        ProtocolError::SchemaInvalid("amount exceeds the 64-bit base-unit range".into())
    })
}
