use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::envelope::{hash_unsigned, hash_unsigned_hex};
use super::{
    Envelope, EnvelopeBody, EnvelopeKind, EscrowCreatedBody, LnInvoiceBody, ProtocolError,
    StatusBody, TermsBody,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradePhase {
    New,
    Terms,
    Accepted,
    Invoice,
    Escrow,
    Claimed,
    Refunded,
    Canceled,
}

impl TradePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradePhase::Claimed | TradePhase::Refunded | TradePhase::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradePhase::New => "new",
            TradePhase::Terms => "terms",
            TradePhase::Accepted => "accepted",
            TradePhase::Invoice => "invoice",
            TradePhase::Escrow => "escrow",
            TradePhase::Claimed => "claimed",
            TradePhase::Refunded => "refunded",
            TradePhase::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Advanced,
    /// Byte-identical replay of an already-applied envelope.
    Duplicate,
}

/// Per-trade converging state. One owner per `trade_id`; envelopes are
/// applied in arrival order and reordering surfaces as `wrong_state`,
/// which the sender resolves by resending the missing precursor.
#[derive(Debug, Clone)]
pub struct TradeState {
    pub trade_id: String,
    pub phase: TradePhase,
    pub terms: Option<TermsBody>,
    /// Hash of the unsigned TERMS envelope; what ACCEPT must reference.
    pub terms_hash_hex: Option<String>,
    pub ln_invoice: Option<LnInvoiceBody>,
    pub sol_escrow: Option<EscrowCreatedBody>,
    pub ln_paid: bool,
    pub claim_tx_sig: Option<String>,
    pub refund_tx_sig: Option<String>,
    /// First accepted hash per freeze-once kind; a later distinct body
    /// of the same kind is a conflicting replay.
    frozen: HashMap<EnvelopeKind, [u8; 32]>,
    seen: HashSet<[u8; 32]>,
}

pub fn initial(trade_id: &str) -> TradeState {
    TradeState {
        trade_id: trade_id.to_string(),
        phase: TradePhase::New,
        terms: None,
        terms_hash_hex: None,
        ln_invoice: None,
        sol_escrow: None,
        ln_paid: false,
        claim_tx_sig: None,
        refund_tx_sig: None,
        frozen: HashMap::new(),
        seen: HashSet::new(),
    }
}

impl TradeState {
    pub fn apply(&mut self, env: &Envelope) -> Result<Applied, ProtocolError> {
        if env.trade_id != self.trade_id {
            return Err(ProtocolError::SchemaInvalid(format!(
                "envelope for trade {} applied to trade {}",
                env.trade_id, self.trade_id
            )));
        }

        let hash = hash_unsigned(env);
        if self.seen.contains(&hash) {
            return Ok(Applied::Duplicate);
        }
        if let Some(first) = self.frozen.get(&env.kind)
            && *first != hash
        {
            return Err(ProtocolError::ConflictingReplay(env.kind));
        }
        if self.phase.is_terminal() {
            return Err(self.wrong_state(env.kind));
        }

        match (&self.phase, &env.body) {
            (TradePhase::New, EnvelopeBody::Terms(terms)) => {
                self.terms = Some(terms.clone());
                self.terms_hash_hex = Some(hash_unsigned_hex(env));
                self.phase = TradePhase::Terms;
            }
            (TradePhase::Terms, EnvelopeBody::Accept(accept)) => {
                let expected = self
                    .terms_hash_hex
                    .as_deref()
                    .expect("terms hash recorded in TERMS phase");
                if accept.terms_hash != expected {
                    return Err(ProtocolError::TermsMismatch(
                        "ACCEPT.terms_hash does not match the frozen TERMS".into(),
                    ));
                }
                self.phase = TradePhase::Accepted;
            }
            (TradePhase::Accepted, EnvelopeBody::LnInvoice(invoice)) => {
                let terms = self.terms.as_ref().expect("terms frozen before ACCEPTED");
                if Some(invoice.amount_msat) != terms.btc_sats.checked_mul(1000) {
                    return Err(ProtocolError::TermsMismatch(format!(
                        "invoice amount {} msat but terms say {} sats",
                        invoice.amount_msat, terms.btc_sats
                    )));
                }
                self.ln_invoice = Some(invoice.clone());
                self.phase = TradePhase::Invoice;
            }
            (TradePhase::Invoice, EnvelopeBody::SolEscrowCreated(escrow)) => {
                self.check_escrow_against_agreement(escrow)?;
                self.sol_escrow = Some(escrow.clone());
                self.phase = TradePhase::Escrow;
            }
            (TradePhase::Escrow, EnvelopeBody::Status(status)) => {
                self.apply_status(env.kind, status)?;
            }
            (
                TradePhase::New | TradePhase::Terms | TradePhase::Accepted,
                EnvelopeBody::Cancel(_),
            ) => {
                self.phase = TradePhase::Canceled;
            }
            _ => return Err(self.wrong_state(env.kind)),
        }

        self.seen.insert(hash);
        if matches!(
            env.kind,
            EnvelopeKind::Terms
                | EnvelopeKind::Accept
                | EnvelopeKind::LnInvoice
                | EnvelopeKind::SolEscrowCreated
                | EnvelopeKind::Cancel
        ) {
            self.frozen.insert(env.kind, hash);
        }
        Ok(Applied::Advanced)
    }

    fn apply_status(
        &mut self,
        kind: EnvelopeKind,
        status: &StatusBody,
    ) -> Result<(), ProtocolError> {
        match status {
            StatusBody {
                claimed: Some(true),
                tx_sig: Some(tx_sig),
                ..
            } => {
                self.claim_tx_sig = Some(tx_sig.clone());
                self.phase = TradePhase::Claimed;
            }
            StatusBody {
                refunded: Some(true),
                tx_sig: Some(tx_sig),
                ..
            } => {
                self.refund_tx_sig = Some(tx_sig.clone());
                self.phase = TradePhase::Refunded;
            }
            StatusBody {
                ln_paid: Some(true),
                claimed: None | Some(false),
                refunded: None | Some(false),
                ..
            } => {
                self.ln_paid = true;
            }
            _ => return Err(self.wrong_state(kind)),
        }
        Ok(())
    }

    fn check_escrow_against_agreement(
        &self,
        escrow: &EscrowCreatedBody,
    ) -> Result<(), ProtocolError> {
        let terms = self.terms.as_ref().expect("terms frozen before INVOICE");
        let invoice = self
            .ln_invoice
            .as_ref()
            .expect("invoice recorded before ESCROW");

        if escrow.payment_hash_hex != invoice.payment_hash_hex {
            return Err(ProtocolError::EscrowMismatch(
                "escrow payment hash differs from the LN invoice".into(),
            ));
        }
        if escrow.amount != terms.usdt_amount {
            return Err(ProtocolError::EscrowMismatch(format!(
                "escrow net amount {} but terms say {}",
                escrow.amount, terms.usdt_amount
            )));
        }
        if escrow.mint != terms.sol_mint {
            return Err(ProtocolError::EscrowMismatch("escrow mint differs from terms".into()));
        }
        if escrow.recipient != terms.sol_recipient {
            return Err(ProtocolError::EscrowMismatch(
                "escrow recipient differs from terms".into(),
            ));
        }
        if escrow.refund_after_unix != terms.sol_refund_after_unix {
            return Err(ProtocolError::EscrowMismatch(
                "escrow refund timer differs from terms".into(),
            ));
        }
        Ok(())
    }

    fn wrong_state(&self, kind: EnvelopeKind) -> ProtocolError {
        ProtocolError::WrongState {
            kind,
            phase: self.phase.as_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::envelope::PeerKeypair;
    use crate::protocol::{AcceptBody, CancelBody, SwapDirection};

    fn maker() -> PeerKeypair {
        PeerKeypair::from_seed(&[0xaa; 32])
    }

    fn taker() -> PeerKeypair {
        PeerKeypair::from_seed(&[0xbb; 32])
    }

    fn terms_body() -> TermsBody {
        TermsBody {
            pair: "BTCUSDT".into(),
            direction: SwapDirection::LnToSpl,
            app_hash: "00".repeat(32),
            btc_sats: 10_000,
            usdt_amount: "1000000".into(),
            usdt_decimals: 6,
            sol_mint: "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB".into(),
            sol_recipient: "4gRGqmg".into(),
            sol_refund: "Refund111".into(),
            sol_refund_after_unix: 1_700_001_000,
            platform_fee_bps: 50,
            platform_fee_collector: "Platform111".into(),
            trade_fee_bps: 50,
            trade_fee_collector: "Trade111".into(),
            ln_receiver_peer: maker().pubkey_hex(),
            ln_payer_peer: taker().pubkey_hex(),
            terms_valid_until_unix: 1_700_000_600,
        }
    }

    fn terms_env() -> Envelope {
        maker().seal_at("t1", EnvelopeBody::Terms(terms_body()), 1_700_000_000_000, "01")
    }

    fn accept_env(terms: &Envelope) -> Envelope {
        taker().seal_at(
            "t1",
            EnvelopeBody::Accept(AcceptBody {
                terms_hash: hash_unsigned_hex(terms),
            }),
            1_700_000_001_000,
            "02",
        )
    }

    fn invoice_env() -> Envelope {
        maker().seal_at(
            "t1",
            EnvelopeBody::LnInvoice(LnInvoiceBody {
                bolt11: "lnbc100u1...".into(),
                payment_hash_hex: "ab".repeat(32),
                amount_msat: 10_000_000,
                expires_at_unix: 1_700_003_600,
            }),
            1_700_000_002_000,
            "03",
        )
    }

    fn escrow_env() -> Envelope {
        maker().seal_at(
            "t1",
            EnvelopeBody::SolEscrowCreated(EscrowCreatedBody {
                program_id: "evYHPt33hCYHNm7iFHAHXmSkYrEoDnBSv69MHwLfYyK".into(),
                escrow_pda: "Escrow111".into(),
                vault_ata: "Vault111".into(),
                mint: "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB".into(),
                amount: "1000000".into(),
                payment_hash_hex: "ab".repeat(32),
                refund_after_unix: 1_700_001_000,
                recipient: "4gRGqmg".into(),
                refund: "Refund111".into(),
                platform_fee_bps: 50,
                trade_fee_bps: 50,
                tx_sig: "sig1".into(),
            }),
            1_700_000_003_000,
            "04",
        )
    }

    fn status_env(body: StatusBody, nonce: &str) -> Envelope {
        taker().seal_at("t1", EnvelopeBody::Status(body), 1_700_000_004_000, nonce)
    }

    fn drive_to_escrow() -> TradeState {
        let mut state = initial("t1");
        let terms = terms_env();
        state.apply(&terms).expect("terms");
        state.apply(&accept_env(&terms)).expect("accept");
        state.apply(&invoice_env()).expect("invoice");
        state.apply(&escrow_env()).expect("escrow");
        state
    }

    #[test]
    fn happy_path_reaches_claimed() {
        let mut state = drive_to_escrow();
        assert_eq!(state.phase, TradePhase::Escrow);

        state
            .apply(&status_env(
                StatusBody {
                    ln_paid: Some(true),
                    ..Default::default()
                },
                "05",
            ))
            .expect("ln_paid");
        assert!(state.ln_paid);
        assert_eq!(state.phase, TradePhase::Escrow);

        state
            .apply(&status_env(
                StatusBody {
                    claimed: Some(true),
                    tx_sig: Some("claimsig".into()),
                    ..Default::default()
                },
                "06",
            ))
            .expect("claimed");
        assert_eq!(state.phase, TradePhase::Claimed);
        assert_eq!(state.claim_tx_sig.as_deref(), Some("claimsig"));
    }

    #[test]
    fn identical_replay_is_a_noop() {
        let mut state = initial("t1");
        let terms = terms_env();
        assert_eq!(state.apply(&terms).expect("first"), Applied::Advanced);
        assert_eq!(state.apply(&terms).expect("replay"), Applied::Duplicate);
        assert_eq!(state.phase, TradePhase::Terms);
    }

    #[test]
    fn distinct_terms_is_a_conflicting_replay() {
        let mut state = initial("t1");
        state.apply(&terms_env()).expect("terms");

        let mut other = terms_body();
        other.btc_sats = 20_000;
        let conflicting =
            maker().seal_at("t1", EnvelopeBody::Terms(other), 1_700_000_009_000, "99");
        assert_eq!(
            state.apply(&conflicting),
            Err(ProtocolError::ConflictingReplay(EnvelopeKind::Terms))
        );
        assert_eq!(state.terms.as_ref().map(|t| t.btc_sats), Some(10_000));
    }

    #[test]
    fn future_envelopes_are_rejected_not_applied() {
        let mut state = initial("t1");
        let err = state
            .apply(&status_env(
                StatusBody {
                    ln_paid: Some(true),
                    ..Default::default()
                },
                "05",
            ))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::WrongState { .. }));
        assert_eq!(state.phase, TradePhase::New);

        let err = state.apply(&escrow_env()).unwrap_err();
        assert!(matches!(err, ProtocolError::WrongState { .. }));
    }

    #[test]
    fn unsolicited_ln_paid_before_escrow_is_wrong_state() {
        let mut state = initial("t1");
        let terms = terms_env();
        state.apply(&terms).expect("terms");
        state.apply(&accept_env(&terms)).expect("accept");
        let err = state
            .apply(&status_env(
                StatusBody {
                    ln_paid: Some(true),
                    ..Default::default()
                },
                "05",
            ))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::WrongState { .. }));
    }

    #[test]
    fn cancel_only_before_escrow() {
        let cancel = |nonce: &str| {
            taker().seal_at(
                "t1",
                EnvelopeBody::Cancel(CancelBody {
                    reason: "fee_cap_exceeded".into(),
                }),
                1_700_000_005_000,
                nonce,
            )
        };

        let mut state = initial("t1");
        state.apply(&cancel("07")).expect("cancel from NEW");
        assert_eq!(state.phase, TradePhase::Canceled);

        let mut state = drive_to_escrow();
        let err = state.apply(&cancel("08")).unwrap_err();
        assert!(matches!(err, ProtocolError::WrongState { .. }));
        assert_eq!(state.phase, TradePhase::Escrow);
    }

    #[test]
    fn terminal_states_absorb_everything_but_replays() {
        let mut state = drive_to_escrow();
        let claimed = status_env(
            StatusBody {
                claimed: Some(true),
                tx_sig: Some("claimsig".into()),
                ..Default::default()
            },
            "06",
        );
        state.apply(&claimed).expect("claimed");

        assert_eq!(state.apply(&claimed).expect("replay"), Applied::Duplicate);

        let late = status_env(
            StatusBody {
                refunded: Some(true),
                tx_sig: Some("refundsig".into()),
                ..Default::default()
            },
            "07",
        );
        assert!(matches!(
            state.apply(&late).unwrap_err(),
            ProtocolError::WrongState { .. }
        ));
        assert_eq!(state.phase, TradePhase::Claimed);
    }

    #[test]
    fn accept_must_reference_the_frozen_terms() {
        let mut state = initial("t1");
        let terms = terms_env();
        state.apply(&terms).expect("terms");

        let bogus = taker().seal_at(
            "t1",
            EnvelopeBody::Accept(AcceptBody {
                terms_hash: "00".repeat(32),
            }),
            1_700_000_001_000,
            "02",
        );
        assert!(matches!(
            state.apply(&bogus).unwrap_err(),
            ProtocolError::TermsMismatch(_)
        ));
        assert_eq!(state.phase, TradePhase::Terms);
    }

    #[test]
    fn escrow_must_match_invoice_and_terms() {
        let mut state = initial("t1");
        let terms = terms_env();
        state.apply(&terms).expect("terms");
        state.apply(&accept_env(&terms)).expect("accept");
        state.apply(&invoice_env()).expect("invoice");

        let mut wrong = escrow_env();
        if let EnvelopeBody::SolEscrowCreated(body) = &mut wrong.body {
            body.payment_hash_hex = "cd".repeat(32);
        }
        let wrong = maker().seal_at("t1", wrong.body, 1_700_000_003_000, "04");
        assert!(matches!(
            state.apply(&wrong).unwrap_err(),
            ProtocolError::EscrowMismatch(_)
        ));
        assert_eq!(state.phase, TradePhase::Invoice);
    }
}
