use crate::protocol::envelope::{canonical_json, PeerKeypair};
use crate::protocol::{InvitePayload, ProtocolError, SignedInvite};

fn payload_bytes(payload: &InvitePayload) -> Vec<u8> {
    let value = serde_json::to_value(payload).expect("invite payload encodes");
    canonical_json(&value).into_bytes()
}

/// Issue a swap-channel invite for `invitee`, signed by the inviter key.
pub fn sign_invite(keys: &PeerKeypair, invitee_pub_key: &str, expires_at_ms: u64) -> SignedInvite {
    let payload = InvitePayload {
        invitee_pub_key: invitee_pub_key.to_string(),
        inviter_pub_key: keys.pubkey_hex(),
        expires_at: expires_at_ms,
    };
    let sig = hex::encode(keys.sign_bytes(&payload_bytes(&payload)));
    SignedInvite { payload, sig }
}

/// Check signature, expiry, and that the invite admits `joiner` and was
/// issued by `expected_inviter` (the channel gatekeeper).
pub fn verify_invite(
    invite: &SignedInvite,
    joiner_pub_key: &str,
    expected_inviter: &str,
    now_ms: u64,
) -> Result<(), ProtocolError> {
    use ed25519_dalek::VerifyingKey;

    if invite.payload.invitee_pub_key != joiner_pub_key {
        return Err(ProtocolError::SchemaInvalid(
            "invite admits a different peer".into(),
        ));
    }
    if invite.payload.inviter_pub_key != expected_inviter {
        return Err(ProtocolError::SchemaInvalid(
            "invite was not issued by the channel owner".into(),
        ));
    }
    if now_ms >= invite.payload.expires_at {
        return Err(ProtocolError::InviteExpired);
    }

    let signer: [u8; 32] = hex::decode(&invite.payload.inviter_pub_key)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| ProtocolError::SignatureInvalid("invalid inviter key".into()))?;
    let sig: [u8; 64] = hex::decode(&invite.sig)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| ProtocolError::SignatureInvalid("invalid invite sig".into()))?;

    let key = VerifyingKey::from_bytes(&signer)
        .map_err(|e| ProtocolError::SignatureInvalid(format!("invalid inviter key: {e}")))?;
    key.verify_strict(
        &payload_bytes(&invite.payload),
        &ed25519_dalek::Signature::from_bytes(&sig),
    )
    .map_err(|e| ProtocolError::SignatureInvalid(format!("invite signature: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invite_roundtrip_verifies() {
        let inviter = PeerKeypair::from_seed(&[1; 32]);
        let invitee = PeerKeypair::from_seed(&[2; 32]);
        let invite = sign_invite(&inviter, &invitee.pubkey_hex(), 2_000);

        verify_invite(&invite, &invitee.pubkey_hex(), &inviter.pubkey_hex(), 1_000)
            .expect("valid invite");
    }

    #[test]
    fn expired_invite_is_rejected() {
        let inviter = PeerKeypair::from_seed(&[1; 32]);
        let invitee = PeerKeypair::from_seed(&[2; 32]);
        let invite = sign_invite(&inviter, &invitee.pubkey_hex(), 2_000);

        assert_eq!(
            verify_invite(&invite, &invitee.pubkey_hex(), &inviter.pubkey_hex(), 2_000),
            Err(ProtocolError::InviteExpired)
        );
    }

    #[test]
    fn invite_is_bound_to_the_invitee() {
        let inviter = PeerKeypair::from_seed(&[1; 32]);
        let invitee = PeerKeypair::from_seed(&[2; 32]);
        let interloper = PeerKeypair::from_seed(&[3; 32]);
        let invite = sign_invite(&inviter, &invitee.pubkey_hex(), 2_000);

        assert!(verify_invite(
            &invite,
            &interloper.pubkey_hex(),
            &inviter.pubkey_hex(),
            1_000
        )
        .is_err());
    }

    #[test]
    fn tampered_expiry_breaks_the_signature() {
        let inviter = PeerKeypair::from_seed(&[1; 32]);
        let invitee = PeerKeypair::from_seed(&[2; 32]);
        let mut invite = sign_invite(&inviter, &invitee.pubkey_hex(), 2_000);
        invite.payload.expires_at = 10_000;

        assert!(matches!(
            verify_invite(&invite, &invitee.pubkey_hex(), &inviter.pubkey_hex(), 1_000),
            Err(ProtocolError::SignatureInvalid(_))
        ));
    }
}
