use ed25519_dalek::{Signer as _, SigningKey, VerifyingKey};
use rand::RngCore as _;
use rand::rngs::OsRng;
use serde_json::Value;
use sha2::{Digest as _, Sha256};

use super::{Envelope, EnvelopeBody, EnvelopeKind, ProtocolError, PROTOCOL_V};

/// Canonical JSON: object keys in lexicographic order at every nesting
/// level, no insignificant whitespace. This is the signing and hashing
/// input format; both sides must produce identical bytes.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string encodes"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&serde_json::to_string(other).expect("scalar encodes")),
    }
}

fn unsigned_value(env: &Envelope) -> Value {
    serde_json::json!({
        "v": env.v,
        "kind": env.kind.as_str(),
        "trade_id": env.trade_id,
        "ts": env.ts,
        "nonce": env.nonce,
        "body": env.body.to_value(),
    })
}

/// Canonical bytes of the unsigned envelope: every field except
/// `signer` and `sig`.
pub fn canonical_unsigned(env: &Envelope) -> String {
    canonical_json(&unsigned_value(env))
}

/// SHA-256 digest of the canonical unsigned encoding. This digest is
/// what later envelopes reference as `rfq_id`, `quote_id` and
/// `terms_hash`.
pub fn hash_unsigned(env: &Envelope) -> [u8; 32] {
    Sha256::digest(canonical_unsigned(env).as_bytes()).into()
}

pub fn hash_unsigned_hex(env: &Envelope) -> String {
    hex::encode(hash_unsigned(env))
}

/// Sign the canonical unsigned encoding; returns the 128-hex signature.
pub fn sign(env: &Envelope, keys: &PeerKeypair) -> String {
    hex::encode(keys.sign_bytes(canonical_unsigned(env).as_bytes()))
}

/// Attach signer and signature, consuming the unsigned envelope.
pub fn attach(mut env: Envelope, signer_hex: &str, sig_hex: &str) -> Envelope {
    env.signer = signer_hex.to_string();
    env.sig = sig_hex.to_string();
    env
}

/// Cryptographically verify `sig` against `signer` over the canonical
/// unsigned encoding.
pub fn verify(env: &Envelope) -> Result<(), ProtocolError> {
    let signer: [u8; 32] = decode_fixed_hex(&env.signer)
        .ok_or_else(|| ProtocolError::SignatureInvalid("signer must be 64 hex chars".into()))?;
    let sig: [u8; 64] = decode_fixed_hex(&env.sig)
        .ok_or_else(|| ProtocolError::SignatureInvalid("sig must be 128 hex chars".into()))?;

    let key = VerifyingKey::from_bytes(&signer)
        .map_err(|e| ProtocolError::SignatureInvalid(format!("invalid public key: {e}")))?;
    let sig = ed25519_dalek::Signature::from_bytes(&sig);
    key.verify_strict(canonical_unsigned(env).as_bytes(), &sig)
        .map_err(|e| ProtocolError::SignatureInvalid(format!("verification failed: {e}")))
}

fn decode_fixed_hex<const N: usize>(s: &str) -> Option<[u8; N]> {
    if s.len() != N * 2 || !s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
        return None;
    }
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

/// Ed25519 identity of a peer. Signs envelopes and swap-channel invites.
pub struct PeerKeypair {
    signing: SigningKey,
}

impl PeerKeypair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    pub fn from_seed_hex(seed_hex: &str) -> Result<Self, ProtocolError> {
        let seed: [u8; 32] = decode_fixed_hex(seed_hex)
            .ok_or_else(|| ProtocolError::SchemaInvalid("seed must be 64 hex chars".into()))?;
        Ok(Self::from_seed(&seed))
    }

    pub fn pubkey_hex(&self) -> String {
        hex::encode(self.signing.verifying_key().to_bytes())
    }

    pub fn sign_bytes(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    /// Build, timestamp and sign an envelope in one step.
    pub fn seal(&self, trade_id: &str, body: EnvelopeBody) -> Envelope {
        let mut nonce = [0u8; 16];
        OsRng.fill_bytes(&mut nonce);
        self.seal_at(trade_id, body, now_ms(), &hex::encode(nonce))
    }

    /// Deterministic variant of [`PeerKeypair::seal`] for callers that
    /// control `ts` and `nonce`.
    pub fn seal_at(&self, trade_id: &str, body: EnvelopeBody, ts: u64, nonce: &str) -> Envelope {
        let unsigned = Envelope {
            v: PROTOCOL_V,
            kind: body.kind(),
            trade_id: trade_id.to_string(),
            ts,
            nonce: nonce.to_string(),
            body,
            signer: String::new(),
            sig: String::new(),
        };
        let sig = sign(&unsigned, self);
        let signer = self.pubkey_hex();
        attach(unsigned, &signer, &sig)
    }
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn now_unix() -> i64 {
    (now_ms() / 1000) as i64
}

impl Envelope {
    /// Full wire form, signature included.
    pub fn to_wire_json(&self) -> String {
        let mut value = unsigned_value(self);
        let obj = value.as_object_mut().expect("unsigned_value is an object");
        obj.insert("signer".into(), Value::String(self.signer.clone()));
        obj.insert("sig".into(), Value::String(self.sig.clone()));
        canonical_json(&value)
    }

    pub fn from_wire_json(payload: &str) -> Result<Envelope, ProtocolError> {
        let value: Value = serde_json::from_str(payload)
            .map_err(|e| ProtocolError::SchemaInvalid(format!("envelope json: {e}")))?;
        let obj = value
            .as_object()
            .ok_or_else(|| ProtocolError::SchemaInvalid("envelope must be an object".into()))?;

        let v = obj
            .get("v")
            .and_then(Value::as_u64)
            .ok_or_else(|| ProtocolError::SchemaInvalid("v must be an integer".into()))?;
        let kind: EnvelopeKind = obj
            .get("kind")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ProtocolError::SchemaInvalid(format!("kind: {e}")))?
            .ok_or_else(|| ProtocolError::SchemaInvalid("kind is required".into()))?;
        let trade_id = require_str(obj, "trade_id")?;
        let ts = obj
            .get("ts")
            .and_then(Value::as_u64)
            .ok_or_else(|| ProtocolError::SchemaInvalid("ts must be an integer".into()))?;
        let nonce = require_str(obj, "nonce")?;
        let body_value = obj
            .get("body")
            .cloned()
            .ok_or_else(|| ProtocolError::SchemaInvalid("body is required".into()))?;
        let body = EnvelopeBody::from_value(kind, body_value)?;
        let signer = require_str(obj, "signer")?;
        let sig = require_str(obj, "sig")?;

        Ok(Envelope {
            v: v as u32,
            kind,
            trade_id,
            ts,
            nonce,
            body,
            signer,
            sig,
        })
    }
}

fn require_str(
    obj: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<String, ProtocolError> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::SchemaInvalid(format!("{key} must be a string")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QuoteAcceptBody;

    fn sample(keys: &PeerKeypair) -> Envelope {
        keys.seal_at(
            "trade-1",
            EnvelopeBody::QuoteAccept(QuoteAcceptBody {
                quote_id: "11".repeat(32),
            }),
            1_700_000_000_000,
            "0a0b",
        )
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let value = serde_json::json!({"b": 1, "a": {"z": true, "m": "x"}});
        assert_eq!(canonical_json(&value), r#"{"a":{"m":"x","z":true},"b":1}"#);
    }

    #[test]
    fn sign_attach_verify_roundtrip() {
        let keys = PeerKeypair::from_seed(&[7u8; 32]);
        let env = sample(&keys);
        assert!(verify(&env).is_ok());
    }

    #[test]
    fn tampered_body_fails_verification() {
        let keys = PeerKeypair::from_seed(&[7u8; 32]);
        let mut env = sample(&keys);
        env.body = EnvelopeBody::QuoteAccept(QuoteAcceptBody {
            quote_id: "22".repeat(32),
        });
        assert!(matches!(
            verify(&env),
            Err(ProtocolError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn unknown_body_fields_do_not_alter_the_hash() {
        let keys = PeerKeypair::from_seed(&[9u8; 32]);
        let env = sample(&keys);
        let wire = env.to_wire_json();
        let padded = wire.replace(
            "\"quote_id\"",
            "\"zzz_unknown\":\"ignored\",\"quote_id\"",
        );
        let decoded = Envelope::from_wire_json(&padded).expect("decode padded");
        assert_eq!(hash_unsigned(&decoded), hash_unsigned(&env));
        assert!(verify(&decoded).is_ok());
    }

    #[test]
    fn wire_roundtrip_preserves_hash() {
        let keys = PeerKeypair::from_seed(&[3u8; 32]);
        let env = sample(&keys);
        let decoded = Envelope::from_wire_json(&env.to_wire_json()).expect("decode");
        assert_eq!(decoded, env);
        assert_eq!(hash_unsigned(&decoded), hash_unsigned(&env));
    }

    #[test]
    fn distinct_envelopes_hash_differently() {
        let keys = PeerKeypair::from_seed(&[5u8; 32]);
        let a = sample(&keys);
        let mut b = a.clone();
        b.nonce = "0a0c".into();
        assert_ne!(hash_unsigned(&a), hash_unsigned(&b));
    }
}
