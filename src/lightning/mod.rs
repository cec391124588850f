pub mod invoice;
pub mod ldk;

use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct CreatedInvoice {
    pub bolt11: String,
    pub payment_hash_hex: String,
    pub amount_msat: u64,
    pub expires_at_unix: i64,
}

/// Node-facing Lightning operations. Paying the same BOLT-11 twice must
/// not double-spend; that idempotence is the node's responsibility, the
/// engines only rely on it.
#[async_trait]
pub trait LightningClient: Send + Sync {
    async fn invoice(
        &self,
        amount_msat: u64,
        label: &str,
        description: &str,
        expiry_secs: u32,
    ) -> Result<CreatedInvoice>;

    /// Pay an invoice and return the 32-byte preimage. Success of this
    /// call is the evidence of payment.
    async fn pay(&self, bolt11: &str) -> Result<[u8; 32]>;
}

pub fn sha256_preimage(preimage: &[u8]) -> [u8; 32] {
    use sha2::{Digest as _, Sha256};
    Sha256::digest(preimage).into()
}
