use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use ln_spl_swap::lightning::{sha256_preimage, CreatedInvoice, LightningClient};

#[derive(Default)]
struct NodeInner {
    invoices: HashMap<String, ([u8; 32], u64)>,
    payments: HashMap<String, [u8; 32]>,
    counter: u64,
    fail_pays: bool,
}

/// Deterministic in-memory Lightning node pair: invoices created on one
/// handle are payable from any handle, and paying twice settles once.
pub struct MockLightning {
    inner: Mutex<NodeInner>,
}

impl MockLightning {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(NodeInner::default()),
        })
    }

    pub fn set_fail_pays(&self, fail: bool) {
        self.inner.lock().expect("ln poisoned").fail_pays = fail;
    }

    pub fn outgoing_payment_count(&self) -> usize {
        self.inner.lock().expect("ln poisoned").payments.len()
    }

    pub fn preimage_for(&self, bolt11: &str) -> Option<[u8; 32]> {
        self.inner
            .lock()
            .expect("ln poisoned")
            .payments
            .get(bolt11)
            .copied()
    }
}

#[async_trait]
impl LightningClient for MockLightning {
    async fn invoice(
        &self,
        amount_msat: u64,
        _label: &str,
        _description: &str,
        expiry_secs: u32,
    ) -> Result<CreatedInvoice> {
        let mut inner = self.inner.lock().expect("ln poisoned");
        inner.counter += 1;

        let mut preimage = [0u8; 32];
        preimage[..8].copy_from_slice(&inner.counter.to_be_bytes());
        preimage[8] = 0x5a;
        let payment_hash = sha256_preimage(&preimage);
        let bolt11 = format!("lnmock1{}n{}", hex::encode(&payment_hash[..8]), inner.counter);
        inner.invoices.insert(bolt11.clone(), (preimage, amount_msat));

        Ok(CreatedInvoice {
            bolt11,
            payment_hash_hex: hex::encode(payment_hash),
            amount_msat,
            expires_at_unix: ln_spl_swap::protocol::envelope::now_unix() + expiry_secs as i64,
        })
    }

    async fn pay(&self, bolt11: &str) -> Result<[u8; 32]> {
        let mut inner = self.inner.lock().expect("ln poisoned");
        anyhow::ensure!(!inner.fail_pays, "mock: route_not_found");

        let (preimage, _) = *inner
            .invoices
            .get(bolt11)
            .ok_or_else(|| anyhow::anyhow!("unknown invoice"))?;
        inner.payments.insert(bolt11.to_string(), preimage);
        Ok(preimage)
    }
}
