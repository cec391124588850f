use std::str::FromStr as _;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use bitcoin::hashes::Hash as _;
use lightning_invoice::Bolt11Invoice;

#[derive(Debug, Clone)]
pub struct DecodedBolt11 {
    pub payment_hash: [u8; 32],
    pub amount_msat: Option<u64>,
    pub expires_at_unix: Option<i64>,
}

pub fn decode_bolt11(invoice: &str) -> Result<DecodedBolt11> {
    let invoice = parse(invoice)?;
    Ok(DecodedBolt11 {
        payment_hash: invoice.payment_hash().to_byte_array(),
        amount_msat: invoice.amount_milli_satoshis(),
        expires_at_unix: invoice.expires_at().map(|d| d.as_secs() as i64),
    })
}

pub fn payment_hash_from_bolt11(invoice: &str) -> Result<[u8; 32]> {
    Ok(parse(invoice)?.payment_hash().to_byte_array())
}

pub fn amount_msat_from_bolt11(invoice: &str) -> Result<Option<u64>> {
    Ok(parse(invoice)?.amount_milli_satoshis())
}

pub fn is_expired_bolt11(invoice: &str) -> Result<bool> {
    let invoice = parse(invoice)?;
    let Some(expires_at) = invoice.expires_at() else {
        return Ok(false);
    };
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0));
    Ok(now >= expires_at)
}

fn parse(invoice: &str) -> Result<Bolt11Invoice> {
    Bolt11Invoice::from_str(invoice).map_err(|e| anyhow::anyhow!("parse BOLT11 invoice: {e:?}"))
}
