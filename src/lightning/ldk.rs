use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use ldk_server_client::client::LdkServerClient;
use ldk_server_protos::api::{Bolt11ReceiveRequest, Bolt11SendRequest, ListPaymentsRequest};
use ldk_server_protos::types::{
    Bolt11InvoiceDescription, PaymentDirection, PaymentStatus, bolt11_invoice_description,
    payment_kind,
};

use super::{sha256_preimage, CreatedInvoice, LightningClient};
use crate::lightning::invoice::decode_bolt11;

const DEFAULT_PAY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct LdkLightningClient {
    client: LdkServerClient,
    pay_timeout: Duration,
}

impl LdkLightningClient {
    pub fn new(rest_service_address: String) -> Self {
        Self {
            client: LdkServerClient::new(rest_service_address),
            pay_timeout: DEFAULT_PAY_TIMEOUT,
        }
    }

    pub fn with_pay_timeout(mut self, pay_timeout: Duration) -> Self {
        self.pay_timeout = pay_timeout;
        self
    }

    async fn bolt11_receive(
        &self,
        amount_msat: u64,
        description: String,
        expiry_secs: u32,
    ) -> Result<String> {
        let description = Bolt11InvoiceDescription {
            kind: Some(bolt11_invoice_description::Kind::Direct(description)),
        };

        let resp = self
            .client
            .bolt11_receive(Bolt11ReceiveRequest {
                amount_msat: Some(amount_msat),
                description: Some(description),
                expiry_secs,
            })
            .await
            .context("Bolt11Receive")?;

        Ok(resp.invoice)
    }

    async fn bolt11_send(&self, invoice: String) -> Result<String> {
        let resp = self
            .client
            .bolt11_send(Bolt11SendRequest {
                invoice,
                amount_msat: None,
                route_parameters: None,
            })
            .await
            .context("Bolt11Send")?;
        Ok(resp.payment_id)
    }

    async fn wait_preimage(&self, payment_id: &str, timeout: Duration) -> Result<[u8; 32]> {
        let deadline = Instant::now() + timeout;
        loop {
            let payments = self
                .client
                .list_payments(ListPaymentsRequest { page_token: None })
                .await
                .context("ListPayments")?
                .payments;

            if let Some(p) = payments.into_iter().find(|p| p.id == payment_id)
                && p.direction == PaymentDirection::Outbound as i32
                && p.status == PaymentStatus::Succeeded as i32
                && matches!(
                    p.kind.as_ref().and_then(|k| k.kind.as_ref()),
                    Some(payment_kind::Kind::Bolt11(_))
                )
            {
                let preimage_hex = p
                    .kind
                    .and_then(|k| k.kind)
                    .and_then(|k| match k {
                        payment_kind::Kind::Bolt11(b) => b.preimage,
                        _ => None,
                    })
                    .context("missing payment preimage")?;

                let bytes = hex::decode(preimage_hex).context("decode preimage hex")?;
                let preimage: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("preimage must be 32 bytes"))?;
                return Ok(preimage);
            }

            if Instant::now() >= deadline {
                anyhow::bail!("timeout waiting for preimage: payment_id={payment_id}");
            }

            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

#[async_trait]
impl LightningClient for LdkLightningClient {
    async fn invoice(
        &self,
        amount_msat: u64,
        label: &str,
        description: &str,
        expiry_secs: u32,
    ) -> Result<CreatedInvoice> {
        let bolt11 = self
            .bolt11_receive(amount_msat, format!("{label}: {description}"), expiry_secs)
            .await?;
        let decoded = decode_bolt11(&bolt11).context("decode created invoice")?;
        anyhow::ensure!(
            decoded.amount_msat == Some(amount_msat),
            "node issued an invoice for {:?} msat, requested {amount_msat}",
            decoded.amount_msat
        );
        Ok(CreatedInvoice {
            bolt11,
            payment_hash_hex: hex::encode(decoded.payment_hash),
            amount_msat,
            expires_at_unix: decoded.expires_at_unix.unwrap_or_default(),
        })
    }

    async fn pay(&self, bolt11: &str) -> Result<[u8; 32]> {
        let expected_hash = decode_bolt11(bolt11).context("decode invoice")?.payment_hash;
        let payment_id = self.bolt11_send(bolt11.to_string()).await?;
        let preimage = self
            .wait_preimage(&payment_id, self.pay_timeout)
            .await
            .context("wait preimage")?;
        anyhow::ensure!(
            sha256_preimage(&preimage) == expected_hash,
            "preimage hash mismatch for payment_id={payment_id}"
        );
        Ok(preimage)
    }
}
