use anyhow::{Context as _, Result};

use ln_spl_swap::receipts::{ReceiptsStore, TradePatch};

#[test]
fn receipts_store_upsert_merges_partial_patches() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let path = dir.path().join("receipts.sqlite3");

    let mut store = ReceiptsStore::open(path).context("open receipts store")?;

    store
        .upsert_trade(
            "trade-a",
            &TradePatch {
                state: Some("terms".into()),
                role: Some("maker".into()),
                counterparty: Some("cafebabe".into()),
                ..TradePatch::default()
            },
            1_000,
        )
        .context("insert trade-a")?;

    store
        .upsert_trade(
            "trade-a",
            &TradePatch {
                state: Some("invoice".into()),
                bolt11: Some("lnbc1...".into()),
                payment_hash_hex: Some("ab".repeat(32)),
                amount_msat: Some(10_000_000),
                ..TradePatch::default()
            },
            2_000,
        )
        .context("patch trade-a")?;

    let got = store
        .get("trade-a")
        .context("get trade-a")?
        .context("trade-a missing")?;
    assert_eq!(got.state, "invoice");
    assert_eq!(got.role, "maker");
    assert_eq!(got.counterparty.as_deref(), Some("cafebabe"));
    assert_eq!(got.bolt11.as_deref(), Some("lnbc1..."));
    assert_eq!(got.amount_msat, Some(10_000_000));
    assert_eq!(got.updated_at_ms, 2_000);

    store
        .upsert_trade(
            "trade-a",
            &TradePatch {
                state: Some("claimed".into()),
                claim_tx_sig: Some("sig-claim".into()),
                ln_paid: Some(true),
                ..TradePatch::default()
            },
            3_000,
        )
        .context("finalize trade-a")?;
    let got = store
        .get("trade-a")
        .context("get trade-a final")?
        .context("trade-a missing after final")?;
    assert_eq!(got.state, "claimed");
    assert!(got.ln_paid);
    assert_eq!(got.claim_tx_sig.as_deref(), Some("sig-claim"));
    // Untouched fields survive the merge.
    assert_eq!(got.payment_hash_hex.as_deref(), Some("ab".repeat(32).as_str()));

    Ok(())
}

#[test]
fn receipts_store_filters_by_state() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mut store =
        ReceiptsStore::open(dir.path().join("receipts.sqlite3")).context("open store")?;

    for (trade_id, state) in [("a", "escrow"), ("b", "claimed"), ("c", "escrow")] {
        store
            .upsert_trade(
                trade_id,
                &TradePatch {
                    state: Some(state.into()),
                    ..TradePatch::default()
                },
                1,
            )
            .with_context(|| format!("insert {trade_id}"))?;
    }

    let escrows = store.list_by_state("escrow").context("list escrow")?;
    assert_eq!(
        escrows.iter().map(|t| t.trade_id.as_str()).collect::<Vec<_>>(),
        vec!["a", "c"]
    );
    Ok(())
}

#[test]
fn event_log_is_append_only_and_redacted() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mut store =
        ReceiptsStore::open(dir.path().join("receipts.sqlite3")).context("open store")?;

    store
        .append_event(
            "trade-a",
            "ln.paid",
            &serde_json::json!({ "preimage_hex": "00".repeat(32), "amount_msat": 10 }),
            1_000,
        )
        .context("append first")?;
    store
        .append_event("trade-a", "escrow.claimed", &serde_json::json!({ "tx_sig": "s" }), 2_000)
        .context("append second")?;

    let events = store.list_events("trade-a").context("list events")?;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, "ln.paid");
    assert_eq!(events[1].kind, "escrow.claimed");

    let first: serde_json::Value =
        serde_json::from_str(&events[0].payload_json).context("parse payload")?;
    assert_eq!(first["preimage_hex"], "[redacted]");
    assert_eq!(first["amount_msat"], 10);
    Ok(())
}
