use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use rusqlite::{params, Connection, OptionalExtension as _};
use serde_json::Value;

/// Durable per-trade record. Partial updates are merged through
/// [`ReceiptsStore::upsert_trade`]; the append-only event log rides
/// alongside in `trade_events`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TradeRecord {
    pub trade_id: String,
    pub state: String,
    pub role: String,
    pub counterparty: Option<String>,
    pub terms_json: Option<String>,
    pub bolt11: Option<String>,
    pub payment_hash_hex: Option<String>,
    pub amount_msat: Option<u64>,
    pub escrow_tx_sig: Option<String>,
    pub claim_tx_sig: Option<String>,
    pub refund_tx_sig: Option<String>,
    pub ln_paid: bool,
    pub last_error: Option<String>,
    pub updated_at_ms: u64,
}

/// Fields to merge into a trade record; `None` leaves the stored value
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct TradePatch {
    pub state: Option<String>,
    pub role: Option<String>,
    pub counterparty: Option<String>,
    pub terms_json: Option<String>,
    pub bolt11: Option<String>,
    pub payment_hash_hex: Option<String>,
    pub amount_msat: Option<u64>,
    pub escrow_tx_sig: Option<String>,
    pub claim_tx_sig: Option<String>,
    pub refund_tx_sig: Option<String>,
    pub ln_paid: Option<bool>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TradeEvent {
    pub trade_id: String,
    pub ts_ms: u64,
    pub kind: String,
    pub payload_json: String,
}

#[derive(Debug)]
pub struct ReceiptsStore {
    conn: Connection,
    path: PathBuf,
}

impl ReceiptsStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create receipts dir {}", dir.display()))?;
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate sqlite schema")?;

        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn upsert_trade(&mut self, trade_id: &str, patch: &TradePatch, now_ms: u64) -> Result<()> {
        let mut record = self
            .get(trade_id)
            .with_context(|| format!("load trade {trade_id}"))?
            .unwrap_or_else(|| TradeRecord {
                trade_id: trade_id.to_string(),
                state: "new".to_string(),
                ..TradeRecord::default()
            });

        if let Some(state) = &patch.state {
            record.state = state.clone();
        }
        if let Some(role) = &patch.role {
            record.role = role.clone();
        }
        merge(&mut record.counterparty, &patch.counterparty);
        merge(&mut record.terms_json, &patch.terms_json);
        merge(&mut record.bolt11, &patch.bolt11);
        merge(&mut record.payment_hash_hex, &patch.payment_hash_hex);
        if let Some(amount_msat) = patch.amount_msat {
            record.amount_msat = Some(amount_msat);
        }
        merge(&mut record.escrow_tx_sig, &patch.escrow_tx_sig);
        merge(&mut record.claim_tx_sig, &patch.claim_tx_sig);
        merge(&mut record.refund_tx_sig, &patch.refund_tx_sig);
        if let Some(ln_paid) = patch.ln_paid {
            record.ln_paid = ln_paid;
        }
        merge(&mut record.last_error, &patch.last_error);
        record.updated_at_ms = now_ms;

        self.conn
            .execute(
                r#"
INSERT OR REPLACE INTO trades (
  trade_id,
  state,
  role,
  counterparty,
  terms_json,
  bolt11,
  payment_hash_hex,
  amount_msat,
  escrow_tx_sig,
  claim_tx_sig,
  refund_tx_sig,
  ln_paid,
  last_error,
  updated_at_ms
) VALUES (
  ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14
)
"#,
                params![
                    &record.trade_id,
                    &record.state,
                    &record.role,
                    record.counterparty.as_deref(),
                    record.terms_json.as_deref(),
                    record.bolt11.as_deref(),
                    record.payment_hash_hex.as_deref(),
                    record.amount_msat.map(|v| v as i64),
                    record.escrow_tx_sig.as_deref(),
                    record.claim_tx_sig.as_deref(),
                    record.refund_tx_sig.as_deref(),
                    record.ln_paid as i64,
                    record.last_error.as_deref(),
                    record.updated_at_ms as i64,
                ],
            )
            .with_context(|| format!("upsert trade {trade_id}"))?;
        Ok(())
    }

    /// Append-only; payloads are redacted before they touch disk.
    pub fn append_event(
        &mut self,
        trade_id: &str,
        kind: &str,
        payload: &Value,
        now_ms: u64,
    ) -> Result<()> {
        let payload = redact(payload.clone());
        self.conn
            .execute(
                "INSERT INTO trade_events (trade_id, ts_ms, kind, payload_json) VALUES (?1, ?2, ?3, ?4)",
                params![
                    trade_id,
                    now_ms as i64,
                    kind,
                    serde_json::to_string(&payload).context("encode event payload")?,
                ],
            )
            .with_context(|| format!("append event {kind} for {trade_id}"))?;
        Ok(())
    }

    pub fn get(&self, trade_id: &str) -> Result<Option<TradeRecord>> {
        self.conn
            .query_row(
                &format!("{TRADE_SELECT} WHERE trade_id = ?1"),
                params![trade_id],
                row_to_trade_record,
            )
            .optional()
            .with_context(|| format!("get trade {trade_id}"))
    }

    pub fn list_by_state(&self, state: &str) -> Result<Vec<TradeRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{TRADE_SELECT} WHERE state = ?1 ORDER BY trade_id"))
            .context("prepare list by state")?;
        let rows = stmt
            .query_map(params![state], row_to_trade_record)
            .context("query list by state")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read trade row")?);
        }
        Ok(out)
    }

    pub fn list_events(&self, trade_id: &str) -> Result<Vec<TradeEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT trade_id, ts_ms, kind, payload_json FROM trade_events WHERE trade_id = ?1 ORDER BY id",
            )
            .context("prepare list events")?;
        let rows = stmt
            .query_map(params![trade_id], |row| {
                let ts_ms: i64 = row.get(1)?;
                Ok(TradeEvent {
                    trade_id: row.get(0)?,
                    ts_ms: ts_ms as u64,
                    kind: row.get(2)?,
                    payload_json: row.get(3)?,
                })
            })
            .context("query list events")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read event row")?);
        }
        Ok(out)
    }
}

fn merge(slot: &mut Option<String>, patch: &Option<String>) {
    if let Some(value) = patch {
        *slot = Some(value.clone());
    }
}

const TRADE_SELECT: &str = r#"
SELECT
  trade_id,
  state,
  role,
  counterparty,
  terms_json,
  bolt11,
  payment_hash_hex,
  amount_msat,
  escrow_tx_sig,
  claim_tx_sig,
  refund_tx_sig,
  ln_paid,
  last_error,
  updated_at_ms
FROM trades
"#;

fn row_to_trade_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradeRecord> {
    let amount_msat: Option<i64> = row.get(7)?;
    let ln_paid: i64 = row.get(11)?;
    let updated_at_ms: i64 = row.get(13)?;

    Ok(TradeRecord {
        trade_id: row.get(0)?,
        state: row.get(1)?,
        role: row.get(2)?,
        counterparty: row.get(3)?,
        terms_json: row.get(4)?,
        bolt11: row.get(5)?,
        payment_hash_hex: row.get(6)?,
        amount_msat: amount_msat.map(|v| v as u64),
        escrow_tx_sig: row.get(8)?,
        claim_tx_sig: row.get(9)?,
        refund_tx_sig: row.get(10)?,
        ln_paid: ln_paid != 0,
        last_error: row.get(12)?,
        updated_at_ms: updated_at_ms as u64,
    })
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS trades (
  trade_id TEXT PRIMARY KEY,
  state TEXT NOT NULL,
  role TEXT NOT NULL DEFAULT '',
  counterparty TEXT,
  terms_json TEXT,
  bolt11 TEXT,
  payment_hash_hex TEXT,
  amount_msat INTEGER,
  escrow_tx_sig TEXT,
  claim_tx_sig TEXT,
  refund_tx_sig TEXT,
  ln_paid INTEGER NOT NULL DEFAULT 0,
  last_error TEXT,
  updated_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS trades_state_idx ON trades(state);

CREATE TABLE IF NOT EXISTS trade_events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  trade_id TEXT NOT NULL,
  ts_ms INTEGER NOT NULL,
  kind TEXT NOT NULL,
  payload_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS trade_events_trade_idx ON trade_events(trade_id);
"#,
    )
    .context("create tables")?;

    ensure_columns(conn).context("ensure columns")?;
    Ok(())
}

fn ensure_columns(conn: &Connection) -> Result<()> {
    let trade_cols = table_columns(conn, "trades").context("read trades columns")?;
    ensure_column(conn, "trades", &trade_cols, "role", "TEXT NOT NULL DEFAULT ''")?;
    ensure_column(conn, "trades", &trade_cols, "counterparty", "TEXT")?;
    ensure_column(conn, "trades", &trade_cols, "escrow_tx_sig", "TEXT")?;
    ensure_column(conn, "trades", &trade_cols, "claim_tx_sig", "TEXT")?;
    ensure_column(conn, "trades", &trade_cols, "refund_tx_sig", "TEXT")?;
    ensure_column(conn, "trades", &trade_cols, "last_error", "TEXT")?;
    Ok(())
}

fn table_columns(conn: &Connection, table: &str) -> Result<HashSet<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("prepare PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([]).context("query PRAGMA table_info")?;

    let mut out = HashSet::new();
    while let Some(row) = rows.next().context("read PRAGMA row")? {
        let name: String = row.get(1)?;
        out.insert(name);
    }
    Ok(out)
}

fn ensure_column(
    conn: &Connection,
    table: &str,
    columns: &HashSet<String>,
    name: &str,
    decl: &str,
) -> Result<()> {
    if columns.contains(name) {
        return Ok(());
    }
    conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {name} {decl}"), [])
        .with_context(|| format!("add column {table}.{name}"))?;
    Ok(())
}

const REDACTED_KEYS: &[&str] = &["preimage", "preimage_hex", "secret", "seed", "invite"];

/// Strip payment secrets, key material and invite payloads out of event
/// payloads before they are persisted or exported.
fn redact(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    if REDACTED_KEYS.iter().any(|r| k.eq_ignore_ascii_case(r)) {
                        (k, Value::String("[redacted]".into()))
                    } else {
                        (k, redact(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact).collect()),
        other => other,
    }
}
