use std::path::PathBuf;
use std::str::FromStr as _;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser as _, Subcommand};
use ln_spl_swap::solana::escrow::{
    derive_config_pda, derive_escrow_pda, derive_fee_vault_ata, derive_vault_ata,
};
use ln_spl_swap::solana::{EscrowChain as _, RpcEscrowClient};
use serde_json::json;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signer::keypair::read_keypair_file;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8899")]
    solana_rpc_url: String,

    #[arg(long)]
    program_id: String,

    /// Signer for config/withdraw operations; read-only commands accept
    /// any funded keypair.
    #[arg(long)]
    solana_keypair: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    ConfigGet,
    ConfigInit {
        #[arg(long)]
        fee_collector: String,

        #[arg(long)]
        fee_bps: u16,
    },
    ConfigSet {
        #[arg(long)]
        fee_collector: String,

        #[arg(long)]
        fee_bps: u16,
    },
    FeesBalance {
        #[arg(long)]
        mint: String,
    },
    FeesWithdraw {
        #[arg(long)]
        mint: String,

        #[arg(long)]
        dest_token_account: String,

        /// 0 drains the whole fee vault.
        #[arg(long, default_value_t = 0)]
        amount: u64,
    },
    EscrowGet {
        #[arg(long)]
        payment_hash_hex: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    ln_spl_swap::logging::init().ok();
    let args = Args::parse();

    let program_id = Pubkey::from_str(&args.program_id).context("parse program_id")?;
    let keypair = read_keypair_file(&args.solana_keypair)
        .map_err(|e| anyhow::anyhow!("read solana keypair: {e}"))?;
    let client = Arc::new(RpcEscrowClient::new(
        args.solana_rpc_url,
        program_id,
        keypair,
    ));

    let out = match args.command {
        Command::ConfigGet => {
            let (config_pda, bump) = derive_config_pda(&program_id);
            match client.get_config_state().await.context("fetch config")? {
                Some(state) => json!({
                    "config_pda": config_pda.to_string(),
                    "bump": bump,
                    "authority": Pubkey::new_from_array(state.authority).to_string(),
                    "fee_collector": Pubkey::new_from_array(state.fee_collector).to_string(),
                    "fee_bps": state.fee_bps,
                }),
                None => anyhow::bail!("config is not initialized"),
            }
        }
        Command::ConfigInit {
            fee_collector,
            fee_bps,
        } => {
            let fee_collector =
                Pubkey::from_str(&fee_collector).context("parse fee_collector")?;
            let tx_sig = client
                .init_config(&fee_collector, fee_bps)
                .await
                .context("InitConfig")?;
            json!({ "tx_sig": tx_sig })
        }
        Command::ConfigSet {
            fee_collector,
            fee_bps,
        } => {
            let fee_collector =
                Pubkey::from_str(&fee_collector).context("parse fee_collector")?;
            let tx_sig = client
                .set_config(&fee_collector, fee_bps)
                .await
                .context("SetConfig")?;
            json!({ "tx_sig": tx_sig })
        }
        Command::FeesBalance { mint } => {
            let mint = Pubkey::from_str(&mint).context("parse mint")?;
            let (config_pda, _) = derive_config_pda(&program_id);
            let fee_vault = derive_fee_vault_ata(&config_pda, &mint);
            let balance = client
                .fee_vault_balance(&mint)
                .await
                .context("fetch fee vault balance")?;
            json!({
                "fee_vault": fee_vault.to_string(),
                "balance": balance,
            })
        }
        Command::FeesWithdraw {
            mint,
            dest_token_account,
            amount,
        } => {
            let mint = Pubkey::from_str(&mint).context("parse mint")?;
            let dest =
                Pubkey::from_str(&dest_token_account).context("parse dest_token_account")?;
            let tx_sig = client
                .withdraw_fees(&dest, &mint, amount)
                .await
                .context("WithdrawFees")?;
            json!({ "tx_sig": tx_sig })
        }
        Command::EscrowGet { payment_hash_hex } => {
            let bytes = hex::decode(&payment_hash_hex).context("decode payment_hash_hex")?;
            let payment_hash: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("payment_hash must be 32 bytes"))?;
            let (escrow_pda, _) = derive_escrow_pda(&payment_hash, &program_id);
            match client
                .get_escrow_state(&payment_hash)
                .await
                .context("fetch escrow")?
            {
                Some(state) => {
                    let mint = Pubkey::new_from_array(state.mint);
                    json!({
                        "escrow_pda": escrow_pda.to_string(),
                        "status": state.status,
                        "payment_hash": hex::encode(state.payment_hash),
                        "recipient": Pubkey::new_from_array(state.recipient).to_string(),
                        "refund": Pubkey::new_from_array(state.refund).to_string(),
                        "refund_after": state.refund_after,
                        "mint": mint.to_string(),
                        "net_amount": state.net_amount,
                        "fee_amount": state.fee_amount,
                        "fee_bps": state.fee_bps,
                        "fee_collector": Pubkey::new_from_array(state.fee_collector).to_string(),
                        "vault": derive_vault_ata(&escrow_pda, &mint).to_string(),
                    })
                }
                None => anyhow::bail!("no escrow for payment hash {payment_hash_hex}"),
            }
        }
    };

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
