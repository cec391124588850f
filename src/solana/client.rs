use std::str::FromStr as _;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use solana_rpc_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer as _;
use solana_sdk::transaction::Transaction;

use super::escrow::{
    self, fee_for, ConfigStateAccount, EscrowStateAccount, STATUS_ACTIVE,
};
use crate::protocol::validate::amount_units;
use crate::protocol::EscrowCreatedBody;

const SUBMIT_ATTEMPTS: u32 = 3;
const SUBMIT_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct CreateEscrowArgs {
    pub payer_token_account: Pubkey,
    pub mint: Pubkey,
    pub payment_hash: [u8; 32],
    pub recipient: Pubkey,
    pub refund: Pubkey,
    pub refund_after_unix: i64,
    pub net_amount: u64,
    /// The quoted split; the on-chain config must carry exactly the
    /// combined bps or the transaction is not submitted.
    pub expected_platform_fee_bps: u16,
    pub expected_trade_fee_bps: u16,
}

#[derive(Debug, Clone)]
pub struct ClaimEscrowArgs {
    pub recipient_token_account: Pubkey,
    pub mint: Pubkey,
    pub payment_hash: [u8; 32],
    pub preimage: [u8; 32],
}

#[derive(Debug, Clone)]
pub struct RefundEscrowArgs {
    pub refund_token_account: Pubkey,
    pub mint: Pubkey,
    pub payment_hash: [u8; 32],
}

/// On-chain side effects and reads needed by the engines. The RPC
/// client is the production implementation; tests drive a mock chain.
#[async_trait]
pub trait EscrowChain: Send + Sync {
    fn program_id(&self) -> Pubkey;

    async fn get_escrow_state(&self, payment_hash: &[u8; 32])
        -> Result<Option<EscrowStateAccount>>;

    async fn get_config_state(&self) -> Result<Option<ConfigStateAccount>>;

    async fn token_balance(&self, token_account: &Pubkey) -> Result<u64>;

    async fn create_escrow(&self, args: CreateEscrowArgs) -> Result<String>;

    async fn claim_escrow(&self, args: ClaimEscrowArgs) -> Result<String>;

    async fn refund_escrow(&self, args: RefundEscrowArgs) -> Result<String>;

    /// Clock used for refund-timer decisions. The program enforces the
    /// real cluster clock regardless.
    async fn now_unix(&self) -> Result<i64>;
}

pub struct RpcEscrowClient {
    rpc: RpcClient,
    program_id: Pubkey,
    signer: Keypair,
}

impl RpcEscrowClient {
    pub fn new(rpc_url: String, program_id: Pubkey, signer: Keypair) -> Self {
        Self {
            rpc: RpcClient::new_with_commitment(rpc_url, CommitmentConfig::confirmed()),
            program_id,
            signer,
        }
    }

    pub fn signer_pubkey(&self) -> Pubkey {
        self.signer.pubkey()
    }

    async fn fetch_account(&self, address: &Pubkey) -> Result<Option<Vec<u8>>> {
        let resp = self
            .rpc
            .get_account_with_commitment(address, CommitmentConfig::confirmed())
            .await
            .with_context(|| format!("get account {address}"))?;
        Ok(resp.value.map(|account| account.data))
    }

    pub async fn init_config(&self, fee_collector: &Pubkey, fee_bps: u16) -> Result<String> {
        let ix = escrow::init_config_instruction(
            &self.program_id,
            &self.signer.pubkey(),
            fee_collector,
            fee_bps,
        );
        self.submit(ix).await
    }

    pub async fn set_config(&self, fee_collector: &Pubkey, fee_bps: u16) -> Result<String> {
        let ix = escrow::set_config_instruction(
            &self.program_id,
            &self.signer.pubkey(),
            fee_collector,
            fee_bps,
        );
        self.submit(ix).await
    }

    pub async fn withdraw_fees(
        &self,
        dest_token: &Pubkey,
        mint: &Pubkey,
        amount: u64,
    ) -> Result<String> {
        let ix = escrow::withdraw_fees_instruction(
            &self.program_id,
            &self.signer.pubkey(),
            dest_token,
            mint,
            amount,
        );
        self.submit(ix).await
    }

    pub async fn fee_vault_balance(&self, mint: &Pubkey) -> Result<u64> {
        let (config_pda, _) = escrow::derive_config_pda(&self.program_id);
        let fee_vault = escrow::derive_fee_vault_ata(&config_pda, mint);
        self.token_balance(&fee_vault).await
    }

    /// Sign and submit with a fresh blockhash per attempt; expired
    /// blockhashes are the common transient failure here.
    async fn submit(&self, instruction: solana_sdk::instruction::Instruction) -> Result<String> {
        let mut last_err = None;
        for attempt in 1..=SUBMIT_ATTEMPTS {
            let blockhash = self
                .rpc
                .get_latest_blockhash()
                .await
                .context("get latest blockhash")?;
            let tx = Transaction::new_signed_with_payer(
                &[instruction.clone()],
                Some(&self.signer.pubkey()),
                &[&self.signer],
                blockhash,
            );
            match self.rpc.send_and_confirm_transaction(&tx).await {
                Ok(sig) => return Ok(sig.to_string()),
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "escrow tx submit failed");
                    last_err = Some(err);
                    tokio::time::sleep(SUBMIT_BACKOFF * attempt).await;
                }
            }
        }
        Err(last_err.expect("at least one attempt ran")).context("submit escrow transaction")
    }
}

#[async_trait]
impl EscrowChain for RpcEscrowClient {
    fn program_id(&self) -> Pubkey {
        self.program_id
    }

    async fn get_escrow_state(
        &self,
        payment_hash: &[u8; 32],
    ) -> Result<Option<EscrowStateAccount>> {
        let (escrow_pda, _) = escrow::derive_escrow_pda(payment_hash, &self.program_id);
        match self.fetch_account(&escrow_pda).await? {
            Some(data) => Ok(Some(EscrowStateAccount::decode(&data)?)),
            None => Ok(None),
        }
    }

    async fn get_config_state(&self) -> Result<Option<ConfigStateAccount>> {
        let (config_pda, _) = escrow::derive_config_pda(&self.program_id);
        match self.fetch_account(&config_pda).await? {
            Some(data) => Ok(Some(ConfigStateAccount::decode(&data)?)),
            None => Ok(None),
        }
    }

    async fn token_balance(&self, token_account: &Pubkey) -> Result<u64> {
        use solana_sdk::program_pack::Pack as _;
        let data = self
            .fetch_account(token_account)
            .await?
            .with_context(|| format!("token account {token_account} does not exist"))?;
        let account =
            spl_token::state::Account::unpack(&data).context("unpack token account")?;
        Ok(account.amount)
    }

    async fn create_escrow(&self, args: CreateEscrowArgs) -> Result<String> {
        let config = self
            .get_config_state()
            .await?
            .context("escrow config is not initialized")?;
        let expected_bps = args
            .expected_platform_fee_bps
            .checked_add(args.expected_trade_fee_bps)
            .context("fee bps overflow")?;
        anyhow::ensure!(
            config.fee_bps == expected_bps,
            "on-chain fee is {} bps, quoted split totals {} bps",
            config.fee_bps,
            expected_bps
        );

        let ix = escrow::init_instruction(
            &self.program_id,
            &self.signer.pubkey(),
            &args.payer_token_account,
            &args.mint,
            &args.payment_hash,
            &args.recipient,
            &args.refund,
            args.refund_after_unix,
            args.net_amount,
        );
        self.submit(ix).await
    }

    async fn claim_escrow(&self, args: ClaimEscrowArgs) -> Result<String> {
        let ix = escrow::claim_instruction(
            &self.program_id,
            &self.signer.pubkey(),
            &args.recipient_token_account,
            &args.mint,
            &args.payment_hash,
            &args.preimage,
        );
        self.submit(ix).await
    }

    async fn refund_escrow(&self, args: RefundEscrowArgs) -> Result<String> {
        let ix = escrow::refund_instruction(
            &self.program_id,
            &self.signer.pubkey(),
            &args.refund_token_account,
            &args.mint,
            &args.payment_hash,
        );
        self.submit(ix).await
    }

    async fn now_unix(&self) -> Result<i64> {
        Ok(crate::protocol::envelope::now_unix())
    }
}

/// Outcome of the taker-side pre-payment guard.
#[derive(Debug)]
pub enum EscrowCheck {
    Ok(EscrowStateAccount),
    /// The claimed escrow contradicts what the chain holds. Fatal for
    /// the trade: the taker must not pay.
    Mismatch(String),
}

/// Recompute every derivable address from the `SOL_ESCROW_CREATED`
/// claims and compare against confirmed on-chain state. RPC failures
/// bubble as `Err` (retryable); contradictions return
/// [`EscrowCheck::Mismatch`].
pub async fn verify_escrow_on_chain(
    chain: &dyn EscrowChain,
    body: &EscrowCreatedBody,
) -> Result<EscrowCheck> {
    let mismatch = |what: &str| Ok(EscrowCheck::Mismatch(what.to_string()));

    let Ok(claimed_program) = Pubkey::from_str(&body.program_id) else {
        return mismatch("program_id is not a valid pubkey");
    };
    if claimed_program != chain.program_id() {
        return mismatch("program_id differs from the configured escrow program");
    }

    let (Ok(mint), Ok(recipient), Ok(refund)) = (
        Pubkey::from_str(&body.mint),
        Pubkey::from_str(&body.recipient),
        Pubkey::from_str(&body.refund),
    ) else {
        return mismatch("mint/recipient/refund is not a valid pubkey");
    };

    let Ok(payment_hash) = hex::decode(&body.payment_hash_hex) else {
        return mismatch("payment_hash_hex is not hex");
    };
    let Ok(payment_hash) = <[u8; 32]>::try_from(payment_hash) else {
        return mismatch("payment_hash must be 32 bytes");
    };

    let (escrow_pda, _) = escrow::derive_escrow_pda(&payment_hash, &chain.program_id());
    if body.escrow_pda != escrow_pda.to_string() {
        return mismatch("escrow_pda does not derive from the payment hash");
    }
    let vault = escrow::derive_vault_ata(&escrow_pda, &mint);
    if body.vault_ata != vault.to_string() {
        return mismatch("vault_ata does not derive from the escrow PDA");
    }

    let net_amount = match amount_units(&body.amount) {
        Ok(value) => value,
        Err(_) => return mismatch("amount is not a valid base-unit integer"),
    };

    let Some(state) = chain.get_escrow_state(&payment_hash).await? else {
        return mismatch("no escrow account on chain for this payment hash");
    };

    if state.status != STATUS_ACTIVE {
        return mismatch("escrow is not active");
    }
    if state.payment_hash != payment_hash {
        return mismatch("on-chain payment hash differs");
    }
    if state.mint != mint.to_bytes() {
        return mismatch("on-chain mint differs");
    }
    if state.recipient != recipient.to_bytes() {
        return mismatch("on-chain recipient differs");
    }
    if state.refund != refund.to_bytes() {
        return mismatch("on-chain refund authority differs");
    }
    if state.vault != vault.to_bytes() {
        return mismatch("on-chain vault differs");
    }
    if state.refund_after != body.refund_after_unix {
        return mismatch("on-chain refund timer differs");
    }
    if state.net_amount != net_amount {
        return mismatch("on-chain net amount differs");
    }

    let combined_bps = body.platform_fee_bps as u32 + body.trade_fee_bps as u32;
    if state.fee_bps as u32 != combined_bps {
        return mismatch("on-chain fee bps differ from the quoted split");
    }
    if state.fee_amount != fee_for(net_amount, state.fee_bps) {
        return mismatch("on-chain fee amount inconsistent with fee bps");
    }

    let vault_balance = chain.token_balance(&vault).await?;
    let Some(required) = state.net_amount.checked_add(state.fee_amount) else {
        return mismatch("net + fee overflows");
    };
    if vault_balance < required {
        return mismatch("vault does not hold net + fees");
    }

    Ok(EscrowCheck::Ok(state))
}
