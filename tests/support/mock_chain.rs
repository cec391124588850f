use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use ln_spl_swap::lightning::sha256_preimage;
use ln_spl_swap::solana::escrow::{
    derive_config_pda, derive_escrow_pda, derive_fee_vault_ata, derive_vault_ata, fee_for,
    STATUS_ACTIVE, STATUS_CLAIMED, STATUS_REFUNDED,
};
use ln_spl_swap::solana::{
    ClaimEscrowArgs, ConfigStateAccount, CreateEscrowArgs, EscrowChain, EscrowStateAccount,
    RefundEscrowArgs,
};
use solana_sdk::pubkey::Pubkey;

#[derive(Debug, Clone)]
pub struct TokenAccount {
    pub mint: Pubkey,
    pub owner: Pubkey,
    pub amount: u64,
}

#[derive(Default)]
struct LedgerInner {
    config: Option<ConfigStateAccount>,
    escrows: HashMap<[u8; 32], EscrowStateAccount>,
    token_accounts: HashMap<Pubkey, TokenAccount>,
    clock_offset_sec: i64,
    tx_counter: u64,
    fail_creates: bool,
}

/// Shared in-memory stand-in for the escrow program's on-chain state.
/// Each peer gets its own [`MockChain`] handle carrying its signer, the
/// way each process holds its own RPC client and keypair.
pub struct MockLedger {
    program_id: Pubkey,
    inner: Mutex<LedgerInner>,
}

impl MockLedger {
    pub fn new(program_id: Pubkey) -> Arc<Self> {
        Arc::new(Self {
            program_id,
            inner: Mutex::new(LedgerInner::default()),
        })
    }

    pub fn program_id(&self) -> Pubkey {
        self.program_id
    }

    pub fn init_config(&self, authority: Pubkey, fee_collector: Pubkey, fee_bps: u16) {
        let (_, bump) = derive_config_pda(&self.program_id);
        self.inner.lock().expect("ledger poisoned").config = Some(ConfigStateAccount {
            v: ConfigStateAccount::V1,
            authority: authority.to_bytes(),
            fee_collector: fee_collector.to_bytes(),
            fee_bps,
            bump,
        });
    }

    /// Create a token account at a fresh address.
    pub fn create_token_account(&self, owner: Pubkey, mint: Pubkey, amount: u64) -> Pubkey {
        let address = Pubkey::new_unique();
        self.inner.lock().expect("ledger poisoned").token_accounts.insert(
            address,
            TokenAccount {
                mint,
                owner,
                amount,
            },
        );
        address
    }

    pub fn balance(&self, address: &Pubkey) -> u64 {
        self.inner
            .lock()
            .expect("ledger poisoned")
            .token_accounts
            .get(address)
            .map(|a| a.amount)
            .unwrap_or(0)
    }

    pub fn fee_vault_balance(&self, mint: &Pubkey) -> u64 {
        let (config_pda, _) = derive_config_pda(&self.program_id);
        self.balance(&derive_fee_vault_ata(&config_pda, mint))
    }

    pub fn escrow(&self, payment_hash: &[u8; 32]) -> Option<EscrowStateAccount> {
        self.inner
            .lock()
            .expect("ledger poisoned")
            .escrows
            .get(payment_hash)
            .cloned()
    }

    pub fn advance_clock(&self, sec: i64) {
        self.inner.lock().expect("ledger poisoned").clock_offset_sec += sec;
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.inner.lock().expect("ledger poisoned").fail_creates = fail;
    }

    pub fn connect(self: &Arc<Self>, signer: Pubkey) -> Arc<MockChain> {
        Arc::new(MockChain {
            ledger: Arc::clone(self),
            signer,
        })
    }

    fn now_unix(&self) -> i64 {
        ln_spl_swap::protocol::envelope::now_unix()
            + self.inner.lock().expect("ledger poisoned").clock_offset_sec
    }

    fn next_tx(&self, label: &str) -> String {
        let mut inner = self.inner.lock().expect("ledger poisoned");
        inner.tx_counter += 1;
        format!("mocktx-{label}-{}", inner.tx_counter)
    }
}

pub struct MockChain {
    ledger: Arc<MockLedger>,
    signer: Pubkey,
}

#[async_trait]
impl EscrowChain for MockChain {
    fn program_id(&self) -> Pubkey {
        self.ledger.program_id
    }

    async fn get_escrow_state(
        &self,
        payment_hash: &[u8; 32],
    ) -> Result<Option<EscrowStateAccount>> {
        Ok(self.ledger.escrow(payment_hash))
    }

    async fn get_config_state(&self) -> Result<Option<ConfigStateAccount>> {
        Ok(self.ledger.inner.lock().expect("ledger poisoned").config.clone())
    }

    async fn token_balance(&self, token_account: &Pubkey) -> Result<u64> {
        let inner = self.ledger.inner.lock().expect("ledger poisoned");
        inner
            .token_accounts
            .get(token_account)
            .map(|a| a.amount)
            .ok_or_else(|| anyhow::anyhow!("token account {token_account} does not exist"))
    }

    async fn create_escrow(&self, args: CreateEscrowArgs) -> Result<String> {
        let now = self.ledger.now_unix();
        let program_id = self.ledger.program_id;
        let mut inner = self.ledger.inner.lock().expect("ledger poisoned");

        anyhow::ensure!(!inner.fail_creates, "mock: submit failed");
        let config = inner.config.clone().ok_or_else(|| anyhow::anyhow!("config not initialized"))?;
        let expected_bps = args.expected_platform_fee_bps + args.expected_trade_fee_bps;
        anyhow::ensure!(
            config.fee_bps == expected_bps,
            "on-chain fee is {} bps, expected {}",
            config.fee_bps,
            expected_bps
        );
        anyhow::ensure!(
            !inner.escrows.contains_key(&args.payment_hash),
            "escrow already initialized"
        );
        anyhow::ensure!(args.refund_after_unix > now, "refund_after in the past");

        let fee_amount = fee_for(args.net_amount, config.fee_bps);
        let total = args.net_amount + fee_amount;

        let payer = inner
            .token_accounts
            .get_mut(&args.payer_token_account)
            .ok_or_else(|| anyhow::anyhow!("payer token account missing"))?;
        anyhow::ensure!(payer.owner == self.signer, "payer token owner mismatch");
        anyhow::ensure!(payer.mint == args.mint, "payer token mint mismatch");
        anyhow::ensure!(payer.amount >= total, "payer token insufficient balance");
        payer.amount -= total;

        let (escrow_pda, bump) = derive_escrow_pda(&args.payment_hash, &program_id);
        let vault = derive_vault_ata(&escrow_pda, &args.mint);
        inner.token_accounts.insert(
            vault,
            TokenAccount {
                mint: args.mint,
                owner: escrow_pda,
                amount: total,
            },
        );
        let (config_pda, _) = derive_config_pda(&program_id);
        let fee_vault = derive_fee_vault_ata(&config_pda, &args.mint);
        inner.token_accounts.entry(fee_vault).or_insert(TokenAccount {
            mint: args.mint,
            owner: config_pda,
            amount: 0,
        });

        inner.escrows.insert(
            args.payment_hash,
            EscrowStateAccount {
                v: EscrowStateAccount::V2,
                status: STATUS_ACTIVE,
                payment_hash: args.payment_hash,
                recipient: args.recipient.to_bytes(),
                refund: args.refund.to_bytes(),
                refund_after: args.refund_after_unix,
                mint: args.mint.to_bytes(),
                net_amount: args.net_amount,
                fee_amount,
                fee_bps: config.fee_bps,
                fee_collector: config.fee_collector,
                vault: vault.to_bytes(),
                bump,
            },
        );
        drop(inner);
        Ok(self.ledger.next_tx("init"))
    }

    async fn claim_escrow(&self, args: ClaimEscrowArgs) -> Result<String> {
        let program_id = self.ledger.program_id;
        let mut inner = self.ledger.inner.lock().expect("ledger poisoned");

        let escrow = inner
            .escrows
            .get(&args.payment_hash)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no escrow for payment hash"))?;
        anyhow::ensure!(escrow.status == STATUS_ACTIVE, "escrow not active");
        anyhow::ensure!(
            Pubkey::new_from_array(escrow.recipient) == self.signer,
            "claim signer is not the recipient"
        );
        anyhow::ensure!(
            sha256_preimage(&args.preimage) == escrow.payment_hash,
            "invalid preimage"
        );

        let recipient_token = inner
            .token_accounts
            .get(&args.recipient_token_account)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("recipient token account missing"))?;
        anyhow::ensure!(recipient_token.owner == self.signer, "recipient token owner mismatch");
        anyhow::ensure!(
            recipient_token.mint == Pubkey::new_from_array(escrow.mint),
            "recipient token mint mismatch"
        );

        let vault = Pubkey::new_from_array(escrow.vault);
        let net = escrow.net_amount;
        let fee = escrow.fee_amount;
        inner
            .token_accounts
            .get_mut(&vault)
            .ok_or_else(|| anyhow::anyhow!("vault missing"))?
            .amount -= net + fee;
        inner
            .token_accounts
            .get_mut(&args.recipient_token_account)
            .expect("checked above")
            .amount += net;
        let (config_pda, _) = derive_config_pda(&program_id);
        let fee_vault = derive_fee_vault_ata(&config_pda, &Pubkey::new_from_array(escrow.mint));
        inner
            .token_accounts
            .get_mut(&fee_vault)
            .ok_or_else(|| anyhow::anyhow!("fee vault missing"))?
            .amount += fee;

        let stored = inner.escrows.get_mut(&args.payment_hash).expect("checked above");
        stored.status = STATUS_CLAIMED;
        stored.net_amount = 0;
        stored.fee_amount = 0;
        drop(inner);
        Ok(self.ledger.next_tx("claim"))
    }

    async fn refund_escrow(&self, args: RefundEscrowArgs) -> Result<String> {
        let now = self.ledger.now_unix();
        let mut inner = self.ledger.inner.lock().expect("ledger poisoned");

        let escrow = inner
            .escrows
            .get(&args.payment_hash)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no escrow for payment hash"))?;
        anyhow::ensure!(escrow.status == STATUS_ACTIVE, "escrow not active");
        anyhow::ensure!(
            Pubkey::new_from_array(escrow.refund) == self.signer,
            "refund signer mismatch"
        );
        anyhow::ensure!(now >= escrow.refund_after, "too early to refund");

        let refund_token = inner
            .token_accounts
            .get(&args.refund_token_account)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("refund token account missing"))?;
        anyhow::ensure!(refund_token.owner == self.signer, "refund token owner mismatch");
        anyhow::ensure!(
            refund_token.mint == Pubkey::new_from_array(escrow.mint),
            "refund token mint mismatch"
        );

        let vault = Pubkey::new_from_array(escrow.vault);
        let total = escrow.net_amount + escrow.fee_amount;
        inner
            .token_accounts
            .get_mut(&vault)
            .ok_or_else(|| anyhow::anyhow!("vault missing"))?
            .amount -= total;
        inner
            .token_accounts
            .get_mut(&args.refund_token_account)
            .expect("checked above")
            .amount += total;

        let stored = inner.escrows.get_mut(&args.payment_hash).expect("checked above");
        stored.status = STATUS_REFUNDED;
        stored.net_amount = 0;
        stored.fee_amount = 0;
        drop(inner);
        Ok(self.ledger.next_tx("refund"))
    }

    async fn now_unix(&self) -> Result<i64> {
        Ok(self.ledger.now_unix())
    }
}
