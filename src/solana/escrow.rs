use borsh::{BorshDeserialize, BorshSerialize};
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::{system_program, sysvar};

pub const ESCROW_SEED: &[u8] = b"escrow";
pub const CONFIG_SEED: &[u8] = b"config";

/// Program-side cap on the combined fee; `InitConfig`/`SetConfig` above
/// this are rejected on chain.
pub const MAX_FEE_BPS: u16 = 2_500;

pub const STATUS_ACTIVE: u8 = 0;
pub const STATUS_CLAIMED: u8 = 1;
pub const STATUS_REFUNDED: u8 = 2;

/// Escrow account, layout v2 (221 bytes). Keyed by the Lightning
/// payment hash through the PDA seeds.
#[derive(Debug, Clone, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct EscrowStateAccount {
    pub v: u8,
    pub status: u8,
    pub payment_hash: [u8; 32],
    pub recipient: [u8; 32],
    pub refund: [u8; 32],
    pub refund_after: i64,
    pub mint: [u8; 32],
    pub net_amount: u64,
    pub fee_amount: u64,
    pub fee_bps: u16,
    pub fee_collector: [u8; 32],
    pub vault: [u8; 32],
    pub bump: u8,
}

impl EscrowStateAccount {
    pub const V2: u8 = 2;
    pub const LEN: usize = 221;

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        let state = Self::try_from_slice(&data[..Self::LEN.min(data.len())])
            .map_err(|e| anyhow::anyhow!("decode escrow account: {e}"))?;
        anyhow::ensure!(state.v == Self::V2, "unsupported escrow layout v{}", state.v);
        Ok(state)
    }
}

/// Config account, layout v1 (68 bytes).
#[derive(Debug, Clone, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct ConfigStateAccount {
    pub v: u8,
    pub authority: [u8; 32],
    pub fee_collector: [u8; 32],
    pub fee_bps: u16,
    pub bump: u8,
}

impl ConfigStateAccount {
    pub const V1: u8 = 1;
    pub const LEN: usize = 68;

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        let state = Self::try_from_slice(&data[..Self::LEN.min(data.len())])
            .map_err(|e| anyhow::anyhow!("decode config account: {e}"))?;
        anyhow::ensure!(state.v == Self::V1, "unsupported config layout v{}", state.v);
        Ok(state)
    }
}

pub fn derive_escrow_pda(payment_hash: &[u8; 32], program_id: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[ESCROW_SEED, payment_hash], program_id)
}

pub fn derive_config_pda(program_id: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[CONFIG_SEED], program_id)
}

/// The vault is the escrow PDA's associated token account for the mint.
pub fn derive_vault_ata(escrow_pda: &Pubkey, mint: &Pubkey) -> Pubkey {
    spl_associated_token_account::get_associated_token_address(escrow_pda, mint)
}

/// Collected fees accumulate in the config PDA's associated token
/// account until `WithdrawFees` drains them.
pub fn derive_fee_vault_ata(config_pda: &Pubkey, mint: &Pubkey) -> Pubkey {
    spl_associated_token_account::get_associated_token_address(config_pda, mint)
}

// Instruction data encodings: single tag byte followed by raw
// little-endian fields, exactly what the program's parser reads.

fn init_data(
    payment_hash: &[u8; 32],
    recipient: &Pubkey,
    refund: &Pubkey,
    refund_after: i64,
    amount: u64,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(1 + 32 + 32 + 32 + 8 + 8);
    data.push(0);
    data.extend_from_slice(payment_hash);
    data.extend_from_slice(&recipient.to_bytes());
    data.extend_from_slice(&refund.to_bytes());
    data.extend_from_slice(&refund_after.to_le_bytes());
    data.extend_from_slice(&amount.to_le_bytes());
    data
}

pub fn init_instruction(
    program_id: &Pubkey,
    payer: &Pubkey,
    payer_token: &Pubkey,
    mint: &Pubkey,
    payment_hash: &[u8; 32],
    recipient: &Pubkey,
    refund: &Pubkey,
    refund_after: i64,
    net_amount: u64,
) -> Instruction {
    let (escrow_pda, _) = derive_escrow_pda(payment_hash, program_id);
    let (config_pda, _) = derive_config_pda(program_id);
    let vault = derive_vault_ata(&escrow_pda, mint);
    let fee_vault = derive_fee_vault_ata(&config_pda, mint);

    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*payer, true),
            AccountMeta::new(*payer_token, false),
            AccountMeta::new(escrow_pda, false),
            AccountMeta::new(vault, false),
            AccountMeta::new_readonly(*mint, false),
            AccountMeta::new_readonly(system_program::id(), false),
            AccountMeta::new_readonly(spl_token::id(), false),
            AccountMeta::new_readonly(spl_associated_token_account::id(), false),
            AccountMeta::new_readonly(sysvar::rent::id(), false),
            AccountMeta::new_readonly(config_pda, false),
            AccountMeta::new(fee_vault, false),
        ],
        data: init_data(payment_hash, recipient, refund, refund_after, net_amount),
    }
}

pub fn claim_instruction(
    program_id: &Pubkey,
    recipient: &Pubkey,
    recipient_token: &Pubkey,
    mint: &Pubkey,
    payment_hash: &[u8; 32],
    preimage: &[u8; 32],
) -> Instruction {
    let (escrow_pda, _) = derive_escrow_pda(payment_hash, program_id);
    let (config_pda, _) = derive_config_pda(program_id);
    let vault = derive_vault_ata(&escrow_pda, mint);
    let fee_vault = derive_fee_vault_ata(&config_pda, mint);

    let mut data = Vec::with_capacity(1 + 32);
    data.push(1);
    data.extend_from_slice(preimage);

    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new_readonly(*recipient, true),
            AccountMeta::new(escrow_pda, false),
            AccountMeta::new(vault, false),
            AccountMeta::new(*recipient_token, false),
            AccountMeta::new(fee_vault, false),
            AccountMeta::new_readonly(spl_token::id(), false),
        ],
        data,
    }
}

pub fn refund_instruction(
    program_id: &Pubkey,
    refund_authority: &Pubkey,
    refund_token: &Pubkey,
    mint: &Pubkey,
    payment_hash: &[u8; 32],
) -> Instruction {
    let (escrow_pda, _) = derive_escrow_pda(payment_hash, program_id);
    let vault = derive_vault_ata(&escrow_pda, mint);

    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new_readonly(*refund_authority, true),
            AccountMeta::new(escrow_pda, false),
            AccountMeta::new(vault, false),
            AccountMeta::new(*refund_token, false),
            AccountMeta::new_readonly(spl_token::id(), false),
            AccountMeta::new_readonly(sysvar::clock::id(), false),
        ],
        data: vec![2],
    }
}

pub fn init_config_instruction(
    program_id: &Pubkey,
    payer: &Pubkey,
    fee_collector: &Pubkey,
    fee_bps: u16,
) -> Instruction {
    let (config_pda, _) = derive_config_pda(program_id);

    let mut data = Vec::with_capacity(1 + 32 + 2);
    data.push(3);
    data.extend_from_slice(&fee_collector.to_bytes());
    data.extend_from_slice(&fee_bps.to_le_bytes());

    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*payer, true),
            AccountMeta::new(config_pda, false),
            AccountMeta::new_readonly(system_program::id(), false),
            AccountMeta::new_readonly(sysvar::rent::id(), false),
        ],
        data,
    }
}

pub fn set_config_instruction(
    program_id: &Pubkey,
    authority: &Pubkey,
    fee_collector: &Pubkey,
    fee_bps: u16,
) -> Instruction {
    let (config_pda, _) = derive_config_pda(program_id);

    let mut data = Vec::with_capacity(1 + 32 + 2);
    data.push(4);
    data.extend_from_slice(&fee_collector.to_bytes());
    data.extend_from_slice(&fee_bps.to_le_bytes());

    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new_readonly(*authority, true),
            AccountMeta::new(config_pda, false),
        ],
        data,
    }
}

/// `amount == 0` drains the whole fee vault.
pub fn withdraw_fees_instruction(
    program_id: &Pubkey,
    fee_collector: &Pubkey,
    dest_token: &Pubkey,
    mint: &Pubkey,
    amount: u64,
) -> Instruction {
    let (config_pda, _) = derive_config_pda(program_id);
    let fee_vault = derive_fee_vault_ata(&config_pda, mint);

    let mut data = Vec::with_capacity(1 + 8);
    data.push(5);
    data.extend_from_slice(&amount.to_le_bytes());

    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new_readonly(*fee_collector, true),
            AccountMeta::new_readonly(config_pda, false),
            AccountMeta::new(fee_vault, false),
            AccountMeta::new(*dest_token, false),
            AccountMeta::new_readonly(spl_token::id(), false),
        ],
        data,
    }
}

/// Fee taken at `Init`: `net * fee_bps / 10_000`, floored, matching the
/// program's arithmetic.
pub fn fee_for(net_amount: u64, fee_bps: u16) -> u64 {
    ((net_amount as u128 * fee_bps as u128) / 10_000) as u64
}
