pub mod client;
pub mod escrow;

pub use client::{
    verify_escrow_on_chain, ClaimEscrowArgs, CreateEscrowArgs, EscrowChain, EscrowCheck,
    RefundEscrowArgs, RpcEscrowClient,
};
pub use escrow::{ConfigStateAccount, EscrowStateAccount};
