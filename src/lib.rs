pub mod engine;
pub mod lightning;
pub mod logging;
pub mod protocol;
pub mod receipts;
pub mod solana;
pub mod transport;
