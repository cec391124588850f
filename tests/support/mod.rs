#![allow(dead_code)]

pub mod mock_chain;
pub mod mock_ln;
pub mod wait;
