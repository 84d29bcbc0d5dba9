#![cfg_attr(not(any(test, feature = "cargo-clippy")), no_std)]

pub mod stat;
