//! Shared record layout for the TCP receive probe
//!
//! This crate is compiled both into the eBPF program and into the
//! userspace agent, so it must stay `no_std` and dependency-free.

#![no_std]

pub mod constants;
pub mod record;

pub use constants::*;
pub use record::RecvRecord;
