//! Side effects: filesystem, subprocesses, network.

pub mod backend;
pub mod config;
pub mod health;
pub mod paths;
pub mod port;
pub mod preflight;
pub mod presenter;
pub mod preserve;
pub mod process;
