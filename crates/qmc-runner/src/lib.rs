//! QMC runner: keeps a validator node supplied with a pre-shared key agreed
//! with its peers over QKD links, and supervises the node process.

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod exchange;
pub mod logging;
pub mod peers;
pub mod psk;
pub mod qkd;
pub mod qrng;
pub mod recovery;
pub mod retry;
pub mod rotation;
pub mod server;
pub mod store;
pub mod supervisor;

pub use config::RunnerConfig;
pub use context::AppContext;
pub use error::RunnerError;
pub use server::RunnerServer;
