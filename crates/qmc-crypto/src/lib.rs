#![forbid(unsafe_code)]

pub mod codec;
pub mod identity;
pub mod onetimepad;
pub mod utils;

pub use identity::{NodeKey, PeerIdentity};

#[cfg(test)]
mod proptests;
