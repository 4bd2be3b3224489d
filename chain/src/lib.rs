pub mod config;

pub use config::{ConsensusConstants, DEVNET_CONSTANTS};
