pub mod capabilities;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod lifecycle;
pub mod notify;
pub mod registry;
pub mod seed;
pub mod storage;
pub mod types;

pub use config::Config;
pub use types::*;
