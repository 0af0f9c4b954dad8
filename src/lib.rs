pub mod collector;
pub mod config;
pub mod context;
pub mod error;
pub mod mounts;
pub mod platform;
pub mod privilege;
pub mod runner;
pub mod sandbox;
pub mod shard;
pub mod util;
