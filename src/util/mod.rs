pub mod checksum;
pub mod compress;
pub mod download;
pub mod quote;
