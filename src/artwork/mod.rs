pub mod store;
pub mod transcode;
