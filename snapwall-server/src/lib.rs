pub mod cleanup;
pub mod config;
pub mod http;
pub mod payload;
pub mod state;
pub mod store;
pub mod upload;
