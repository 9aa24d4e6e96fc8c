pub mod btle;
pub mod commands;
pub mod connection;
pub mod constants;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod types;
pub mod watcher;
