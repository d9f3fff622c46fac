pub mod codec;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod poll;
pub mod server;
pub mod stream;
