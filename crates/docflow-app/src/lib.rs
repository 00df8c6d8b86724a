pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod paths;
pub mod server;
pub mod services;
pub mod storage;
