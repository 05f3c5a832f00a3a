pub mod config;
pub mod connection;
pub mod error;
pub mod ipc;
pub mod link;
pub mod manager;
pub mod resolver;
pub mod token;
pub mod worker;
