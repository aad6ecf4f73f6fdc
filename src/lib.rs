pub mod auth;
pub mod chat;
pub mod conf;
pub mod data;
pub mod server;
pub mod tracing;
pub mod types;
