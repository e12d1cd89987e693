pub mod api;
pub mod config;
pub mod gateway;
pub mod router;
pub mod server;
