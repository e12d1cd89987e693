pub mod config;
pub mod error;
pub mod processor;
pub mod service;
pub mod worker;
