use std::net::SocketAddr;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:8081")]
    pub address: SocketAddr,

    #[envconfig(default = "redis://localhost:6379/")]
    pub redis_url: String,

    #[envconfig(default = "ncc")]
    pub key_prefix: String,

    /// Approximate cap on the number of entries kept in the log.
    #[envconfig(default = "10000")]
    pub max_log_length: u64,

    #[envconfig(default = "1000000")]
    pub filter_capacity: u64,

    #[envconfig(default = "0.0001")]
    pub filter_error_rate: f64,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,
}
