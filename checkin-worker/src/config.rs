use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "redis://localhost:6379/")]
    pub redis_url: String,

    #[envconfig(default = "ncc")]
    pub key_prefix: String,

    #[envconfig(default = "checkinConsumers")]
    pub consumer_group: NonEmptyString,

    /// How long a claim blocks waiting for new entries.
    #[envconfig(default = "5000")]
    pub block_timeout: EnvMsDuration,

    /// How long an entry must sit unacknowledged before another consumer may take it over.
    #[envconfig(default = "60000")]
    pub claim_min_idle: EnvMsDuration,

    /// Upper bound of the random pause after each processed entry; 0 disables it.
    #[envconfig(default = "0")]
    pub simulated_work_max_ms: EnvMsDuration,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(default = "1000000")]
    pub filter_capacity: u64,

    #[envconfig(default = "0.0001")]
    pub filter_error_rate: f64,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Longest a healthy loop can go between two liveness reports: a full
    /// blocking read followed by the longest backoff, plus some slack.
    pub fn liveness_deadline(&self) -> time::Duration {
        self.block_timeout.0
            + self.retry_policy.maximum_interval.0
            + self.simulated_work_max_ms.0
            + time::Duration::from_secs(10)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(from = "RETRY_BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "RETRY_INITIAL_INTERVAL", default = "100")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "RETRY_MAXIMUM_INTERVAL", default = "5000")]
    pub maximum_interval: EnvMsDuration,
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_millisecond_durations() {
        let parsed: EnvMsDuration = "1500".parse().unwrap();
        assert_eq!(parsed.0, time::Duration::from_millis(1500));
        assert!("1.5".parse::<EnvMsDuration>().is_err());
    }

    #[test]
    fn group_name_cannot_be_empty() {
        assert!("".parse::<NonEmptyString>().is_err());
        assert_eq!(
            "checkinConsumers".parse::<NonEmptyString>().unwrap().as_str(),
            "checkinConsumers"
        );
    }
}
