use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

const DEFAULT_TRANSPORT_API_URL: &str = "https://api.resend.com/emails";

/// Service configuration, loaded from `MAILSPOOL_`-prefixed environment
/// variables.
///
/// An absent `transport_api_key` is a valid, degraded configuration: enqueue
/// keeps accepting messages, delivery waits until a key is provided.
#[derive(Clone, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,

    pub transport_api_key: Option<SecretString>,
    pub transport_api_url: Option<Url>,
    #[serde(default = "default_transport_timeout_secs")]
    pub transport_timeout_secs: u64,

    #[serde(default = "default_sender")]
    pub default_sender: String,
    pub default_sender_name: Option<String>,
}

fn default_transport_timeout_secs() -> u64 {
    10
}

fn default_sender() -> String {
    "no-reply@localhost".to_owned()
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("MAILSPOOL_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> Option<&str> {
        self.db_path.as_deref()
    }

    pub fn transport_api_url(&self) -> Url {
        self.transport_api_url.clone().unwrap_or_else(|| {
            DEFAULT_TRANSPORT_API_URL
                .parse()
                .expect("default transport url is valid")
        })
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.transport_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            transport_api_key: None,
            transport_api_url: None,
            transport_timeout_secs: default_transport_timeout_secs(),
            default_sender: default_sender(),
            default_sender_name: None,
        }
    }
}
