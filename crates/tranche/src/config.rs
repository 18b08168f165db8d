use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::proxy::ProxyConfig;
use crate::retry::RetryPolicy;

pub const DEFAULT_USER_AGENT: &str = concat!("tranche/", env!("CARGO_PKG_VERSION"));

/// Configurable options for the download engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Read timeout (maximum time between receiving data chunks)
    pub read_timeout: Duration,

    /// User agent used when the download does not carry its own
    pub user_agent: String,

    /// Extra headers sent with every request
    pub headers: HeaderMap,

    /// Proxy configuration (optional)
    pub proxy: Option<ProxyConfig>,

    /// Redirect hops followed before giving up with `TooManyRedirects`
    pub max_redirects: u32,

    /// Backoff and retry bound applied to retryable attempts
    pub retry: RetryPolicy,

    /// Remove the partial file when an attempt ends in an error status
    pub delete_file_on_error: bool,

    /// Reserve the full length on disk before transferring
    pub preallocate: bool,

    /// Truncate an existing destination file when metadata is first fetched
    pub replace_existing_file: bool,

    /// Progress is persisted only after this many bytes...
    pub progress_min_bytes: u64,

    /// ...and this much time since the last write
    pub progress_min_interval: Duration,

    pub speed_sample_interval: Duration,

    /// Write buffer per piece
    pub buffer_size: usize,

    /// How long pieces may take to record their state after a pause or stop
    pub cancel_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HeaderMap::new(),
            proxy: None,
            max_redirects: 5,
            retry: RetryPolicy::default(),
            delete_file_on_error: false,
            preallocate: true,
            replace_existing_file: false,
            progress_min_bytes: 64 * 1024,
            progress_min_interval: Duration::from_secs(2),
            speed_sample_interval: Duration::from_millis(500),
            buffer_size: 64 * 1024,
            cancel_grace: Duration::from_secs(2),
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    pub fn max_retries(&self) -> u32 {
        self.retry.max_retries
    }
}

/// Builder for [`EngineConfig`]
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Adds a header; invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.config.headers.insert(name, value);
        }
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.config.headers.extend(headers);
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.config.proxy = Some(proxy);
        self
    }

    pub fn with_max_redirects(mut self, max_redirects: u32) -> Self {
        self.config.max_redirects = max_redirects;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.retry.max_retries = max_retries;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn with_delete_file_on_error(mut self, enabled: bool) -> Self {
        self.config.delete_file_on_error = enabled;
        self
    }

    pub fn with_preallocate(mut self, enabled: bool) -> Self {
        self.config.preallocate = enabled;
        self
    }

    pub fn with_replace_existing_file(mut self, enabled: bool) -> Self {
        self.config.replace_existing_file = enabled;
        self
    }

    pub fn with_progress_cadence(mut self, min_bytes: u64, min_interval: Duration) -> Self {
        self.config.progress_min_bytes = min_bytes;
        self.config.progress_min_interval = min_interval;
        self
    }

    pub fn with_speed_sample_interval(mut self, interval: Duration) -> Self {
        self.config.speed_sample_interval = interval;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size.max(1);
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.config.cancel_grace = grace;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}
