use std::time::Duration;

/// Configures timeout, retry and queue behavior of a
/// [`RequestHandler`](crate::RequestHandler).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HandlerOptions {
    /// Base URL that relative request paths are joined to.
    pub base_url: Option<String>,
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Base retry backoff in milliseconds (exponential strategy).
    pub retry_backoff_ms: u64,
    /// Upper bound for a single backoff delay.
    pub max_retry_backoff_ms: u64,
    /// Interval of the background queue processor.
    pub queue_interval_ms: u64,
    /// Capacity of the failed-request archive.
    pub failed_capacity: usize,
    /// Login entry point announced when a request comes back 401.
    pub login_url: String,
    /// Attach `Authorization: Bearer <token>` from the session store when the
    /// caller did not set the header.
    pub attach_bearer_token: bool,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: 30_000,
            max_retries: 3,
            retry_backoff_ms: 1_000,
            max_retry_backoff_ms: 30_000,
            queue_interval_ms: 5_000,
            failed_capacity: 100,
            login_url: "/login".to_owned(),
            attach_bearer_token: true,
        }
    }
}

impl HandlerOptions {
    /// Builds options from environment variables on top of the defaults.
    ///
    /// Reads (all optional):
    /// - `RESILIENT_FETCH_BASE_URL`
    /// - `RESILIENT_FETCH_TIMEOUT_MS`
    /// - `RESILIENT_FETCH_MAX_RETRIES`
    /// - `RESILIENT_FETCH_BACKOFF_MS`
    /// - `RESILIENT_FETCH_MAX_BACKOFF_MS`
    /// - `RESILIENT_FETCH_QUEUE_INTERVAL_MS`
    ///
    /// Returns an error if a variable is set but cannot be parsed.
    pub fn from_env() -> std::result::Result<Self, String> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> std::result::Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut opts = Self::default();

        if let Some(url) = lookup("RESILIENT_FETCH_BASE_URL") {
            if url.trim().is_empty() {
                return Err("RESILIENT_FETCH_BASE_URL is set but empty".to_owned());
            }
            opts.base_url = Some(url.trim().to_owned());
        }

        let number = |name: &str| -> std::result::Result<Option<u64>, String> {
            lookup(name)
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .map_err(|err| format!("{name} must be an unsigned integer: {err}"))
                })
                .transpose()
        };

        if let Some(value) = number("RESILIENT_FETCH_TIMEOUT_MS")? {
            opts.timeout_ms = value;
        }
        if let Some(value) = number("RESILIENT_FETCH_MAX_RETRIES")? {
            opts.max_retries = u32::try_from(value)
                .map_err(|_| "RESILIENT_FETCH_MAX_RETRIES is out of range".to_owned())?;
        }
        if let Some(value) = number("RESILIENT_FETCH_BACKOFF_MS")? {
            opts.retry_backoff_ms = value;
        }
        if let Some(value) = number("RESILIENT_FETCH_MAX_BACKOFF_MS")? {
            opts.max_retry_backoff_ms = value;
        }
        if let Some(value) = number("RESILIENT_FETCH_QUEUE_INTERVAL_MS")? {
            if value == 0 {
                return Err("RESILIENT_FETCH_QUEUE_INTERVAL_MS must be positive".to_owned());
            }
            opts.queue_interval_ms = value;
        }

        Ok(opts)
    }

    /// Delay before the retry that follows `retry_count` earlier retries:
    /// `min(base * 2^retry_count, max)`.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exp = retry_count.min(32);
        let multiplier = 1u64 << exp;
        let delay_ms = self
            .retry_backoff_ms
            .saturating_mul(multiplier)
            .min(self.max_retry_backoff_ms);
        Duration::from_millis(delay_ms)
    }

    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub(crate) fn queue_interval(&self) -> Duration {
        Duration::from_millis(self.queue_interval_ms.max(1))
    }
}
