use serde::Deserialize;
use std::convert::TryFrom;
use std::time::Duration;

/// A termination signal that triggers the graceful shutdown of a started
/// [`Ship`](crate::Ship).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum Signal {
    #[serde(rename = "SIGINT")]
    Interrupt,
    #[serde(rename = "SIGTERM")]
    Terminate,
    #[serde(rename = "SIGQUIT")]
    Quit,
    #[serde(rename = "SIGHUP")]
    Hangup,
}

/// Configuration of a [`Ship`](crate::Ship) and the HTTP server it starts.
///
/// It can be built in code, or loaded from a `ship` config file and
/// environment variables with the "SHIP_" prefix through [`Config::new`].
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// The name of the router, used in the server log lines.
    #[serde(default)]
    pub name: String,
    /// The prefix prepended to every registered route.
    #[serde(default)]
    pub prefix: String,
    /// Reveals the messages of server errors to the client.
    #[serde(default)]
    pub debug: bool,
    /// If true, the trailing slash of paths is neither removed at
    /// registration nor at lookup, so `/a/` and `/a` are different routes.
    #[serde(default)]
    pub keep_trailing_slash: bool,
    /// Initial capacity of the buffers handed out by the buffer pool. Defaults to 2KB.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Initial capacity of the key/value store of each context.
    #[serde(default)]
    pub context_store_size: usize,
    /// Maximum number of middlewares in one chain. Defaults to 256.
    #[serde(default = "default_max_middlewares")]
    pub max_middlewares: usize,
    /// Maximum number of path parameters in one route. Defaults to 32.
    #[serde(default = "default_max_params")]
    pub max_params: usize,
    /// Signals that trigger the graceful shutdown. An empty list disables
    /// signal handling.
    #[serde(default = "default_signals")]
    pub signals: Vec<Signal>,
    /// Grace period for in-flight connections when the shutdown is
    /// triggered without an explicit deadline. Defaults to 10 seconds.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Maximum number of worker threads. Defaults to CPU count * 15.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Keep-alive duration in seconds for worker threads. Defaults to 6 seconds.
    #[serde(default = "default_keep_alive_secs")]
    pub worker_keep_alive_secs: u64,
    #[serde(default = "default_true")]
    pub http1_keep_alive: bool,
    #[serde(default)]
    pub http1_half_close: bool,
    /// Maximum buffer size for HTTP/1.x requests. Defaults to 512kb (524,288 bytes).
    #[serde(default = "default_max_buf_size")]
    pub http1_max_buf_size: usize,
    #[serde(default)]
    pub http1_only: bool,
    #[cfg(feature = "http2")]
    #[serde(default)]
    pub http2_only: bool,
}

/// Implements conversion from the config crate's Config type to Config.
impl TryFrom<config::Config> for Config {
    type Error = config::ConfigError;

    fn try_from(config: config::Config) -> Result<Self, Self::Error> {
        config.try_deserialize()
    }
}

impl Config {
    /// Loads the configuration from the environment.
    ///
    /// This method will:
    /// 1. Load environment variables from a .env file if present
    /// 2. Load configuration from a "ship" file (if it exists)
    /// 3. Override with environment variables prefixed with "SHIP_"
    ///
    /// # Errors
    /// Returns a ConfigError if configuration loading or parsing fails.
    pub fn new() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("ship").required(false))
            .add_source(config::Environment::with_prefix("SHIP"));

        builder.build()?.try_into()
    }

    /// Normalizes the values that have a meaning only in a restricted range.
    pub(crate) fn normalize(mut self) -> Self {
        self.prefix = self.prefix.trim_end_matches('/').to_owned();
        if self.buffer_size == 0 {
            self.buffer_size = default_buffer_size();
        }
        if self.max_middlewares == 0 {
            self.max_middlewares = default_max_middlewares();
        }
        if self.max_params == 0 {
            self.max_params = default_max_params();
        }
        if self.max_workers == 0 {
            self.max_workers = default_max_workers();
        }
        self
    }

    /// Converts the worker_keep_alive_secs value into a Duration.
    pub fn worker_keep_alive(&self) -> Duration {
        Duration::from_secs(self.worker_keep_alive_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn default_buffer_size() -> usize {
    2048
}

fn default_max_middlewares() -> usize {
    256
}

fn default_max_params() -> usize {
    32
}

fn default_signals() -> Vec<Signal> {
    vec![Signal::Interrupt, Signal::Terminate, Signal::Quit]
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

/// Default value for max_workers. Returns CPU count * 15.
fn default_max_workers() -> usize {
    num_cpus::get() * 15
}

/// Default worker keep-alive duration in seconds.
fn default_keep_alive_secs() -> u64 {
    6
}

fn default_true() -> bool {
    true
}

/// Default maximum buffer size (512kb).
fn default_max_buf_size() -> usize {
    524_288
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: String::new(),
            prefix: String::new(),
            debug: false,
            keep_trailing_slash: false,
            buffer_size: default_buffer_size(),
            context_store_size: 0,
            max_middlewares: default_max_middlewares(),
            max_params: default_max_params(),
            signals: default_signals(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            max_workers: default_max_workers(),
            worker_keep_alive_secs: default_keep_alive_secs(),
            http1_keep_alive: true,
            http1_half_close: false,
            http1_max_buf_size: default_max_buf_size(),
            http1_only: false,
            #[cfg(feature = "http2")]
            http2_only: false,
        }
    }
}
