//! Pool configuration.
//!
//! [`PoolConfig`] controls sizing and borrow behaviour. [`DataSourceConfig`]
//! carries the opaque connect parameters handed to the connection manager.
//! Both can be loaded together from a properties document via [`Settings`].

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::PoolError;

/// Default number of connections created eagerly at startup.
pub const DEFAULT_INITIAL_SIZE: u32 = 5;

/// Default upper bound on live connections.
pub const DEFAULT_MAX_SIZE: u32 = 20;

/// Default time to wait for a free connection.
pub const DEFAULT_BORROW_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Configuration for the connection pool.
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// in future minor versions without breaking changes. Use the builder
/// pattern methods or [`Default::default()`] to construct instances.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Number of connections created when the pool is built.
    pub initial_size: u32,

    /// Maximum number of live connections (idle plus borrowed).
    pub max_size: u32,

    /// Time to wait for a connection before timing out.
    pub borrow_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_size: DEFAULT_INITIAL_SIZE,
            max_size: DEFAULT_MAX_SIZE,
            borrow_timeout: DEFAULT_BORROW_TIMEOUT,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of connections created eagerly.
    #[must_use]
    pub fn initial_size(mut self, count: u32) -> Self {
        self.initial_size = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_size(mut self, count: u32) -> Self {
        self.max_size = count;
        self
    }

    /// Set the borrow timeout.
    #[must_use]
    pub fn borrow_timeout(mut self, timeout: Duration) -> Self {
        self.borrow_timeout = timeout;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_size == 0 {
            return Err(PoolError::Configuration(
                "max_size must be greater than 0".into(),
            ));
        }
        if self.initial_size > self.max_size {
            return Err(PoolError::Configuration(
                "initial_size cannot be greater than max_size".into(),
            ));
        }
        Ok(())
    }

    fn from_properties(props: &Properties) -> Self {
        let mut config = Self::new();

        if let Some(value) = props.parsed::<u32>("pool.initialSize") {
            config.initial_size = value;
        }
        match props.parsed::<u32>("pool.maxSize") {
            Some(0) => {
                tracing::warn!(
                    default = DEFAULT_MAX_SIZE,
                    "pool.maxSize must be at least 1, using default"
                );
            }
            Some(value) => config.max_size = value,
            None => {}
        }
        if let Some(millis) = props.parsed::<u64>("pool.borrowTimeoutMillis") {
            config.borrow_timeout = Duration::from_millis(millis);
        }

        if config.initial_size > config.max_size {
            tracing::warn!(
                initial_size = config.initial_size,
                max_size = config.max_size,
                "pool.initialSize exceeds pool.maxSize, clamping"
            );
            config.initial_size = config.max_size;
        }

        config
    }
}

/// Driver-connect parameters for the backing data store.
///
/// The pool never interprets these; they are handed to whatever
/// [`ConnectionManager`](crate::ConnectionManager) the data layer supplies.
#[derive(Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct DataSourceConfig {
    /// Driver identifier, if the data layer needs one.
    pub driver: Option<String>,
    /// Driver endpoint.
    pub url: String,
    /// Login name.
    pub username: Option<String>,
    /// Login password.
    pub password: Option<String>,
}

impl DataSourceConfig {
    /// Create a data source pointing at `url` with no credentials.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            driver: None,
            url: url.into(),
            username: None,
            password: None,
        }
    }

    /// Set the driver identifier.
    #[must_use]
    pub fn driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = Some(driver.into());
        self
    }

    /// Set the login credentials.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    fn from_properties(props: &Properties) -> Result<Self, PoolError> {
        let url = props
            .get("jdbc.url")
            .filter(|url| !url.is_empty())
            .ok_or_else(|| PoolError::Configuration("missing required key jdbc.url".into()))?;

        Ok(Self {
            driver: props.get("jdbc.driverClassName").map(str::to_string),
            url: url.to_string(),
            username: props.get("jdbc.username").map(str::to_string),
            password: props.get("jdbc.password").map(str::to_string),
        })
    }
}

impl fmt::Debug for DataSourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSourceConfig")
            .field("driver", &self.driver)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Startup settings: pool sizing plus data source parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Pool sizing and timeouts.
    pub pool: PoolConfig,
    /// Connect parameters for the connection manager.
    pub data_source: DataSourceConfig,
}

impl Settings {
    /// Parse settings from a properties document.
    ///
    /// Recognised keys:
    ///
    /// | key | default |
    /// |---|---|
    /// | `jdbc.url` | required |
    /// | `jdbc.driverClassName`, `jdbc.username`, `jdbc.password` | unset |
    /// | `pool.initialSize` | 5 |
    /// | `pool.maxSize` | 20 |
    /// | `pool.borrowTimeoutMillis` | 30000 |
    ///
    /// Missing or malformed pool values fall back to their defaults. A
    /// missing `jdbc.url` is an error.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::time::Duration;
    /// use shelf_pool::Settings;
    ///
    /// let settings = Settings::from_properties(
    ///     "jdbc.url=postgres://localhost/library\npool.maxSize=8\n",
    /// )
    /// .unwrap();
    ///
    /// assert_eq!(settings.pool.max_size, 8);
    /// assert_eq!(settings.pool.borrow_timeout, Duration::from_secs(30));
    /// ```
    pub fn from_properties(input: &str) -> Result<Self, PoolError> {
        let props = Properties::parse(input);
        let data_source = DataSourceConfig::from_properties(&props)?;
        let pool = PoolConfig::from_properties(&props);
        Ok(Self { pool, data_source })
    }

    /// Read and parse a properties file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PoolError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|e| {
            PoolError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_properties(&input)
    }
}

/// Flat `key=value` map in the Java properties style.
struct Properties {
    entries: HashMap<String, String>,
}

impl Properties {
    fn parse(input: &str) -> Self {
        let mut entries = HashMap::new();

        for line in input.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }

            let split = line
                .find(['=', ':'])
                .map(|idx| (&line[..idx], &line[idx + 1..]));
            match split {
                Some((key, value)) => {
                    entries.insert(key.trim().to_string(), value.trim().to_string());
                }
                None => {
                    entries.insert(line.to_string(), String::new());
                }
            }
        }

        Self { entries }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(key, value = raw, "invalid pool setting, using default");
                None
            }
        }
    }
}
