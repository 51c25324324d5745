use anyhow::{anyhow, bail, Context, Result};
use std::{collections::HashMap, fs, net::SocketAddr, time};

use reqwest::Url;
use serde::Deserialize;

use crate::CommandLineConf;

#[derive(Deserialize, Default)]
struct RawConfig {
    listen: Option<String>,
    public_url: Option<String>,
    verbose: Option<u8>,
    connect_timeout: Option<u64>,
    stall_timeout: Option<u64>,
    stall_check_interval: Option<u64>,
    request_timeout: Option<u64>,
    max_chunk_size: Option<u64>,
    max_redirects: Option<u8>,
    max_attempts: Option<u8>,
    retry_delay_ms: Option<u64>,
    probe_ttl: Option<u64>,
    probe_cache_capacity: Option<usize>,
    pool_max_idle_per_host: Option<usize>,
    pool_idle_timeout: Option<u64>,
    direct_max_bytes: Option<u64>,
    cookie_names: Option<Vec<String>>,
    cookie_prefixes: Option<Vec<String>>,
    referers: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub public_url: Option<Url>,
    pub verbose: log::LevelFilter,
    pub connect_timeout: time::Duration,
    pub stall_timeout: time::Duration,
    pub stall_check_interval: time::Duration,
    pub request_timeout: Option<time::Duration>,
    pub max_chunk_size: u64,
    pub max_redirects: u8,
    pub max_attempts: u8,
    pub retry_delay_unit: time::Duration,
    pub probe_ttl: time::Duration,
    pub probe_cache_capacity: usize,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: time::Duration,
    pub direct_max_bytes: Option<u64>,
    pub cookie_names: Vec<String>,
    pub cookie_prefixes: Vec<String>,
    pub referers: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: SocketAddr::from(([0, 0, 0, 0], 3000)),
            public_url: None,
            verbose: log::LevelFilter::Warn,
            connect_timeout: time::Duration::from_secs(30),
            stall_timeout: time::Duration::from_secs(300),
            stall_check_interval: time::Duration::from_secs(10),
            request_timeout: None,
            max_chunk_size: 512 * 1024,
            max_redirects: 5,
            max_attempts: 3,
            retry_delay_unit: time::Duration::from_millis(1000),
            probe_ttl: time::Duration::from_secs(300),
            probe_cache_capacity: 256,
            pool_max_idle_per_host: 10,
            pool_idle_timeout: time::Duration::from_secs(120),
            direct_max_bytes: None,
            cookie_names: vec!["e".into(), "p".into(), "h".into()],
            cookie_prefixes: vec!["_ga".into()],
            referers: HashMap::new(),
        }
    }
}

impl Config {
    /// Stall threshold actually enforced while streaming. Under a hard request budget the
    /// whole call has to finish before the platform kills it, so the budget caps the stall.
    pub fn effective_stall_timeout(&self) -> time::Duration {
        match self.request_timeout {
            Some(budget) => self.stall_timeout.min(budget),
            None => self.stall_timeout,
        }
    }

    /// Referer to present to `url`'s host: a configured override, otherwise the target's origin.
    pub fn referer_for(&self, url: &Url) -> String {
        url.host_str()
            .and_then(|host| self.referers.get(host))
            .cloned()
            .unwrap_or_else(|| url.origin().ascii_serialization())
    }

    fn validate(self) -> Result<Self> {
        if self.max_chunk_size == 0 {
            bail!("max_chunk_size must be greater than zero");
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.probe_cache_capacity == 0 {
            bail!("probe_cache_capacity must be at least 1");
        }
        if self.stall_check_interval.is_zero() {
            bail!("stall_check_interval must be greater than zero");
        }
        Ok(self)
    }
}

impl TryFrom<CommandLineConf> for Config {
    type Error = anyhow::Error;

    fn try_from(conf: CommandLineConf) -> std::result::Result<Self, Self::Error> {
        get_config(conf)
    }
}

fn get_config(args: CommandLineConf) -> Result<Config> {
    let raw_config = args
        .config
        .as_ref()
        .map(|file| fs::read_to_string(file).context("Could not open/read config file."))
        .transpose()?
        .map(|contents| toml::from_str::<RawConfig>(&contents).context("failed to parse config file."))
        .transpose()?
        .unwrap_or_default();

    let defaults = Config::default();

    let listen = match args.listen {
        Some(addr) => addr,
        None => raw_config
            .listen
            .as_deref()
            .map(str::parse)
            .transpose()
            .context("Bad listen address")?
            .unwrap_or(defaults.listen),
    };

    let public_url = match args.public_url {
        Some(url) => Some(url),
        None => raw_config
            .public_url
            .as_deref()
            .map(Url::parse)
            .transpose()
            .context("Bad public URL.")?,
    };

    if let Some(url) = &public_url {
        if url.cannot_be_a_base() {
            return Err(anyhow!("Public URL cannot be used as a base: {}", url));
        }
    }

    let verbose = match args.verbose {
        0 => raw_config.verbose.unwrap_or(0),
        n => n,
    };
    let verbose = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let secs = |cli: Option<u64>, file: Option<u64>| cli.or(file).map(time::Duration::from_secs);

    Config {
        listen,
        public_url,
        verbose,
        connect_timeout: secs(args.connect_timeout, raw_config.connect_timeout)
            .unwrap_or(defaults.connect_timeout),
        stall_timeout: secs(args.stall_timeout, raw_config.stall_timeout)
            .unwrap_or(defaults.stall_timeout),
        stall_check_interval: raw_config
            .stall_check_interval
            .map(time::Duration::from_secs)
            .unwrap_or(defaults.stall_check_interval),
        request_timeout: secs(args.request_timeout, raw_config.request_timeout),
        max_chunk_size: args
            .max_chunk_size
            .or(raw_config.max_chunk_size)
            .unwrap_or(defaults.max_chunk_size),
        max_redirects: raw_config.max_redirects.unwrap_or(defaults.max_redirects),
        max_attempts: raw_config.max_attempts.unwrap_or(defaults.max_attempts),
        retry_delay_unit: raw_config
            .retry_delay_ms
            .map(time::Duration::from_millis)
            .unwrap_or(defaults.retry_delay_unit),
        probe_ttl: raw_config
            .probe_ttl
            .map(time::Duration::from_secs)
            .unwrap_or(defaults.probe_ttl),
        probe_cache_capacity: raw_config
            .probe_cache_capacity
            .unwrap_or(defaults.probe_cache_capacity),
        pool_max_idle_per_host: raw_config
            .pool_max_idle_per_host
            .unwrap_or(defaults.pool_max_idle_per_host),
        pool_idle_timeout: raw_config
            .pool_idle_timeout
            .map(time::Duration::from_secs)
            .unwrap_or(defaults.pool_idle_timeout),
        direct_max_bytes: raw_config.direct_max_bytes,
        cookie_names: raw_config.cookie_names.unwrap_or(defaults.cookie_names),
        cookie_prefixes: raw_config.cookie_prefixes.unwrap_or(defaults.cookie_prefixes),
        referers: raw_config.referers.unwrap_or_default(),
    }
    .validate()
}
