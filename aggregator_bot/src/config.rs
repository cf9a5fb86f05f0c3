use aggregator_prometheus::collector::{AggregatorOptions, RefreshPolicy};
use aggregator_prometheus::scrape::ScrapeTarget;
use aggregator_prometheus::LabelSet;
use anyhow::{Context, Result};
use heck::SnakeCase;
use std::str::FromStr;
use std::time::Duration;
use structopt::StructOpt;

/// How long cached results are reused when `REFRESH_INTERVAL` is "on"
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug)]
pub struct Config {
    /// Enables verbose logging of errors that occur while scraping metrics
    pub debug: bool,

    /// How frequently (in seconds) to log internal debug metrics
    pub debug_interval: Option<Duration>,

    /// The exporters to aggregate, each with its own static labels.
    pub scrape_targets: Vec<TargetConfig>,

    /// A comma separated list of static labels to add to every scraped metric.
    /// e.g. "environment=production,version=0.5.0"
    pub scrape_labels: Vec<(String, String)>,

    /// How long to wait to receive a response from a single target.
    pub scrape_timeout: Option<Duration>,

    /// The maximum number of targets to scrape at once.
    pub scrape_concurrency: Option<usize>,

    /// How long a whole aggregation cycle may take.
    pub cycle_timeout: Option<Duration>,

    /// When a request to the metrics endpoint scrapes the targets again.
    pub refresh: RefreshPolicy,

    /// Exit instead of skipping families with an unsupported metric type.
    pub abort_on_unsupported: bool,

    /// The address to serve aggregated metrics on.
    /// e.g. "0.0.0.0:9095"
    pub listen_addr: String,

    /// The path to serve aggregated metrics at.
    pub metrics_path: String,
}

#[derive(Debug, Eq, PartialEq)]
pub struct TargetConfig {
    pub url: String,
    pub labels: Vec<(String, String)>,
}

impl Config {
    /// Loads configuration from arguments, env and dotenv
    pub fn load() -> Result<Config> {
        // Attempts to find a `.env` file to initialize/extend the environment
        dotenv::dotenv().ok();

        // Load the config from arguments, then environment variables
        let env = Environment::from_args();

        let scrape_targets = parse_targets(&env.scrape_targets)?;
        if scrape_targets.is_empty() {
            return Err(anyhow::format_err!("SCRAPE_TARGETS is empty"));
        }
        Ok(Config {
            debug: env.debug || env_flag("DEBUG")?,
            debug_interval: match env.debug_interval {
                ToggleValue::Enabled(secs) => Some(Duration::from_secs(secs)),
                ToggleValue::EnabledDefault => Some(Duration::from_secs(300)),
                ToggleValue::Disabled => None,
            },
            scrape_targets,
            scrape_labels: parse_labels(&env.scrape_labels).context("invalid SCRAPE_LABELS")?,
            scrape_timeout: non_zero_secs(env.scrape_timeout),
            scrape_concurrency: if env.scrape_concurrency == 0 {
                None
            } else {
                Some(env.scrape_concurrency)
            },
            cycle_timeout: non_zero_secs(env.cycle_timeout),
            refresh: match env.refresh_interval {
                ToggleValue::Enabled(secs) => RefreshPolicy::MaxAge(Duration::from_secs(secs)),
                ToggleValue::EnabledDefault => RefreshPolicy::MaxAge(DEFAULT_REFRESH_INTERVAL),
                ToggleValue::Disabled => RefreshPolicy::Always,
            },
            abort_on_unsupported: env.abort_on_unsupported || env_flag("ABORT_ON_UNSUPPORTED")?,
            listen_addr: env.listen_addr,
            metrics_path: env.metrics_path,
        })
    }

    pub fn aggregator_options(&self) -> AggregatorOptions {
        AggregatorOptions {
            max_concurrency: self.scrape_concurrency,
            cycle_timeout: self.cycle_timeout,
            refresh: self.refresh,
            abort_on_unsupported: self.abort_on_unsupported,
        }
    }

    /// Builds the scrape targets; a target's own labels override `SCRAPE_LABELS`
    pub fn targets(&self) -> Vec<ScrapeTarget> {
        self.scrape_targets
            .iter()
            .map(|target| {
                let labels = self
                    .scrape_labels
                    .iter()
                    .chain(target.labels.iter())
                    .cloned()
                    .collect::<LabelSet>();
                let mut scrape = ScrapeTarget::new(target.url.clone());
                if !labels.is_empty() {
                    scrape = scrape.with_labels(labels);
                }
                if let Some(timeout) = self.scrape_timeout {
                    scrape = scrape.with_timeout(timeout);
                }
                scrape
            })
            .collect()
    }
}

/// Reads an on/off environment variable, which is off if unset
fn env_flag(name: &str) -> Result<bool> {
    Ok(match dotenv::var(name).ok() {
        Some(val) if val == "true" || val == "on" || val == "1" => true,
        Some(val) if val == "false" || val == "off" || val == "0" || val == "" => false,
        Some(val) => val
            .parse::<bool>()
            .with_context(|| format!("invalid {}", name))?,
        None => false,
    })
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

/// Parses `url|name=value,...` entries separated by `;`
fn parse_targets(val: &str) -> Result<Vec<TargetConfig>> {
    val.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let mut parts = entry.splitn(2, '|');
            let url = parts.next().unwrap_or("").trim();
            if url.is_empty() {
                return Err(anyhow::format_err!("invalid SCRAPE_TARGETS entry: {}", entry));
            }
            let labels = parse_labels(parts.next().unwrap_or(""))
                .with_context(|| format!("invalid labels for scrape target {}", url))?;
            Ok(TargetConfig {
                url: url.to_string(),
                labels,
            })
        })
        .collect()
}

/// Parses a comma separated list of `name=value` pairs
fn parse_labels(val: &str) -> Result<Vec<(String, String)>> {
    val.split(',')
        .map(str::trim)
        .filter(|name_value| !name_value.is_empty())
        .map(|name_value| {
            let name_value = name_value.splitn(2, '=').collect::<Vec<_>>();
            match name_value.as_slice() {
                [name, value]
                    if !value.is_empty() && !name.is_empty() && *name == name.to_snake_case() =>
                {
                    Ok((name.to_string(), value.to_string()))
                }
                _ => Err(anyhow::format_err!("invalid label: {}", name_value.join("="))),
            }
        })
        .collect()
}

#[derive(Debug, StructOpt)]
#[structopt(name = "aggregator-bot")]
struct Environment {
    /// Enables verbose logging of errors that occur while scraping metrics
    #[structopt(short, long)]
    debug: bool,

    /// How frequently (in seconds) to log internal debug metrics
    #[structopt(long, env = "DEBUG_INTERVAL", default_value = "300")]
    debug_interval: ToggleValue<u64>,

    /// The exporters to aggregate, as "url|name=value,..." entries separated by ";"
    #[structopt(short = "t", long, env = "SCRAPE_TARGETS")]
    scrape_targets: String,

    /// A comma separated list of static labels to add to metrics
    #[structopt(long, env = "SCRAPE_LABELS", default_value = "")]
    scrape_labels: String,

    /// How long (in seconds) to wait for each target; 0 waits indefinitely
    #[structopt(long, env = "SCRAPE_TIMEOUT", default_value = "5")]
    scrape_timeout: u64,

    /// The max number of targets to scrape at once; 0 is unbounded
    #[structopt(long, env = "SCRAPE_CONCURRENCY", default_value = "0")]
    scrape_concurrency: usize,

    /// How long (in seconds) a whole aggregation may take; 0 is unbounded
    #[structopt(long, env = "CYCLE_TIMEOUT", default_value = "0")]
    cycle_timeout: u64,

    /// How long (in seconds) to reuse aggregated results; off scrapes on every request
    #[structopt(long, env = "REFRESH_INTERVAL", default_value = "off")]
    refresh_interval: ToggleValue<u64>,

    /// Exit when an exporter serves a metric type that can't be converted
    #[structopt(long)]
    abort_on_unsupported: bool,

    /// The address to serve aggregated metrics on
    #[structopt(short = "l", long, env = "LISTEN_ADDR", default_value = "0.0.0.0:9095")]
    listen_addr: String,

    /// The path to serve aggregated metrics at
    #[structopt(long, env = "METRICS_PATH", default_value = "/metrics")]
    metrics_path: String,
}

#[derive(Debug, Eq, PartialEq)]
enum ToggleValue<T: FromStr> {
    Enabled(T),
    EnabledDefault,
    Disabled,
}

impl<T: FromStr> Default for ToggleValue<T> {
    fn default() -> Self {
        ToggleValue::Disabled
    }
}

impl<T: FromStr> FromStr for ToggleValue<T> {
    type Err = T::Err;
    fn from_str(val: &str) -> std::result::Result<Self, Self::Err> {
        match val {
            "false" | "off" | "0" | "" => Ok(ToggleValue::Disabled),
            "true" | "on" | "1" => Ok(ToggleValue::EnabledDefault),
            _ => val.parse().map(ToggleValue::Enabled),
        }
    }
}
