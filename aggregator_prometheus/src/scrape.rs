use std::time::{Duration, Instant};
use thiserror::Error;

use crate::labels::add_labels;
use crate::parser::{self, ParseError};
use crate::{LabelSet, MetricFamilySet};

#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("invalid scrape url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to scrape {url}: {error}")]
    Failed { url: String, error: surf::Error },
    #[error("scrape of {url} timed out")]
    Timeout { url: String },
    #[error("failed to parse metrics from {url}: {source}")]
    Parse {
        url: String,
        #[source]
        source: ParseError,
    },
}

pub type ScrapeResult = std::result::Result<MetricFamilySet, ScrapeError>;

pub struct ScrapeTarget {
    /// Identifies the target in logs and reported errors; defaults to the url
    pub name: String,

    /// The url to be scraped.
    ///
    /// e.g. http://10.0.15.15:9025/metrics
    pub url: String,

    /// A static set of labels to add to every scraped series
    pub labels: Option<LabelSet>,

    /// How long to wait for a response, at most
    pub timeout: Option<Duration>,

    client: surf::Client,
}

impl ScrapeTarget {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        ScrapeTarget {
            name: url.clone(),
            url,
            labels: None,
            timeout: None,
            client: surf::Client::new(),
        }
    }

    pub fn with_labels(mut self, labels: LabelSet) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Use a specific http client instead of the default one.
    ///
    /// Headers configured on the client are sent with every scrape.
    pub fn with_client(mut self, client: surf::Client) -> Self {
        self.client = client;
        self
    }

    /// Make a request to the scrape target and parse the response.
    ///
    /// The request is abandoned at `deadline` or after the target's own
    /// timeout, whichever comes first. Without either it waits indefinitely.
    pub async fn scrape(&self, deadline: Option<Instant>) -> ScrapeResult {
        let url = surf::Url::parse(&self.url).map_err(|err| ScrapeError::InvalidUrl {
            url: self.url.clone(),
            reason: err.to_string(),
        })?;

        // The response status isn't checked; an error page fails to parse instead
        let response = self.client.get(url.as_str()).recv_string();
        let deadline = match (deadline, self.timeout) {
            (Some(deadline), Some(timeout)) => Some(deadline.min(Instant::now() + timeout)),
            (deadline, timeout) => deadline.or_else(|| timeout.map(|t| Instant::now() + t)),
        };
        let result = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                async_std::future::timeout(remaining, response)
                    .await
                    .map_err(|_| ScrapeError::Timeout {
                        url: self.url.clone(),
                    })?
            }
            None => response.await,
        };
        let body = result.map_err(|error| ScrapeError::Failed {
            url: self.url.clone(),
            error,
        })?;

        let mut families = parser::parse(&body).map_err(|source| ScrapeError::Parse {
            url: self.url.clone(),
            source,
        })?;
        if let Some(labels) = &self.labels {
            add_labels(&mut families, labels);
        }
        Ok(families)
    }
}

impl std::fmt::Debug for ScrapeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScrapeTarget")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("labels", &self.labels)
            .field("timeout", &self.timeout)
            .finish()
    }
}
