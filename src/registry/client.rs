// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! HTTP access to registries through reqwest.

use crate::registry::{HealthProbe, QueryError, RegistryEndpoint, RegistryQuery, Row};

use reqwest::{header::AUTHORIZATION, Client};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

/// Timeout of a single registry query.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout of a single health check.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

const USER_AGENT: &str = concat!("fair-cli/", env!("CARGO_PKG_VERSION"));

/// Registry client over HTTP.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: Client,
    endpoint: RegistryEndpoint,
}

impl RegistryClient {
    /// Construct new client with default timeout.
    ///
    /// # Errors
    ///
    /// - Return [`QueryError::Client`] if the HTTP client cannot be built.
    pub fn new(endpoint: RegistryEndpoint) -> Result<Self, QueryError> {
        Self::with_timeout(endpoint, QUERY_TIMEOUT)
    }

    /// Construct new client with custom request timeout.
    ///
    /// # Errors
    ///
    /// - Return [`QueryError::Client`] if the HTTP client cannot be built.
    pub fn with_timeout(endpoint: RegistryEndpoint, timeout: Duration) -> Result<Self, QueryError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(QueryError::Client)?;

        Ok(Self { http, endpoint })
    }

    pub fn endpoint(&self) -> &RegistryEndpoint {
        &self.endpoint
    }

    async fn fetch_page(&self, url: Url, filters: &[(&str, &str)]) -> Result<Listing, QueryError> {
        let mut request = self.http.get(url.clone()).query(filters);

        // INVARIANT: Token only goes to the registry it belongs to, whatever
        // host a pagination link points at.
        if let Some(token) = self.endpoint.token() {
            if url.origin() == self.endpoint.uri().origin() {
                request = request.header(AUTHORIZATION, format!("token {token}"));
            } else {
                warn!("not sending registry token to foreign origin of {url}");
            }
        }

        let response = request.send().await.map_err(|source| QueryError::Transport {
            url: url.clone(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(QueryError::Status { url, status });
        }

        response
            .json::<Listing>()
            .await
            .map_err(|source| QueryError::Body { url, source })
    }
}

impl RegistryQuery for RegistryClient {
    /// List objects of a kind, following pagination links.
    ///
    /// Filters are only attached to the first request. Pages returned by the
    /// registry already carry them in their `next` link.
    #[instrument(skip(self, filters), level = "debug")]
    async fn list(&self, kind: &str, filters: &[(&str, &str)]) -> Result<Vec<Row>, QueryError> {
        let mut url = self.endpoint.object_url(kind)?;
        let mut filters = filters;
        let mut rows = Vec::new();

        loop {
            debug!("query {url} with {filters:?}");
            match self.fetch_page(url, filters).await? {
                Listing::Rows(page) => {
                    rows.extend(page);
                    break;
                }
                Listing::Page { results, next } => {
                    rows.extend(results);
                    let Some(link) = next else {
                        break;
                    };

                    url = Url::parse(&link)
                        .map_err(|source| QueryError::NextPage { link, source })?;
                    filters = &[];
                }
            }
        }

        debug!("registry returned {} rows for {kind:?}", rows.len());
        Ok(rows)
    }
}

/// Registry listing body.
///
/// Registries answer either with a bare array of rows, or with a paginated
/// object carrying the rows under `results`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Listing {
    Rows(Vec<Row>),
    Page {
        results: Vec<Row>,
        #[serde(default)]
        next: Option<String>,
    },
}

/// Health probe over HTTP.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    http: Client,
}

impl HttpProbe {
    /// Construct new probe with default timeout.
    ///
    /// # Errors
    ///
    /// - Return [`QueryError::Client`] if the HTTP client cannot be built.
    pub fn new() -> Result<Self, QueryError> {
        Self::with_timeout(PROBE_TIMEOUT)
    }

    /// Construct new probe with custom timeout.
    ///
    /// # Errors
    ///
    /// - Return [`QueryError::Client`] if the HTTP client cannot be built.
    pub fn with_timeout(timeout: Duration) -> Result<Self, QueryError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(QueryError::Client)?;

        Ok(Self { http })
    }
}

impl HealthProbe for HttpProbe {
    async fn is_responding(&self, url: &Url) -> bool {
        match self.http.get(url.clone()).send().await {
            Ok(response) => {
                debug!("{url} answered {}", response.status());
                true
            }
            Err(error) => {
                debug!("{url} not answering: {error}");
                false
            }
        }
    }
}
