// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Registry access and local registry management.
//!
//! A __registry__ is a web-queryable metadata store recording datasets and
//! other objects by their attributes. FAIR talks to two kinds of registry:
//! remote registries listed in the CLI configuration, and a __local
//! registry__ server that FAIR installs and runs on the user's machine.
//!
//! Querying goes through the [`RegistryQuery`] seam, and liveness checks go
//! through the [`HealthProbe`] seam, so that the glob resolver and the server
//! manager can be exercised without a real registry. The [`client`] module
//! provides the HTTP implementations of both.
//!
//! # Local Registry Lifecycle
//!
//! ```text
//! NotInstalled --install--> Stopped --launch--> Starting --healthy--> Running
//!      ^                       ^                                        |
//!      |                       +----------- Stopping <------stop--------+
//!      +--------------------------- uninstall (from any state)
//! ```
//!
//! See [`server::RegistryServer`] for the transitions.

pub mod client;
pub mod install;
pub mod process;
pub mod record;
pub mod server;

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    future::Future,
};
use url::Url;

/// Single row of a registry listing.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Which registry a query is resolved against.
///
/// Always chosen explicitly by the caller, never inferred from the uri.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryOrigin {
    /// Locally hosted registry server.
    Local,

    /// Remote registry registered under a label.
    Remote(String),
}

impl Default for RegistryOrigin {
    fn default() -> Self {
        Self::Remote("origin".into())
    }
}

impl Display for RegistryOrigin {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Local => fmt.write_str("local registry"),
            Self::Remote(label) => write!(fmt, "remote registry {label:?}"),
        }
    }
}

/// Location of a registry API and the credentials to use with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEndpoint {
    uri: Url,
    token: Option<String>,
}

impl RegistryEndpoint {
    /// Construct new endpoint.
    ///
    /// The uri is treated as a directory, so a missing trailing slash is
    /// added to keep object kinds below it when joined.
    pub fn new(mut uri: Url, token: Option<String>) -> Self {
        if !uri.path().ends_with('/') {
            let path = format!("{}/", uri.path());
            uri.set_path(&path);
        }

        Self { uri, token }
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Url listing objects of a kind, e.g. `<uri>/data_product/`.
    ///
    /// # Errors
    ///
    /// - Return [`QueryError::InvalidKind`] if kind does not form a path
    ///   segment below the endpoint.
    pub fn object_url(&self, kind: &str) -> Result<Url, QueryError> {
        if kind.is_empty() || kind == "." || kind == ".." || kind.contains(['/', '?', '#']) {
            return Err(QueryError::InvalidKind(kind.into()));
        }

        self.uri
            .join(&format!("{kind}/"))
            .map_err(|_| QueryError::InvalidKind(kind.into()))
    }
}

/// Read-only query interface of a registry.
pub trait RegistryQuery {
    /// List objects of `kind` matching every `(field, value)` filter.
    fn list(
        &self,
        kind: &str,
        filters: &[(&str, &str)],
    ) -> impl Future<Output = Result<Vec<Row>, QueryError>> + Send;
}

/// Liveness probe of a registry server.
pub trait HealthProbe {
    /// Whether anything answers HTTP at `url`.
    ///
    /// Any response counts, even an error status. Refused connections and
    /// timeouts do not.
    fn is_responding(&self, url: &Url) -> impl Future<Output = bool> + Send;
}

/// Registry query failures.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// Object kind cannot be placed in a url.
    #[error("invalid registry object kind {0:?}")]
    InvalidKind(String),

    /// Request could not be built or sent.
    #[error("request to {url} failed")]
    Transport {
        url: Url,
        #[source]
        source: reqwest::Error,
    },

    /// Registry answered with non-success status.
    #[error("registry answered {status} for {url}")]
    Status {
        url: Url,
        status: reqwest::StatusCode,
    },

    /// Body of response is not a listing.
    #[error("malformed listing from {url}")]
    Body {
        url: Url,
        #[source]
        source: reqwest::Error,
    },

    /// Pagination link is not a valid url.
    #[error("invalid next page link {link:?}")]
    NextPage {
        link: String,
        #[source]
        source: url::ParseError,
    },

    /// Registry endpoint could not be built.
    #[error("cannot build registry client")]
    Client(#[source] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    #[test_case("http://127.0.0.1:8000/api", "http://127.0.0.1:8000/api/data_product/"; "no trailing slash")]
    #[test_case("http://127.0.0.1:8000/api/", "http://127.0.0.1:8000/api/data_product/"; "trailing slash")]
    #[test_case("https://data.scrc.uk", "https://data.scrc.uk/data_product/"; "root")]
    #[test]
    fn object_url_below_endpoint(uri: &str, expect: &str) -> anyhow::Result<()> {
        let endpoint = RegistryEndpoint::new(Url::parse(uri)?, None);
        use pretty_assertions::assert_eq;
        assert_eq!(endpoint.object_url("data_product")?.as_str(), expect);
        Ok(())
    }

    #[test_case(""; "empty")]
    #[test_case("../admin"; "traversal")]
    #[test_case("object?x=1"; "query")]
    #[test_case("."; "current dir")]
    #[test_case(".."; "parent dir")]
    #[test]
    fn object_url_rejects_bad_kind(kind: &str) -> anyhow::Result<()> {
        let endpoint = RegistryEndpoint::new(Url::parse("http://localhost/api/")?, None);
        assert!(matches!(endpoint.object_url(kind), Err(QueryError::InvalidKind(_))));
        Ok(())
    }
}
