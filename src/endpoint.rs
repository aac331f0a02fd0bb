//! Endpoint identity.
//!
//! An endpoint URI such as `memory://orders` names the transport protocol
//! (`memory`) and an address within it (`orders`). Receivers are keyed by
//! the endpoint's filter address when one is set, otherwise by its address.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use regex::{Regex, RegexBuilder};
use url::Url;

use crate::error::{ConnectorError, ConnectorResult};

/// Parsed endpoint URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointUri {
    uri: String,
    protocol: String,
    address: String,
    filter_address: Option<String>,
}

impl EndpointUri {
    pub fn parse(uri: &str) -> ConnectorResult<Self> {
        let url = Url::parse(uri)
            .map_err(|e| ConnectorError::invalid_argument(format!("invalid endpoint uri '{uri}': {e}")))?;

        let path = url.path().trim_end_matches('/');
        let address = match url.host_str() {
            Some(host) if path.is_empty() => host.to_string(),
            Some(host) => format!("{host}{path}"),
            None => path.trim_start_matches('/').to_string(),
        };
        if address.is_empty() {
            return Err(ConnectorError::invalid_argument(format!(
                "endpoint uri '{uri}' has no address"
            )));
        }

        Ok(Self {
            uri: uri.to_string(),
            protocol: url.scheme().to_ascii_lowercase(),
            address,
            filter_address: None,
        })
    }

    /// Key receivers on `filter_address` instead of the plain address.
    pub fn with_filter_address(mut self, filter_address: impl Into<String>) -> Self {
        self.filter_address = Some(filter_address.into());
        self
    }

    pub fn as_str(&self) -> &str {
        &self.uri
    }

    /// Lower-cased URI scheme.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn filter_address(&self) -> Option<&str> {
        self.filter_address.as_deref()
    }

    /// Key under which a receiver for this endpoint is registered.
    pub fn receiver_key(&self) -> &str {
        self.filter_address.as_deref().unwrap_or(&self.address)
    }
}

impl fmt::Display for EndpointUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

impl FromStr for EndpointUri {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// An inbound or outbound endpoint as resolved by the configuration layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    uri: EndpointUri,
    name: String,
    transacted: bool,
    polling_frequency: Option<Duration>,
}

impl Endpoint {
    pub fn new(uri: EndpointUri) -> Self {
        Self {
            name: format!("endpoint.{}.{}", uri.protocol(), uri.address()),
            uri,
            transacted: false,
            polling_frequency: None,
        }
    }

    pub fn parse(uri: &str) -> ConnectorResult<Self> {
        EndpointUri::parse(uri).map(Self::new)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_transacted(mut self, transacted: bool) -> Self {
        self.transacted = transacted;
        self
    }

    pub fn with_polling_frequency(mut self, frequency: Duration) -> Self {
        self.polling_frequency = Some(frequency);
        self
    }

    pub fn uri(&self) -> &EndpointUri {
        &self.uri
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> &str {
        self.uri.protocol()
    }

    pub fn is_transacted(&self) -> bool {
        self.transacted
    }

    pub fn polling_frequency(&self) -> Option<Duration> {
        self.polling_frequency
    }
}

/// Case-insensitive `*` wildcard used to look up receivers by key.
#[derive(Debug, Clone)]
pub struct WildcardMatcher {
    regex: Regex,
}

impl WildcardMatcher {
    pub fn new(pattern: &str) -> ConnectorResult<Self> {
        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = RegexBuilder::new(&format!("^{body}$"))
            .case_insensitive(true)
            .build()
            .map_err(|e| ConnectorError::invalid_argument(format!("bad wildcard '{pattern}': {e}")))?;
        Ok(Self { regex })
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_is_host_and_path() {
        let uri = EndpointUri::parse("MEMORY://queue/orders/").unwrap();
        assert_eq!(uri.protocol(), "memory");
        assert_eq!(uri.address(), "queue/orders");
        assert_eq!(uri.receiver_key(), "queue/orders");

        let simple = EndpointUri::parse("test://in").unwrap();
        assert_eq!(simple.address(), "in");
    }

    #[test]
    fn opaque_uri_uses_path_as_address() {
        let uri = EndpointUri::parse("memory:orders").unwrap();
        assert_eq!(uri.address(), "orders");
    }

    #[test]
    fn filter_address_overrides_receiver_key() {
        let uri = EndpointUri::parse("memory://orders")
            .unwrap()
            .with_filter_address("orders-eu");
        assert_eq!(uri.receiver_key(), "orders-eu");
        assert_eq!(uri.address(), "orders");
    }

    #[test]
    fn missing_address_is_rejected() {
        assert!(EndpointUri::parse("memory://").is_err());
        assert!(EndpointUri::parse("not a uri").is_err());
    }

    #[test]
    fn wildcard_matching_is_case_insensitive() {
        let matcher = WildcardMatcher::new("Orders*").unwrap();
        assert!(matcher.matches("orders"));
        assert!(matcher.matches("ORDERS.eu"));
        assert!(!matcher.matches("my.orders"));

        let literal = WildcardMatcher::new("a.b").unwrap();
        assert!(literal.matches("A.B"));
        assert!(!literal.matches("axb"), "dots must be literal");
    }
}
