//! Endpoint addresses.
//!
//! An address names an object anywhere in a process tree:
//!
//! ```text
//! host/process            the process itself (lifecycle subscriptions)
//! host/process/endpoint   an endpoint registered inside that process
//! ```
//!
//! All three parts compare case-insensitively.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::{EndpointId, Error, ProcessId};

/// Address of a process or of an endpoint inside a process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EndpointAddress {
    host: String,
    process: ProcessId,
    endpoint: Option<EndpointId>,
}

impl EndpointAddress {
    /// Address of an endpoint.
    pub fn new(host: impl Into<String>, process: ProcessId, endpoint: EndpointId) -> Self {
        Self {
            host: host.into(),
            process,
            endpoint: Some(endpoint),
        }
    }

    /// Address of a process itself.
    pub fn process(host: impl Into<String>, process: ProcessId) -> Self {
        Self {
            host: host.into(),
            process,
            endpoint: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn process_id(&self) -> &ProcessId {
        &self.process
    }

    pub fn endpoint_id(&self) -> Option<&EndpointId> {
        self.endpoint.as_ref()
    }

    /// True when the address denotes a process rather than one of its endpoints.
    pub fn is_process(&self) -> bool {
        self.endpoint.is_none()
    }

    /// Same host and process, different endpoint.
    pub fn with_endpoint(&self, endpoint: EndpointId) -> Self {
        Self {
            host: self.host.clone(),
            process: self.process.clone(),
            endpoint: Some(endpoint),
        }
    }

    /// The address of the owning process.
    pub fn to_process(&self) -> Self {
        Self::process(self.host.clone(), self.process.clone())
    }
}

impl PartialEq for EndpointAddress {
    fn eq(&self, other: &Self) -> bool {
        self.host.eq_ignore_ascii_case(&other.host)
            && self.process == other.process
            && self.endpoint == other.endpoint
    }
}

impl Eq for EndpointAddress {}

impl std::hash::Hash for EndpointAddress {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        for b in self.host.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
        state.write_u8(0xff);
        self.process.hash(state);
        self.endpoint.hash(state);
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            Some(endpoint) => write!(f, "{}/{}/{}", self.host, self.process, endpoint),
            None => write!(f, "{}/{}", self.host, self.process),
        }
    }
}

impl FromStr for EndpointAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let (host, process, endpoint) = match parts.as_slice() {
            [host, process] => (*host, *process, None),
            [host, process, ""] => (*host, *process, None),
            [host, process, endpoint] => (*host, *process, Some(*endpoint)),
            _ => {
                return Err(Error::validation(format!(
                    "address must be host/process[/endpoint]: {:?}",
                    s
                )))
            }
        };
        if host.is_empty() {
            return Err(Error::validation(format!("address has empty host: {:?}", s)));
        }
        let process = process.parse::<ProcessId>().map_err(Error::validation)?;
        let endpoint = endpoint
            .map(|e| e.parse::<EndpointId>().map_err(Error::validation))
            .transpose()?;
        Ok(Self {
            host: host.to_string(),
            process,
            endpoint,
        })
    }
}

impl TryFrom<String> for EndpointAddress {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EndpointAddress> for String {
    fn from(address: EndpointAddress) -> Self {
        address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_parse_endpoint_address() {
        let addr: EndpointAddress = "node-a/P1/E1".parse().unwrap();
        assert_eq!(addr.host(), "node-a");
        assert_eq!(addr.process_id().as_str(), "P1");
        assert_eq!(addr.endpoint_id().unwrap().as_str(), "E1");
        assert!(!addr.is_process());
        assert_eq!(addr.to_string(), "node-a/P1/E1");
    }

    #[test]
    fn test_parse_process_address() {
        let addr: EndpointAddress = "node-a/P1".parse().unwrap();
        assert!(addr.is_process());
        let trailing: EndpointAddress = "node-a/P1/".parse().unwrap();
        assert_eq!(addr, trailing);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!("node-a".parse::<EndpointAddress>().is_err());
        assert!("/P1/E1".parse::<EndpointAddress>().is_err());
        assert!("node-a//E1".parse::<EndpointAddress>().is_err());
        assert!("a/b/c/d".parse::<EndpointAddress>().is_err());
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let a: EndpointAddress = "Node-A/p1/Echo".parse().unwrap();
        let b: EndpointAddress = "node-a/P1/ECHO".parse().unwrap();
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_serde_uses_text_form() {
        let addr: EndpointAddress = "h/p/e".parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"h/p/e\"");
        let back: EndpointAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
        assert!(serde_json::from_str::<EndpointAddress>("\"nope\"").is_err());
    }
}
