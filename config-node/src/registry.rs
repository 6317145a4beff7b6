use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::coordination::path;
use crate::error::{ConfigNodeError, Result};
use crate::model::Namespace;

/// Request filters every WAF node ships with
pub const DEFAULT_REQUEST_FILTERS: &[&str] = &[
    "args-filter",
    "cc-filter",
    "cookie-filter",
    "ip-filter",
    "post-filter",
    "file-filter",
    "scanner-filter",
    "ua-filter",
    "url-filter",
    "wip-filter",
    "wurl-filter",
];

/// Response filters every WAF node ships with
pub const DEFAULT_RESPONSE_FILTERS: &[&str] = &["clickjack-filter"];

/// One bootstrap target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterEntry {
    pub namespace: Namespace,
    pub name: String,
}

/// Known filters per namespace, seeded at bootstrap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterRegistry {
    pub request: Vec<String>,
    pub response: Vec<String>,
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self {
            request: DEFAULT_REQUEST_FILTERS.iter().map(|s| s.to_string()).collect(),
            response: DEFAULT_RESPONSE_FILTERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl FilterRegistry {
    pub fn new(request: Vec<String>, response: Vec<String>) -> Self {
        Self { request, response }
    }

    pub fn names(&self, namespace: Namespace) -> &[String] {
        match namespace {
            Namespace::Request => &self.request,
            Namespace::Response => &self.response,
        }
    }

    /// Every `{namespace, name}` pair, request filters first
    pub fn entries(&self) -> Vec<FilterEntry> {
        Namespace::ALL
            .iter()
            .flat_map(|&namespace| {
                self.names(namespace).iter().map(move |name| FilterEntry {
                    namespace,
                    name: name.clone(),
                })
            })
            .collect()
    }

    pub fn contains(&self, namespace: Namespace, name: &str) -> bool {
        self.names(namespace).iter().any(|n| n == name)
    }

    pub fn len(&self) -> usize {
        self.request.len() + self.response.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names must be storable path segments and unique per namespace
    pub fn validate(&self) -> Result<()> {
        for namespace in Namespace::ALL {
            let mut seen = HashSet::new();
            for name in self.names(namespace) {
                path::validate_segment(name).map_err(|e| {
                    ConfigNodeError::Config(format!("{} filter {:?}: {}", namespace, name, e))
                })?;
                if !seen.insert(name.as_str()) {
                    return Err(ConfigNodeError::Config(format!(
                        "duplicate {} filter {:?}",
                        namespace, name
                    )));
                }
            }
        }
        Ok(())
    }
}
