//! Filter configuration data model and its on-store encoding.
//!
//! Persisted layout:
//! - `/waf/config/request/<filter>` holds the request filter switch
//! - `/waf/config/request/<filter>/<regex>` holds a rule's enabled flag
//! - `/waf/config/response/<filter>` holds the response filter switch
//!
//! Every value is the literal string `"true"` or `"false"`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::coordination::path;
use crate::error::{ConfigNodeError, Result};

/// Root of the WAF configuration tree
pub const CONFIG_ROOT: &str = "/waf/config";

/// Top-level configuration namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Request,
    Response,
}

impl Namespace {
    /// Both namespaces, request first
    pub const ALL: [Namespace; 2] = [Namespace::Request, Namespace::Response];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Request => "request",
            Namespace::Response => "response",
        }
    }

    /// Path of the namespace subtree
    pub fn base_path(&self) -> &'static str {
        match self {
            Namespace::Request => "/waf/config/request",
            Namespace::Response => "/waf/config/response",
        }
    }

    /// Path of a filter's switch node
    pub fn filter_path(&self, filter_name: &str) -> Result<String> {
        path::validate_segment(filter_name)?;
        Ok(path::join(self.base_path(), filter_name))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Path of a rule node under a request filter
pub fn rule_path(filter_name: &str, regex: &str) -> Result<String> {
    let filter = Namespace::Request.filter_path(filter_name)?;
    path::validate_segment(regex).map_err(|e| ConfigNodeError::InvalidRule(e.to_string()))?;
    Ok(path::join(&filter, regex))
}

/// Encode a switch or rule flag as stored
pub fn encode_switch(enabled: bool) -> Vec<u8> {
    if enabled {
        b"true".to_vec()
    } else {
        b"false".to_vec()
    }
}

/// Decode a stored switch or rule flag
pub fn decode_switch(data: &[u8]) -> Result<bool> {
    let text = std::str::from_utf8(data)
        .map_err(|e| ConfigNodeError::Serialization(format!("switch is not UTF-8: {}", e)))?;

    match text.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ConfigNodeError::Serialization(format!(
            "expected \"true\" or \"false\", got {:?}",
            other
        ))),
    }
}

/// A regex rule scoped to one request filter
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rule {
    /// Pattern, unique within its filter
    pub regex: String,
    /// Whether the rule is active
    pub enabled: bool,
}

impl Rule {
    pub fn new(regex: impl Into<String>, enabled: bool) -> Self {
        Self {
            regex: regex.into(),
            enabled,
        }
    }
}

/// Request filter state: switch plus rules keyed by regex
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFilterConfig {
    pub enabled: bool,
    pub rules: BTreeMap<String, bool>,
}

impl RequestFilterConfig {
    /// Enabled flag of a rule, if present
    pub fn rule(&self, regex: &str) -> Option<bool> {
        self.rules.get(regex).copied()
    }

    /// Rules as `Rule` values, ordered by regex
    pub fn rule_list(&self) -> Vec<Rule> {
        self.rules
            .iter()
            .map(|(regex, enabled)| Rule::new(regex.clone(), *enabled))
            .collect()
    }
}

/// Response filter state: switch only
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFilterConfig {
    pub enabled: bool,
}

/// Request configuration keyed by filter name
pub type RequestConfigs = BTreeMap<String, RequestFilterConfig>;

/// Response configuration keyed by filter name
pub type ResponseConfigs = BTreeMap<String, ResponseFilterConfig>;

/// Batched request filter change: optional switch plus rule upserts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestConfigUpdate {
    pub filter_name: String,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Response filter switch change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseConfigUpdate {
    pub filter_name: String,
    pub enabled: bool,
}
