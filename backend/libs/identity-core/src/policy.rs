//! Endpoint authorization table
//!
//! Maps an endpoint id to the minimum role a caller must hold. Built once at
//! startup and shared read-only afterwards. Endpoints without a rule only
//! require an authenticated caller.

use crate::claims::IdentityClaims;
use crate::error::Forbidden;
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRule {
    pub endpoint_id: String,
    pub minimum_role: Option<String>,
}

impl AuthorizationRule {
    pub fn require(endpoint_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            minimum_role: Some(role.into()),
        }
    }

    pub fn authenticated(endpoint_id: impl Into<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            minimum_role: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyParseError {
    #[error("empty endpoint id in rule {0:?}")]
    EmptyEndpoint(String),

    #[error("empty role for endpoint {0:?}")]
    EmptyRole(String),

    #[error("duplicate rule for endpoint {0:?}")]
    Duplicate(String),
}

#[derive(Debug, Clone, Default)]
pub struct AuthorizationPolicy {
    rules: HashMap<String, Option<String>>,
}

impl AuthorizationPolicy {
    pub fn new(rules: impl IntoIterator<Item = AuthorizationRule>) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|rule| (rule.endpoint_id, rule.minimum_role))
                .collect(),
        }
    }

    /// Allow any authenticated caller everywhere
    pub fn allow_authenticated() -> Self {
        Self::default()
    }

    /// Decide whether `claims` may call `endpoint_id`
    pub fn check(&self, endpoint_id: &str, claims: &IdentityClaims) -> Result<(), Forbidden> {
        match self.required_role(endpoint_id) {
            Some(role) if !claims.has_role(role) => Err(Forbidden {
                endpoint: endpoint_id.to_string(),
                required_role: role.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Whether a rule names `endpoint_id`, with or without a role
    pub fn governs(&self, endpoint_id: &str) -> bool {
        self.rules.contains_key(endpoint_id)
    }

    pub fn required_role(&self, endpoint_id: &str) -> Option<&str> {
        self.rules.get(endpoint_id).and_then(|role| role.as_deref())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// `endpoint=role;endpoint;...`, whitespace around entries ignored
impl FromStr for AuthorizationPolicy {
    type Err = PolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rules = HashMap::new();

        for entry in s.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (endpoint, role) = match entry.split_once('=') {
                Some((endpoint, role)) => {
                    let role = role.trim();
                    if role.is_empty() {
                        return Err(PolicyParseError::EmptyRole(endpoint.trim().to_string()));
                    }
                    (endpoint.trim(), Some(role.to_string()))
                }
                None => (entry, None),
            };

            if endpoint.is_empty() {
                return Err(PolicyParseError::EmptyEndpoint(entry.to_string()));
            }
            if rules.insert(endpoint.to_string(), role).is_some() {
                return Err(PolicyParseError::Duplicate(endpoint.to_string()));
            }
        }

        Ok(Self { rules })
    }
}
