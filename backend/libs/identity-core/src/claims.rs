//! Verified identity claims
//!
//! `IdentityClaims` is the only representation of "who is calling" that the
//! rest of the system sees. It can only be built inside this crate, by the
//! token verifier or by decoding a forwarded identity that a verifier produced
//! upstream, so holding one is proof that verification happened.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;

/// Subject and roles extracted from a verified bearer token
///
/// Immutable after construction. Roles are kept ordered so that two
/// verifications of the same token compare equal and log identically.
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityClaims {
    subject_id: String,
    roles: BTreeSet<String>,
    audience: String,
    issued_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
}

impl IdentityClaims {
    pub(crate) fn new(
        subject_id: String,
        roles: BTreeSet<String>,
        audience: String,
        issued_at: Option<DateTime<Utc>>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        debug_assert!(!subject_id.is_empty());
        Self {
            subject_id,
            roles,
            audience,
            issued_at,
            expires_at,
        }
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn roles(&self) -> &BTreeSet<String> {
        &self.roles
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Audience the token was verified against
    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Roles joined with commas, for log fields
    pub fn roles_display(&self) -> String {
        self.roles.iter().map(String::as_str).collect::<Vec<_>>().join(",")
    }
}

impl fmt::Debug for IdentityClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityClaims")
            .field("subject_id", &self.subject_id)
            .field("roles", &self.roles)
            .field("audience", &self.audience)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
