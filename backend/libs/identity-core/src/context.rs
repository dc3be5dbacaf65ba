//! Request-scoped identity carrier
//!
//! An `IdentityContext` is created empty when a request enters the outermost
//! layer, bound at most once when its credential verifies, and dropped with
//! the request. Clones share the same slot, which is how an outer layer sees
//! what an inner layer bound.

use crate::claims::IdentityClaims;
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("an identity is already bound to this request")]
pub struct AlreadyBound;

#[derive(Clone, Default)]
pub struct IdentityContext {
    slot: Arc<OnceCell<Arc<IdentityClaims>>>,
}

impl IdentityContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind verified claims; the first binding wins and is never replaced
    pub fn bind(&self, claims: IdentityClaims) -> Result<(), AlreadyBound> {
        self.slot.set(Arc::new(claims)).map_err(|_| AlreadyBound)
    }

    pub fn claims(&self) -> Option<&IdentityClaims> {
        self.slot.get().map(Arc::as_ref)
    }

    /// Shared handle to the bound claims, for handing to handlers
    pub fn shared_claims(&self) -> Option<Arc<IdentityClaims>> {
        self.slot.get().cloned()
    }

    pub fn is_bound(&self) -> bool {
        self.slot.get().is_some()
    }
}

impl fmt::Debug for IdentityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.claims() {
            Some(claims) => f
                .debug_struct("IdentityContext")
                .field("subject_id", &claims.subject_id())
                .finish(),
            None => f.write_str("IdentityContext(unbound)"),
        }
    }
}
