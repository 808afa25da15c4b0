//! Tunnel profiles, resolver candidates and the handle of an open tunnel.

use std::net::IpAddr;

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::id::HandleId;
use crate::time::{Timestamp, now};

/// A labelled, ordered set of name-resolution addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverCandidate {
    pub label: String,
    pub addresses: Vec<IpAddr>,
}

/// A named tunnel profile: the resolver candidates it may rotate through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub resolvers: Vec<ResolverCandidate>,
}

impl Profile {
    /// Check domain invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] when the name is empty, there are no
    /// candidates, or a candidate has no addresses.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.resolvers.is_empty() {
            return Err(ValidationError::NoResolvers(self.name.clone()));
        }
        if let Some(empty) = self.resolvers.iter().find(|c| c.addresses.is_empty()) {
            return Err(ValidationError::EmptyResolverSet(empty.label.clone()));
        }
        Ok(())
    }

    /// Build the tunnel configuration that applies `candidate`.
    #[must_use]
    pub fn config_for(&self, candidate: &ResolverCandidate) -> TunnelConfig {
        TunnelConfig {
            resolver_set: candidate.addresses.clone(),
            resolver_label: candidate.label.clone(),
            session_label: format!("{}/{}", self.name, candidate.label),
        }
    }
}

/// What the transport needs to open a tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub resolver_set: Vec<IpAddr>,
    pub resolver_label: String,
    pub session_label: String,
}

impl TunnelConfig {
    /// Two configs are equivalent when they apply the same resolver set;
    /// labels are cosmetic.
    #[must_use]
    pub fn is_equivalent(&self, other: &Self) -> bool {
        self.resolver_set == other.resolver_set
    }
}

/// An open tunnel. Exclusively owned by the tunnel manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHandle {
    pub id: HandleId,
    pub config: TunnelConfig,
    pub opened_at: Timestamp,
}

impl TunnelHandle {
    /// Mint a handle for a freshly opened tunnel.
    #[must_use]
    pub fn open(config: TunnelConfig) -> Self {
        Self {
            id: HandleId::new(),
            config,
            opened_at: now(),
        }
    }
}

/// Pick a resolver candidate pseudo-randomly.
///
/// Whenever more than one candidate exists, the pick differs from the
/// candidate labelled `previous`.
pub fn pick_resolver<'a, R: Rng + ?Sized>(
    candidates: &'a [ResolverCandidate],
    previous: Option<&str>,
    rng: &mut R,
) -> Option<&'a ResolverCandidate> {
    if candidates.len() <= 1 {
        return candidates.first();
    }
    let eligible: Vec<&ResolverCandidate> = candidates
        .iter()
        .filter(|c| Some(c.label.as_str()) != previous)
        .collect();
    if eligible.is_empty() {
        return candidates.choose(rng);
    }
    eligible.choose(rng).copied()
}
