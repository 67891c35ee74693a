use std::collections::BTreeSet;
use std::fmt::Display;

use crate::keys::KeyParsers;

/// Subset of an authoritative namespace that one agent execution is responsible for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeScope {
    /// Every id of the type.
    Global,
    /// Ids whose key carries this provider and account, and the region if one is given.
    Account {
        provider: String,
        account:  String,
        region:   Option<String>,
    },
    /// Exactly these ids. Used by on-demand updates so that siblings are never evicted.
    Ids(BTreeSet<String>),
}

impl MergeScope {
    pub fn account<S: ToString>(provider: S, account: S, region: Option<S>) -> Self {
        Self::Account {
            provider: provider.to_string(),
            account:  account.to_string(),
            region:   region.map(|r| r.to_string()),
        }
    }

    pub fn ids<I: IntoIterator<Item = S>, S: Into<String>>(ids: I) -> Self {
        Self::Ids(ids.into_iter().map(Into::into).collect())
    }

    /// Whether `id` belongs to this scope. Ids that cannot be parsed never belong to an account scope.
    pub fn contains(&self, parsers: &KeyParsers, id: &str) -> bool {
        match self {
            Self::Global => true,
            Self::Ids(ids) => ids.contains(id),
            Self::Account {
                provider,
                account,
                region,
            } => match parsers.parse(id) {
                Ok(key) => {
                    key.provider == *provider
                        && key.account == *account
                        && region.as_ref().is_none_or(|r| key.region == *r)
                }
                Err(_) => false,
            },
        }
    }

    /// Whether two scopes may claim the same id. Id scopes are compared with account scopes conservatively.
    pub fn overlaps(&self, other: &MergeScope) -> bool {
        match (self, other) {
            (Self::Global, _) | (_, Self::Global) => true,
            (Self::Ids(a), Self::Ids(b)) => !a.is_disjoint(b),
            (Self::Ids(_), _) | (_, Self::Ids(_)) => true,
            (
                Self::Account {
                    provider: p1,
                    account: a1,
                    region: r1,
                },
                Self::Account {
                    provider: p2,
                    account: a2,
                    region: r2,
                },
            ) => {
                p1 == p2
                    && a1 == a2
                    && match (r1, r2) {
                        (Some(r1), Some(r2)) => r1 == r2,
                        _ => true,
                    }
            }
        }
    }
}

impl Display for MergeScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => write!(f, "*"),
            Self::Account {
                provider,
                account,
                region: Some(region),
            } => write!(f, "{provider}/{account}/{region}"),
            Self::Account {
                provider,
                account,
                region: None,
            } => write!(f, "{provider}/{account}"),
            Self::Ids(ids) => write!(f, "{} id(s)", ids.len()),
        }
    }
}

/// Identity of the writer of a cache result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSource {
    agent_type: String,
    scope:      MergeScope,
}

impl CacheSource {
    pub fn new<S: ToString>(agent_type: S, scope: MergeScope) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            scope,
        }
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn scope(&self) -> &MergeScope {
        &self.scope
    }
}

impl Display for CacheSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.agent_type, self.scope)
    }
}
