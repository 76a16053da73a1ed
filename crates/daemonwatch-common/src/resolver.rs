//! Connection resolution strategies and their selection order

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A way of listing the connections of a process
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Resolver {
    /// Reads /proc/net and the process' file descriptors directly
    Proc,
    /// `netstat -np`
    Netstat,
    /// `ss -nptu`
    Ss,
    /// `lsof -wnPi`
    Lsof,
}

impl Resolver {
    pub const ALL: [Resolver; 4] =
        [Resolver::Proc, Resolver::Netstat, Resolver::Ss, Resolver::Lsof];

    pub fn name(&self) -> &'static str {
        match self {
            Resolver::Proc => "proc",
            Resolver::Netstat => "netstat",
            Resolver::Ss => "ss",
            Resolver::Lsof => "lsof",
        }
    }

    /// Executable this strategy shells out to, if any
    pub fn command(&self) -> Option<&'static str> {
        match self {
            Resolver::Proc => None,
            Resolver::Netstat => Some("netstat"),
            Resolver::Ss => Some("ss"),
            Resolver::Lsof => Some("lsof"),
        }
    }
}

impl fmt::Display for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error for resolver names that don't match any strategy
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown connection resolver: {0}")]
pub struct UnknownResolver(pub String);

impl FromStr for Resolver {
    type Err = UnknownResolver;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Resolver::ALL
            .iter()
            .copied()
            .find(|r| r.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownResolver(s.to_string()))
    }
}

/// Resolver picked for a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveResolver {
    pub resolver: Resolver,
    /// False when this is a user pinned override
    pub is_default: bool,
}

/// Ordered resolvers to try plus an optional pinned override.
///
/// The priority list only ever shrinks from its head. The override is never
/// removed by failures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverList {
    priority: VecDeque<Resolver>,
    custom: Option<Resolver>,
}

impl ResolverList {
    pub fn new(priority: impl IntoIterator<Item = Resolver>) -> Self {
        Self {
            priority: priority.into_iter().collect(),
            custom: None,
        }
    }

    /// Resolver the next lookup should use
    pub fn active(&self) -> Option<ActiveResolver> {
        if let Some(resolver) = self.custom {
            return Some(ActiveResolver {
                resolver,
                is_default: false,
            });
        }

        self.priority.front().map(|&resolver| ActiveResolver {
            resolver,
            is_default: true,
        })
    }

    /// Drop the head of the priority list, providing the new head.
    pub fn remove_head(&mut self) -> Option<Resolver> {
        self.priority.pop_front();
        self.priority.front().copied()
    }

    pub fn priority(&self) -> Vec<Resolver> {
        self.priority.iter().copied().collect()
    }

    pub fn custom(&self) -> Option<Resolver> {
        self.custom
    }

    pub fn set_custom(&mut self, resolver: Option<Resolver>) {
        self.custom = resolver;
    }

    pub fn is_exhausted(&self) -> bool {
        self.custom.is_none() && self.priority.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_prefers_custom() {
        let mut list = ResolverList::new([Resolver::Netstat, Resolver::Lsof]);
        assert_eq!(
            list.active(),
            Some(ActiveResolver {
                resolver: Resolver::Netstat,
                is_default: true
            })
        );

        list.set_custom(Some(Resolver::Ss));
        assert_eq!(
            list.active(),
            Some(ActiveResolver {
                resolver: Resolver::Ss,
                is_default: false
            })
        );

        list.set_custom(None);
        assert_eq!(list.active().map(|a| a.resolver), Some(Resolver::Netstat));
    }

    #[test]
    fn test_remove_head_shrinks_in_order() {
        let mut list = ResolverList::new([Resolver::Proc, Resolver::Netstat, Resolver::Lsof]);
        assert_eq!(list.remove_head(), Some(Resolver::Netstat));
        assert_eq!(list.priority(), vec![Resolver::Netstat, Resolver::Lsof]);
        assert_eq!(list.remove_head(), Some(Resolver::Lsof));
        assert_eq!(list.remove_head(), None);
        assert!(list.is_exhausted());
        assert_eq!(list.remove_head(), None);
        assert_eq!(list.active(), None);
    }

    #[test]
    fn test_custom_survives_exhaustion() {
        let mut list = ResolverList::new([]);
        assert!(list.is_exhausted());
        list.set_custom(Some(Resolver::Lsof));
        assert!(!list.is_exhausted());
        assert_eq!(list.active().map(|a| a.resolver), Some(Resolver::Lsof));
    }

    #[test]
    fn test_parse_resolver_names() {
        assert_eq!("netstat".parse::<Resolver>(), Ok(Resolver::Netstat));
        assert_eq!(" LSOF ".parse::<Resolver>(), Ok(Resolver::Lsof));
        assert_eq!("proc".parse::<Resolver>(), Ok(Resolver::Proc));
        assert!("sockstat".parse::<Resolver>().is_err());
    }

    #[test]
    fn test_serde_names_match_display() {
        for resolver in Resolver::ALL {
            let json = serde_json::to_string(&resolver).unwrap();
            assert_eq!(json, format!("\"{}\"", resolver));
        }
    }
}
