//! Virtual hosts

use std::collections::BTreeSet;
use std::fmt;

/// An immutable set of hostnames treated as one routing domain.
///
/// Two `SiteHost`s are equal when they hold the same set of names, so a
/// `SiteHost` can key a router map. Names are stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteHost {
    hosts: BTreeSet<String>,
}

impl SiteHost {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hosts: hosts
                .into_iter()
                .map(|h| h.as_ref().trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }

    /// Whether `host` (port already stripped) belongs to this site.
    pub fn has_host(&self, host: &str) -> bool {
        self.hosts.contains(&host.to_ascii_lowercase())
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(String::as_str)
    }
}

impl fmt::Display for SiteHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.hosts().collect();
        write!(f, "{}", names.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_set_equality() {
        let a = SiteHost::new(["example.com", "www.example.com"]);
        let b = SiteHost::new(["WWW.example.com", "example.com"]);
        assert_eq!(a, b);

        let mut map = HashMap::new();
        map.insert(a, 1);
        assert_eq!(map.get(&b), Some(&1));
    }

    #[test]
    fn test_has_host() {
        let site = SiteHost::new(["Example.com"]);
        assert!(site.has_host("example.com"));
        assert!(site.has_host("EXAMPLE.COM"));
        assert!(!site.has_host("other.com"));
        assert_eq!(site.to_string(), "example.com");
    }
}
