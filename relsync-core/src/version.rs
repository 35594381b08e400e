//! Ordering for release version strings.
//!
//! Versions are dot-separated numeric cores with an optional `-prerelease`
//! suffix and optional `+build` metadata (ignored for ordering), following
//! semver precedence. Non-numeric core components compare as text after all
//! numeric ones so that odd version strings still get a total, stable order.

use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Ident {
    Num(u64),
    Text(String),
}

impl Ident {
    fn parse(s: &str) -> Self {
        match s.parse::<u64>() {
            Ok(n) => Ident::Num(n),
            Err(_) => Ident::Text(s.to_string()),
        }
    }
}

impl Ord for Ident {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Ident::Num(a), Ident::Num(b)) => a.cmp(b),
            (Ident::Num(_), Ident::Text(_)) => Ordering::Less,
            (Ident::Text(_), Ident::Num(_)) => Ordering::Greater,
            (Ident::Text(a), Ident::Text(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Ident {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A parsed, comparable release version.
#[derive(Debug, Clone, Eq)]
pub struct ReleaseVersion {
    raw: String,
    core: Vec<Ident>,
    pre: Vec<Ident>,
}

impl ReleaseVersion {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim().trim_start_matches(['v', 'V']);
        let without_build = trimmed.split('+').next().unwrap_or_default();
        let (core, pre) = match without_build.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (without_build, None),
        };

        let mut core: Vec<Ident> = core.split('.').map(Ident::parse).collect();
        // 1.0 == 1.0.0
        while core.len() > 1 && core.last() == Some(&Ident::Num(0)) {
            core.pop();
        }
        let pre = pre
            .map(|p| p.split('.').map(Ident::parse).collect())
            .unwrap_or_default();

        Self {
            raw: raw.to_string(),
            core,
            pre,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_prerelease(&self) -> bool {
        !self.pre.is_empty()
    }
}

impl PartialEq for ReleaseVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for ReleaseVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_core = self.core.cmp(&other.core);
        if by_core != Ordering::Equal {
            return by_core;
        }
        // A release outranks any of its prereleases.
        match (self.pre.is_empty(), other.pre.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => self.pre.cmp(&other.pre),
        }
    }
}

impl PartialOrd for ReleaseVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
