/// Environment variable holding a colon-separated list of exempt prefixes.
pub const EXEMPT_ENV: &str = "RUMP_NS_EXEMPT";

/// Literal name prefixes that are never rewritten.
///
/// Which names a loader must leave alone (its own runtime hooks, names that are already
/// namespaced, toolchain-generated symbols) depends on the target, so there is no default list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExemptionSet {
    prefixes: Vec<Vec<u8>>,
}

impl ExemptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_prefixes<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let mut set = Self::new();
        for p in prefixes {
            set.insert(p);
        }
        set
    }

    /// Parse a colon-separated prefix list. Empty components are skipped.
    pub fn from_list(list: &str) -> Self {
        Self::from_prefixes(list.split(':').filter(|s| !s.is_empty()))
    }

    /// Read the exemption list from [EXEMPT_ENV]. An unset variable yields an empty set.
    pub fn from_env() -> Self {
        std::env::var(EXEMPT_ENV)
            .map(|v| Self::from_list(&v))
            .unwrap_or_default()
    }

    /// Add a prefix, keeping insertion order and ignoring duplicates.
    pub fn insert(&mut self, prefix: impl AsRef<[u8]>) {
        let prefix = prefix.as_ref();
        if !self.prefixes.iter().any(|p| p == prefix) {
            self.prefixes.push(prefix.to_vec());
        }
    }

    /// Extend the set with the namespace prefix itself, which makes renaming idempotent.
    pub fn with_prefix_exempt(mut self, prefix: &str) -> Self {
        self.insert(prefix);
        self
    }

    pub fn matches(&self, name: &[u8]) -> bool {
        self.prefixes.iter().any(|p| name.starts_with(p))
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.prefixes.iter().map(|p| p.as_slice())
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}
