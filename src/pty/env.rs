//! Spawn environment
//!
//! The shell never inherits the relay's environment implicitly. Whatever the
//! child should see is enumerated in a [`ShellEnv`] and applied on top of a
//! cleared environment at spawn time.

use std::collections::BTreeMap;

/// Environment variables handed to a spawned shell
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellEnv {
    vars: BTreeMap<String, String>,
}

impl ShellEnv {
    /// Create an empty environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the current process environment
    ///
    /// Variables whose name or value is not valid unicode are skipped.
    pub fn inherit() -> Self {
        let vars = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        Self { vars }
    }

    /// Set a variable, replacing any previous value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Builder-style variant of [`ShellEnv::set`]
    #[cfg(test)]
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Remove a variable if present
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.vars.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ShellEnv {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_remove() {
        let mut env = ShellEnv::new().with_var("TERM", "xterm-color");
        assert_eq!(env.get("TERM"), Some("xterm-color"));

        env.set("TERM", "dumb");
        assert_eq!(env.get("TERM"), Some("dumb"));
        assert_eq!(env.len(), 1);

        assert_eq!(env.remove("TERM"), Some("dumb".to_string()));
        assert!(env.is_empty());
    }

    #[test]
    fn test_inherit_snapshots_host() {
        // PATH is present in any environment that can run the test suite
        let env = ShellEnv::inherit();
        assert_eq!(
            env.get("PATH").map(str::to_string),
            std::env::var("PATH").ok()
        );
    }

    #[test]
    fn test_from_iter_is_ordered() {
        let env: ShellEnv = [("B", "2"), ("A", "1")].into_iter().collect();
        let keys: Vec<_> = env.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["A", "B"]);
    }
}
