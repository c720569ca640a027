//! Case-insensitive environment maps

use std::collections::{BTreeMap, HashMap};

/// Environment entries looked up without regard to case.
///
/// The first spelling of a name is kept for iteration; later writes replace
/// the value.
#[derive(Debug, Clone, Default)]
pub struct CaseInsensitiveEnv {
    entries: HashMap<String, (String, String)>,
}

impl CaseInsensitiveEnv {
    /// An empty environment
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Project (system) entries overridden by caller (user) entries.
    #[must_use]
    pub fn merged<'a, I, J>(system: I, user: J) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
        J: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut env = Self::new();
        for (k, v) in system.into_iter().chain(user) {
            env.set(k, v);
        }
        env
    }

    /// Insert or replace a value
    pub fn set(&mut self, name: &str, value: &str) {
        self.entries
            .entry(name.to_ascii_lowercase())
            .and_modify(|(_, v)| value.clone_into(v))
            .or_insert_with(|| (name.to_string(), value.to_string()));
    }

    /// Look up a value
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(&name.to_ascii_lowercase()).map(|(_, v)| v.as_str())
    }

    /// Look up a non-empty value
    #[must_use]
    pub fn get_non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|v| !v.is_empty())
    }

    /// `true` when `name` is present
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    /// `true` when there are no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries with their original spelling
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.values().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Entries with upper-cased names, as handed to child processes
    #[must_use]
    pub fn to_upper_map(&self) -> BTreeMap<String, String> {
        self.iter().map(|(k, v)| (k.to_ascii_uppercase(), v.to_string())).collect()
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for CaseInsensitiveEnv {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        let mut env = Self::new();
        for (k, v) in iter {
            env.set(k, v);
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_ignore_case_and_user_wins() {
        let system = BTreeMap::from([("Pets_Api_Key".to_string(), "system".to_string())]);
        let user = BTreeMap::from([("PETS_API_KEY".to_string(), "user".to_string())]);
        let env = CaseInsensitiveEnv::merged(&system, &user);

        assert_eq!(env.get("pets_api_key"), Some("user"));
        assert!(env.contains("PETS_API_KEY"));
        // first spelling is kept
        assert_eq!(env.iter().next(), Some(("Pets_Api_Key", "user")));
        assert_eq!(env.to_upper_map()["PETS_API_KEY"], "user");
    }

    #[test]
    fn empty_values_are_present_but_not_usable() {
        let env: CaseInsensitiveEnv = [("TOKEN", "")].into_iter().collect();
        assert!(env.contains("token"));
        assert_eq!(env.get_non_empty("token"), None);
    }
}
