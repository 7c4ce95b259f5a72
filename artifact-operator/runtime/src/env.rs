use kyverno_artifact_operator_core::provider::UnsupportedProvider;
use kyverno_artifact_operator_core::ReferenceError;

/// Environment access behind a trait so tests can substitute values without
/// touching the process environment.
pub trait EnvLookup: Send + Sync {
    /// Returns the variable's value; unset and empty are both `None`.
    fn get(&self, key: &str) -> Option<String>;
}

/// The real process environment.
#[derive(Copy, Clone, Debug, Default)]
pub struct ProcessEnv;

impl EnvLookup for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|value| !value.is_empty())
    }
}

pub fn string_or(env: &dyn EnvLookup, key: &str, default: &str) -> String {
    env.get(key).unwrap_or_else(|| default.to_string())
}

/// `t`, `true`, and `1` (case-insensitive) are true; any other set value is
/// false; unset falls back to the default.
pub fn bool_or(env: &dyn EnvLookup, key: &str, default: bool) -> bool {
    match env.get(key) {
        Some(value) => matches!(value.to_ascii_lowercase().as_str(), "t" | "true" | "1"),
        None => default,
    }
}

/// Unset or unparseable values fall back to the default.
pub fn int_or(env: &dyn EnvLookup, key: &str, default: u64) -> u64 {
    env.get(key)
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable must be set")]
    Missing(&'static str),
    #[error("GITHUB_TOKEN contains only invalid characters")]
    EmptyToken,
    #[error(transparent)]
    Provider(#[from] UnsupportedProvider),
    #[error("invalid IMAGE_BASE: {0}")]
    Reference(#[from] ReferenceError),
}


#[cfg(test)]
mod tests {
    use super::test::StaticEnv;
    use super::*;

    #[test]
    fn empty_values_read_as_unset() {
        let env = StaticEnv::with(&[("POLL_INTERVAL", "")]);
        assert_eq!(env.get("POLL_INTERVAL"), None);
        assert_eq!(int_or(&env, "POLL_INTERVAL", 30), 30);
    }

    #[test]
    fn boolean_forms() {
        let env = StaticEnv::with(&[
            ("A", "t"),
            ("B", "TRUE"),
            ("C", "1"),
            ("D", "yes"),
            ("E", "false"),
        ]);
        assert!(bool_or(&env, "A", false));
        assert!(bool_or(&env, "B", false));
        assert!(bool_or(&env, "C", false));
        assert!(!bool_or(&env, "D", true));
        assert!(!bool_or(&env, "E", true));
        assert!(bool_or(&env, "MISSING", true));
    }

    #[test]
    fn integers_fall_back_on_garbage() {
        let env = StaticEnv::with(&[("GOOD", "120"), ("BAD", "two")]);
        assert_eq!(int_or(&env, "GOOD", 30), 120);
        assert_eq!(int_or(&env, "BAD", 30), 30);
        assert_eq!(int_or(&env, "MISSING", 30), 30);
    }
}
