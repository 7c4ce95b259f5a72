/// Registry provider backing a declared artifact.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Provider {
    #[default]
    Github,
    Artifactory,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Artifactory => "artifactory",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = UnsupportedProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "github" => Ok(Self::Github),
            "artifactory" => Ok(Self::Artifactory),
            other => Err(UnsupportedProvider(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported provider {0:?} (must be 'github' or 'artifactory')")]
pub struct UnsupportedProvider(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsing_is_case_insensitive() {
        assert_eq!("GitHub".parse::<Provider>().unwrap(), Provider::Github);
        assert_eq!(
            "ARTIFACTORY".parse::<Provider>().unwrap(),
            Provider::Artifactory
        );
    }

    #[test]
    fn unknown_providers_are_rejected() {
        assert!("quay".parse::<Provider>().is_err());
    }

    #[test]
    fn default_is_github() {
        assert_eq!(Provider::default(), Provider::Github);
    }
}
