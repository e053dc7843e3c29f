use dotenv::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::Credentials;

/// Settings read from the environment (and `.env`), overriding the file.
#[derive(Debug, Default)]
pub struct EnvSettings {
    pub config_path: Option<PathBuf>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub connect_timeout_seconds: Option<u64>,
}

impl EnvSettings {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from any key lookup, so tests need not touch the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Box<dyn std::error::Error>>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(EnvSettings {
            config_path: lookup("FILE_QUEUE_CONFIG").map(PathBuf::from),
            user: lookup("FILE_QUEUE_USER"),
            password: lookup("FILE_QUEUE_PASSWORD"),
            connect_timeout_seconds: match lookup("FILE_QUEUE_CONNECT_TIMEOUT_SECONDS") {
                Some(val) => Some(val.parse()?),
                None => None,
            },
        })
    }

    /// Credentials when both user and password are given.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => Some(Credentials::new(user.as_str(), password.as_str())),
            _ => None,
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_seconds.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<EnvSettings, Box<dyn std::error::Error>> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvSettings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_env_overrides() {
        let settings = settings(&[
            ("FILE_QUEUE_CONFIG", "/etc/file_queue/FileQueue.json"),
            ("FILE_QUEUE_USER", "files"),
            ("FILE_QUEUE_PASSWORD", "secret"),
            ("FILE_QUEUE_CONNECT_TIMEOUT_SECONDS", "15"),
        ])
        .unwrap();

        assert_eq!(
            settings.config_path,
            Some(PathBuf::from("/etc/file_queue/FileQueue.json"))
        );
        assert_eq!(settings.credentials(), Some(Credentials::new("files", "secret")));
        assert_eq!(settings.connect_timeout(), Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_env_defaults() {
        let settings = settings(&[("FILE_QUEUE_USER", "files")]).unwrap();
        assert!(settings.config_path.is_none());
        assert!(settings.credentials().is_none());
        assert!(settings.connect_timeout().is_none());
    }

    #[test]
    fn test_env_bad_timeout() {
        assert!(settings(&[("FILE_QUEUE_CONNECT_TIMEOUT_SECONDS", "soon")]).is_err());
    }
}
