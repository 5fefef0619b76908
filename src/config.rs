use log::warn;
use std::collections::HashSet;
use std::env;
use std::time::Duration;

const DEFAULT_DATABASE_URL: &str = "sqlite:meeting_tally.db";
const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_CONSOLE_ACTOR: &str = "console";
const DEFAULT_STALLED_CHECK_SECONDS: u64 = 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    /// Empty means every actor may manage votes.
    pub admin_users: HashSet<String>,
    pub console_actor: String,
    pub stalled_check_interval: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url =
            lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        let max_connections =
            parse_or_default(&lookup, "DATABASE_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS);
        let stalled_seconds =
            parse_or_default(&lookup, "STALLED_CHECK_SECONDS", DEFAULT_STALLED_CHECK_SECONDS);
        let admin_users = lookup("ADMIN_USERS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let console_actor =
            lookup("CONSOLE_ACTOR").unwrap_or_else(|| DEFAULT_CONSOLE_ACTOR.to_string());

        Self {
            database_url,
            max_connections,
            admin_users,
            console_actor,
            stalled_check_interval: Duration::from_secs(stalled_seconds),
        }
    }
}

fn parse_or_default<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + Copy + std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring unparseable {}={:?}, using {}", key, raw, default);
            default
        }),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_lookup(|_| None);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.max_connections, 5);
        assert!(config.admin_users.is_empty());
        assert_eq!(config.console_actor, "console");
        assert_eq!(config.stalled_check_interval, Duration::from_secs(60));
    }

    #[test]
    fn reads_admin_list_and_falls_back_on_bad_numbers() {
        let config = Config::from_lookup(lookup_from(&[
            ("ADMIN_USERS", "alice, bob,,"),
            ("DATABASE_MAX_CONNECTIONS", "lots"),
            ("STALLED_CHECK_SECONDS", "5"),
        ]));
        assert_eq!(config.admin_users.len(), 2);
        assert!(config.admin_users.contains("alice"));
        assert!(config.admin_users.contains("bob"));
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.stalled_check_interval, Duration::from_secs(5));
    }
}
