use std::str::FromStr;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub port: u16,
    /// Longest wait for a game lock before it is force-released
    pub lock_lease: Duration,
    /// Games with no activity for this long are reaped
    pub idle_game_ttl: Duration,
    /// Private lobbies short of players are reaped sooner
    pub stale_private_lobby_ttl: Duration,
    /// Delay between reaching a valid seat count and the game starting
    pub start_delay: Duration,
    pub sweep_interval: Duration,
    /// Overrides the per-game timed-mode delay (development only)
    pub dev_timed_delay: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 6660,
            lock_lease: Duration::from_millis(10_000),
            idle_game_ttl: Duration::from_secs(7200),
            stale_private_lobby_ttl: Duration::from_secs(900),
            start_delay: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(5),
            dev_timed_delay: None,
        }
    }
}

impl ServerConfig {
    /// Load config from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let port = parse_var(&lookup, "CHANCERY_PORT", defaults.port);
        let lock_lease = Duration::from_millis(parse_var(
            &lookup,
            "LOCK_LEASE_MS",
            defaults.lock_lease.as_millis() as u64,
        ));
        let idle_game_ttl = Duration::from_secs(parse_var(
            &lookup,
            "IDLE_GAME_TTL_SECS",
            defaults.idle_game_ttl.as_secs(),
        ));
        let stale_private_lobby_ttl = Duration::from_secs(parse_var(
            &lookup,
            "STALE_PRIVATE_LOBBY_TTL_SECS",
            defaults.stale_private_lobby_ttl.as_secs(),
        ));
        let start_delay = Duration::from_secs(parse_var(
            &lookup,
            "START_DELAY_SECS",
            defaults.start_delay.as_secs(),
        ));
        let sweep_interval = Duration::from_secs(
            parse_var(
                &lookup,
                "SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            )
            .max(1),
        );
        let dev_timed_delay = lookup("DEV_TIMED_DELAY_MS").and_then(|v| match v.trim().parse() {
            Ok(ms) => Some(Duration::from_millis(ms)),
            Err(_) => {
                tracing::warn!("Ignoring invalid DEV_TIMED_DELAY_MS={:?}", v);
                None
            }
        });

        if dev_timed_delay.is_some() {
            tracing::warn!("DEV_TIMED_DELAY_MS is set, timed games use the dev delay");
        }

        Self {
            port,
            lock_lease,
            idle_game_ttl,
            stale_private_lobby_ttl,
            start_delay,
            sweep_interval,
            dev_timed_delay,
        }
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy + std::fmt::Debug,
{
    match lookup(name) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid {}={:?}, using default {:?}", name, raw, default);
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        assert_eq!(ServerConfig::from_lookup(lookup(&[])), ServerConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("CHANCERY_PORT", "8080"),
            ("LOCK_LEASE_MS", "250"),
            ("START_DELAY_SECS", "0"),
            ("DEV_TIMED_DELAY_MS", "1500"),
        ]));
        assert_eq!(config.port, 8080);
        assert_eq!(config.lock_lease, Duration::from_millis(250));
        assert_eq!(config.start_delay, Duration::ZERO);
        assert_eq!(config.dev_timed_delay, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("CHANCERY_PORT", "not-a-port"),
            ("SWEEP_INTERVAL_SECS", "0"),
            ("DEV_TIMED_DELAY_MS", "soon"),
        ]));
        assert_eq!(config.port, 6660);
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
        assert_eq!(config.dev_timed_delay, None);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("IDLE_GAME_TTL_SECS", "60");
        let config = ServerConfig::from_env();
        std::env::remove_var("IDLE_GAME_TTL_SECS");
        assert_eq!(config.idle_game_ttl, Duration::from_secs(60));
    }
}
