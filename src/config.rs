use anyhow::{Context, Result, anyhow};
use chrono::{FixedOffset, Offset, Utc};
use std::env;
use std::str::FromStr;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub server_addr: String,
    pub access_token_ttl: usize,
    pub refresh_token_ttl: usize,

    // Rate limiting
    pub rate_login_per_min: u32,
    pub rate_register_per_min: u32,
    pub rate_refresh_per_min: u32,
    pub rate_protected_per_min: u32,

    pub api_prefix: String,
    pub log_dir: String,
    pub run_migrations: bool,

    // Uploads
    pub upload_dir: String,
    pub max_upload_bytes: usize,

    /// Local offset of the business, used to decide which calendar day a
    /// clock-in belongs to.
    pub clock_utc_offset_minutes: i32,
    pub reminder_poll_secs: u64,
}

fn required(name: &str) -> Result<String> {
    env::var(name).with_context(|| format!("{name} must be set"))
}

fn parsed_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{name} has an invalid value {raw:?}: {e}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            server_addr: required("SERVER_ADDR")?,
            database_url: required("DATABASE_URL")?,
            jwt_secret: required("JWT_SECRET")?,
            access_token_ttl: parsed_or("ACCESS_TOKEN_TTL", 900)?, // 15 min
            refresh_token_ttl: parsed_or("REFRESH_TOKEN_TTL", 604_800)?, // 7 days

            rate_login_per_min: parsed_or("RATE_LOGIN_PER_MIN", 60)?,
            rate_register_per_min: parsed_or("RATE_REGISTER_PER_MIN", 30)?,
            rate_refresh_per_min: parsed_or("RATE_REFRESH_PER_MIN", 30)?,
            rate_protected_per_min: parsed_or("RATE_PROTECTED_PER_MIN", 1000)?,

            api_prefix: env::var("API_PREFIX").unwrap_or_else(|_| "/api".to_string()),
            log_dir: env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_string()),
            run_migrations: parsed_or("RUN_MIGRATIONS", true)?,

            upload_dir: env::var("UPLOAD_DIR").unwrap_or_else(|_| "uploads".to_string()),
            max_upload_bytes: parsed_or("MAX_UPLOAD_BYTES", 10 * 1024 * 1024)?,

            clock_utc_offset_minutes: parsed_or("CLOCK_UTC_OFFSET_MINUTES", 0)?,
            reminder_poll_secs: parsed_or("REMINDER_POLL_SECS", 60)?,
        })
    }

    /// Offset used to assign clock sessions to work dates.
    pub fn clock_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.clock_utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix())
    }

    /// Configuration for unit tests; never touches the environment.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            database_url: "mysql://localhost/opsdash_test".into(),
            jwt_secret: "test-secret".into(),
            server_addr: "127.0.0.1:0".into(),
            access_token_ttl: 900,
            refresh_token_ttl: 3600,
            rate_login_per_min: 60,
            rate_register_per_min: 30,
            rate_refresh_per_min: 30,
            rate_protected_per_min: 1000,
            api_prefix: "/api".into(),
            log_dir: "logs".into(),
            run_migrations: false,
            upload_dir: std::env::temp_dir()
                .join("opsdash_test_uploads")
                .to_string_lossy()
                .into_owned(),
            max_upload_bytes: 1024,
            clock_utc_offset_minutes: 0,
            reminder_poll_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_offset_falls_back_to_utc_when_out_of_range() {
        let mut cfg = Config::for_tests();
        cfg.clock_utc_offset_minutes = -300;
        assert_eq!(cfg.clock_offset().local_minus_utc(), -300 * 60);

        cfg.clock_utc_offset_minutes = 100_000;
        assert_eq!(cfg.clock_offset().local_minus_utc(), 0);
    }

    #[test]
    fn parsed_or_uses_default_for_missing_variable() {
        let value: u32 = parsed_or("OPSDASH_SURELY_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }
}
