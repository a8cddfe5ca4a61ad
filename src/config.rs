use std::env;
use std::str::FromStr;

use chrono_tz::Tz;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_name: String,
    pub environment: String,
    pub api_prefix: String,
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub rate_limit_per_second: u64,
    pub rate_limit_burst_size: u32,
    pub dev_auth_overrides_enabled: bool,
    pub jwt_secret: Option<String>,
    pub database_url: Option<String>,
    pub db_pool_max_connections: u32,
    pub db_pool_min_connections: u32,
    pub db_pool_acquire_timeout_seconds: u64,
    pub db_pool_idle_timeout_seconds: u64,
    /// Local calendar used for "today" in due/discount comparisons and for
    /// defaulted transaction dates.
    pub billing_timezone: Tz,
    /// Upper bound on ids per bulk-update statement. The backing store times
    /// out on very large id lists, so membership writes are chunked.
    pub bulk_chunk_size: usize,
    pub batch_totals_cache_ttl_seconds: u64,
    pub batch_totals_cache_max_entries: u64,
    pub gateway_webhook_url: Option<String>,
    pub gateway_webhook_secret: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            app_name: env_or("APP_NAME", "GridBatch API"),
            environment: env_or("ENVIRONMENT", "development"),
            api_prefix: normalize_prefix(&env_or("API_PREFIX", "/v1")),
            host: env_or("HOST", "0.0.0.0"),
            port: env_parse_or("PORT", 8000),
            cors_origins: parse_csv(&env_or("CORS_ORIGINS", "http://localhost:3000")),
            rate_limit_per_second: env_parse_or("RATE_LIMIT_PER_SECOND", 10),
            rate_limit_burst_size: env_parse_or("RATE_LIMIT_BURST_SIZE", 100),
            dev_auth_overrides_enabled: env_parse_bool_or("DEV_AUTH_OVERRIDES_ENABLED", false),
            jwt_secret: env_opt("JWT_SECRET"),
            database_url: env_opt("DATABASE_URL"),
            db_pool_max_connections: env_parse_or("DB_POOL_MAX_CONNECTIONS", 5),
            db_pool_min_connections: env_parse_or("DB_POOL_MIN_CONNECTIONS", 1),
            db_pool_acquire_timeout_seconds: env_parse_or("DB_POOL_ACQUIRE_TIMEOUT_SECONDS", 5),
            db_pool_idle_timeout_seconds: env_parse_or("DB_POOL_IDLE_TIMEOUT_SECONDS", 600),
            billing_timezone: parse_timezone(env_opt("BILLING_TIMEZONE")),
            bulk_chunk_size: env_parse_or("BULK_CHUNK_SIZE", 5usize).max(1),
            batch_totals_cache_ttl_seconds: env_parse_or("BATCH_TOTALS_CACHE_TTL_SECONDS", 15),
            batch_totals_cache_max_entries: env_parse_or("BATCH_TOTALS_CACHE_MAX_ENTRIES", 2000),
            gateway_webhook_url: env_opt("GATEWAY_WEBHOOK_URL"),
            gateway_webhook_secret: env_opt("GATEWAY_WEBHOOK_SECRET"),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.trim().eq_ignore_ascii_case("production")
    }

    pub fn auth_dev_overrides_enabled(&self) -> bool {
        if self.is_production() {
            return false;
        }
        self.dev_auth_overrides_enabled
    }
}

fn parse_timezone(raw: Option<String>) -> Tz {
    let Some(name) = raw else {
        return Tz::Asia__Kolkata;
    };
    match Tz::from_str(name.trim()) {
        Ok(tz) => tz,
        Err(_) => {
            tracing::warn!(timezone = %name, "Unknown BILLING_TIMEZONE — falling back to Asia/Kolkata");
            Tz::Asia__Kolkata
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    env_opt(key)
        .and_then(|raw| raw.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_parse_bool_or(key: &str, default: bool) -> bool {
    match env_opt(key).as_deref().map(str::to_ascii_lowercase) {
        Some(value) if value == "1" || value == "true" || value == "yes" || value == "on" => true,
        Some(value) if value == "0" || value == "false" || value == "no" || value == "off" => false,
        Some(_) => default,
        None => default,
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn normalize_prefix(raw: &str) -> String {
    let mut prefix = raw.trim().to_string();
    if prefix.is_empty() {
        return "/v1".to_string();
    }
    if !prefix.starts_with('/') {
        prefix.insert(0, '/');
    }
    while prefix.ends_with('/') && prefix.len() > 1 {
        prefix.pop();
    }
    prefix
}

#[cfg(test)]
mod tests {
    use super::{normalize_prefix, parse_csv, parse_timezone};

    #[test]
    fn normalizes_prefix() {
        assert_eq!(normalize_prefix("v1"), "/v1");
        assert_eq!(normalize_prefix("/v1/"), "/v1");
        assert_eq!(normalize_prefix(""), "/v1");
    }

    #[test]
    fn csv_parsing_skips_blanks() {
        assert_eq!(
            parse_csv("a, b,,c "),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(parse_csv(" , ").is_empty());
    }

    #[test]
    fn timezone_falls_back_on_garbage() {
        assert_eq!(
            parse_timezone(Some("Not/AZone".to_string())),
            chrono_tz::Tz::Asia__Kolkata
        );
        assert_eq!(
            parse_timezone(Some("Asia/Dhaka".to_string())),
            chrono_tz::Tz::Asia__Dhaka
        );
        assert_eq!(parse_timezone(None), chrono_tz::Tz::Asia__Kolkata);
    }
}
