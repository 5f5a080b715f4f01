use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub max_age_days: i64,
    pub cookie_secure: bool,
    pub sweep_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Public origin of the app, echoed back in callback/signout `url` fields.
    pub base_url: String,
    pub session: SessionConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")?;
        let session = SessionConfig {
            max_age_days: env_parse("SESSION_MAX_AGE_DAYS").unwrap_or(30),
            cookie_secure: std::env::var("SESSION_COOKIE_SECURE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            sweep_seconds: env_parse("SESSION_SWEEP_SECONDS").unwrap_or(60 * 60),
        };
        Ok(Self {
            database_url,
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS").unwrap_or(10),
            base_url: std::env::var("AUTH_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".into()),
            session,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}
