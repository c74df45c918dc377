use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Comma-separated `id:token` account credentials; `None` leaves the
    /// directory empty and every attachment rejected.
    pub accounts: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("SWITCHYARD_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            accounts: env::var("SWITCHYARD_ACCOUNTS").ok(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            accounts: None,
        }
    }
}
