use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::{env, fmt};

/// Which account store backs the process. Picked here at startup;
/// business logic never inspects the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Postgres,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(StorageBackend::Memory),
            "postgres" => Ok(StorageBackend::Postgres),
            other => Err(format!("unknown storage backend `{}`", other)),
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::Memory => f.write_str("memory"),
            StorageBackend::Postgres => f.write_str("postgres"),
        }
    }
}

pub struct Config {
    pub bind_addr: SocketAddr,
    pub storage: StorageBackend,
    pub database_url: Option<String>,
    pub data_dir: PathBuf,
    pub session_file: PathBuf,
    pub admin_email: String,
    pub admin_password: String,
}

impl Config {
    pub fn load() -> Self {
        Self {
            bind_addr: try_load("NNRG_BIND_ADDR", "127.0.0.1:3000"),
            storage: try_load("NNRG_STORAGE", "memory"),
            database_url: env::var("DATABASE_URL").ok(),
            data_dir: PathBuf::from(var_or("NNRG_DATA_DIR", "data")),
            session_file: PathBuf::from(var_or("NNRG_SESSION_FILE", "session.dat")),
            admin_email: var_or("NNRG_ADMIN_EMAIL", "admin@nnrg.edu.in"),
            admin_password: var_or("NNRG_ADMIN_PASSWORD", "admin123"),
        }
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| {
        log::debug!("{} not set, using default: {}", key, default);
        default.to_string()
    })
}

fn try_load<T: FromStr>(key: &str, default: &str) -> T
where
    T::Err: Display,
{
    var_or(key, default)
        .parse()
        .map_err(|e| {
            log::warn!("Invalid {} value: {}", key, e);
        })
        .expect("Environment misconfigured!")
}
