use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

pub const DEFAULT_HOST: &str = "127.0.0.1:11434";

/// Bind address for the HTTP server, from `OLLAMA_HOST`.
pub fn host() -> SocketAddr {
    let addr = env::var("OLLAMA_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());

    // A bare host gets the default port appended.
    let addr = if addr.contains(':') {
        addr
    } else {
        format!("{}:11434", addr)
    };

    addr.parse()
        .unwrap_or_else(|_| DEFAULT_HOST.parse().unwrap())
}

/// Root directory for the model store, from `OLLAMA_MODELS`.
pub fn models_dir() -> PathBuf {
    let mut path = env::var("OLLAMA_MODELS").unwrap_or_else(|_| "~/.ollama/models".to_string());

    if path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            path = path.replacen('~', &home.to_string_lossy(), 1);
        }
    }

    PathBuf::from(path)
}

/// Extra allowed CORS origins, from `OLLAMA_ORIGINS` (comma-separated).
pub fn allowed_origins() -> Vec<String> {
    env::var("OLLAMA_ORIGINS")
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_defaults_to_loopback() {
        // Only meaningful when the variable is unset in the test environment.
        if env::var("OLLAMA_HOST").is_err() {
            assert_eq!(host().to_string(), "127.0.0.1:11434");
        }
    }
}
