//! Startup configuration, sourced entirely from environment variables.
//!
//! Unlike the TOML project-file configuration this crate's ancestor used, the executor reads its
//! whole configuration once at process start. Malformed values fail startup with a named error
//! rather than silently falling back to a default.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must be a positive integer, got '{value}'")]
    InvalidInteger { key: &'static str, value: String },

    #[error("{key} must be a positive number, got '{value}'")]
    InvalidNumber { key: &'static str, value: String },

    #[error("CUSTOM_POOLS entry '{entry}' is malformed: expected 'image:size'")]
    MalformedPoolEntry { entry: String },

    #[error("CUSTOM_POOLS entry '{entry}' has a non-positive size '{size}'")]
    InvalidPoolSize { entry: String, size: String },

    #[error("CUSTOM_POOLS duplicates BASE_IMAGE ('{image}'): give it a distinct image or drop it from CUSTOM_POOLS")]
    DuplicatesBaseImage { image: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub pool_size: usize,
    pub base_image: String,
    pub memory_limit: String,
    pub memory_limit_bytes: i64,
    pub cpu_limit: f64,
    pub timeout: Duration,
    pub custom_image_registry: Option<String>,
    pub custom_image_pull_timeout: Duration,
    pub custom_image_pull_retries: u32,
    pub custom_pools: Vec<(String, usize)>,
    pub host_port: u16,
    pub log_level: String,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_positive_usize(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    let parsed: i64 = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidInteger { key, value: value.to_string() })?;
    if parsed <= 0 {
        return Err(ConfigError::InvalidInteger { key, value: value.to_string() });
    }
    Ok(parsed as usize)
}

fn parse_positive_u32(key: &'static str, value: &str) -> Result<u32, ConfigError> {
    let parsed: i64 = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidInteger { key, value: value.to_string() })?;
    if parsed <= 0 {
        return Err(ConfigError::InvalidInteger { key, value: value.to_string() });
    }
    Ok(parsed as u32)
}

fn parse_positive_f64(key: &'static str, value: &str) -> Result<f64, ConfigError> {
    let parsed: f64 = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidNumber { key, value: value.to_string() })?;
    if !(parsed > 0.0) {
        return Err(ConfigError::InvalidNumber { key, value: value.to_string() });
    }
    Ok(parsed)
}

/// Parses a memory-limit string like "256m", "1g", "512k", or a bare byte count, into bytes.
pub fn parse_memory_limit(value: &str) -> Result<i64, ConfigError> {
    let value = value.trim();
    let (number_part, multiplier) = match value.chars().last() {
        Some(c) if c.eq_ignore_ascii_case(&'k') => (&value[..value.len() - 1], 1024i64),
        Some(c) if c.eq_ignore_ascii_case(&'m') => (&value[..value.len() - 1], 1024 * 1024),
        Some(c) if c.eq_ignore_ascii_case(&'g') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1i64),
    };
    let number: i64 = number_part
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidInteger { key: "MEMORY_LIMIT", value: value.to_string() })?;
    if number <= 0 {
        return Err(ConfigError::InvalidInteger { key: "MEMORY_LIMIT", value: value.to_string() });
    }
    Ok(number * multiplier)
}

/// Splits a `CUSTOM_POOLS` value ("img1:n1,img2:n2,...") into (image, size) pairs. Each entry
/// splits on its *final* colon via `rsplit_once` so that image references containing colons
/// (registry ports, explicit tags) parse correctly, e.g. `host:5000/img:tag:2`.
fn parse_custom_pools(value: &str) -> Result<Vec<(String, usize)>, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(Vec::new());
    }
    let mut pools = Vec::new();
    for raw_entry in value.split(',') {
        let entry = raw_entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (image, size_str) = entry
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::MalformedPoolEntry { entry: entry.to_string() })?;
        if image.is_empty() {
            return Err(ConfigError::MalformedPoolEntry { entry: entry.to_string() });
        }
        let size: i64 = size_str.trim().parse().map_err(|_| ConfigError::InvalidPoolSize {
            entry: entry.to_string(),
            size: size_str.to_string(),
        })?;
        if size <= 0 {
            return Err(ConfigError::InvalidPoolSize {
                entry: entry.to_string(),
                size: size_str.to_string(),
            });
        }
        pools.push((image.to_string(), size as usize));
    }
    Ok(pools)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let pool_size = parse_positive_usize("POOL_SIZE", &env_or("POOL_SIZE", "5"))?;
        let base_image = env_or("BASE_IMAGE", "alpine:latest");
        let memory_limit = env_or("MEMORY_LIMIT", "256m");
        let memory_limit_bytes = parse_memory_limit(&memory_limit)?;
        let cpu_limit = parse_positive_f64("CPU_LIMIT", &env_or("CPU_LIMIT", "0.5"))?;
        let timeout_secs = parse_positive_u32("TIMEOUT", &env_or("TIMEOUT", "30"))?;
        let custom_image_registry = std::env::var("CUSTOM_IMAGE_REGISTRY")
            .ok()
            .filter(|s| !s.is_empty());
        let custom_image_pull_timeout_secs = parse_positive_u32(
            "CUSTOM_IMAGE_PULL_TIMEOUT",
            &env_or("CUSTOM_IMAGE_PULL_TIMEOUT", "300"),
        )?;
        let custom_image_pull_retries =
            parse_positive_u32("CUSTOM_IMAGE_PULL_RETRIES", &env_or("CUSTOM_IMAGE_PULL_RETRIES", "3"))?;
        let custom_pools = parse_custom_pools(&env_or("CUSTOM_POOLS", ""))?;
        let host_port = parse_positive_u32("HOST_PORT", &env_or("HOST_PORT", "8080"))? as u16;
        let log_level = env_or("LOG_LEVEL", "INFO");

        for (image, _) in &custom_pools {
            if *image == base_image {
                return Err(ConfigError::DuplicatesBaseImage { image: image.clone() });
            }
        }

        Ok(Config {
            pool_size,
            base_image,
            memory_limit,
            memory_limit_bytes,
            cpu_limit,
            timeout: Duration::from_secs(timeout_secs as u64),
            custom_image_registry,
            custom_image_pull_timeout: Duration::from_secs(custom_image_pull_timeout_secs as u64),
            custom_image_pull_retries,
            custom_pools,
            host_port,
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_memory_limit_suffixes() {
        assert_eq!(parse_memory_limit("256m").unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1g").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("512k").unwrap(), 512 * 1024);
        assert_eq!(parse_memory_limit("1000").unwrap(), 1000);
    }

    #[test]
    fn rejects_non_positive_memory_limit() {
        assert!(parse_memory_limit("0m").is_err());
        assert!(parse_memory_limit("-5m").is_err());
    }

    #[test]
    fn parses_custom_pools_with_colon_in_image_ref() {
        let pools = parse_custom_pools("host:5000/img:tag:2,alpine:latest:3").unwrap();
        assert_eq!(
            pools,
            vec![
                ("host:5000/img:tag".to_string(), 2),
                ("alpine:latest".to_string(), 3),
            ]
        );
    }

    #[test]
    fn empty_custom_pools_is_empty_vec() {
        assert_eq!(parse_custom_pools("").unwrap(), Vec::new());
        assert_eq!(parse_custom_pools("   ").unwrap(), Vec::new());
    }

    #[test]
    fn rejects_malformed_custom_pools_entry() {
        assert!(parse_custom_pools("no-colon-here").is_err());
    }

    #[test]
    fn rejects_non_positive_custom_pool_size() {
        assert!(parse_custom_pools("alpine:0").is_err());
        assert!(parse_custom_pools("alpine:-1").is_err());
    }

    #[test]
    fn rejects_non_integer_pool_size() {
        assert!(parse_positive_usize("POOL_SIZE", "abc").is_err());
        assert!(parse_positive_usize("POOL_SIZE", "0").is_err());
        assert!(parse_positive_usize("POOL_SIZE", "-3").is_err());
    }
}
