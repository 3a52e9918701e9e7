use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tunnel::VlessParams;

pub const DEFAULT_CONFIG_FILE: &str = "/app/config.yaml";
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9273";
pub const DEFAULT_CHECK_URL: &str = "https://www.google.com";
pub const DEFAULT_CHECK_INTERVAL: &str = "30s";
pub const DEFAULT_CHECK_TIMEOUT: &str = "30s";
pub const DEFAULT_SOCKS_BASE_PORT: u16 = 1080;

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("no tunnels defined in config")]
    NoTunnels,
    #[error("tunnel {0}: url is required")]
    MissingUrl(usize),
    #[error("invalid vless URL: {0}")]
    InvalidVlessUrl(String),
    #[error("invalid {field}: {value:?}")]
    InvalidDuration {
        field: &'static str,
        value: String,
    },
    #[error("tunnel {index} ({name}): {source}")]
    Tunnel {
        index: usize,
        name: String,
        #[source]
        source: Box<ConfigError>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub check_url: String,
    #[serde(default)]
    pub check_interval: String,
    #[serde(default)]
    pub check_timeout: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub check_url: String,
    #[serde(default)]
    pub check_interval: String,
    #[serde(default)]
    pub check_timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default = "default_socks_base_port")]
    pub socks_base_port: u16,
    #[serde(default)]
    pub tunnels: Vec<TunnelSpec>,
}

fn default_socks_base_port() -> u16 {
    DEFAULT_SOCKS_BASE_PORT
}

impl Config {
    /// 读取并解析配置文件，对每条隧道应用默认值
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
    }

    /// 解析 YAML 并应用默认值：显式值 → defaults 块 → 内置默认
    pub fn from_yaml(data: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(data)?;

        if config.tunnels.is_empty() {
            return Err(ConfigError::NoTunnels);
        }

        for (i, tunnel) in config.tunnels.iter_mut().enumerate() {
            if tunnel.url.is_empty() {
                return Err(ConfigError::MissingUrl(i));
            }

            if tunnel.check_url.is_empty() {
                tunnel.check_url = config.defaults.check_url.clone();
            }
            if tunnel.check_interval.is_empty() {
                tunnel.check_interval = config.defaults.check_interval.clone();
            }
            if tunnel.check_timeout.is_empty() {
                tunnel.check_timeout = config.defaults.check_timeout.clone();
            }

            if tunnel.check_url.is_empty() {
                tunnel.check_url = DEFAULT_CHECK_URL.to_string();
            }
            if tunnel.check_interval.is_empty() {
                tunnel.check_interval = DEFAULT_CHECK_INTERVAL.to_string();
            }
            if tunnel.check_timeout.is_empty() {
                tunnel.check_timeout = DEFAULT_CHECK_TIMEOUT.to_string();
            }
        }

        Ok(config)
    }

    /// 无副作用地校验全部隧道定义：URL 可解析、时长可解析
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, tunnel) in self.tunnels.iter().enumerate() {
            validate_tunnel(tunnel).map_err(|e| ConfigError::Tunnel {
                index: i,
                name: tunnel.name.clone(),
                source: Box::new(e),
            })?;
        }
        Ok(())
    }
}

fn validate_tunnel(tunnel: &TunnelSpec) -> Result<(), ConfigError> {
    VlessParams::parse(&tunnel.url)?;
    parse_duration("check_interval", &tunnel.check_interval)?;
    parse_duration("check_timeout", &tunnel.check_timeout)?;
    Ok(())
}

/// 解析形如 "30s"、"1m"、"500ms" 的时长字符串；零时长视为非法
pub fn parse_duration(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let duration = humantime::parse_duration(value).map_err(|_| ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
    })?;
    if duration.is_zero() {
        return Err(ConfigError::InvalidDuration {
            field,
            value: value.to_string(),
        });
    }
    Ok(duration)
}

pub fn config_file_from_env() -> String {
    std::env::var("CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string())
}

pub fn listen_addr_from_env() -> String {
    let addr = std::env::var("LISTEN_ADDR").unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string());
    normalize_listen_addr(&addr)
}

/// 允许 ":9273" 这种只写端口的形式
pub fn normalize_listen_addr(addr: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_string(),
    }
}

pub fn debug_from_env() -> bool {
    std::env::var("DEBUG").map(|v| v == "true").unwrap_or(false)
}
