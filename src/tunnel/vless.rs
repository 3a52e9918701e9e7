use url::Url;
use uuid::Uuid;

use crate::config::ConfigError;

/// 从 vless:// URL 解析出的隧道参数，解析后不可变
///
/// `pbk`/`sid`/`spx` 只在 `security=reality` 时有意义，但解析阶段
/// 一律保留，由提供者在生成配置时决定取舍。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlessParams {
    pub uuid: String,
    pub address: String,
    pub port: u16,
    /// query 参数 `type`，如 tcp、ws
    pub transport: String,
    pub security: String,
    pub pbk: String,
    pub sni: String,
    pub fp: String,
    pub sid: String,
    pub spx: String,
}

impl VlessParams {
    /// 解析 vless:// URL；未识别的 query 参数忽略
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        if !raw.starts_with("vless://") {
            return Err(ConfigError::InvalidVlessUrl(
                "URL must start with vless://".to_string(),
            ));
        }

        let url = Url::parse(raw).map_err(|e| ConfigError::InvalidVlessUrl(e.to_string()))?;

        let uuid = url.username().to_string();
        if uuid.is_empty() {
            return Err(ConfigError::InvalidVlessUrl("missing UUID".to_string()));
        }
        Uuid::parse_str(&uuid)
            .map_err(|e| ConfigError::InvalidVlessUrl(format!("invalid UUID: {e}")))?;

        let address = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidVlessUrl("missing host".to_string()))?
            .to_string();

        let port = url
            .port()
            .ok_or_else(|| ConfigError::InvalidVlessUrl("missing port".to_string()))?;

        let mut params = Self {
            uuid,
            address,
            port,
            transport: String::new(),
            security: String::new(),
            pbk: String::new(),
            sni: String::new(),
            fp: String::new(),
            sid: String::new(),
            spx: String::new(),
        };

        for (key, value) in url.query_pairs() {
            let value = value.into_owned();
            match key.as_ref() {
                "type" => params.transport = value,
                "security" => params.security = value,
                "pbk" => params.pbk = value,
                "sni" => params.sni = value,
                "fp" => params.fp = value,
                "sid" => params.sid = value,
                "spx" => params.spx = value,
                _ => {}
            }
        }

        Ok(params)
    }

    /// 形如 `host:port` 的服务器标签
    pub fn server(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}
