use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::vless::VlessParams;

/// 隧道提供者 - 启动一个在本地回环地址上暴露 SOCKS5 入口的隧道
///
/// `start` 返回时隧道进程已被拉起，但监听 socket 未必已经就绪；
/// 就绪与否由管理器的端口轮询探明。
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    async fn start(
        &self,
        params: &VlessParams,
        socks_port: u16,
    ) -> Result<Box<dyn ProviderHandle>>;
}

/// 已启动隧道的句柄；close 释放全部底层资源
#[async_trait]
pub trait ProviderHandle: Send {
    async fn close(&mut self) -> Result<()>;
}

/// 按解析出的 VLESS 参数生成隧道引擎的配置文档
///
/// 字段必须与 `VlessParams` 一一对应：SOCKS 入站绑定 127.0.0.1、
/// noauth；VLESS 出站 encryption=none、flow 为空；流设置按
/// security 分别生成 reality / tls 两套参数。
pub fn render_provider_config(params: &VlessParams, socks_port: u16, log_level: &str) -> Value {
    json!({
        "log": {
            "loglevel": log_level,
        },
        "inbounds": [{
            "port": socks_port,
            "listen": "127.0.0.1",
            "protocol": "socks",
            "settings": {
                "auth": "noauth",
                "udp": true,
            },
        }],
        "outbounds": [{
            "protocol": "vless",
            "settings": {
                "vnext": [{
                    "address": &params.address,
                    "port": params.port,
                    "users": [{
                        "id": &params.uuid,
                        "encryption": "none",
                        "flow": "",
                    }],
                }],
            },
            "streamSettings": render_stream_settings(params),
        }],
    })
}

fn render_stream_settings(params: &VlessParams) -> Value {
    let mut stream = json!({
        "network": &params.transport,
    });

    if params.transport == "tcp" {
        stream["tcpSettings"] = json!({
            "header": { "type": "none" },
        });
    }

    match params.security.as_str() {
        "reality" => {
            stream["security"] = json!("reality");

            let mut reality = json!({
                "show": false,
                "fingerprint": &params.fp,
                "serverName": &params.sni,
                "publicKey": &params.pbk,
            });
            // shortId 与 spiderX 均为可选
            if !params.sid.is_empty() {
                reality["shortId"] = json!(&params.sid);
            }
            if !params.spx.is_empty() {
                reality["spiderX"] = json!(&params.spx);
            }

            stream["realitySettings"] = reality;
        }
        "tls" => {
            stream["security"] = json!("tls");
            stream["tlsSettings"] = json!({
                "serverName": &params.sni,
                "allowInsecure": false,
                "fingerprint": &params.fp,
            });
        }
        _ => {}
    }

    stream
}

/// 以外部 xray 进程实现的隧道提供者
pub struct XrayProcessProvider {
    binary: String,
    log_level: String,
}

impl XrayProcessProvider {
    /// 从环境变量取 xray 二进制路径（`XRAY_BIN`）与日志级别（`XRAY_LOG_LEVEL`）
    pub fn from_env() -> Self {
        Self {
            binary: std::env::var("XRAY_BIN").unwrap_or_else(|_| "xray".to_string()),
            log_level: std::env::var("XRAY_LOG_LEVEL").unwrap_or_else(|_| "warning".to_string()),
        }
    }
}

#[async_trait]
impl TunnelProvider for XrayProcessProvider {
    async fn start(
        &self,
        params: &VlessParams,
        socks_port: u16,
    ) -> Result<Box<dyn ProviderHandle>> {
        let config = render_provider_config(params, socks_port, &self.log_level);
        let config_path = std::env::temp_dir().join(format!("xray-tunnel-{socks_port}.json"));
        tokio::fs::write(&config_path, serde_json::to_vec_pretty(&config)?)
            .await
            .with_context(|| {
                format!("failed to write xray config to {}", config_path.display())
            })?;

        debug!(port = socks_port, config = %config_path.display(), "starting xray process");

        let child = Command::new(&self.binary)
            .arg("run")
            .arg("-c")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start xray binary {:?}", self.binary))?;

        Ok(Box::new(XrayProcessHandle { child, config_path }))
    }
}

struct XrayProcessHandle {
    child: Child,
    config_path: PathBuf,
}

#[async_trait]
impl ProviderHandle for XrayProcessHandle {
    async fn close(&mut self) -> Result<()> {
        if let Err(e) = self.child.start_kill() {
            warn!(error = %e, "failed to kill xray process");
        }
        let _ = self.child.wait().await;
        let _ = tokio::fs::remove_file(&self.config_path).await;
        Ok(())
    }
}
