use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::provider::{ProviderHandle, TunnelProvider};
use super::vless::VlessParams;
use crate::config::{self, TunnelSpec};
use crate::metrics::{LabelSet, TunnelMetrics};
use crate::probe::ProbeClient;

/// 运行中的隧道实例
///
/// 除 `up` 与指标副作用外，字段在构建后不再变化。每个实例在活动集
/// 中恰有一个探测循环和一个提供者进程。
pub struct TunnelInstance {
    pub name: String,
    pub params: VlessParams,
    pub socks_port: u16,
    pub check_url: String,
    pub check_interval: Duration,
    pub check_timeout: Duration,
    pub client: ProbeClient,
    pub cancel: CancellationToken,
    pub up: AtomicBool,
    handle: Mutex<Option<Box<dyn ProviderHandle>>>,
}

impl std::fmt::Debug for TunnelInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelInstance")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("socks_port", &self.socks_port)
            .field("check_url", &self.check_url)
            .field("check_interval", &self.check_interval)
            .field("check_timeout", &self.check_timeout)
            .field("up", &self.up)
            .finish_non_exhaustive()
    }
}

impl TunnelInstance {
    /// 构建并启动一个隧道实例
    ///
    /// 任何一步失败都会递增 init_errors 计数并回收已创建的资源。
    pub async fn build(
        spec: &TunnelSpec,
        socks_port: u16,
        provider: &dyn TunnelProvider,
        metrics: &TunnelMetrics,
    ) -> Result<Self> {
        match Self::try_build(spec, socks_port, provider).await {
            Ok(instance) => Ok(instance),
            Err(e) => {
                metrics.tunnel_init_errors.inc();
                Err(e)
            }
        }
    }

    async fn try_build(
        spec: &TunnelSpec,
        socks_port: u16,
        provider: &dyn TunnelProvider,
    ) -> Result<Self> {
        let params = VlessParams::parse(&spec.url).context("failed to parse VLESS URL")?;

        let check_interval = config::parse_duration("check_interval", &spec.check_interval)?;
        let check_timeout = config::parse_duration("check_timeout", &spec.check_timeout)?;

        let handle = provider
            .start(&params, socks_port)
            .await
            .context("failed to start tunnel provider")?;

        // 探测客户端不复用连接：每次探测都要走完整的 SOCKS5 握手路径
        let client = ProbeClient::new(socks_port, check_timeout);

        let name = if spec.name.is_empty() {
            params.server()
        } else {
            spec.name.clone()
        };

        Ok(Self {
            name,
            params,
            socks_port,
            check_url: spec.check_url.clone(),
            check_interval,
            check_timeout,
            client,
            cancel: CancellationToken::new(),
            up: AtomicBool::new(false),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// 本实例时间序列的标签集
    pub fn label_set(&self) -> LabelSet {
        LabelSet {
            name: self.name.clone(),
            server: self.params.server(),
            security: self.params.security.clone(),
            sni: self.params.sni.clone(),
        }
    }

    /// 取消探测循环并关闭提供者；提供者侧的错误只记日志
    pub async fn stop(&self) {
        self.cancel.cancel();

        let mut guard = self.handle.lock().await;
        if let Some(mut handle) = guard.take() {
            if let Err(e) = handle.close().await {
                warn!(name = %self.name, error = %e, "failed to close tunnel provider");
            }
        }
    }

    /// 提供者句柄是否已被关闭（或从未存在）
    pub async fn provider_closed(&self) -> bool {
        self.handle.lock().await.is_none()
    }

    #[cfg(test)]
    pub(crate) fn stub(
        name: &str,
        socks_port: u16,
        check_url: &str,
        check_interval: Duration,
        check_timeout: Duration,
    ) -> Self {
        let params = VlessParams {
            uuid: crate::testutil::TEST_UUID.to_string(),
            address: "vpn.example.com".to_string(),
            port: 443,
            transport: "tcp".to_string(),
            security: "reality".to_string(),
            pbk: String::new(),
            sni: "cdn.example.com".to_string(),
            fp: "chrome".to_string(),
            sid: String::new(),
            spx: String::new(),
        };
        Self {
            name: name.to_string(),
            params,
            socks_port,
            check_url: check_url.to_string(),
            check_interval,
            check_timeout,
            client: ProbeClient::new(socks_port, check_timeout),
            cancel: CancellationToken::new(),
            up: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }
}
