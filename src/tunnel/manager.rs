use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::instance::TunnelInstance;
use super::provider::TunnelProvider;
use crate::config::Config;
use crate::metrics::{LabelSet, TunnelMetrics};
use crate::probe;

const READY_TIMEOUT: Duration = Duration::from_secs(10);
const READY_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// 存活判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// 至少一条隧道 UP
    Up,
    AllDown,
    NoTunnels,
}

/// 隧道管理器 - 持有活动实例集合
///
/// 集合由读写锁保护，整体替换、从不原地修改：读者要么看到旧集合
/// 要么看到新集合。写者只有 initialize / reload / stop_all。
pub struct TunnelManager {
    instances: RwLock<Vec<Arc<TunnelInstance>>>,
    metrics: Arc<TunnelMetrics>,
    provider: Arc<dyn TunnelProvider>,
}

impl TunnelManager {
    pub fn new(metrics: Arc<TunnelMetrics>, provider: Arc<dyn TunnelProvider>) -> Self {
        Self {
            instances: RwLock::new(Vec::new()),
            metrics,
            provider,
        }
    }

    /// 按配置顺序构建并发布全部隧道实例
    ///
    /// SOCKS 端口按 socks_base_port + 下标确定性分配。任何实例构建
    /// 失败都会回收已建实例后整体失败，不留下半套集合。端口就绪
    /// 超时只告警不中止，探测循环会把未就绪暴露为 DOWN。
    pub async fn initialize(&self, config: &Config) -> Result<()> {
        if config.tunnels.is_empty() {
            bail!("no tunnels to initialize");
        }

        let mut built: Vec<Arc<TunnelInstance>> = Vec::with_capacity(config.tunnels.len());

        for (i, spec) in config.tunnels.iter().enumerate() {
            let Some(socks_port) = config.socks_base_port.checked_add(i as u16) else {
                for instance in &built {
                    instance.stop().await;
                }
                bail!("socks port range exhausted at tunnel {}", i + 1);
            };

            debug!(index = i + 1, name = %spec.name, socks_port, "initializing tunnel");

            match TunnelInstance::build(spec, socks_port, self.provider.as_ref(), &self.metrics)
                .await
            {
                Ok(instance) => {
                    info!(
                        name = %instance.name,
                        server = %instance.params.server(),
                        security = %instance.params.security,
                        socks_port,
                        "started tunnel"
                    );
                    built.push(Arc::new(instance));
                }
                Err(e) => {
                    for instance in &built {
                        instance.stop().await;
                    }
                    return Err(e).with_context(|| format!("failed to initialize tunnel {}", i + 1));
                }
            }
        }

        for instance in &built {
            if let Err(e) = wait_for_socks_port(instance.socks_port, READY_TIMEOUT).await {
                warn!(
                    name = %instance.name,
                    port = instance.socks_port,
                    error = %e,
                    "socks port not ready"
                );
            }
        }

        for instance in &built {
            tokio::spawn(probe::run(instance.clone(), self.metrics.clone()));
        }

        let mut active = self.instances.write().await;
        *active = built;
        Ok(())
    }

    /// 从配置文件重载隧道集合
    ///
    /// 先加载并校验新配置，校验失败直接返回、现有隧道不受影响。
    /// 之后整体换代：停掉旧集合、用新配置重新 initialize，最后删除
    /// 已移除隧道的指标序列。保留的隧道延续其计数历史。
    pub async fn reload(&self, config_path: &Path) -> Result<()> {
        info!(file = %config_path.display(), "reloading configuration");

        let new_config = Config::load(config_path).context("failed to load config")?;
        new_config
            .validate()
            .context("config validation failed")?;

        let old_instances = {
            let mut active = self.instances.write().await;
            std::mem::take(&mut *active)
        };
        let old_label_sets: Vec<LabelSet> = old_instances.iter().map(|i| i.label_set()).collect();

        for instance in &old_instances {
            instance.stop().await;
        }

        self.initialize(&new_config)
            .await
            .context("failed to initialize tunnels")?;

        let new_label_sets: Vec<LabelSet> = {
            let active = self.instances.read().await;
            active.iter().map(|i| i.label_set()).collect()
        };
        self.metrics.cleanup_removed(&old_label_sets, &new_label_sets);

        info!(tunnels = new_label_sets.len(), "configuration reloaded");
        Ok(())
    }

    /// 停止全部实例并清空活动集合
    pub async fn stop_all(&self) {
        let instances = {
            let mut active = self.instances.write().await;
            std::mem::take(&mut *active)
        };
        for instance in &instances {
            instance.stop().await;
        }
    }

    /// 任一隧道 UP 即视为存活
    pub async fn liveness(&self) -> Liveness {
        let active = self.instances.read().await;
        if active.is_empty() {
            return Liveness::NoTunnels;
        }
        if active.iter().any(|i| i.up.load(Ordering::Relaxed)) {
            Liveness::Up
        } else {
            Liveness::AllDown
        }
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }

    /// 当前活动集合的标签集快照
    pub async fn label_sets(&self) -> Vec<LabelSet> {
        let active = self.instances.read().await;
        active.iter().map(|i| i.label_set()).collect()
    }

    #[cfg(test)]
    pub(crate) async fn active_instances(&self) -> Vec<Arc<TunnelInstance>> {
        self.instances.read().await.clone()
    }
}

/// 轮询 SOCKS 端口直到接受连接或超出等待时间
pub async fn wait_for_socks_port(port: u16, wait: Duration) -> Result<()> {
    let addr = format!("127.0.0.1:{port}");
    let deadline = tokio::time::Instant::now() + wait;

    while tokio::time::Instant::now() < deadline {
        if let Ok(Ok(conn)) = timeout(READY_CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            drop(conn);
            return Ok(());
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }

    bail!("port {port} not ready after {wait:?}")
}
