use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use url::Url;

use crate::metrics::TunnelMetrics;
use crate::socks::Socks5Dialer;
use crate::tunnel::TunnelInstance;

/// 视为隧道可达的 HTTP 状态码。重定向不跟随，但说明链路通了，
/// 所以一并算作 UP。
const UP_STATUSES: [u16; 4] = [200, 301, 302, 307];

/// SOCKS 端口可达性预检的超时
const SOCKS_PRECHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// 成功时最多读取的响应体字节数
const BODY_SAMPLE_LIMIT: usize = 1024;

/// 单次探测的分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Up,
    /// 本地 SOCKS 端口都连不上
    SocksUnreachable,
    /// 拨号、握手或请求阶段出错（含超时）
    RequestError,
    /// 拿到了响应但状态码不在可达集合内
    BadStatus(u16),
}

/// 探测 HTTP 客户端 - 经由 SOCKS5 拨号器发起一次性 GET 请求
pub struct ProbeClient {
    dialer: Socks5Dialer,
    timeout: Duration,
    tls: TlsConnector,
}

impl ProbeClient {
    /// 创建绑定到本地 SOCKS5 端口的探测客户端
    ///
    /// TLS 校验始终开启，最低版本 1.2。系统根证书加载失败只降级
    /// 告警：exporter 照常运行，https 探测会以握手失败形式显现。
    pub fn new(socks_port: u16, check_timeout: Duration) -> Self {
        let mut roots = rustls::RootCertStore::empty();
        match rustls_native_certs::load_native_certs() {
            Ok(certs) => {
                roots.add_parsable_certificates(certs);
            }
            Err(e) => {
                warn!(error = %e, "failed to load system root certificates");
            }
        }

        let tls_config = rustls::ClientConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS12,
            &rustls::version::TLS13,
        ])
        .with_root_certificates(roots)
        .with_no_client_auth();

        Self {
            dialer: Socks5Dialer::new(format!("127.0.0.1:{socks_port}"), check_timeout),
            timeout: check_timeout,
            tls: TlsConnector::from(Arc::new(tls_config)),
        }
    }

    /// 发起一次探测请求
    ///
    /// 整个调用（拨号、握手、请求、读体）都在 check_timeout 内完成，
    /// 否则按超时错误返回。
    pub async fn get(&self, check_url: &str) -> Result<ProbeResponse> {
        timeout(self.timeout, self.request(check_url))
            .await
            .map_err(|_| anyhow!("request timed out after {:?}", self.timeout))?
    }

    async fn request(&self, check_url: &str) -> Result<ProbeResponse> {
        let target = ProbeTarget::parse(check_url)?;

        let stream = self.dialer.dial(&target.authority).await?;

        if target.tls {
            let server_name = ServerName::try_from(target.host.clone())
                .map_err(|_| anyhow!("invalid TLS server name: {}", target.host))?;
            let stream = self
                .tls
                .connect(server_name, stream)
                .await
                .context("TLS handshake failed")?;
            exchange(stream, &target).await
        } else {
            exchange(stream, &target).await
        }
    }
}

/// 探测响应，只携带分类所需的状态码
#[derive(Debug)]
pub struct ProbeResponse {
    pub status: u16,
}

struct ProbeTarget {
    /// 证书校验与 SNI 用的主机名
    host: String,
    /// 交给 SOCKS5 拨号器的 host:port
    authority: String,
    /// Host 头，仅在非默认端口时带端口
    host_header: String,
    path_and_query: String,
    tls: bool,
}

impl ProbeTarget {
    fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).with_context(|| format!("invalid check URL: {raw}"))?;

        let tls = match url.scheme() {
            "http" => false,
            "https" => true,
            other => bail!("unsupported check URL scheme: {other}"),
        };

        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("check URL has no host: {raw}"))?
            .to_string();

        let default_port = if tls { 443 } else { 80 };
        let port = url.port().unwrap_or(default_port);
        let host_header = if port == default_port {
            host.clone()
        } else {
            format!("{host}:{port}")
        };

        let mut path_and_query = url.path().to_string();
        if let Some(query) = url.query() {
            path_and_query = format!("{path_and_query}?{query}");
        }

        Ok(Self {
            authority: format!("{host}:{port}"),
            host,
            host_header,
            path_and_query,
            tls,
        })
    }
}

/// 单次 HTTP/1.1 请求-响应交换
async fn exchange<S>(stream: S, target: &ProbeTarget) -> Result<ProbeResponse>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .context("HTTP handshake failed")?;
    let conn = tokio::spawn(conn);

    let request = Request::builder()
        .uri(target.path_and_query.as_str())
        .header(hyper::header::HOST, target.host_header.as_str())
        .header(hyper::header::CONNECTION, "close")
        .body(Empty::<Bytes>::new())?;

    let response = sender
        .send_request(request)
        .await
        .context("HTTP request failed")?;
    let status = response.status().as_u16();

    // 可达时顺带读一小段响应体，确认读路径也是通的
    if UP_STATUSES.contains(&status) {
        sample_body(response.into_body()).await;
    }

    conn.abort();
    Ok(ProbeResponse { status })
}

/// 最多读 1 KiB 响应体，错误忽略
async fn sample_body(mut body: Incoming) {
    let mut read = 0usize;
    while read < BODY_SAMPLE_LIMIT {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    read += data.len();
                }
            }
            _ => break,
        }
    }
}

/// 单次探测：先验证 SOCKS 入口可达，再经隧道发起 GET，并更新指标
pub async fn check(instance: &TunnelInstance, metrics: &TunnelMetrics) -> ProbeOutcome {
    let start = Instant::now();
    let labels = instance.label_set();
    let values = labels.values();

    let socks_addr = format!("127.0.0.1:{}", instance.socks_port);
    match timeout(SOCKS_PRECHECK_TIMEOUT, TcpStream::connect(&socks_addr)).await {
        Ok(Ok(conn)) => drop(conn),
        Ok(Err(e)) => {
            warn!(name = %instance.name, error = %e, "tunnel DOWN: socks unreachable");
            record_failure(instance, metrics, &labels);
            return ProbeOutcome::SocksUnreachable;
        }
        Err(_) => {
            warn!(name = %instance.name, "tunnel DOWN: socks connect timed out");
            record_failure(instance, metrics, &labels);
            return ProbeOutcome::SocksUnreachable;
        }
    }

    let response = match instance.client.get(&instance.check_url).await {
        Ok(response) => response,
        Err(e) => {
            warn!(name = %instance.name, error = %e, "tunnel DOWN: request error");
            record_failure(instance, metrics, &labels);
            return ProbeOutcome::RequestError;
        }
    };

    metrics
        .tunnel_http_status
        .with_label_values(&values)
        .set(f64::from(response.status));

    if !UP_STATUSES.contains(&response.status) {
        warn!(name = %instance.name, status = response.status, "tunnel DOWN: unexpected status");
        record_failure(instance, metrics, &labels);
        return ProbeOutcome::BadStatus(response.status);
    }

    let latency = start.elapsed();
    info!(name = %instance.name, latency_ms = latency.as_millis() as u64, "tunnel UP");

    metrics.tunnel_up.with_label_values(&values).set(1.0);
    metrics
        .tunnel_latency
        .with_label_values(&values)
        .set(latency.as_secs_f64());
    let now_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    metrics
        .tunnel_last_success
        .with_label_values(&values)
        .set(now_unix);
    metrics
        .tunnel_check_total
        .with_label_values(&labels.check_values("success"))
        .inc();
    instance.up.store(true, Ordering::Relaxed);

    ProbeOutcome::Up
}

fn record_failure(
    instance: &TunnelInstance,
    metrics: &TunnelMetrics,
    labels: &crate::metrics::LabelSet,
) {
    metrics
        .tunnel_up
        .with_label_values(&labels.values())
        .set(0.0);
    metrics
        .tunnel_check_total
        .with_label_values(&labels.check_values("failure"))
        .inc();
    instance.up.store(false, Ordering::Relaxed);
}

/// 按固定周期运行探测循环，直到实例被取消
///
/// 第一次探测立即执行，抓取端不用等一个完整周期才看到数据。
/// 同一实例的探测串行执行，不会重叠。
pub async fn run(instance: Arc<TunnelInstance>, metrics: Arc<TunnelMetrics>) {
    let mut ticker = interval(instance.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = instance.cancel.cancelled() => {
                debug!(name = %instance.name, "probe loop stopped");
                return;
            }
            _ = ticker.tick() => {
                check(&instance, &metrics).await;
            }
        }
    }
}
