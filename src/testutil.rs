//! 测试辅助：进程内 mock SOCKS5 服务器、仅绑定端口的隧道提供者、
//! 注册表序列读取

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::metrics::TunnelMetrics;
use crate::tunnel::{ProviderHandle, TunnelProvider, VlessParams};

/// xray 文档里的示例 UUID
pub const TEST_UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

/// mock SOCKS5 服务器的行为配置
#[derive(Debug, Clone)]
pub struct MockSocksOptions {
    pub http_status: u16,
    pub http_body: String,
    /// 非零时 CONNECT 以该拒绝码应答
    pub socks_reply: u8,
    /// CONNECT 成功应答之后、HTTP 响应之前的延迟
    pub response_delay: Option<Duration>,
    /// 握手成功后直接回放的原始字节，替代 HTTP 响应
    pub raw_response: Option<Vec<u8>>,
}

impl Default for MockSocksOptions {
    fn default() -> Self {
        Self {
            http_status: 200,
            http_body: "OK".to_string(),
            socks_reply: 0,
            response_delay: None,
            raw_response: None,
        }
    }
}

/// 运行中的 mock SOCKS5 服务器，drop 时停止
pub struct MockSocks5 {
    pub port: u16,
    handle: JoinHandle<()>,
}

impl Drop for MockSocks5 {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// 在随机回环端口上启动 mock SOCKS5 服务器
pub async fn start_mock_socks5(options: MockSocksOptions) -> MockSocks5 {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock socks listener");
    let port = listener.local_addr().expect("mock local addr").port();
    let handle = tokio::spawn(accept_loop(listener, options));
    MockSocks5 { port, handle }
}

async fn accept_loop(listener: TcpListener, options: MockSocksOptions) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(handle_connection(stream, options.clone()));
    }
}

async fn handle_connection(mut stream: TcpStream, options: MockSocksOptions) {
    // greeting
    let mut greeting = [0u8; 2];
    if stream.read_exact(&mut greeting).await.is_err() {
        return;
    }
    let mut methods = vec![0u8; usize::from(greeting[1])];
    if stream.read_exact(&mut methods).await.is_err() {
        return;
    }
    if stream.write_all(&[5, 0]).await.is_err() {
        return;
    }

    // CONNECT 请求头与目标地址
    let mut head = [0u8; 4];
    if stream.read_exact(&mut head).await.is_err() {
        return;
    }
    match head[3] {
        1 => {
            let mut addr = [0u8; 6];
            let _ = stream.read_exact(&mut addr).await;
        }
        3 => {
            let mut len = [0u8; 1];
            if stream.read_exact(&mut len).await.is_err() {
                return;
            }
            let mut addr = vec![0u8; usize::from(len[0]) + 2];
            let _ = stream.read_exact(&mut addr).await;
        }
        4 => {
            let mut addr = [0u8; 18];
            let _ = stream.read_exact(&mut addr).await;
        }
        _ => return,
    }

    if options.socks_reply != 0 {
        let _ = stream
            .write_all(&[5, options.socks_reply, 0, 1, 0, 0, 0, 0, 0, 0])
            .await;
        return;
    }
    if stream
        .write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0])
        .await
        .is_err()
    {
        return;
    }

    if let Some(delay) = options.response_delay {
        tokio::time::sleep(delay).await;
    }

    if let Some(raw) = &options.raw_response {
        let _ = stream.write_all(raw).await;
        return;
    }

    // 读完 HTTP 请求头再回应
    let mut request = Vec::new();
    let mut byte = [0u8; 1];
    while !request.ends_with(b"\r\n\r\n") && request.len() < 8192 {
        match stream.read_exact(&mut byte).await {
            Ok(_) => request.push(byte[0]),
            Err(_) => return,
        }
    }

    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        options.http_status,
        status_text(options.http_status),
        options.http_body.len(),
        options.http_body,
    );
    let _ = stream.write_all(response.as_bytes()).await;
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        301 => "Moved Permanently",
        302 => "Found",
        307 => "Temporary Redirect",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// 只在请求的端口上跑一个 mock SOCKS5 监听的隧道提供者
#[derive(Clone)]
pub struct MockProvider {
    options: MockSocksOptions,
    /// 每次 start 请求的端口，按顺序记录
    pub started_ports: Arc<Mutex<Vec<u16>>>,
    /// 已关闭的句柄数
    pub closed: Arc<AtomicUsize>,
}

impl MockProvider {
    pub fn new(options: MockSocksOptions) -> Self {
        Self {
            options,
            started_ports: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl TunnelProvider for MockProvider {
    async fn start(
        &self,
        _params: &VlessParams,
        socks_port: u16,
    ) -> Result<Box<dyn ProviderHandle>> {
        let listener = TcpListener::bind(("127.0.0.1", socks_port)).await?;
        self.started_ports
            .lock()
            .expect("started_ports lock")
            .push(socks_port);
        let task = tokio::spawn(accept_loop(listener, self.options.clone()));
        Ok(Box::new(MockHandle {
            task,
            closed: self.closed.clone(),
        }))
    }
}

struct MockHandle {
    task: JoinHandle<()>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl ProviderHandle for MockHandle {
    async fn close(&mut self) -> Result<()> {
        self.task.abort();
        let _ = (&mut self.task).await;
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// 从注册表中按标签找一条序列的当前值（gauge 或 counter）
///
/// `labels` 是序列必须携带的标签子集。
pub fn series_value(metrics: &TunnelMetrics, family: &str, labels: &[(&str, &str)]) -> Option<f64> {
    for mf in metrics.registry().gather() {
        if mf.get_name() != family {
            continue;
        }
        'metric: for m in mf.get_metric() {
            let pairs = m.get_label();
            for (key, value) in labels {
                if !pairs
                    .iter()
                    .any(|lp| lp.get_name() == *key && lp.get_value() == *value)
                {
                    continue 'metric;
                }
            }
            if m.has_gauge() {
                return Some(m.get_gauge().get_value());
            }
            if m.has_counter() {
                return Some(m.get_counter().get_value());
            }
        }
    }
    None
}
