use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 拨号错误
#[derive(Debug, Error)]
pub enum SocksError {
    #[error("failed to connect to proxy: {0}")]
    ProxyConnect(#[source] io::Error),
    #[error("timed out connecting to proxy")]
    ProxyTimeout,
    #[error("SOCKS5 handshake failed")]
    Handshake,
    #[error("SOCKS5 connect failed: reply code {0}")]
    Connect(u8),
    #[error("invalid target address: {0}")]
    Target(String),
    #[error("unknown address type in SOCKS5 reply: {0}")]
    Protocol(u8),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// SOCKS5 拨号器 - 通过本地 SOCKS5 代理建立到目标地址的 TCP 连接
///
/// 目标始终按域名形式（ATYP=3）发送，DNS 解析留给隧道的远端完成。
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    proxy_addr: String,
    timeout: Duration,
}

impl Socks5Dialer {
    pub fn new(proxy_addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            proxy_addr: proxy_addr.into(),
            timeout,
        }
    }

    /// 经由代理 CONNECT 到 `host:port` 形式的目标地址
    ///
    /// `timeout` 只约束到代理的 TCP 连接；握手阶段由调用方的整体超时约束。
    /// 任何错误路径都会随流的 drop 关闭底层连接。
    pub async fn dial(&self, target: &str) -> Result<TcpStream, SocksError> {
        let (host, port) = split_host_port(target)?;

        let mut stream = timeout(self.timeout, TcpStream::connect(&self.proxy_addr))
            .await
            .map_err(|_| SocksError::ProxyTimeout)?
            .map_err(SocksError::ProxyConnect)?;

        // greeting: [VER, NMETHODS, METHODS...]
        stream
            .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
            .await?;

        let mut method = [0u8; 2];
        stream.read_exact(&mut method).await?;
        if method != [SOCKS_VERSION, METHOD_NO_AUTH] {
            return Err(SocksError::Handshake);
        }

        // CONNECT 请求: [VER, CMD, RSV, ATYP, LEN, HOST..., PORT_HI, PORT_LO]
        let mut request = Vec::with_capacity(7 + host.len());
        request.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN]);
        request.push(host.len() as u8);
        request.extend_from_slice(host.as_bytes());
        request.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&request).await?;

        // reply: [VER, REP, RSV, ATYP]
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await?;
        if reply[1] != 0 {
            return Err(SocksError::Connect(reply[1]));
        }

        // 丢弃绑定地址与端口
        match reply[3] {
            ATYP_IPV4 => {
                let mut bound = [0u8; 6];
                stream.read_exact(&mut bound).await?;
            }
            ATYP_IPV6 => {
                let mut bound = [0u8; 18];
                stream.read_exact(&mut bound).await?;
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut bound = vec![0u8; usize::from(len[0]) + 2];
                stream.read_exact(&mut bound).await?;
            }
            other => return Err(SocksError::Protocol(other)),
        }

        Ok(stream)
    }
}

fn split_host_port(target: &str) -> Result<(&str, u16), SocksError> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| SocksError::Target(target.to_string()))?;
    if host.is_empty() || host.len() > 255 {
        return Err(SocksError::Target(target.to_string()));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| SocksError::Target(target.to_string()))?;
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn local_listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    fn dialer(addr: &str) -> Socks5Dialer {
        Socks5Dialer::new(addr, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn dial_sends_domain_connect_and_returns_stream() {
        let (listener, addr) = local_listener().await;

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();

            let mut greeting = [0u8; 3];
            conn.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 1, 0]);
            conn.write_all(&[5, 0]).await.unwrap();

            let mut head = [0u8; 4];
            conn.read_exact(&mut head).await.unwrap();
            assert_eq!(head, [5, 1, 0, 3]);

            let mut len = [0u8; 1];
            conn.read_exact(&mut len).await.unwrap();
            let mut host = vec![0u8; usize::from(len[0])];
            conn.read_exact(&mut host).await.unwrap();
            assert_eq!(host, b"example.com");

            let mut port = [0u8; 2];
            conn.read_exact(&mut port).await.unwrap();
            assert_eq!(u16::from_be_bytes(port), 8080);

            conn.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
            conn.write_all(b"hello").await.unwrap();
        });

        let mut stream = dialer(&addr).dial("example.com:8080").await.unwrap();
        let mut payload = [0u8; 5];
        stream.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"hello");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn dial_rejects_bad_greeting_reply() {
        let (listener, addr) = local_listener().await;

        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            conn.read_exact(&mut greeting).await.unwrap();
            // 代理要求认证，握手应当失败
            conn.write_all(&[5, 0xFF]).await.unwrap();
        });

        let err = dialer(&addr).dial("example.com:80").await.unwrap_err();
        assert!(matches!(err, SocksError::Handshake));
    }

    #[tokio::test]
    async fn dial_surfaces_connect_reply_code() {
        let (listener, addr) = local_listener().await;

        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            conn.read_exact(&mut greeting).await.unwrap();
            conn.write_all(&[5, 0]).await.unwrap();

            let mut request = vec![0u8; 4 + 1 + "example.com".len() + 2];
            conn.read_exact(&mut request).await.unwrap();
            // host unreachable
            conn.write_all(&[5, 4, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });

        let err = dialer(&addr).dial("example.com:80").await.unwrap_err();
        assert!(matches!(err, SocksError::Connect(4)));
    }

    #[tokio::test]
    async fn dial_drains_domain_form_bound_address() {
        let (listener, addr) = local_listener().await;

        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            conn.read_exact(&mut greeting).await.unwrap();
            conn.write_all(&[5, 0]).await.unwrap();

            let mut request = vec![0u8; 4 + 1 + "example.com".len() + 2];
            conn.read_exact(&mut request).await.unwrap();

            let mut reply = vec![5, 0, 0, 3, 7];
            reply.extend_from_slice(b"a.b.com");
            reply.extend_from_slice(&80u16.to_be_bytes());
            conn.write_all(&reply).await.unwrap();
            conn.write_all(b"ok").await.unwrap();
        });

        let mut stream = dialer(&addr).dial("example.com:80").await.unwrap();
        let mut payload = [0u8; 2];
        stream.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"ok");
    }

    #[tokio::test]
    async fn dial_drains_ipv6_bound_address() {
        let (listener, addr) = local_listener().await;

        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            conn.read_exact(&mut greeting).await.unwrap();
            conn.write_all(&[5, 0]).await.unwrap();

            let mut request = vec![0u8; 4 + 1 + "example.com".len() + 2];
            conn.read_exact(&mut request).await.unwrap();

            let mut reply = vec![5, 0, 0, 4];
            reply.extend_from_slice(&[0u8; 18]);
            conn.write_all(&reply).await.unwrap();
            conn.write_all(b"ok").await.unwrap();
        });

        let mut stream = dialer(&addr).dial("example.com:80").await.unwrap();
        let mut payload = [0u8; 2];
        stream.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"ok");
    }

    #[tokio::test]
    async fn dial_rejects_unknown_address_type() {
        let (listener, addr) = local_listener().await;

        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            conn.read_exact(&mut greeting).await.unwrap();
            conn.write_all(&[5, 0]).await.unwrap();

            let mut request = vec![0u8; 4 + 1 + "example.com".len() + 2];
            conn.read_exact(&mut request).await.unwrap();
            conn.write_all(&[5, 0, 0, 9]).await.unwrap();
        });

        let err = dialer(&addr).dial("example.com:80").await.unwrap_err();
        assert!(matches!(err, SocksError::Protocol(9)));
    }

    #[tokio::test]
    async fn dial_fails_when_proxy_is_unreachable() {
        // 先绑定再释放，借此拿到一个大概率无人监听的端口
        let (listener, addr) = local_listener().await;
        drop(listener);

        let err = dialer(&addr).dial("example.com:80").await.unwrap_err();
        assert!(matches!(err, SocksError::ProxyConnect(_)));
    }

    #[tokio::test]
    async fn dial_rejects_malformed_target() {
        let d = Socks5Dialer::new("127.0.0.1:1", Duration::from_millis(100));
        assert!(matches!(
            d.dial("no-port").await.unwrap_err(),
            SocksError::Target(_)
        ));
        assert!(matches!(
            d.dial("host:99999").await.unwrap_err(),
            SocksError::Target(_)
        ));
    }
}
