//! HTTP proxy traversal
//!
//! Opens a raw TCP tunnel through an HTTP proxy with `CONNECT host:port`.
//! Only `HTTP/1.1 200` is accepted as success.

use crate::config::ProxyConfig;
use crate::relay::RelayError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Upper bound on the proxy response head
const MAX_RESPONSE_HEAD: usize = 8192;

/// Render the CONNECT request for `host:port`
pub fn connect_request(host: &str, port: u16) -> String {
    format!(
        "CONNECT {}:{} HTTP/1.1\r\nHost: {}\r\n\r\n",
        host, port, host
    )
}

/// Run the CONNECT handshake on an already open proxy stream.
///
/// Returns any bytes the proxy sent after its response head; they belong
/// to the tunneled stream.
pub async fn proxy_handshake<S>(stream: &mut S, host: &str, port: u16) -> Result<Vec<u8>, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(connect_request(host, port).as_bytes())
        .await?;

    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(RelayError::Proxy(
                "proxy closed the connection before answering CONNECT".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        let parsed = {
            let mut headers = [httparse::EMPTY_HEADER; 64];
            let mut response = httparse::Response::new(&mut headers);
            match response.parse(&buf) {
                Ok(httparse::Status::Complete(head_len)) => {
                    Some((head_len, response.version, response.code))
                }
                Ok(httparse::Status::Partial) => None,
                Err(e) => {
                    return Err(RelayError::Proxy(format!(
                        "malformed proxy response: {}",
                        e
                    )))
                }
            }
        };

        match parsed {
            Some((head_len, Some(1), Some(200))) => {
                debug!("Proxy tunnel to {}:{} established", host, port);
                return Ok(buf.split_off(head_len));
            }
            Some(_) => {
                let status_line = String::from_utf8_lossy(&buf)
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .to_string();
                return Err(RelayError::Proxy(format!(
                    "proxy refused CONNECT to {}:{}: {}",
                    host, port, status_line
                )));
            }
            None if buf.len() > MAX_RESPONSE_HEAD => {
                return Err(RelayError::Proxy(
                    "proxy response head too large".to_string(),
                ));
            }
            None => {}
        }
    }
}

/// Dial the proxy and open a tunnel to `host:port` through it
pub async fn connect_via_proxy(
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
) -> Result<(TcpStream, Vec<u8>), RelayError> {
    let address = proxy.address();
    let mut stream = TcpStream::connect(&address)
        .await
        .map_err(|e| RelayError::Connect {
            target: address.clone(),
            source: e,
        })?;

    let leftover = proxy_handshake(&mut stream, host, port).await?;
    Ok((stream, leftover))
}
