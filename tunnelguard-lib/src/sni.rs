//! SNI-inspecting SOCKS5 proxy (component E): disambiguates domains that
//! share an IP address (CDN collisions) for applications that route through
//! it explicitly.
//!
//! The `parse_client_hello_sni` helper is a standalone utility exercised by
//! tests; the per-connection hot path classifies by the SOCKS5 target
//! address itself, not by inspecting the TLS record (see the crate-level
//! design notes on why).

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;

use crate::domain::Matcher;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

const SOCKS_VERSION: u8 = 5;
const CMD_CONNECT: u8 = 1;
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;
const REPLY_SUCCESS: u8 = 0x00;
const REPLY_FAILURE: u8 = 0x01;

#[derive(Debug, Error)]
pub enum Error {
    #[error("bind failed on {addr}: {source}")]
    Bind { addr: SocketAddr, source: std::io::Error },
}

#[derive(Clone, Debug)]
enum Target {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Target {
    fn host(&self) -> String {
        match self {
            Target::Ip(addr) => addr.ip().to_string(),
            Target::Domain(name, _) => name.clone(),
        }
    }

    fn port(&self) -> u16 {
        match self {
            Target::Ip(addr) => addr.port(),
            Target::Domain(_, port) => *port,
        }
    }
}

pub struct SniProxy {
    matcher: Matcher,
    vpn_socks: Option<SocketAddr>,
    listen_addr: SocketAddr,
    connections: Mutex<Vec<AbortHandle>>,
}

impl SniProxy {
    pub fn new(matcher: Matcher, listen_addr: SocketAddr, vpn_socks: Option<SocketAddr>) -> Arc<Self> {
        Arc::new(SniProxy { matcher, vpn_socks, listen_addr, connections: Mutex::new(Vec::new()) })
    }

    pub async fn run(self: &Arc<Self>) -> Result<(), Error> {
        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|source| Error::Bind { addr: self.listen_addr, source })?;
        tracing::info!(addr = %self.listen_addr, "sni proxy listening");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let this = self.clone();
                    let task = tokio::spawn(async move {
                        if let Err(error) = this.serve(stream).await {
                            tracing::debug!(%peer, %error, "sni proxy connection ended with error");
                        }
                    });
                    self.connections.lock().expect("connections lock poisoned").push(task.abort_handle());
                }
                Err(error) => tracing::warn!(%error, "sni proxy accept error"),
            }
        }
    }

    /// Force-closes every active connection; used on shutdown.
    pub fn stop(&self) {
        for handle in self.connections.lock().expect("connections lock poisoned").drain(..) {
            handle.abort();
        }
    }

    async fn serve(&self, mut client: TcpStream) -> std::io::Result<()> {
        match self.handshake(&mut client).await {
            Ok(target) => self.connect_and_relay(client, target).await,
            Err(error) => {
                let _ = client.write_all(&failure_reply()).await;
                Err(error)
            }
        }
    }

    async fn handshake(&self, client: &mut TcpStream) -> std::io::Result<Target> {
        tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            let mut header = [0u8; 2];
            client.read_exact(&mut header).await?;
            if header[0] != SOCKS_VERSION {
                return Err(invalid_data("unsupported socks version in greeting"));
            }
            let nmethods = header[1] as usize;
            let mut methods = vec![0u8; nmethods];
            client.read_exact(&mut methods).await?;

            client.write_all(&[SOCKS_VERSION, 0x00]).await?;

            let mut request_header = [0u8; 4];
            client.read_exact(&mut request_header).await?;
            let [ver, cmd, _rsv, atyp] = request_header;
            if ver != SOCKS_VERSION {
                return Err(invalid_data("unsupported socks version in request"));
            }
            if cmd != CMD_CONNECT {
                client.write_all(&failure_reply()).await?;
                return Err(invalid_data("only the connect command is supported"));
            }

            let target = match atyp {
                ATYP_IPV4 => {
                    let mut addr = [0u8; 4];
                    client.read_exact(&mut addr).await?;
                    let port = read_port(client).await?;
                    Target::Ip(SocketAddr::from((Ipv4Addr::from(addr), port)))
                }
                ATYP_DOMAIN => {
                    let mut len = [0u8; 1];
                    client.read_exact(&mut len).await?;
                    let mut name = vec![0u8; len[0] as usize];
                    client.read_exact(&mut name).await?;
                    let name = String::from_utf8(name).map_err(|_| invalid_data("domain is not valid ascii"))?;
                    let port = read_port(client).await?;
                    Target::Domain(name, port)
                }
                ATYP_IPV6 => {
                    let mut addr = [0u8; 16];
                    client.read_exact(&mut addr).await?;
                    let port = read_port(client).await?;
                    Target::Ip(SocketAddr::from((Ipv6Addr::from(addr), port)))
                }
                _ => return Err(invalid_data("unsupported address type")),
            };

            Ok(target)
        })
        .await
        .map_err(|_| invalid_data("socks handshake timed out"))?
    }

    async fn connect_and_relay(&self, mut client: TcpStream, target: Target) -> std::io::Result<()> {
        let outcome = self.matcher.classify(&target.host());

        let dial = async {
            match (outcome.tunnel, self.vpn_socks) {
                (true, Some(proxy)) => socks5_connect_via(proxy, &target.host(), target.port()).await,
                _ => TcpStream::connect((target.host().as_str(), target.port())).await,
            }
        };

        let mut upstream = match tokio::time::timeout(DIAL_TIMEOUT, dial).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => {
                client.write_all(&failure_reply()).await?;
                return Err(error);
            }
            Err(_) => {
                client.write_all(&failure_reply()).await?;
                return Err(invalid_data("dial timed out"));
            }
        };

        client.write_all(&success_reply()).await?;
        tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
        Ok(())
    }
}

async fn read_port(stream: &mut TcpStream) -> std::io::Result<u16> {
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(u16::from_be_bytes(port))
}

fn success_reply() -> [u8; 10] {
    [SOCKS_VERSION, REPLY_SUCCESS, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

fn failure_reply() -> [u8; 10] {
    [SOCKS_VERSION, REPLY_FAILURE, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

fn invalid_data(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}

async fn socks5_connect_via(proxy: SocketAddr, host: &str, port: u16) -> std::io::Result<TcpStream> {
    let mut stream = TcpStream::connect(proxy).await?;
    stream.write_all(&[SOCKS_VERSION, 1, 0x00]).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply != [SOCKS_VERSION, 0x00] {
        return Err(invalid_data("upstream socks proxy rejected no-auth"));
    }

    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[1] != REPLY_SUCCESS {
        return Err(invalid_data("upstream socks proxy refused connect"));
    }
    let skip = match header[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        _ => return Err(invalid_data("upstream socks proxy returned unknown address type")),
    };
    let mut rest = vec![0u8; skip + 2];
    stream.read_exact(&mut rest).await?;

    Ok(stream)
}

/// Decodes the leading bytes of a TCP stream as a TLS ClientHello and
/// returns the `server_name` extension's first hostname, if present. Does
/// not reassemble across TLS records.
pub fn parse_client_hello_sni(bytes: &[u8]) -> Option<String> {
    let mut cursor = Cursor::new(bytes);

    if cursor.read_u8()? != 0x16 {
        return None;
    }
    cursor.skip(2)?; // legacy record version
    let record_len = cursor.read_u16()? as usize;
    if cursor.remaining() < record_len {
        return None;
    }

    if cursor.read_u8()? != 0x01 {
        return None;
    }
    cursor.skip(3)?; // handshake length (u24)

    cursor.skip(2)?; // client_version
    cursor.skip(32)?; // random

    let session_id_len = cursor.read_u8()? as usize;
    cursor.skip(session_id_len)?;

    let cipher_suites_len = cursor.read_u16()? as usize;
    cursor.skip(cipher_suites_len)?;

    let compression_len = cursor.read_u8()? as usize;
    cursor.skip(compression_len)?;

    if cursor.remaining() == 0 {
        return None;
    }
    let extensions_len = cursor.read_u16()? as usize;
    let extensions_end = cursor.pos() + extensions_len;

    while cursor.pos() < extensions_end {
        let ext_type = cursor.read_u16()?;
        let ext_len = cursor.read_u16()? as usize;
        if ext_type != 0x0000 {
            cursor.skip(ext_len)?;
            continue;
        }

        let server_name_list_len = cursor.read_u16()? as usize;
        let list_end = cursor.pos() + server_name_list_len;
        while cursor.pos() < list_end {
            let name_type = cursor.read_u8()?;
            let name_len = cursor.read_u16()? as usize;
            if name_type == 0x00 {
                let bytes = cursor.take(name_len)?;
                return String::from_utf8(bytes.to_vec()).ok();
            }
            cursor.skip(name_len)?;
        }
        return None;
    }

    None
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Cursor { bytes, pos: 0 }
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn read_u8(&mut self) -> Option<u8> {
        let byte = *self.bytes.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    fn read_u16(&mut self) -> Option<u16> {
        let bytes = self.bytes.get(self.pos..self.pos + 2)?;
        self.pos += 2;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        if self.remaining() < n {
            return None;
        }
        self.pos += n;
        Some(())
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let bytes = self.bytes.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A fake VPN-side SOCKS5 proxy: plays the upstream role
    /// `socks5_connect_via` dials against, then echoes whatever it receives
    /// so the returned stream's proven usable end to end.
    async fn fake_upstream_socks5(listener: TcpListener, expected_host: &'static str, expected_port: u16) {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut greeting = [0u8; 3];
        stream.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [SOCKS_VERSION, 1, 0x00]);
        stream.write_all(&[SOCKS_VERSION, REPLY_SUCCESS]).await.unwrap();

        let mut header = [0u8; 5];
        stream.read_exact(&mut header).await.unwrap();
        assert_eq!(&header[..4], [SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN]);
        let mut name = vec![0u8; header[4] as usize];
        stream.read_exact(&mut name).await.unwrap();
        assert_eq!(name, expected_host.as_bytes());
        let mut port = [0u8; 2];
        stream.read_exact(&mut port).await.unwrap();
        assert_eq!(u16::from_be_bytes(port), expected_port);

        stream.write_all(&success_reply()).await.unwrap();

        let mut echo = [0u8; 5];
        stream.read_exact(&mut echo).await.unwrap();
        stream.write_all(&echo).await.unwrap();
    }

    #[tokio::test]
    async fn socks5_connect_via_completes_the_handshake_and_returns_a_usable_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(fake_upstream_socks5(listener, "tunnel.test", 443));

        let mut upstream = socks5_connect_via(addr, "tunnel.test", 443).await.unwrap();
        upstream.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        upstream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn socks5_connect_via_rejects_a_non_success_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[SOCKS_VERSION, REPLY_SUCCESS]).await.unwrap();

            let mut header = [0u8; 5];
            stream.read_exact(&mut header).await.unwrap();
            let mut name = vec![0u8; header[4] as usize];
            stream.read_exact(&mut name).await.unwrap();
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await.unwrap();

            stream.write_all(&failure_reply()).await.unwrap();
        });

        let result = socks5_connect_via(addr, "blocked.test", 443).await;
        assert!(result.is_err());
        server.await.unwrap();
    }

    fn u16be(n: u16) -> [u8; 2] {
        n.to_be_bytes()
    }

    /// Builds a minimal well-formed ClientHello record carrying a single
    /// `server_name` extension for `hostname`.
    fn client_hello_with_sni(hostname: &str) -> Vec<u8> {
        let mut server_name_entry = Vec::new();
        server_name_entry.push(0x00); // name_type = host_name
        server_name_entry.extend_from_slice(&u16be(hostname.len() as u16));
        server_name_entry.extend_from_slice(hostname.as_bytes());

        let mut server_name_list = Vec::new();
        server_name_list.extend_from_slice(&u16be(server_name_entry.len() as u16));
        server_name_list.extend_from_slice(&server_name_entry);

        let mut sni_extension = Vec::new();
        sni_extension.extend_from_slice(&u16be(0x0000)); // extension type: server_name
        sni_extension.extend_from_slice(&u16be(server_name_list.len() as u16));
        sni_extension.extend_from_slice(&server_name_list);

        let mut extensions = Vec::new();
        extensions.extend_from_slice(&u16be(sni_extension.len() as u16));
        extensions.extend_from_slice(&sni_extension);

        let mut handshake_body = Vec::new();
        handshake_body.extend_from_slice(&[0x03, 0x03]); // client_version
        handshake_body.extend_from_slice(&[0u8; 32]); // random
        handshake_body.push(0); // session id len
        handshake_body.extend_from_slice(&u16be(2)); // cipher suites len
        handshake_body.extend_from_slice(&[0x00, 0x2f]);
        handshake_body.push(1); // compression methods len
        handshake_body.push(0x00);
        handshake_body.extend_from_slice(&extensions);

        let mut handshake = Vec::new();
        handshake.push(0x01); // handshake type: client_hello
        let len = handshake_body.len() as u32;
        handshake.extend_from_slice(&len.to_be_bytes()[1..]); // u24
        handshake.extend_from_slice(&handshake_body);

        let mut record = Vec::new();
        record.push(0x16); // record type: handshake
        record.extend_from_slice(&[0x03, 0x01]); // legacy record version
        record.extend_from_slice(&u16be(handshake.len() as u16));
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn parses_sni_from_a_well_formed_client_hello() {
        let record = client_hello_with_sni("example.com");
        assert_eq!(parse_client_hello_sni(&record), Some("example.com".to_string()));
    }

    #[test]
    fn returns_none_for_a_non_handshake_record() {
        let mut record = client_hello_with_sni("example.com");
        record[0] = 0x17; // application_data, not handshake
        assert_eq!(parse_client_hello_sni(&record), None);
    }

    #[test]
    fn returns_none_for_truncated_input() {
        let record = client_hello_with_sni("example.com");
        assert_eq!(parse_client_hello_sni(&record[..10]), None);
    }

    #[test]
    fn returns_none_when_no_server_name_extension_present() {
        // a handshake with an empty extensions block
        let mut handshake_body = Vec::new();
        handshake_body.extend_from_slice(&[0x03, 0x03]);
        handshake_body.extend_from_slice(&[0u8; 32]);
        handshake_body.push(0);
        handshake_body.extend_from_slice(&u16be(2));
        handshake_body.extend_from_slice(&[0x00, 0x2f]);
        handshake_body.push(1);
        handshake_body.push(0x00);
        handshake_body.extend_from_slice(&u16be(0)); // zero-length extensions

        let mut handshake = Vec::new();
        handshake.push(0x01);
        let len = handshake_body.len() as u32;
        handshake.extend_from_slice(&len.to_be_bytes()[1..]);
        handshake.extend_from_slice(&handshake_body);

        let mut record = Vec::new();
        record.push(0x16);
        record.extend_from_slice(&[0x03, 0x01]);
        record.extend_from_slice(&u16be(handshake.len() as u16));
        record.extend_from_slice(&handshake);

        assert_eq!(parse_client_hello_sni(&record), None);
    }
}
