//! DNS proxy: a UDP DNS server that classifies each query, forwards it
//! byte-for-byte to the matching upstream, and feeds observed addresses to
//! the conflict detector and route manager (component C).

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::{RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify, mpsc, oneshot};

use crate::conflict::ConflictDetector;
use crate::domain::Matcher;
use crate::route::RouteManager;

pub const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MISSING_TTL: u32 = 3600;
const MAX_DATAGRAM: usize = 4096;

#[derive(Debug, Error)]
pub enum Error {
    #[error("bind failed on {addr}: {source}")]
    Bind { addr: SocketAddr, source: std::io::Error },
    #[error("dns proxy already running")]
    AlreadyRunning,
    #[error("dns proxy is not running")]
    NotRunning,
    #[error("failed to decode dns message: {0}")]
    Decode(#[from] hickory_proto::ProtoError),
    #[error("upstream io error: {0}")]
    Upstream(std::io::Error),
}

#[derive(Clone, Debug)]
pub struct DnsProxyConfig {
    pub listen_addr: SocketAddr,
    pub tunnel_upstream: SocketAddr,
    pub direct_upstream: SocketAddr,
    pub route_ttl: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Stopped,
    Starting,
    Running,
}

/// One connected UDP socket per upstream, shared by every in-flight query
/// to that upstream and demultiplexed by DNS transaction id. Avoids
/// exhausting ephemeral ports under load.
struct UpstreamActor {
    sender: mpsc::UnboundedSender<OutboundQuery>,
}

struct OutboundQuery {
    id: u16,
    bytes: Vec<u8>,
    reply: oneshot::Sender<Vec<u8>>,
}

impl UpstreamActor {
    async fn spawn(upstream: SocketAddr) -> Result<Self, Error> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await.map_err(Error::Upstream)?;
        socket.connect(upstream).await.map_err(Error::Upstream)?;
        let (tx, mut rx) = mpsc::unbounded_channel::<OutboundQuery>();

        tokio::spawn(async move {
            let mut pending: HashMap<u16, oneshot::Sender<Vec<u8>>> = HashMap::new();
            let mut buf = [0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    outbound = rx.recv() => {
                        match outbound {
                            Some(outbound) => {
                                pending.insert(outbound.id, outbound.reply);
                                if let Err(error) = socket.send(&outbound.bytes).await {
                                    tracing::warn!(%error, %upstream, "failed sending to upstream");
                                    pending.remove(&outbound.id);
                                }
                            }
                            None => break,
                        }
                    }
                    received = socket.recv(&mut buf) => {
                        match received {
                            Ok(n) if n >= 2 => {
                                let id = u16::from_be_bytes([buf[0], buf[1]]);
                                if let Some(reply) = pending.remove(&id) {
                                    let _ = reply.send(buf[..n].to_vec());
                                }
                            }
                            Ok(_) => {}
                            Err(error) => tracing::warn!(%error, %upstream, "upstream recv error"),
                        }
                    }
                }
            }
        });

        Ok(UpstreamActor { sender: tx })
    }

    async fn query(&self, id: u16, bytes: Vec<u8>) -> Result<Vec<u8>, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(OutboundQuery { id, bytes, reply: reply_tx })
            .map_err(|_| Error::Upstream(std::io::Error::other("upstream actor gone")))?;
        tokio::time::timeout(QUERY_TIMEOUT, reply_rx)
            .await
            .map_err(|_| Error::Upstream(std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream timeout")))?
            .map_err(|_| Error::Upstream(std::io::Error::other("upstream actor dropped reply")))
    }
}

pub struct DnsProxy {
    matcher: Matcher,
    conflicts: Arc<ConflictDetector>,
    routes: Arc<RouteManager>,
    config: DnsProxyConfig,
    state: Mutex<State>,
    shutdown: Notify,
    upstreams: Mutex<HashMap<SocketAddr, Arc<UpstreamActor>>>,
}

impl DnsProxy {
    pub fn new(matcher: Matcher, conflicts: Arc<ConflictDetector>, routes: Arc<RouteManager>, config: DnsProxyConfig) -> Arc<Self> {
        Arc::new(DnsProxy {
            matcher,
            conflicts,
            routes,
            config,
            state: Mutex::new(State::Stopped),
            shutdown: Notify::new(),
            upstreams: Mutex::new(HashMap::new()),
        })
    }

    /// Binds the listen socket and serves queries until `stop()` is called.
    pub async fn run(self: &Arc<Self>) -> Result<(), Error> {
        {
            let mut state = self.state.lock().await;
            if *state != State::Stopped {
                return Err(Error::AlreadyRunning);
            }
            *state = State::Starting;
        }

        let socket = Arc::new(
            UdpSocket::bind(self.config.listen_addr)
                .await
                .map_err(|source| Error::Bind { addr: self.config.listen_addr, source })?,
        );
        *self.state.lock().await = State::Running;
        tracing::info!(addr = %self.config.listen_addr, "dns proxy listening");

        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((n, client)) => {
                            let datagram = buf[..n].to_vec();
                            let this = self.clone();
                            let socket = socket.clone();
                            tokio::spawn(async move {
                                if let Some(response) = this.handle_query(&datagram).await {
                                    if let Err(error) = socket.send_to(&response, client).await {
                                        tracing::warn!(%error, %client, "failed sending reply to client");
                                    }
                                }
                            });
                        }
                        Err(error) => tracing::warn!(%error, "dns proxy recv error"),
                    }
                }
            }
        }

        *self.state.lock().await = State::Stopped;
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    #[tracing::instrument(skip(self, datagram), fields(query_id, qname, qtype, tunnel))]
    async fn handle_query(&self, datagram: &[u8]) -> Option<Vec<u8>> {
        let request = match Message::from_bytes(datagram) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(%error, "dropping malformed dns datagram");
                return None;
            }
        };

        let question = request.queries().first()?;
        let qname = question.name().to_string();
        let qname = qname.trim_end_matches('.');
        let qtype = question.query_type();

        let outcome = self.matcher.classify(qname);
        tracing::Span::current().record("query_id", request.id()).record("qname", qname).record("qtype", qtype.to_string()).record("tunnel", outcome.tunnel);
        tracing::info!("query");

        let upstream = if outcome.tunnel { self.config.tunnel_upstream } else { self.config.direct_upstream };

        let response_bytes = match self.forward(request.id(), datagram, upstream).await {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::warn!(%error, "upstream error, synthesizing servfail");
                return Self::synthesize_servfail(&request).ok();
            }
        };

        if let Ok(response) = Message::from_bytes(&response_bytes) {
            let (ips, min_ttl) = Self::extract_a_records(&response);
            tracing::info!(answers = ips.len(), ttl = min_ttl, "response");
            if !ips.is_empty() {
                let conflict = self.conflicts.record_batch(qname, &ips, outcome.tunnel);
                if outcome.tunnel && conflict.is_none() {
                    if let Err(error) = self.routes.inject(qname, &ips, self.config.route_ttl).await {
                        tracing::warn!(%error, "route injection failed");
                    }
                }
                tracing::info!(domain = qname, ips = ?ips, tunnel = outcome.tunnel, conflict = conflict.is_some(), "route-injection");
            }
        }

        Some(response_bytes)
    }

    async fn forward(&self, id: u16, datagram: &[u8], upstream: SocketAddr) -> Result<Vec<u8>, Error> {
        let actor = self.actor_for(upstream).await?;
        actor.query(id, datagram.to_vec()).await
    }

    async fn actor_for(&self, upstream: SocketAddr) -> Result<Arc<UpstreamActor>, Error> {
        let mut upstreams = self.upstreams.lock().await;
        if let Some(actor) = upstreams.get(&upstream) {
            return Ok(actor.clone());
        }
        let actor = Arc::new(UpstreamActor::spawn(upstream).await?);
        upstreams.insert(upstream, actor.clone());
        Ok(actor)
    }

    fn synthesize_servfail(request: &Message) -> Result<Vec<u8>, Error> {
        let mut response = Message::new();
        response.set_id(request.id());
        response.set_message_type(MessageType::Response);
        response.set_op_code(OpCode::Query);
        response.set_response_code(ResponseCode::ServFail);
        for query in request.queries() {
            response.add_query(query.clone());
        }
        Ok(response.to_bytes()?)
    }

    fn extract_a_records(response: &Message) -> (Vec<Ipv4Addr>, u32) {
        let mut ips = Vec::new();
        let mut min_ttl: Option<u32> = None;
        for record in response.answers() {
            if record.record_type() != RecordType::A {
                continue;
            }
            if let Some(RData::A(addr)) = record.data() {
                ips.push(addr.0);
            }
            min_ttl = Some(min_ttl.map_or(record.ttl(), |ttl| ttl.min(record.ttl())));
        }
        (ips, min_ttl.unwrap_or(DEFAULT_MISSING_TTL))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, Record, rdata};
    use std::str::FromStr;

    fn query_message(id: u16, name: &str) -> Message {
        let mut message = Message::new();
        message.set_id(id);
        message.set_message_type(MessageType::Query);
        message.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        message
    }

    #[test]
    fn synthesize_servfail_preserves_id_and_questions() {
        let request = query_message(42, "example.com.");
        let bytes = DnsProxy::synthesize_servfail(&request).unwrap();
        let response = Message::from_bytes(&bytes).unwrap();

        assert_eq!(response.id(), 42);
        assert_eq!(response.response_code(), ResponseCode::ServFail);
        assert_eq!(response.answer_count(), 0);
        assert_eq!(response.queries().len(), 1);
    }

    #[test]
    fn extract_a_records_returns_addresses_and_minimum_ttl() {
        let mut response = query_message(1, "example.com.");
        response.set_message_type(MessageType::Response);
        let name = Name::from_str("example.com.").unwrap();
        response.add_answer(Record::from_rdata(name.clone(), 300, RData::A(rdata::A(Ipv4Addr::new(93, 184, 216, 34)))));
        response.add_answer(Record::from_rdata(name, 120, RData::A(rdata::A(Ipv4Addr::new(93, 184, 216, 35)))));

        let (ips, ttl) = DnsProxy::extract_a_records(&response);
        assert_eq!(ips, vec![Ipv4Addr::new(93, 184, 216, 34), Ipv4Addr::new(93, 184, 216, 35)]);
        assert_eq!(ttl, 120);
    }

    #[test]
    fn extract_a_records_defaults_ttl_when_no_answers() {
        let response = query_message(1, "example.com.");
        let (ips, ttl) = DnsProxy::extract_a_records(&response);
        assert!(ips.is_empty());
        assert_eq!(ttl, DEFAULT_MISSING_TTL);
    }
}
