//! RPC client: a pooled, lazily-dialed connection per destination peer, with per-call timeout
//! and bounded exponential-backoff retries (SPEC_FULL.md §4.3).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::client::conn::{handshake, SendRequest};
use hyper::upgrade::Upgraded;
use hyper::{Body, Method as HttpMethod, Request, StatusCode};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;

use crate::envelope::{Frame, Header, Method, Peer, WireResult};
use crate::error::{StorageError, StorageResult};
use crate::metrics::Metrics;
use crate::rpc::codec::{read_frame, write_frame};

/// The CONNECT target path the server listens for (SPEC_FULL.md §6: "HTTP CONNECT to a fixed
/// path").
const RPC_CONNECT_PATH: &str = "/_clusternode_rpc";

struct Connection {
    stream: Upgraded,
}

pub struct RpcClient {
    self_peer: Peer,
    timeout: Duration,
    retries: u32,
    metrics: Arc<Metrics>,
    seq: std::sync::atomic::AtomicU64,
    conns: AsyncMutex<HashMap<Peer, Arc<AsyncMutex<Option<Connection>>>>>,
}

impl RpcClient {
    pub fn new(self_peer: Peer, timeout: Duration, retries: u32, metrics: Arc<Metrics>) -> Self {
        Self {
            self_peer,
            timeout,
            retries,
            metrics,
            seq: std::sync::atomic::AtomicU64::new(0),
            conns: AsyncMutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, dest: &Peer) -> Arc<AsyncMutex<Option<Connection>>> {
        let mut conns = self.conns.lock().await;
        conns.entry(dest.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(None))).clone()
    }

    async fn dial(dest: &Peer) -> StorageResult<Connection> {
        let tcp = TcpStream::connect(dest)
            .await
            .map_err(|err| StorageError::Transport { dest: dest.clone(), reason: err.to_string() })?;

        let (mut sender, conn): (SendRequest<Body>, _) = handshake(tcp)
            .await
            .map_err(|err| StorageError::Transport { dest: dest.clone(), reason: err.to_string() })?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                log::debug!("rpc connection driver ended: {err}");
            }
        });

        let request = Request::builder()
            .method(HttpMethod::CONNECT)
            .uri(RPC_CONNECT_PATH)
            .body(Body::empty())
            .map_err(|err| StorageError::service_error(err.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|err| StorageError::Transport { dest: dest.clone(), reason: err.to_string() })?;

        if response.status() != StatusCode::OK {
            return Err(StorageError::Transport {
                dest: dest.clone(),
                reason: format!("CONNECT rejected with status {}", response.status()),
            });
        }

        let stream = hyper::upgrade::on(response)
            .await
            .map_err(|err| StorageError::Transport { dest: dest.clone(), reason: err.to_string() })?;

        Ok(Connection { stream })
    }

    /// Issues one RPC, retrying on timeout/transport failure with delays `2, 4, 8, ...` seconds,
    /// up to `self.retries` attempts. A non-transport (application) error is returned
    /// immediately without retrying.
    pub async fn call(&self, dest: &Peer, method: Method, body: Vec<u8>) -> StorageResult<Vec<u8>> {
        let function = method.as_str();
        let mut delay = Duration::from_secs(2);
        let mut last_err = StorageError::Transport { dest: dest.clone(), reason: "never attempted".into() };

        for attempt in 0..=self.retries {
            let started = Instant::now();
            let outcome = tokio::time::timeout(self.timeout, self.attempt(dest, method, body.clone())).await;

            match outcome {
                Ok(Ok(reply)) => {
                    self.metrics.record(function, started.elapsed(), true);
                    return Ok(reply);
                }
                Ok(Err(err)) => {
                    self.metrics.record(function, started.elapsed(), false);
                    self.evict(dest).await;
                    if !is_retryable(&err) {
                        return Err(err);
                    }
                    last_err = err;
                }
                Err(_elapsed) => {
                    self.metrics.record(function, started.elapsed(), false);
                    self.evict(dest).await;
                    last_err = StorageError::Timeout { dest: dest.clone() };
                }
            }

            if attempt < self.retries {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        Err(last_err)
    }

    async fn attempt(&self, dest: &Peer, method: Method, body: Vec<u8>) -> StorageResult<Vec<u8>> {
        let slot = self.slot(dest).await;
        let mut guard = slot.lock().await;
        if guard.is_none() {
            *guard = Some(Self::dial(dest).await?);
        }
        let conn = guard.as_mut().expect("just dialed");

        let seq = self.seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let header = Header { source: self.self_peer.clone(), dest: dest.clone(), method, seq };
        write_frame(&mut conn.stream, &Frame { header, body }).await?;
        let reply = read_frame(&mut conn.stream).await?;
        Ok(reply.body)
    }

    async fn evict(&self, dest: &Peer) {
        if let Some(slot) = self.conns.lock().await.get(dest).cloned() {
            *slot.lock().await = None;
        }
    }
}

fn is_retryable(err: &StorageError) -> bool {
    matches!(err, StorageError::Transport { .. } | StorageError::Timeout { .. })
}

/// Decodes a typed reply out of a `WireResult<T>` body, reconstructing the sentinel error
/// variant if the remote side reported one.
pub fn decode_reply<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
    let wire: WireResult<T> = rmp_serde::from_slice(bytes)?;
    wire.into_result()
}
