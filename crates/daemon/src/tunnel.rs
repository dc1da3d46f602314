//! Reverse tunnel client for a localtunnel-compatible server.
//!
//! `GET <server>/<subdomain>` asks the server for a public URL. The reply
//! names a TCP port on the server; we keep `max_conn_count` sockets open to
//! it and splice each one onto the local web port. When every socket has
//! died the tunnel reports itself closed.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::Error;

/// A live (or dead) tunnel. Cloning shares the same close signal.
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    url: String,
    closed: CancellationToken,
}

impl TunnelHandle {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            closed: CancellationToken::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Resolves once the tunnel has dropped or been closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

#[async_trait]
pub trait TunnelConnector: Send + Sync {
    /// Ask the remote for `subdomain`. The returned URL may name a different
    /// subdomain when the requested one is taken.
    async fn open(&self, subdomain: &str) -> Result<TunnelHandle, Error>;
}

/// Whether `url`'s first host label is `subdomain`.
pub fn grants_subdomain(url: &str, subdomain: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.split('.').next() == Some(subdomain)))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// localtunnel
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Grant {
    port: u16,
    #[serde(default)]
    max_conn_count: Option<usize>,
    url: String,
}

#[derive(Debug, Deserialize)]
struct Refusal {
    message: String,
}

/// Delay before a relay slot re-dials after the local service refused it.
const LOCAL_RETRY: Duration = Duration::from_secs(1);

pub struct LocalTunnel {
    client: reqwest::Client,
    server: Url,
    local_port: u16,
}

impl LocalTunnel {
    pub fn new(server: &str, local_port: u16, request_timeout: Duration) -> Result<Self, Error> {
        let server = Url::parse(server)
            .map_err(|e| Error::ConnectivityError(format!("bad tunnel server {server:?}: {e}")))?;
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            server,
            local_port,
        })
    }
}

#[async_trait]
impl TunnelConnector for LocalTunnel {
    async fn open(&self, subdomain: &str) -> Result<TunnelHandle, Error> {
        let endpoint = self
            .server
            .join(subdomain)
            .map_err(|e| Error::ConnectivityError(format!("bad subdomain {subdomain:?}: {e}")))?;

        let resp = self.client.get(endpoint).send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            let reason = serde_json::from_str::<Refusal>(&body)
                .map(|r| r.message)
                .unwrap_or(body);
            return Err(Error::ConnectivityError(format!("{status}: {reason}")));
        }

        let grant: Grant = serde_json::from_str(&body)
            .map_err(|e| Error::ConnectivityError(format!("bad grant {body:?}: {e}")))?;
        let remote_host = self
            .server
            .host_str()
            .ok_or_else(|| Error::ConnectivityError("tunnel server has no host".into()))?
            .to_string();

        let handle = TunnelHandle::new(grant.url);
        let slots = grant.max_conn_count.unwrap_or(1).max(1);
        info!(url = handle.url(), remote_port = grant.port, slots, "tunnel granted");

        tokio::spawn(relay(
            remote_host,
            grant.port,
            self.local_port,
            slots,
            handle.token(),
        ));

        Ok(handle)
    }
}

/// Keep `slots` relays running until all of them die or `closed` fires.
async fn relay(
    remote_host: String,
    remote_port: u16,
    local_port: u16,
    slots: usize,
    closed: CancellationToken,
) {
    let mut set = JoinSet::new();
    for slot in 0..slots {
        set.spawn(relay_slot(slot, remote_host.clone(), remote_port, local_port));
    }

    let died = {
        let drain = async { while set.join_next().await.is_some() {} };
        tokio::select! {
            _ = closed.cancelled() => false,
            _ = drain => true,
        }
    };

    if died {
        warn!(remote = %remote_host, "all tunnel relays died");
        closed.cancel();
    } else {
        set.abort_all();
        debug!("tunnel relays stopped");
    }
}

/// One relay socket: dial the server, wait for a request, splice it onto the
/// local port, repeat. Returns when the server stops accepting.
async fn relay_slot(slot: usize, remote_host: String, remote_port: u16, local_port: u16) {
    loop {
        let mut upstream = match TcpStream::connect((remote_host.as_str(), remote_port)).await {
            Ok(s) => s,
            Err(e) => {
                warn!(slot, "tunnel server refused relay: {e}");
                return;
            }
        };

        if let Err(e) = upstream.readable().await {
            debug!(slot, "relay socket failed while idle: {e}");
            continue;
        }

        let mut local = match TcpStream::connect(("127.0.0.1", local_port)).await {
            Ok(s) => s,
            Err(e) => {
                warn!(slot, local_port, "local service unreachable: {e}");
                tokio::time::sleep(LOCAL_RETRY).await;
                continue;
            }
        };

        match tokio::io::copy_bidirectional(&mut upstream, &mut local).await {
            Ok((up, down)) => debug!(slot, up, down, "relayed request"),
            Err(e) => debug!(slot, "relay ended: {e}"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
