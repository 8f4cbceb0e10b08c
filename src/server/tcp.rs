//! Raw relay mode
//!
//! Bytes are copied both ways between the client and the upstream without
//! any HTTP parsing. The only policy applied is the accept-time blacklist
//! drop done by the listener.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use crate::telemetry::{Outcome, TrafficLogRecord};

use super::Firewall;

pub async fn relay(
    mut client: TcpStream,
    remote_addr: SocketAddr,
    client_ip: IpAddr,
    firewall: Arc<Firewall>,
) {
    let target = firewall.target();
    let client_ip = client_ip.to_string();

    let mut upstream = match dial(&firewall).await {
        Ok(upstream) => upstream,
        Err(e) => {
            error!(%remote_addr, upstream = target, error = %e, "Failed to connect to upstream");
            firewall.telemetry.record(
                Outcome::Failed,
                TrafficLogRecord::failed(client_ip, target, e),
            );
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            debug!(%remote_addr, to_upstream, to_client, "Relay finished");
            firewall
                .telemetry
                .record(Outcome::Success, TrafficLogRecord::success(client_ip, target));
        }
        Err(e) => {
            warn!(%remote_addr, error = %e, "Relay interrupted");
            firewall.telemetry.record(
                Outcome::Failed,
                TrafficLogRecord::failed(client_ip, target, e.to_string()),
            );
        }
    }
}

async fn dial(firewall: &Firewall) -> Result<TcpStream, String> {
    let connect = TcpStream::connect(firewall.target());

    match firewall.proxy.config().timeout {
        Some(timeout) => tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| "Upstream connect timeout".to_string())?
            .map_err(|e| e.to_string()),
        None => connect.await.map_err(|e| e.to_string()),
    }
}
