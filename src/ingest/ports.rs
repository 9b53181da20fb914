//! Dynamic port allocation for ingestion workers.
//!
//! Each worker claims one port out of a configured range by binding a probe
//! socket and holding it until the real decode pipeline takes over. Two
//! workers initializing concurrently may race for the same port; "address in
//! use" is tolerated and the scan continues, and a randomized settle delay
//! before probing keeps the collision probability low.

use crate::config::PortRange;
use crate::defaults;
use crate::error::{Result, StreamscribeError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::{TcpListener, UdpSocket};
use std::time::Duration;

/// Wire transport terminated by an ingestion worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Srt,
    Rtmp,
    WebSocket,
}

impl TransportKind {
    /// Short protocol label used in logs and error messages.
    pub fn label(&self) -> &'static str {
        match self {
            TransportKind::Srt => "srt",
            TransportKind::Rtmp => "rtmp",
            TransportKind::WebSocket => "websocket",
        }
    }

    /// Transport URI publishers connect to once a port is claimed.
    pub fn uri(&self, port: u16) -> String {
        match self {
            TransportKind::Srt => format!("srt://0.0.0.0:{}?mode=listener", port),
            TransportKind::Rtmp => format!("rtmp://0.0.0.0:{}/live", port),
            TransportKind::WebSocket => format!("ws://0.0.0.0:{}", port),
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = StreamscribeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "srt" => Ok(TransportKind::Srt),
            "rtmp" => Ok(TransportKind::Rtmp),
            "websocket" | "ws" => Ok(TransportKind::WebSocket),
            other => Err(StreamscribeError::ConfigInvalidValue {
                key: "transport".to_string(),
                message: format!("unknown transport: {}", other),
            }),
        }
    }
}

/// Probe socket holding a claimed port until the decode pipeline starts.
///
/// SRT listens on UDP; RTMP and WebSocket listen on TCP. Dropping the
/// probe releases the port.
#[derive(Debug)]
pub enum PortProbe {
    Udp(UdpSocket),
    Tcp(TcpListener),
}

impl PortProbe {
    fn bind(kind: TransportKind, port: u16) -> std::io::Result<Self> {
        match kind {
            TransportKind::Srt => UdpSocket::bind(("0.0.0.0", port)).map(PortProbe::Udp),
            TransportKind::Rtmp | TransportKind::WebSocket => {
                TcpListener::bind(("0.0.0.0", port)).map(PortProbe::Tcp)
            }
        }
    }
}

/// Scans `range` for a free port of the protocol-appropriate kind and
/// claims the first one found.
///
/// Ports already in use (including those lost to a concurrently probing
/// sibling) are skipped; only exhaustion of the whole range is an error,
/// and that error is fatal — the worker must never reach ready.
pub fn claim_port(kind: TransportKind, range: PortRange) -> Result<(u16, PortProbe)> {
    for port in range.start..=range.end {
        match PortProbe::bind(kind, port) {
            Ok(probe) => {
                tracing::debug!(protocol = kind.label(), port, "claimed port");
                return Ok((port, probe));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                tracing::warn!(protocol = kind.label(), port, "permission denied, skipping");
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(StreamscribeError::PortRangeExhausted {
        protocol: kind.label().to_string(),
        start: range.start,
        end: range.end,
    })
}

/// Sleeps a random 0..PORT_SETTLE_JITTER_MS before probing so that
/// concurrently initializing workers spread out over the range. Awaited
/// by the worker before [`claim_port`]; must not block a runtime thread.
pub async fn settle_jitter() {
    let jitter = rand::thread_rng().gen_range(0..defaults::PORT_SETTLE_JITTER_MS);
    if jitter > 0 {
        tokio::time::sleep(Duration::from_millis(jitter)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_labels() {
        assert_eq!(TransportKind::Srt.label(), "srt");
        assert_eq!(TransportKind::Rtmp.label(), "rtmp");
        assert_eq!(TransportKind::WebSocket.label(), "websocket");
    }

    #[test]
    fn test_transport_uris() {
        assert_eq!(
            TransportKind::Srt.uri(9001),
            "srt://0.0.0.0:9001?mode=listener"
        );
        assert_eq!(TransportKind::Rtmp.uri(1935), "rtmp://0.0.0.0:1935/live");
        assert_eq!(TransportKind::WebSocket.uri(8100), "ws://0.0.0.0:8100");
    }

    #[test]
    fn test_transport_from_str() {
        assert_eq!("srt".parse::<TransportKind>().ok(), Some(TransportKind::Srt));
        assert_eq!(
            "ws".parse::<TransportKind>().ok(),
            Some(TransportKind::WebSocket)
        );
        assert!("quic".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_claim_port_skips_taken_port() {
        // Occupy the first port of the range, the scan must move past it.
        let taken = TcpListener::bind(("0.0.0.0", 0)).expect("bind ephemeral");
        let first = taken.local_addr().expect("addr").port();
        if first == u16::MAX {
            return; // no room to scan upward from here
        }
        let range = PortRange::new(first, first.saturating_add(20));

        let (port, _probe) =
            claim_port(TransportKind::Rtmp, range).expect("range should have a free port");
        assert!(port > first);
        assert!(port <= range.end);
    }

    #[test]
    fn test_claim_port_exhaustion_is_fatal_error() {
        // A single-port range that is already occupied must exhaust.
        let taken = TcpListener::bind(("0.0.0.0", 0)).expect("bind ephemeral");
        let port = taken.local_addr().expect("addr").port();
        let range = PortRange::new(port, port);

        let err = claim_port(TransportKind::WebSocket, range).unwrap_err();
        assert!(matches!(
            err,
            StreamscribeError::PortRangeExhausted { .. }
        ));
    }

    #[tokio::test]
    async fn test_settle_jitter_is_bounded_by_the_ceiling() {
        tokio::time::timeout(
            Duration::from_millis(defaults::PORT_SETTLE_JITTER_MS + 500),
            settle_jitter(),
        )
        .await
        .expect("jitter must finish inside the configured ceiling");
    }

    #[test]
    fn test_udp_probe_for_srt() {
        // SRT probes must bind UDP: a TCP listener on the same port does
        // not block the claim.
        let tcp = TcpListener::bind(("0.0.0.0", 0)).expect("bind ephemeral");
        let port = tcp.local_addr().expect("addr").port();
        let range = PortRange::new(port, port);

        let (claimed, probe) = claim_port(TransportKind::Srt, range).expect("udp free");
        assert_eq!(claimed, port);
        assert!(matches!(probe, PortProbe::Udp(_)));
    }
}
