//! Session status, reconnect backoff and session-end classification.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ProtocolError;
use crate::protocol::packets::{DisconnectPacket, DisconnectType};

/// Cancels a scheduled reconnect.
#[derive(Clone)]
pub struct ReconnectHandle {
    token: CancellationToken,
}

impl ReconnectHandle {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Abort the pending retry; the engine ends in `Disconnected`.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

impl fmt::Debug for ReconnectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum NetworkStatus {
    Disconnected {
        /// Consecutive unsuccessful sessions so far
        attempt: Option<u32>,
        reason: Option<DisconnectPacket>,
    },
    Connecting,
    Connected,
    Ready,
    Reconnecting {
        attempt: u32,
        delay: Duration,
        deadline: Instant,
        handle: ReconnectHandle,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKind {
    Disconnected,
    Connecting,
    Connected,
    Ready,
    Reconnecting,
}

impl NetworkStatus {
    pub fn kind(&self) -> StatusKind {
        match self {
            NetworkStatus::Disconnected { .. } => StatusKind::Disconnected,
            NetworkStatus::Connecting => StatusKind::Connecting,
            NetworkStatus::Connected => StatusKind::Connected,
            NetworkStatus::Ready => StatusKind::Ready,
            NetworkStatus::Reconnecting { .. } => StatusKind::Reconnecting,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, NetworkStatus::Ready)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, NetworkStatus::Disconnected { .. })
    }
}

impl Default for NetworkStatus {
    fn default() -> Self {
        NetworkStatus::Disconnected {
            attempt: None,
            reason: None,
        }
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusKind::Disconnected => "disconnected",
            StatusKind::Connecting => "connecting",
            StatusKind::Connected => "connected",
            StatusKind::Ready => "ready",
            StatusKind::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// `min(max, base * 2^attempt)`
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

/// How a single session ended.
#[derive(Debug)]
pub(crate) enum SessionEnd {
    /// Deliberate shutdown by either side
    Closed(Option<DisconnectPacket>),
    Retry {
        error: ProtocolError,
        reason: Option<DisconnectPacket>,
    },
    Fatal {
        error: ProtocolError,
        reason: Option<DisconnectPacket>,
    },
}

impl SessionEnd {
    /// Classify a locally detected failure.
    ///
    /// Transport failures carry no reason. Fatal faults get one synthesized
    /// from the error so listeners see why the session ended.
    pub(crate) fn from_error(error: ProtocolError) -> Self {
        if error.is_transient() {
            return SessionEnd::Retry {
                error,
                reason: None,
            };
        }
        let reason = DisconnectPacket::new(local_fault(&error), Some(error.to_string()));
        SessionEnd::Fatal {
            error,
            reason: Some(reason),
        }
    }

    pub(crate) fn from_disconnect(packet: DisconnectPacket) -> Self {
        if packet.kind.is_clean() {
            return SessionEnd::Closed(Some(packet));
        }
        let retryable = packet.kind.is_retryable();
        let error = packet
            .to_error()
            .unwrap_or(ProtocolError::ConnectionClosed);
        if retryable {
            SessionEnd::Retry {
                error,
                reason: Some(packet),
            }
        } else {
            SessionEnd::Fatal {
                error,
                reason: Some(packet),
            }
        }
    }

    pub(crate) fn reason(&self) -> Option<&DisconnectPacket> {
        match self {
            SessionEnd::Closed(reason) => reason.as_ref(),
            SessionEnd::Retry { reason, .. } | SessionEnd::Fatal { reason, .. } => reason.as_ref(),
        }
    }
}

fn local_fault(error: &ProtocolError) -> DisconnectType {
    match error {
        ProtocolError::InvalidToken(_) => DisconnectType::InvalidToken,
        ProtocolError::InvalidOrigin(_) => DisconnectType::InvalidOrigin,
        ProtocolError::InvalidVersion(_) => DisconnectType::InvalidVersion,
        ProtocolError::PermissionDenied(_) => DisconnectType::PermissionDenied,
        ProtocolError::AnotherConnection(_) => DisconnectType::AnotherConnection,
        ProtocolError::InvalidPacket(_)
        | ProtocolError::UnregisteredPacket(_)
        | ProtocolError::UnknownEndpoint(_)
        | ProtocolError::UnexpectedMessage(_)
        | ProtocolError::DecodeError { .. }
        | ProtocolError::DeserializeError(_)
        | ProtocolError::TrailingBytes(_)
        | ProtocolError::InvalidIdentifier(_)
        | ProtocolError::HandshakeError(_)
        | ProtocolError::DecryptionFailure => DisconnectType::InvalidPacket,
        _ => DisconnectType::InternalError,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_schedule() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(30);
        let delays: Vec<u64> = (0..6)
            .map(|attempt| reconnect_delay(attempt, base, max).as_secs())
            .collect();
        assert_eq!(delays, [2, 4, 8, 16, 30, 30]);
        assert_eq!(reconnect_delay(100, base, max), max);
    }

    #[test]
    fn test_session_end_classification() {
        let end = SessionEnd::from_disconnect(DisconnectPacket::new(DisconnectType::ServerRestart, None));
        assert!(matches!(end, SessionEnd::Retry { .. }));

        let end = SessionEnd::from_disconnect(DisconnectPacket::new(DisconnectType::InternalError, None));
        assert!(matches!(end, SessionEnd::Retry { error: ProtocolError::InternalError(_), .. }));

        let end = SessionEnd::from_disconnect(DisconnectPacket::new(DisconnectType::Close, None));
        assert!(matches!(end, SessionEnd::Closed(Some(_))));

        let end = SessionEnd::from_disconnect(DisconnectPacket::new(
            DisconnectType::PermissionDenied,
            Some("nope".into()),
        ));
        assert!(matches!(end, SessionEnd::Fatal { error: ProtocolError::PermissionDenied(_), .. }));
        assert_eq!(end.reason().map(|r| r.kind), Some(DisconnectType::PermissionDenied));

        assert!(matches!(
            SessionEnd::from_error(ProtocolError::ConnectionClosed),
            SessionEnd::Retry { .. }
        ));
        assert!(matches!(
            SessionEnd::from_error(ProtocolError::InvalidPacket("x".into())),
            SessionEnd::Fatal { .. }
        ));
    }

    #[test]
    fn test_local_faults_carry_a_reason() {
        let end = SessionEnd::from_error(ProtocolError::ConnectionClosed);
        assert!(end.reason().is_none());

        let end = SessionEnd::from_error(ProtocolError::UnknownEndpoint("com.example:missing".into()));
        let reason = end.reason().unwrap();
        assert_eq!(reason.kind, DisconnectType::InvalidPacket);
        assert_eq!(
            reason.message.as_deref(),
            Some("Received invocation for unknown endpoint com.example:missing")
        );

        let end = SessionEnd::from_error(ProtocolError::InvalidToken("expired".into()));
        assert_eq!(end.reason().map(|r| r.kind), Some(DisconnectType::InvalidToken));

        let end = SessionEnd::from_error(ProtocolError::InvalidState("stopped".into()));
        assert_eq!(end.reason().map(|r| r.kind), Some(DisconnectType::InternalError));
    }

    #[test]
    fn test_status_kind() {
        assert_eq!(NetworkStatus::default().kind(), StatusKind::Disconnected);
        assert!(NetworkStatus::Ready.is_ready());
        let handle = ReconnectHandle::new(CancellationToken::new());
        let status = NetworkStatus::Reconnecting {
            attempt: 1,
            delay: Duration::from_secs(4),
            deadline: Instant::now(),
            handle: handle.clone(),
        };
        assert_eq!(status.kind(), StatusKind::Reconnecting);
        handle.cancel();
        assert!(handle.is_cancelled());
    }
}
