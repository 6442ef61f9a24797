// Per-connection state and guaranteed room cleanup.

use std::{sync::Arc, time::Duration};

use axum::extract::ws::{close_code, CloseFrame};
use globechat_common::{
    protocol::ws::{ControlFrame, FrameDecodeError},
    types::RoomId,
};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::rooms::{ConnectionHandle, ConnectionId, OutboundFrame, RoomRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress; nothing is registered yet.
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Open)
                | (Self::Connecting, Self::Closed)
                | (Self::Open, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }
}

/// Why a connection's receive loop ended.
#[derive(Debug, thiserror::Error)]
pub enum CloseReason {
    #[error("peer closed the connection (code {code:?})")]
    PeerClosed { code: Option<u16> },
    #[error("stream ended without a close frame")]
    StreamEnded,
    #[error("read failed: {0}")]
    ReadFailed(#[source] axum::Error),
    #[error("write failed: {0}")]
    WriteFailed(#[source] axum::Error),
    #[error("write stalled for {0:?}")]
    WriteTimedOut(Duration),
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] FrameDecodeError),
    #[error("binary frames are not supported")]
    BinaryFrame,
    #[error("no frame received within {0:?}")]
    FrameWaitTimeout(Duration),
}

impl CloseReason {
    /// A clean, peer-initiated shutdown.
    pub fn is_normal(&self) -> bool {
        matches!(self, Self::PeerClosed { code: None | Some(close_code::NORMAL) })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::PeerClosed { .. } if self.is_normal() => "normal",
            Self::PeerClosed { .. } => "peer_abnormal",
            Self::StreamEnded => "stream_ended",
            Self::ReadFailed(_) => "read_failed",
            Self::WriteFailed(_) => "write_failed",
            Self::WriteTimedOut(_) => "write_timeout",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::BinaryFrame => "binary_frame",
            Self::FrameWaitTimeout(_) => "frame_wait_timeout",
        }
    }

    /// Close frame the server sends when it ends the connection itself.
    /// A stalled writer gets none; the socket is just dropped.
    pub fn close_frame(&self) -> Option<CloseFrame> {
        let (code, reason) = match self {
            Self::ProtocolViolation(_) => (close_code::PROTOCOL, "invalid control frame"),
            Self::BinaryFrame => (close_code::UNSUPPORTED, "text frames only"),
            Self::FrameWaitTimeout(_) => (close_code::AWAY, "idle timeout"),
            _ => return None,
        };
        Some(CloseFrame { code, reason: reason.into() })
    }
}

/// One accepted socket's side of the room registry.
///
/// Owns the strong end of the outbound queue, so registry handles stop
/// resolving once the connection is gone. Room membership is released
/// exactly once: by [`Connection::close`], or on drop if the task ends
/// some other way.
#[derive(Debug)]
pub struct Connection {
    handle: ConnectionHandle,
    outbound: Option<mpsc::Sender<OutboundFrame>>,
    registry: Option<Arc<RoomRegistry>>,
    state: ConnectionState,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        registry: Arc<RoomRegistry>,
        outbound: mpsc::Sender<OutboundFrame>,
    ) -> Self {
        Self {
            handle: ConnectionHandle::new(id, &outbound),
            outbound: Some(outbound),
            registry: Some(registry),
            state: ConnectionState::Connecting,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn mark_open(&mut self) {
        self.transition(ConnectionState::Open);
    }

    pub fn begin_closing(&mut self) {
        self.transition(ConnectionState::Closing);
    }

    /// Applies a join or leave. Returns whether membership changed.
    pub fn apply(&self, frame: ControlFrame) -> bool {
        let Some(registry) = self.registry.as_ref() else {
            return false;
        };
        if self.state != ConnectionState::Open {
            return false;
        }

        let connection_id = self.id();
        let room_id = frame.room_id();
        let changed = match frame {
            ControlFrame::Join { .. } => registry.join(&self.handle, room_id),
            ControlFrame::Leave { .. } => registry.leave(connection_id, room_id),
        };
        debug!(
            %connection_id,
            room_id,
            frame_type = frame.type_str(),
            changed,
            "control frame applied"
        );
        changed
    }

    pub fn rooms(&self) -> Vec<RoomId> {
        self.registry.as_ref().map(|registry| registry.rooms_for(self.id())).unwrap_or_default()
    }

    /// Leaves every room and drops the outbound queue. Returns the rooms left.
    pub fn close(mut self) -> Vec<RoomId> {
        self.release()
    }

    fn release(&mut self) -> Vec<RoomId> {
        let Some(registry) = self.registry.take() else {
            return Vec::new();
        };
        if self.state == ConnectionState::Open {
            self.transition(ConnectionState::Closing);
        }

        let left = registry.leave_all(self.id());
        self.outbound = None;
        self.transition(ConnectionState::Closed);
        left
    }

    fn transition(&mut self, next: ConnectionState) {
        if !self.state.can_transition_to(next) {
            warn!(
                connection_id = %self.id(),
                from = ?self.state,
                to = ?next,
                "ignoring invalid connection state transition"
            );
            return;
        }
        trace!(
            connection_id = %self.id(),
            from = ?self.state,
            to = ?next,
            "connection state changed"
        );
        self.state = next;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let left = self.release();
        if !left.is_empty() {
            debug!(connection_id = %self.id(), rooms = ?left, "released rooms on drop");
        }
    }
}
