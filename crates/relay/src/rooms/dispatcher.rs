// Notification fan-out.
//
// A notification is serialized once and the same bytes are queued for every
// member of the room snapshot. Members that cannot take the frame are evicted
// from that room; the rest still receive it.

use std::{sync::Arc, time::Duration};

use globechat_common::{
    protocol::ws::{encode_notification, Notification, NotificationKind},
    types::RoomId,
};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::registry::{
    ConnectionId, DeliveryError, OutboundFrame, RoomRegistry, TryDeliverError,
};
use crate::metrics;

/// Default bound on how long one member may keep a notify waiting.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("failed to serialize {kind} notification for room {room_id}: {source}")]
    Serialize {
        kind: NotificationKind,
        room_id: RoomId,
        #[source]
        source: serde_json::Error,
    },
    #[error("{kind} notification for room {event_room_id} was dispatched to room {room_id}")]
    RoomMismatch { kind: NotificationKind, room_id: RoomId, event_room_id: RoomId },
}

/// Outcome of one notify call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Members in the snapshot.
    pub recipients: usize,
    pub delivered: usize,
    pub evicted: usize,
}

#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    registry: Arc<RoomRegistry>,
    send_timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(registry: Arc<RoomRegistry>, send_timeout: Duration) -> Self {
        Self { registry, send_timeout }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Pushes `event` to every current member of `room_id`.
    ///
    /// Returns an error only when nothing can be delivered to anyone: the
    /// payload does not serialize, or the event names a different room.
    /// Per-member delivery failures are handled by eviction and reported in
    /// the [`DeliveryReport`].
    pub async fn notify<T: Serialize>(
        &self,
        room_id: RoomId,
        event: &Notification<T>,
    ) -> Result<DeliveryReport, NotifyError> {
        if event.room_id != room_id {
            return Err(NotifyError::RoomMismatch {
                kind: event.kind,
                room_id,
                event_room_id: event.room_id,
            });
        }

        let frame = OutboundFrame::from(encode_notification(event).map_err(|source| {
            NotifyError::Serialize { kind: event.kind, room_id, source }
        })?);

        let members = self.registry.snapshot(room_id);
        if members.is_empty() {
            return Ok(DeliveryReport::default());
        }

        let mut report = DeliveryReport { recipients: members.len(), ..DeliveryReport::default() };
        let mut slow_members = JoinSet::new();

        for member in members {
            match member.try_deliver(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TryDeliverError::Full(frame)) => {
                    let send_timeout = self.send_timeout;
                    slow_members.spawn(async move {
                        let result = member.deliver(frame, send_timeout).await;
                        (member.id(), result)
                    });
                }
                Err(TryDeliverError::Gone) => {
                    self.evict(room_id, member.id(), DeliveryError::Gone, &mut report);
                }
            }
        }

        while let Some(joined) = slow_members.join_next().await {
            match joined {
                Ok((_, Ok(()))) => report.delivered += 1,
                Ok((connection_id, Err(error))) => {
                    self.evict(room_id, connection_id, error, &mut report);
                }
                Err(join_error) => {
                    warn!(room_id, ?join_error, "notification delivery task failed");
                }
            }
        }

        metrics::record_notification(event.kind, report.delivered as u64, report.evicted as u64);
        debug!(
            room_id,
            kind = %event.kind,
            recipients = report.recipients,
            delivered = report.delivered,
            evicted = report.evicted,
            "notification dispatched"
        );

        Ok(report)
    }

    fn evict(
        &self,
        room_id: RoomId,
        connection_id: ConnectionId,
        error: DeliveryError,
        report: &mut DeliveryReport,
    ) {
        if self.registry.leave(connection_id, room_id) {
            report.evicted += 1;
        }

        match error {
            DeliveryError::Gone => {
                debug!(%connection_id, room_id, "evicted closed connection from room");
            }
            DeliveryError::TimedOut(_) => {
                warn!(%connection_id, room_id, %error, "evicted unresponsive connection from room");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use globechat_common::protocol::ws::{Notification, NotificationKind};
    use serde::{ser::Error as _, Serialize, Serializer};
    use serde_json::json;

    use super::{DeliveryReport, NotificationDispatcher, NotifyError};
    use crate::rooms::registry::{test_handle, RoomRegistry};

    fn dispatcher(send_timeout: Duration) -> NotificationDispatcher {
        NotificationDispatcher::new(Arc::new(RoomRegistry::new()), send_timeout)
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("payload cannot be encoded"))
        }
    }

    #[tokio::test]
    async fn notify_empty_room_is_noop() {
        let dispatcher = dispatcher(Duration::from_millis(50));

        let report = dispatcher
            .notify(42, &Notification::new_message(42, json!({ "id": 1, "text": "hi" })))
            .await
            .expect("notify on empty room should succeed");

        assert_eq!(report, DeliveryReport::default());
        assert_eq!(dispatcher.registry().room_count(), 0);
    }

    #[tokio::test]
    async fn notify_sends_identical_bytes_to_every_member() {
        let dispatcher = dispatcher(Duration::from_millis(50));
        let (first, _first_sender, mut first_receiver) = test_handle(4);
        let (second, _second_sender, mut second_receiver) = test_handle(4);
        dispatcher.registry().join(&first, 5);
        dispatcher.registry().join(&second, 5);

        let report = dispatcher
            .notify(5, &Notification::new_message(5, json!({ "id": 1, "text": "hi" })))
            .await
            .expect("notify should succeed");

        assert_eq!(report, DeliveryReport { recipients: 2, delivered: 2, evicted: 0 });
        let first_frame = first_receiver.try_recv().expect("first member should receive");
        let second_frame = second_receiver.try_recv().expect("second member should receive");
        assert_eq!(first_frame, second_frame);

        let value: serde_json::Value =
            serde_json::from_str(first_frame.as_str()).expect("frame should be json");
        assert_eq!(
            value,
            json!({ "type": "new-message", "room_id": 5, "data": { "id": 1, "text": "hi" } })
        );
    }

    #[tokio::test]
    async fn notify_only_reaches_the_target_room() {
        let dispatcher = dispatcher(Duration::from_millis(50));
        let (inside, _inside_sender, mut inside_receiver) = test_handle(4);
        let (outside, _outside_sender, mut outside_receiver) = test_handle(4);
        dispatcher.registry().join(&inside, 1);
        dispatcher.registry().join(&outside, 2);

        dispatcher
            .notify(1, &Notification::delete_thread(1, ""))
            .await
            .expect("notify should succeed");

        assert!(inside_receiver.try_recv().is_ok());
        assert!(outside_receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn late_joiner_does_not_receive_earlier_notification() {
        let dispatcher = dispatcher(Duration::from_millis(50));
        let (early, _early_sender, mut early_receiver) = test_handle(4);
        let (late, _late_sender, mut late_receiver) = test_handle(4);
        dispatcher.registry().join(&early, 3);

        dispatcher
            .notify(3, &Notification::new_message(3, json!({ "id": 9 })))
            .await
            .expect("notify should succeed");
        dispatcher.registry().join(&late, 3);

        assert!(early_receiver.try_recv().is_ok());
        assert!(late_receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_member_is_evicted_and_others_still_receive() {
        let dispatcher = dispatcher(Duration::from_millis(50));
        let (failing, failing_sender, failing_receiver) = test_handle(4);
        let (healthy, _healthy_sender, mut healthy_receiver) = test_handle(4);
        dispatcher.registry().join(&failing, 7);
        dispatcher.registry().join(&healthy, 7);
        drop(failing_receiver);
        drop(failing_sender);

        let report = dispatcher
            .notify(7, &Notification::new_message(7, json!({ "id": 1 })))
            .await
            .expect("partial delivery is not an error");

        assert_eq!(report, DeliveryReport { recipients: 2, delivered: 1, evicted: 1 });
        assert!(!dispatcher.registry().contains(7, failing.id()));
        assert!(dispatcher.registry().contains(7, healthy.id()));
        assert!(healthy_receiver.try_recv().is_ok());

        let report = dispatcher
            .notify(7, &Notification::new_message(7, json!({ "id": 2 })))
            .await
            .expect("second notify should succeed");
        assert_eq!(report, DeliveryReport { recipients: 1, delivered: 1, evicted: 0 });
        assert!(healthy_receiver.try_recv().is_ok());
    }

    #[tokio::test]
    async fn closed_receiver_counts_as_failure_even_while_sender_lives() {
        let dispatcher = dispatcher(Duration::from_millis(50));
        let (member, _sender, receiver) = test_handle(4);
        dispatcher.registry().join(&member, 8);
        drop(receiver);

        let report = dispatcher
            .notify(8, &Notification::delete_message(8, json!({ "id": 4 })))
            .await
            .expect("notify should succeed");

        assert_eq!(report.evicted, 1);
        assert_eq!(dispatcher.registry().room_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_member_is_evicted_after_send_timeout() {
        let dispatcher = dispatcher(Duration::from_millis(200));
        let (stalled, _stalled_sender, mut stalled_receiver) = test_handle(1);
        let (healthy, _healthy_sender, mut healthy_receiver) = test_handle(4);
        dispatcher.registry().join(&stalled, 9);
        dispatcher.registry().join(&healthy, 9);

        dispatcher
            .notify(9, &Notification::new_message(9, json!({ "id": 1 })))
            .await
            .expect("first notify should succeed");

        let report = dispatcher
            .notify(9, &Notification::new_message(9, json!({ "id": 2 })))
            .await
            .expect("second notify should succeed");

        assert_eq!(report, DeliveryReport { recipients: 2, delivered: 1, evicted: 1 });
        assert!(!dispatcher.registry().contains(9, stalled.id()));
        assert!(stalled_receiver.try_recv().is_ok());
        assert!(stalled_receiver.try_recv().is_err());
        assert!(healthy_receiver.try_recv().is_ok());
        assert!(healthy_receiver.try_recv().is_ok());
    }

    #[tokio::test]
    async fn serialization_failure_is_reported_and_nothing_is_sent() {
        let dispatcher = dispatcher(Duration::from_millis(50));
        let (member, _sender, mut receiver) = test_handle(4);
        dispatcher.registry().join(&member, 1);

        let error = dispatcher
            .notify(1, &Notification::new_message(1, Unserializable))
            .await
            .expect_err("unserializable payload must fail");

        assert!(matches!(
            error,
            NotifyError::Serialize { kind: NotificationKind::NewMessage, room_id: 1, .. }
        ));
        assert!(receiver.try_recv().is_err());
        assert!(dispatcher.registry().contains(1, member.id()));
    }

    #[tokio::test]
    async fn mismatched_room_is_rejected_without_delivery() {
        let dispatcher = dispatcher(Duration::from_millis(50));
        let (member, _sender, mut receiver) = test_handle(4);
        dispatcher.registry().join(&member, 1);

        let error = dispatcher
            .notify(1, &Notification::new_message(2, json!({})))
            .await
            .expect_err("room mismatch must fail");

        assert!(matches!(error, NotifyError::RoomMismatch { room_id: 1, event_room_id: 2, .. }));
        assert!(receiver.try_recv().is_err());
    }
}
