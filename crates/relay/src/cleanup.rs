// Periodic removal of expired threads.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use globechat_common::protocol::ws::Notification;
use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{config::MAX_TIMER, metrics, rooms::NotificationDispatcher, store::ChatStore};

/// Spawns the sweep loop. The first sweep runs one `period` after start.
pub fn spawn_expiry_sweep(
    store: Arc<ChatStore>,
    dispatcher: NotificationDispatcher,
    period: Duration,
    ttl: Duration,
) -> JoinHandle<()> {
    let period = period.min(MAX_TIMER);
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(cutoff) = expiry_cutoff(Utc::now(), ttl) else {
                warn!(ttl_secs = ttl.as_secs(), "thread ttl out of range, skipping sweep");
                continue;
            };
            let removed = sweep_expired_threads(&store, &dispatcher, cutoff).await;
            if removed > 0 {
                info!(removed, %cutoff, "expired threads removed");
            } else {
                debug!(%cutoff, "no expired threads");
            }
        }
    })
}

/// Oldest creation time that is still kept.
pub fn expiry_cutoff(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl).ok()?;
    now.checked_sub_signed(ttl)
}

/// Deletes every thread created before `cutoff` and tells its room.
/// Returns how many threads were removed.
pub async fn sweep_expired_threads(
    store: &ChatStore,
    dispatcher: &NotificationDispatcher,
    cutoff: DateTime<Utc>,
) -> usize {
    let mut removed = 0;
    for thread_id in store.expired_thread_ids(cutoff).await {
        // A client may delete the thread between listing and removal.
        if let Err(error) = store.delete_thread(thread_id).await {
            debug!(thread_id, %error, "expired thread already gone");
            continue;
        }
        removed += 1;

        let event = Notification::delete_thread(thread_id, "");
        if let Err(error) = dispatcher.notify(thread_id, &event).await {
            warn!(thread_id, %error, "failed to announce expired thread");
        }
    }

    metrics::record_expired_threads(removed as u64);
    removed
}
