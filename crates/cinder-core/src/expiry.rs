//! Periodic expiration sweep.
//!
//! Lazy checks on the read path are the primary expiration mechanism;
//! this reaper is the backstop that reclaims keys nobody touches. One
//! task per shard ticks every second, collects the keys whose instant
//! has passed, then removes each under a re-check so an entry that was
//! refreshed or deleted mid-sweep is left alone.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::db::Db;
use crate::time::now_ms;

/// Sweep period per shard.
pub const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Runs one sweep over the shard. Returns the number of keys removed.
pub fn sweep(db: &Db) -> usize {
    let now = now_ms();
    let mut removed = 0;
    for key in db.expired_keys(now) {
        if db.reap(&key, now) {
            removed += 1;
        }
    }
    removed
}

/// Spawns the reaper task for one shard. The task exits when the
/// shutdown signal flips.
pub fn spawn_reaper(db: Arc<Db>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(REAP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let removed = sweep(&db);
                    if removed > 0 {
                        debug!(shard = db.index(), removed, "expiration sweep");
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::thread;

    #[test]
    fn sweep_removes_only_expired_keys() {
        let db = Db::new(0);
        for i in 0..5 {
            db.set(&format!("temp:{i}"), Bytes::from("gone"));
            db.expire(&format!("temp:{i}"), 5);
        }
        for i in 0..3 {
            db.set(&format!("keep:{i}"), Bytes::from("stay"));
        }

        thread::sleep(Duration::from_millis(25));
        assert_eq!(sweep(&db), 5);
        assert_eq!(db.size(), 3);
    }

    #[test]
    fn sweep_on_clean_shard_removes_nothing() {
        let db = Db::new(0);
        db.set("k", Bytes::from("v"));
        db.expire("k", 60_000);
        assert_eq!(sweep(&db), 0);
        assert_eq!(db.size(), 1);
    }

    #[test]
    fn sweep_on_empty_shard_is_fine() {
        let db = Db::new(0);
        assert_eq!(sweep(&db), 0);
    }
}
