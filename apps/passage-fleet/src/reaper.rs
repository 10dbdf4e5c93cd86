//! Background maintenance: the session reaper and the URL-token GC.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::fleet::unix_now;
use crate::AppState;

const REAPER_INTERVAL: Duration = Duration::from_secs(30);
const TOKEN_GC_INTERVAL: Duration = Duration::from_secs(60);

pub fn spawn(state: AppState) {
    let reaper_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REAPER_INTERVAL);
        loop {
            interval.tick().await;
            let released = reaper_state.fleet.reap(Instant::now());
            if released.is_empty() {
                continue;
            }
            if let Some(mirror) = &reaper_state.mirror {
                for snapshot in &released {
                    mirror.write_slot(snapshot).await;
                }
                mirror
                    .write_summary(&reaper_state.fleet.status(), unix_now())
                    .await;
            }
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TOKEN_GC_INTERVAL);
        loop {
            interval.tick().await;
            let removed = state.fleet.gc_url_tokens(Instant::now());
            if removed > 0 {
                debug!(removed, "expired url tokens collected");
            }
        }
    });
}
