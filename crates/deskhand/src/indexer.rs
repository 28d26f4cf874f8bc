//! Attach/reindex orchestration.
//!
//! Enumeration reports progress 0 -> 50, parameter fetch + subscribe run
//! 50 -> 100. The snapshot is published to the mirror only once the subscribe
//! phase has succeeded, so a failed reindex leaves the prior snapshot (and
//! the change history) intact.

use std::sync::Arc;

use anyhow::{Context, Result};
use liveosc::LiveBridge;
use tracing::{info, warn};

use crate::events::SessionEvent;
use crate::sessions::SessionState;

/// Index the session's mixer, emitting `indexing_status` events throughout.
/// A concurrent indexing run for the same session turns this into a no-op.
pub async fn run(session: Arc<SessionState>, bridge: Arc<LiveBridge>) {
    if !session.try_begin_indexing() {
        return;
    }

    match index(&session, &bridge).await {
        Ok(count) => {
            info!(
                "session {}: indexed {} parameters across {} tracks",
                session.id,
                count,
                session.mirror.load().map(|s| s.tracks.len()).unwrap_or(0)
            );
            session.emit(SessionEvent::IndexingStatus {
                is_indexing: false,
                progress: Some(100),
            });
        }
        Err(e) => {
            warn!("session {}: indexing failed: {:#}", session.id, e);
            session.emit(SessionEvent::Error {
                message: format!("indexing failed: {:#}", e),
            });
            session.emit(SessionEvent::IndexingStatus {
                is_indexing: false,
                progress: None,
            });
        }
    }

    session.end_indexing();
}

async fn index(session: &Arc<SessionState>, bridge: &Arc<LiveBridge>) -> Result<usize> {
    let progress = |p: u8| {
        session.emit(SessionEvent::IndexingStatus {
            is_indexing: true,
            progress: Some(p),
        })
    };

    // One retry on enumerate; per-query timeouts already bound each step.
    let mut snapshot = match bridge.enumerate_mixer(&progress).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("session {}: enumerate failed, retrying once: {}", session.id, e);
            bridge
                .enumerate_mixer(&progress)
                .await
                .context("mixer enumeration")?
        }
    };

    for track in &mut snapshot.tracks {
        for device in &mut track.devices {
            device.parameters = bridge
                .get_parameters(track.track_id, device.device_id)
                .await
                .with_context(|| {
                    format!(
                        "parameter list for track {} device {}",
                        track.track_id, device.device_id
                    )
                })?;
        }
    }

    session
        .observer
        .resubscribe(&snapshot, &progress)
        .await
        .context("parameter subscribe")?;

    let count = snapshot.parameter_count();
    session.mirror.replace(snapshot);
    Ok(count)
}
