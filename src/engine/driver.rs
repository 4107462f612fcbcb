//! Frame loop driving the engine.
//!
//! Stands in for the target application's main update cycle: every frame
//! period the engine is ticked with the wall time measured since the
//! previous tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Engine;

/// Spawn the frame loop.
///
/// On cancellation every live run is asked to stop and one final tick is
/// made so they are torn down before the task exits.
#[must_use]
pub fn spawn_frame_loop(
    engine: Arc<Engine>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last = Instant::now();
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    engine.stop_all();
                    let finished = engine.tick(Duration::ZERO);
                    info!(finished = finished.len(), "frame loop shutting down");
                    break;
                }
                now = interval.tick() => {
                    let wall = now.duration_since(last);
                    last = now;
                    let finished = engine.tick(wall);
                    if !finished.is_empty() {
                        debug!(finished = finished.len(), "runs finished this frame");
                    }
                }
            }
        }
    })
}
