//! State listener
//!
//! A single task drains the bounded state queue and fans each state out
//! through the dispatcher. On termination it drains what is already
//! queued, then exits. Draining more than `max_state_transitions` states
//! without termination trips a safety valve that stops the listener only;
//! workers keep running.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use kgx_core::EventState;

use crate::engine::ExtractionEngine;

pub(crate) async fn state_listener(
    engine: Arc<ExtractionEngine>,
    mut rx: mpsc::Receiver<EventState>,
) {
    let max_transitions = engine.config().max_state_transitions;
    let mut drained = 0usize;

    loop {
        tokio::select! {
            _ = engine.termination().wait() => {
                // Drain the residue so nothing already queued is lost
                while let Ok(state) = rx.try_recv() {
                    engine.dispatcher().dispatch(&state).await;
                    drained += 1;
                }
                debug!(drained, "listener drained after termination");
                break;
            }
            state = rx.recv() => match state {
                Some(state) => {
                    engine.dispatcher().dispatch(&state).await;
                    drained += 1;

                    if drained > max_transitions && !engine.termination().is_requested() {
                        warn!(
                            drained,
                            max_transitions,
                            "state transition limit exceeded, stopping listener"
                        );
                        break;
                    }
                }
                None => {
                    debug!(drained, "state queue closed");
                    break;
                }
            }
        }
    }
}
