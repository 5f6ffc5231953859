//! Acquisition thread.
//!
//! Drives a [`DataSource`] into the raw pool, one slot per buffer, and
//! announces every commit with `raw_buffer_available`. The thread owns the
//! source while it runs and hands it back on exit so the pipeline can
//! reconfigure and restart it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use super::{Acquired, DataSource};
use crate::data::RawBuffer;
use crate::error::{AppResult, OctError};
use crate::error_recovery::{StallMonitor, StallStatus};
use crate::events::EventBus;
use oct_pool::{OverflowPolicy, SlotPool};

/// Producer thread tuning.
#[derive(Debug, Clone, Copy)]
pub struct ProducerConfig {
    /// Bounded wait for one raw buffer (and for a free slot).
    pub wait_timeout: Duration,
    /// Consecutive empty waits before a live source counts as stalled.
    pub stall_threshold: u32,
}

/// Why the acquisition thread stopped.
#[derive(Debug)]
pub enum ProducerOutcome {
    /// Asked to stop.
    Stopped,
    /// The source ran out of data (playback without loop).
    Finished,
    /// The live source stopped delivering.
    Stalled {
        /// Consecutive timed-out waits.
        timeouts: u32,
    },
    /// The source returned a fatal error.
    Failed(OctError),
}

/// What a finished acquisition thread hands back.
pub struct ProducerExit {
    /// The source, handed back for restart.
    pub source: Box<dyn DataSource>,
    /// Why the thread exited.
    pub outcome: ProducerOutcome,
    /// Buffers committed to the raw pool.
    pub buffers: u64,
}

impl std::fmt::Debug for ProducerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerExit")
            .field("source", &self.source.name())
            .field("outcome", &self.outcome)
            .field("buffers", &self.buffers)
            .finish()
    }
}

/// Acquisition thread filling the raw pool from a [`DataSource`].
pub struct Producer {
    handle: Option<JoinHandle<ProducerExit>>,
    stop: Arc<AtomicBool>,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("running", &self.is_running())
            .finish()
    }
}

impl Producer {
    /// Start the acquisition thread on an already configured `source`.
    pub fn spawn(
        source: Box<dyn DataSource>,
        pool: Arc<SlotPool<RawBuffer>>,
        events: EventBus,
        config: ProducerConfig,
    ) -> AppResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("oct-acquisition".into())
            .spawn(move || run(source, &pool, &events, config, &thread_stop))?;
        Ok(Self {
            handle: Some(handle),
            stop,
        })
    }

    /// The thread has not exited yet.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Ask the thread to exit after its current wait.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Stop (if still running) and collect the source.
    pub fn join(mut self) -> AppResult<ProducerExit> {
        self.request_stop();
        let handle = self
            .handle
            .take()
            .ok_or_else(|| OctError::ThreadPanicked("oct-acquisition".into()))?;
        handle
            .join()
            .map_err(|_| OctError::ThreadPanicked("oct-acquisition".into()))
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    mut source: Box<dyn DataSource>,
    pool: &SlotPool<RawBuffer>,
    events: &EventBus,
    config: ProducerConfig,
    stop: &AtomicBool,
) -> ProducerExit {
    let live = source.policy() == OverflowPolicy::Lossy;
    let mut stall = StallMonitor::new(config.stall_threshold);
    let mut buffers = 0u64;
    info!(source = source.name(), live, "Acquisition started");

    let outcome = loop {
        if stop.load(Ordering::Acquire) {
            break ProducerOutcome::Stopped;
        }
        if source.is_finished() {
            break ProducerOutcome::Finished;
        }

        let Some(mut slot) = pool.begin_write_timeout(config.wait_timeout) else {
            trace!(pool = pool.label(), "No writable raw slot");
            continue;
        };

        match source.acquire_next(&mut slot, config.wait_timeout) {
            Ok(Acquired::Filled) => {
                let index = slot.commit();
                buffers += 1;
                stall.record_success();
                trace!(slot = index, buffers, "Raw buffer committed");
                events.raw_buffer_available(pool.ready_len());
            }
            Ok(Acquired::Empty) => {
                drop(slot);
                if !live {
                    continue;
                }
                match stall.record_timeout() {
                    StallStatus::Stalled { consecutive } => {
                        warn!(
                            source = source.name(),
                            timeouts = consecutive,
                            "Acquisition source stalled"
                        );
                        events.attenuate_source(true);
                        events.acquisition_reset_required();
                        events.fault(
                            "acquisition",
                            &OctError::SourceStalled {
                                timeouts: consecutive,
                            },
                        );
                        break ProducerOutcome::Stalled {
                            timeouts: consecutive,
                        };
                    }
                    StallStatus::Waiting { consecutive } => {
                        debug!(consecutive, "Raw buffer wait timed out");
                    }
                    StallStatus::Healthy => {}
                }
            }
            Err(err) => {
                drop(slot);
                events.fault("acquisition", &err);
                if err.is_fatal() {
                    error!(source = source.name(), error = %err, "Acquisition failed");
                    break ProducerOutcome::Failed(err);
                }
                warn!(source = source.name(), error = %err, "Acquisition error, skipping buffer");
            }
        }
    };

    info!(source = source.name(), buffers, ?outcome, "Acquisition stopped");
    ProducerExit {
        source,
        outcome,
        buffers,
    }
}
