//! A hung acquisition source triggers attenuate + reset, bounded by the
//! reset budget.

mod common;

use std::time::Duration;

use common::{small_settings, start, wait_for};
use rust_oct::acquisition::{SimulatedDaq, StallMode};
use rust_oct::error::Severity;
use rust_oct::error_recovery::{RetryPolicy, Supervisor};
use rust_oct::events::{ControlEvent, EventStreams};
use rust_oct::pipeline::PipelineStatus;
use rust_oct::OctError;

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        backoff_delay: Duration::from_millis(1),
    }
}

#[test]
fn test_stalled_source_is_reset_and_resumes() {
    let source = SimulatedDaq::new(31)
        .unpaced()
        .with_stall(StallMode::UntilReconfigure { after: 8 });
    let (mut pipeline, mut streams) = start(small_settings(), Box::new(source));
    let mut supervisor = Supervisor::new(fast_retry(), 2);

    let mut status = PipelineStatus::Running;
    assert!(wait_for(Duration::from_secs(10), || {
        status = pipeline.supervise(&mut supervisor).unwrap();
        status != PipelineStatus::Running
    }));
    assert_eq!(status, PipelineStatus::Recovered { resets: 1 });

    // 8 buffers before the stall make two revolutions; more follow the reset.
    assert!(wait_for(Duration::from_secs(10), || pipeline.frames_completed() >= 4));
    assert_eq!(pipeline.supervise(&mut supervisor).unwrap(), PipelineStatus::Running);

    let control = EventStreams::drain(&mut streams.control);
    assert_eq!(
        control,
        vec![
            ControlEvent::AttenuateSource(true),
            ControlEvent::AcquisitionResetRequired,
            ControlEvent::AttenuateSource(false),
        ]
    );
    let faults = EventStreams::drain(&mut streams.faults);
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].severity, Severity::Stall);
    pipeline.shutdown().unwrap();
}

#[test]
fn test_reset_budget_is_enforced() {
    let source = SimulatedDaq::new(32)
        .unpaced()
        .with_stall(StallMode::Permanent { after: 2 });
    let (mut pipeline, mut streams) = start(small_settings(), Box::new(source));
    let mut supervisor = Supervisor::new(fast_retry(), 2);

    let mut outcome = None;
    assert!(wait_for(Duration::from_secs(10), || {
        match pipeline.supervise(&mut supervisor) {
            Ok(_) => false,
            Err(err) => {
                outcome = Some(err);
                true
            }
        }
    }));
    assert!(matches!(outcome, Some(OctError::ResetLimitExceeded(2))));
    assert_eq!(supervisor.resets(), 2);

    let resets = EventStreams::drain(&mut streams.control)
        .into_iter()
        .filter(|e| *e == ControlEvent::AcquisitionResetRequired)
        .count();
    assert_eq!(resets, 3);
    pipeline.shutdown().unwrap();
}
