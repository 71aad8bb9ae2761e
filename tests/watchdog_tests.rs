//! Watchdog Tests
//!
//! Tests for:
//! - Liveness of regularly pinged frames
//! - Exactly-once hang reports for stalled frames
//! - Hang retirement through the scheduler's fault channel
//! - Pinging from worker threads
//! - Frames rejected before submission leave no watchdog trace

use std::sync::Arc;
use std::time::Duration;

use kairos::device::HeadlessDevice;
use kairos::errors::{DeviceError, FrameFault, HangDetected, SchedulingError};
use kairos::frame::{FrameId, FrameScheduler, FrameTicket, Pass, Watchdog, WatchdogState};
use kairos::settings::{SchedulerSettings, WatchdogSettings};
use kairos::utils::ManualClock;

const TIMEOUT: Duration = Duration::from_millis(40);
const HALF: Duration = Duration::from_millis(20);

fn watchdog() -> (ManualClock, Watchdog, flume::Receiver<HangDetected>) {
    let clock = ManualClock::new();
    let (tx, rx) = flume::unbounded();
    let watchdog = Watchdog::new(Arc::new(clock.clone()), move |hang| {
        tx.send(hang).unwrap();
    });
    (clock, watchdog, rx)
}

fn simple_frame(ticket: &mut FrameTicket) {
    ticket
        .add(Pass::compute("simulate").write("field", 1024))
        .unwrap();
    ticket.add(Pass::render("draw").read("field")).unwrap();
}

// ============================================================================
// Standalone watchdog
// ============================================================================

#[test]
fn test_frames_pinged_every_half_timeout_never_hang() {
    let (clock, watchdog, hangs) = watchdog();
    let mut active: Vec<FrameId> = Vec::new();

    for i in 1..=100 {
        let frame = FrameId(i);
        watchdog.register(frame, (i % 3) as usize, TIMEOUT);
        active.push(frame);

        clock.advance(HALF);
        for &frame in &active {
            assert!(watchdog.ping(frame));
        }
        assert_eq!(watchdog.scan(), 0);

        if active.len() == 3 {
            assert!(watchdog.complete(active.remove(0)));
        }
    }

    assert_eq!(watchdog.hangs_detected(), 0);
    assert!(hangs.try_recv().is_err());
    assert_eq!(watchdog.state(FrameId(1)), Some(WatchdogState::Completed));
}

#[test]
fn test_each_stalled_frame_is_reported_exactly_once() {
    let (clock, watchdog, hangs) = watchdog();
    let stalled = [FrameId(2), FrameId(5)];
    for i in 1..=6 {
        watchdog.register(FrameId(i), 0, TIMEOUT);
    }

    for _ in 0..10 {
        clock.advance(HALF);
        for i in 1..=6 {
            let frame = FrameId(i);
            if !stalled.contains(&frame) {
                assert!(watchdog.ping(frame));
            }
        }
        watchdog.scan();
    }

    let mut reported: Vec<FrameId> = hangs.try_iter().map(|h| h.frame).collect();
    reported.sort();
    assert_eq!(reported, stalled);
    assert_eq!(watchdog.hangs_detected(), 2);

    for frame in stalled {
        assert_eq!(watchdog.state(frame), Some(WatchdogState::Hung));
        assert!(!watchdog.ping(frame), "a hung frame cannot be revived");
        assert!(!watchdog.complete(frame));
    }
    assert_eq!(watchdog.state(FrameId(1)), Some(WatchdogState::Submitted));
    assert_eq!(watchdog.active(), 4);
}

#[test]
fn test_hang_report_describes_the_silence() {
    let (clock, watchdog, hangs) = watchdog();
    watchdog.register(FrameId(7), 2, TIMEOUT);

    clock.advance(TIMEOUT);
    assert_eq!(watchdog.scan(), 0);

    clock.advance(Duration::from_millis(1));
    assert_eq!(watchdog.scan(), 1);
    assert_eq!(
        hangs.try_recv().unwrap(),
        HangDetected {
            frame: FrameId(7),
            slot: 2,
            silent_for: TIMEOUT + Duration::from_millis(1),
            timeout: TIMEOUT,
        }
    );
}

#[test]
fn test_worker_thread_pings_keep_a_frame_alive() {
    let (clock, watchdog, _hangs) = watchdog();
    watchdog.register(FrameId(1), 0, TIMEOUT);

    let pinger = watchdog.pinger();
    let worker = {
        let clock = clock.clone();
        std::thread::spawn(move || {
            for _ in 0..5 {
                clock.advance(HALF);
                assert!(pinger.ping(FrameId(1)));
            }
        })
    };
    worker.join().unwrap();

    assert_eq!(watchdog.scan(), 0);
    let entry = watchdog.entry(FrameId(1)).unwrap();
    assert_eq!(entry.pings, 5);
    assert_eq!(entry.last_ping_time, HALF * 5);
}

// ============================================================================
// Through the scheduler
// ============================================================================

#[test]
fn test_hung_frame_is_retired_and_reported() -> anyhow::Result<()> {
    let clock = ManualClock::new();
    let device = Arc::new(HeadlessDevice::new());
    let scheduler = FrameScheduler::with_clock(
        device.clone(),
        SchedulerSettings::default()
            .with_frames_in_flight(1)
            .with_watchdog(
                WatchdogSettings::default()
                    .with_timeout(TIMEOUT)
                    .with_poll_interval(Duration::from_secs(3600)),
            ),
        Arc::new(clock.clone()),
    )?;
    let faults = scheduler.faults();
    let watchdog = scheduler.watchdog().unwrap();

    let mut ticket = scheduler.begin_frame();
    let frame = ticket.id();
    simple_frame(&mut ticket);
    scheduler.commit_frame(ticket)?;
    assert_eq!(watchdog.state(frame), Some(WatchdogState::Submitted));

    clock.advance(HALF);
    assert!(scheduler.ping(frame));
    assert_eq!(watchdog.scan(), 0);

    clock.advance(TIMEOUT + Duration::from_millis(1));
    watchdog.scan();
    assert_eq!(watchdog.hangs_detected(), 1);
    assert_eq!(scheduler.poll(), 1);

    match faults.try_recv()? {
        FrameFault::Hang(hang) => assert_eq!(hang.frame, frame),
        other => panic!("expected a hang, got {other:?}"),
    }
    assert_eq!(scheduler.in_flight(), 0);
    assert_eq!(scheduler.outstanding_tickets(), 0);
    assert_eq!(scheduler.arena_stats().live_allocations, 0);
    assert_eq!(scheduler.stats().hung, 1);

    // The device finishing the retired frame afterwards changes nothing.
    assert_eq!(device.run_fifo(), 1);
    assert_eq!(scheduler.stats().completed, 0);
    assert!(faults.try_recv().is_err());
    assert!(scheduler.try_begin_frame().is_some());
    Ok(())
}

#[test]
fn test_completed_frame_is_not_reported_as_hung() -> anyhow::Result<()> {
    let clock = ManualClock::new();
    let device = Arc::new(HeadlessDevice::new());
    let scheduler = FrameScheduler::with_clock(
        device.clone(),
        SchedulerSettings::default().with_watchdog(
            WatchdogSettings::default()
                .with_timeout(TIMEOUT)
                .with_poll_interval(Duration::from_secs(3600)),
        ),
        Arc::new(clock.clone()),
    )?;

    let mut ticket = scheduler.begin_frame();
    let frame = ticket.id();
    simple_frame(&mut ticket);
    scheduler.commit_frame(ticket)?;
    device.run_fifo();

    clock.advance(TIMEOUT * 4);
    let watchdog = scheduler.watchdog().unwrap();
    assert_eq!(watchdog.scan(), 0);
    assert_eq!(watchdog.state(frame), Some(WatchdogState::Completed));
    assert_eq!(scheduler.stats().completed, 1);
    assert!(scheduler.faults().try_recv().is_err());
    Ok(())
}

#[test]
fn test_frame_that_failed_to_encode_leaves_no_watchdog_history() -> anyhow::Result<()> {
    let clock = ManualClock::new();
    let device = Arc::new(HeadlessDevice::new());
    let scheduler = FrameScheduler::with_clock(
        device.clone(),
        SchedulerSettings::default().with_watchdog(
            WatchdogSettings::default()
                .with_timeout(TIMEOUT)
                .with_poll_interval(Duration::from_secs(3600)),
        ),
        Arc::new(clock.clone()),
    )?;
    let watchdog = scheduler.watchdog().unwrap();

    device.lose_device();
    let mut ticket = scheduler.begin_frame();
    let frame = ticket.id();
    simple_frame(&mut ticket);
    assert_eq!(
        scheduler.commit_frame(ticket),
        Err(SchedulingError::Device(DeviceError::Lost))
    );

    assert_eq!(watchdog.state(frame), None);
    assert_eq!(watchdog.active(), 0);
    clock.advance(TIMEOUT * 2);
    assert_eq!(watchdog.scan(), 0);
    assert_eq!(scheduler.outstanding_tickets(), 0);
    Ok(())
}

#[test]
fn test_blocked_begin_frame_recovers_a_hung_slot() -> anyhow::Result<()> {
    let device = Arc::new(HeadlessDevice::new());
    let scheduler = FrameScheduler::new(
        device.clone(),
        SchedulerSettings::default()
            .with_frames_in_flight(1)
            .with_watchdog(
                WatchdogSettings::default()
                    .with_timeout(Duration::from_millis(30))
                    .with_poll_interval(Duration::from_millis(5)),
            ),
    )?;

    let mut ticket = scheduler.begin_frame();
    let stuck = ticket.id();
    simple_frame(&mut ticket);
    scheduler.commit_frame(ticket)?;

    // Never driven: only the watchdog can free the slot.
    let next = scheduler
        .begin_frame_timeout(Duration::from_secs(5))
        .expect("hung slot was never recovered");
    assert_ne!(next.id(), stuck);
    assert!(matches!(
        scheduler.faults().try_recv()?,
        FrameFault::Hang(HangDetected { frame, .. }) if frame == stuck
    ));
    Ok(())
}

#[test]
fn test_scheduler_pinger_works_from_another_thread() -> anyhow::Result<()> {
    let clock = ManualClock::new();
    let device = Arc::new(HeadlessDevice::new());
    let scheduler = FrameScheduler::with_clock(
        device.clone(),
        SchedulerSettings::default().with_watchdog(
            WatchdogSettings::default()
                .with_timeout(TIMEOUT)
                .with_poll_interval(Duration::from_secs(3600)),
        ),
        Arc::new(clock.clone()),
    )?;

    let mut ticket = scheduler.begin_frame();
    let frame = ticket.id();
    simple_frame(&mut ticket);
    scheduler.commit_frame(ticket)?;

    let pinger = scheduler.pinger();
    std::thread::spawn(move || assert!(pinger.ping(frame)))
        .join()
        .unwrap();

    let watchdog = scheduler.watchdog().unwrap();
    assert!(watchdog.entry(frame).unwrap().pings >= 1);

    device.run_fifo();
    assert!(!scheduler.ping(frame));
    Ok(())
}
