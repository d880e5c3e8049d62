//! Lookahead frame scheduling against a device clock.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::{error::Error, utils::time::DeviceClock};

// -------------------------------------------------------------------------------------------------

/// A scheduling window in device time: `[start, end)` in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerFrame {
    pub start: f64,
    pub end: f64,
    /// True for the first frame after a (re)start.
    pub is_first: bool,
    /// True for the final frame, which got truncated to the scheduler's stop time.
    pub is_last: bool,
}

impl SchedulerFrame {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Running state of a [`SchedulerState`] or [`LookaheadScheduler`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SchedulerStatus {
    #[default]
    Idle,
    Running,
}

// -------------------------------------------------------------------------------------------------

/// The scheduler's frame state machine, without any timers.
///
/// Consecutive frames never overlap and never leave gaps: each frame starts exactly where
/// the previous one ended. When a stop time is set, the frame which reaches it gets
/// truncated to it, is marked as last frame, and the state machine goes idle.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerState {
    frame_length: f64,
    status: SchedulerStatus,
    next_frame_start: f64,
    ends_at: Option<f64>,
    first_pending: bool,
}

impl SchedulerState {
    /// Default frame length in seconds.
    pub const DEFAULT_FRAME_LENGTH: f64 = 0.1;

    pub fn new(frame_length: f64) -> Result<Self, Error> {
        Self::validate_frame_length(frame_length)?;
        Ok(Self {
            frame_length,
            status: SchedulerStatus::Idle,
            next_frame_start: 0.0,
            ends_at: None,
            first_pending: false,
        })
    }

    pub fn validate_frame_length(frame_length: f64) -> Result<(), Error> {
        if !(frame_length > 0.0) || !frame_length.is_finite() {
            return Err(Error::ParameterError(format!(
                "frame length must be > 0 and finite, but is {frame_length}"
            )));
        }
        Ok(())
    }

    pub fn frame_length(&self) -> f64 {
        self.frame_length
    }

    /// Change the frame length. Applies to the next computed frame.
    pub fn set_frame_length(&mut self, frame_length: f64) -> Result<(), Error> {
        Self::validate_frame_length(frame_length)?;
        self.frame_length = frame_length;
        Ok(())
    }

    pub fn status(&self) -> SchedulerStatus {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.status == SchedulerStatus::Running
    }

    /// Device time at which the next frame starts.
    pub fn next_frame_start(&self) -> f64 {
        self.next_frame_start
    }

    /// Device time at which the scheduler stops, if any.
    pub fn ends_at(&self) -> Option<f64> {
        self.ends_at
    }

    /// (Re)start running from the given device time on, without a stop time.
    pub fn start(&mut self, start_time: f64) {
        self.status = SchedulerStatus::Running;
        self.next_frame_start = start_time;
        self.ends_at = None;
        self.first_pending = true;
    }

    /// Set a stop time. The current frame is not affected, the next computed frame gets
    /// truncated to it.
    pub fn stop_at(&mut self, stop_time: f64) {
        self.ends_at = Some(stop_time);
    }

    /// Stop immediately. Returns true when the state was running.
    pub fn stop(&mut self) -> bool {
        let was_running = self.is_running();
        self.status = SchedulerStatus::Idle;
        was_running
    }

    /// Compute the next frame, or None when not running.
    pub fn next_frame(&mut self) -> Option<SchedulerFrame> {
        if !self.is_running() {
            return None;
        }
        let start = self.next_frame_start;
        let mut end = start + self.frame_length;
        if let Some(ends_at) = self.ends_at {
            end = end.min(ends_at.max(start));
        }
        self.next_frame_start = end;
        let is_last = self.ends_at.is_some_and(|ends_at| end >= ends_at);
        if is_last {
            self.status = SchedulerStatus::Idle;
        }
        let is_first = std::mem::take(&mut self.first_pending);
        Some(SchedulerFrame {
            start,
            end,
            is_first,
            is_last,
        })
    }
}

// -------------------------------------------------------------------------------------------------

enum SchedulerCommand {
    Start(f64),
    StopAt(f64),
    Stop,
    SetFrameLength(f64),
    Shutdown,
}

// -------------------------------------------------------------------------------------------------

/// Invokes a frame callback for consecutive lookahead windows of device time.
///
/// The scheduler runs on its own thread. When started, it immediately invokes the frame
/// callback with the first frame. Each following frame gets computed as soon as the device
/// clock reaches the start of the previously computed frame, so frames are always handed out
/// one frame length ahead of the device clock, and parameter changes apply with a latency of
/// at most two frames. Waits get recalculated against the device clock on every tick, so the
/// scheduler never drifts away from the device's time.
///
/// The stop callback fires when a running scheduler gets stopped explicitly, or when the
/// device clock reached the stop time after the last frame got computed. Restarting a
/// running scheduler does not fire it.
pub struct LookaheadScheduler {
    command_send: Sender<SchedulerCommand>,
    is_running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl LookaheadScheduler {
    /// Upper bound for a single wait on the device clock. Clocks may stall or jump, so the
    /// thread re-checks the clock at least this often.
    const MAX_WAIT: Duration = Duration::from_millis(10);

    /// Create a new idle scheduler with its own thread.
    pub fn new<C, F, S>(
        clock: C,
        frame_length: f64,
        on_frame: F,
        on_stop: S,
    ) -> Result<Self, Error>
    where
        C: DeviceClock + 'static,
        F: FnMut(&SchedulerFrame) + Send + 'static,
        S: FnMut() + Send + 'static,
    {
        let state = SchedulerState::new(frame_length)?;
        let (command_send, command_recv) = unbounded();
        let is_running = Arc::new(AtomicBool::new(false));
        let thread = thread::Builder::new()
            .name("grainflow_scheduler".to_string())
            .spawn({
                let is_running = Arc::clone(&is_running);
                move || {
                    Self::run(clock, state, command_recv, is_running, on_frame, on_stop);
                }
            })?;
        Ok(Self {
            command_send,
            is_running,
            thread: Some(thread),
        })
    }

    /// True when the scheduler is running or waiting for its stop time. Updated
    /// asynchronously by the scheduler thread.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Start running from the given device time on. Restarts a running scheduler and
    /// clears any stop time.
    pub fn schedule_start(&self, start_time: f64) -> Result<(), Error> {
        self.is_running.store(true, Ordering::Release);
        self.send(SchedulerCommand::Start(start_time))
    }

    /// Stop when the device time reaches the given stop time. Frames which already got
    /// computed are not affected.
    pub fn schedule_stop(&self, stop_time: f64) -> Result<(), Error> {
        self.send(SchedulerCommand::StopAt(stop_time))
    }

    /// Stop immediately. Grains which already got scheduled keep playing.
    pub fn stop(&self) -> Result<(), Error> {
        self.send(SchedulerCommand::Stop)
    }

    /// Change the frame length. Applies to the next computed frame.
    pub fn set_frame_length(&self, frame_length: f64) -> Result<(), Error> {
        SchedulerState::validate_frame_length(frame_length)?;
        self.send(SchedulerCommand::SetFrameLength(frame_length))
    }

    fn send(&self, command: SchedulerCommand) -> Result<(), Error> {
        self.command_send.send(command).map_err(Error::from)
    }

    fn run<C, F, S>(
        clock: C,
        mut state: SchedulerState,
        command_recv: Receiver<SchedulerCommand>,
        is_running: Arc<AtomicBool>,
        mut on_frame: F,
        mut on_stop: S,
    ) where
        C: DeviceClock,
        F: FnMut(&SchedulerFrame),
        S: FnMut(),
    {
        if let Err(err) = audio_thread_priority::promote_current_thread_to_real_time(0, 44100) {
            log::warn!("Failed to promote scheduler thread to real-time priority: {err}");
        }
        log::debug!("Scheduler thread started");

        let mut next_tick_at = 0.0;
        // device time at which the stop callback fires after the last frame
        let mut pending_stop_at: Option<f64> = None;
        loop {
            let wait_until = if state.is_running() {
                Some(next_tick_at)
            } else {
                pending_stop_at
            };
            let command = if let Some(wait_until) = wait_until {
                let wait = (wait_until - clock.current_time()).max(0.0);
                let timeout = if wait.is_finite() {
                    Duration::from_secs_f64(wait).min(Self::MAX_WAIT)
                } else {
                    Duration::ZERO
                };
                match command_recv.recv_timeout(timeout) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                match command_recv.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                }
            };

            let mut tick = false;
            match command {
                None => {
                    let now = clock.current_time();
                    if state.is_running() {
                        tick = now >= next_tick_at;
                    } else if pending_stop_at.is_some_and(|stop_at| now >= stop_at) {
                        pending_stop_at = None;
                        log::debug!("Scheduler reached its stop time at {now:.3}");
                        on_stop();
                    }
                }
                Some(SchedulerCommand::Start(start_time)) => {
                    log::debug!("Scheduler starting at {start_time:.3}");
                    pending_stop_at = None;
                    state.start(start_time);
                    tick = true;
                }
                Some(SchedulerCommand::StopAt(stop_time)) => {
                    log::debug!("Scheduler stopping at {stop_time:.3}");
                    state.stop_at(stop_time);
                }
                Some(SchedulerCommand::Stop) => {
                    let was_running = state.stop();
                    if was_running || pending_stop_at.take().is_some() {
                        log::debug!("Scheduler stopped");
                        on_stop();
                    }
                }
                Some(SchedulerCommand::SetFrameLength(frame_length)) => {
                    if let Err(err) = state.set_frame_length(frame_length) {
                        log::warn!("Ignoring frame length change: {err}");
                    }
                }
                Some(SchedulerCommand::Shutdown) => break,
            }

            if tick {
                if let Some(frame) = state.next_frame() {
                    on_frame(&frame);
                    if frame.is_last {
                        let ends_at = state.ends_at().unwrap_or(frame.end);
                        pending_stop_at = Some(ends_at.min(frame.end));
                    } else {
                        next_tick_at = frame.start;
                    }
                }
            }
            is_running.store(
                state.is_running() || pending_stop_at.is_some(),
                Ordering::Release,
            );
        }
        log::debug!("Scheduler thread finished");
    }
}

impl Drop for LookaheadScheduler {
    fn drop(&mut self) {
        let _ = self.command_send.send(SchedulerCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if let Err(payload) = thread.join() {
                log::error!(
                    "Scheduler thread panicked: {}",
                    panic_message::panic_message(&payload)
                );
            }
        }
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::time::ManualClock;

    const RECV_TIMEOUT: Duration = Duration::from_secs(2);

    #[test]
    fn contiguous_frames() -> Result<(), Error> {
        let mut state = SchedulerState::new(0.1)?;
        assert!(state.next_frame().is_none());
        state.start(0.0);
        let frames = (0..5).filter_map(|_| state.next_frame()).collect::<Vec<_>>();
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0].start, 0.0);
        for pair in frames.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert!((frames[4].end - 0.5).abs() < 1e-9);
        assert!(frames[0].is_first);
        assert!(frames[1..].iter().all(|f| !f.is_first));
        assert!(frames.iter().all(|f| !f.is_last));
        assert!(state.is_running());
        Ok(())
    }

    #[test]
    fn truncated_last_frame() -> Result<(), Error> {
        let mut state = SchedulerState::new(0.1)?;
        state.start(1.0);
        state.next_frame();
        state.stop_at(1.25);
        let frame = state.next_frame().unwrap();
        assert!(!frame.is_last);
        let frame = state.next_frame().unwrap();
        assert!(frame.is_last);
        assert_eq!(frame.end, 1.25);
        assert!((frame.duration() - 0.05).abs() < 1e-9);
        assert_eq!(state.status(), SchedulerStatus::Idle);
        assert!(state.next_frame().is_none());

        // stop times in the past end with an empty frame
        state.start(2.0);
        state.stop_at(1.0);
        let frame = state.next_frame().unwrap();
        assert!(frame.is_last);
        assert_eq!((frame.start, frame.end), (2.0, 2.0));

        // restarting clears the stop time
        state.start(3.0);
        assert_eq!(state.ends_at(), None);
        Ok(())
    }

    #[test]
    fn invalid_frame_length() {
        assert!(SchedulerState::new(0.0).is_err());
        assert!(SchedulerState::new(-1.0).is_err());
        assert!(SchedulerState::new(f64::NAN).is_err());
        assert!(SchedulerState::new(f64::INFINITY).is_err());
    }

    #[test]
    fn ticks_follow_device_clock() -> Result<(), Error> {
        let clock = ManualClock::new(0.0);
        let (frame_send, frame_recv) = unbounded();
        let (stop_send, stop_recv) = unbounded();
        let scheduler = LookaheadScheduler::new(
            clock.clone(),
            0.1,
            move |frame| {
                let _ = frame_send.send(*frame);
            },
            move || {
                let _ = stop_send.send(());
            },
        )?;

        // the first two frames get computed right away
        scheduler.schedule_start(0.0)?;
        let mut frames = vec![
            frame_recv.recv_timeout(RECV_TIMEOUT).unwrap(),
            frame_recv.recv_timeout(RECV_TIMEOUT).unwrap(),
        ];
        for _ in 0..3 {
            // no tick before the device time reached the start of the last frame
            assert_eq!(
                frame_recv.recv_timeout(Duration::from_millis(30)),
                Err(RecvTimeoutError::Timeout)
            );
            let last = *frames.last().unwrap();
            clock.set_time(last.start);
            let frame = frame_recv.recv_timeout(RECV_TIMEOUT).unwrap();
            // frames are handed out one frame ahead of the device time
            assert!(frame.start > clock.current_time());
            frames.push(frame);
        }
        assert_eq!(frames[0].start, 0.0);
        for pair in frames.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert!((frames[4].end - 0.5).abs() < 1e-9);

        // auto stop at the stop time
        scheduler.schedule_stop(0.55)?;
        thread::sleep(Duration::from_millis(50));
        clock.set_time(0.4);
        let last = frame_recv.recv_timeout(RECV_TIMEOUT).unwrap();
        assert!(last.is_last);
        assert_eq!(last.end, 0.55);
        // the stop callback waits for the device time to reach the stop time
        assert!(stop_recv.recv_timeout(Duration::from_millis(30)).is_err());
        assert!(scheduler.is_running());
        clock.set_time(0.55);
        assert!(stop_recv.recv_timeout(RECV_TIMEOUT).is_ok());
        assert!(frame_recv.recv_timeout(Duration::from_millis(30)).is_err());
        Ok(())
    }

    #[test]
    fn explicit_stop_fires_callback() -> Result<(), Error> {
        let clock = ManualClock::new(10.0);
        let (frame_send, frame_recv) = unbounded();
        let (stop_send, stop_recv) = unbounded();
        let scheduler = LookaheadScheduler::new(
            clock.clone(),
            0.1,
            move |frame| {
                let _ = frame_send.send(*frame);
            },
            move || {
                let _ = stop_send.send(());
            },
        )?;

        // stopping an idle scheduler does nothing
        scheduler.stop()?;
        assert!(stop_recv.recv_timeout(Duration::from_millis(50)).is_err());

        scheduler.schedule_start(10.0)?;
        assert!(frame_recv.recv_timeout(RECV_TIMEOUT).is_ok());
        // restarting does not stop
        scheduler.schedule_start(10.0)?;
        assert!(frame_recv.recv_timeout(RECV_TIMEOUT).is_ok());
        assert!(stop_recv.recv_timeout(Duration::from_millis(50)).is_err());

        scheduler.stop()?;
        assert!(stop_recv.recv_timeout(RECV_TIMEOUT).is_ok());

        // no more frames after a stop, even when the device time moves on
        while frame_recv.try_recv().is_ok() {}
        for step in 1..=5 {
            clock.set_time(10.0 + step as f64 * 0.1);
            assert_eq!(
                frame_recv.recv_timeout(Duration::from_millis(30)),
                Err(RecvTimeoutError::Timeout)
            );
        }
        assert!(!scheduler.is_running());
        Ok(())
    }
}
