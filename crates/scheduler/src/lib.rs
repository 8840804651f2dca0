use std::time::{Duration, Instant};

/// Upper bound applied to every simulation step, in seconds.
pub const MAX_FRAME_DELTA: f32 = 1.0 / 60.0;

/// Timer interval used while the display is not driving frames.
pub const FALLBACK_INTERVAL: Duration = Duration::from_millis(16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Frames follow the display's refresh callback.
    DisplayRefresh,
    /// Fixed timer, used while the view is hidden or occluded.
    FallbackTimer,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTick {
    pub now: Instant,
    pub dt: f32,
    pub frame: u64,
}

#[derive(Debug)]
pub struct FrameScheduler {
    running: bool,
    visible: bool,
    pending: Option<Instant>,
    last_frame: Option<Instant>,
    frames: u64,
}

impl Default for FrameScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameScheduler {
    pub fn new() -> Self {
        Self {
            running: false,
            visible: true,
            pending: None,
            last_frame: None,
            frames: 0,
        }
    }

    pub fn start(&mut self, now: Instant) {
        if self.running {
            return;
        }
        self.running = true;
        self.pending = Some(now);
        tracing::debug!(?now, "frame scheduling started");
    }

    /// Stops scheduling and cancels the pending frame.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.pending = None;
        self.last_frame = None;
        tracing::debug!(frames = self.frames, "frame scheduling stopped");
    }

    pub fn has_pending_frame(&self) -> bool {
        self.pending.is_some()
    }

    pub fn cadence(&self) -> Cadence {
        if self.visible {
            Cadence::DisplayRefresh
        } else {
            Cadence::FallbackTimer
        }
    }

    pub fn set_visible(&mut self, visible: bool, now: Instant) {
        if self.visible == visible {
            return;
        }
        self.visible = visible;
        if self.running {
            self.pending = Some(self.next_after(now));
        }
        tracing::debug!(visible, cadence = ?self.cadence(), "frame cadence changed");
    }

    pub fn ready_for_frame(&self, now: Instant) -> bool {
        self.running && self.pending.is_some_and(|deadline| now >= deadline)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
    }

    /// Consumes the pending frame and returns its clamped timestep.
    pub fn begin_frame(&mut self, now: Instant) -> Option<FrameTick> {
        if !self.ready_for_frame(now) {
            return None;
        }
        let dt = match self.last_frame {
            Some(previous) => clamp_delta(now.saturating_duration_since(previous)),
            None => MAX_FRAME_DELTA,
        };
        self.pending = None;
        self.last_frame = Some(now);
        self.frames += 1;
        Some(FrameTick {
            now,
            dt,
            frame: self.frames,
        })
    }

    /// Schedules the frame after the one just rendered.
    pub fn finish_frame(&mut self, now: Instant) {
        if self.running {
            self.pending = Some(self.next_after(now));
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    fn next_after(&self, now: Instant) -> Instant {
        match self.cadence() {
            Cadence::DisplayRefresh => now,
            Cadence::FallbackTimer => now + FALLBACK_INTERVAL,
        }
    }
}

pub fn clamp_delta(elapsed: Duration) -> f32 {
    elapsed.as_secs_f32().clamp(0.0, MAX_FRAME_DELTA)
}
