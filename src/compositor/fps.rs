// Frame statistics per output
use serde::Serialize;
use std::time::{Duration, Instant};

const DEFAULT_WINDOW: Duration = Duration::from_millis(500);

/// Commit rate of one output, measured over fixed windows
#[derive(Debug)]
pub struct FpsCounter {
    window_start: Instant,
    /// Commits in the current window
    frames: u32,
    /// Rate of the last full window
    fps: f64,
    window: Duration,
    last_commit: Option<Instant>,
    /// Gap between the last two commits
    frame_time: Option<Duration>,
}

impl FpsCounter {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self::starting_at(Instant::now(), window)
    }

    fn starting_at(now: Instant, window: Duration) -> Self {
        Self {
            window_start: now,
            frames: 0,
            fps: 0.0,
            window,
            last_commit: None,
            frame_time: None,
        }
    }

    /// Record a committed frame.
    /// Returns Some(fps) when a window closed
    pub fn tick(&mut self) -> Option<f64> {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&mut self, now: Instant) -> Option<f64> {
        if let Some(last) = self.last_commit {
            self.frame_time = Some(now.saturating_duration_since(last));
        }
        self.last_commit = Some(now);
        self.frames += 1;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed.is_zero() || elapsed < self.window {
            return None;
        }
        self.fps = self.frames as f64 / elapsed.as_secs_f64();
        self.frames = 0;
        self.window_start = now;
        Some(self.fps)
    }

    pub fn fps(&self) -> f64 {
        self.fps_at(Instant::now())
    }

    /// An output that has not committed for two windows reads 0
    pub fn fps_at(&self, now: Instant) -> f64 {
        match self.last_commit {
            Some(last) if now.saturating_duration_since(last) < self.window * 2 => self.fps,
            _ => 0.0,
        }
    }

    pub fn frame_time(&self) -> Option<Duration> {
        self.frame_time
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters reported by the binary with `--json`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameStats {
    pub output: String,
    /// Commits that carried a new buffer
    pub commits: u64,
    /// Commits that only acknowledged a frame request
    pub empty_commits: u64,
    /// Render cycles the output had to sit out
    pub skipped: u64,
    pub commit_failures: u64,
    /// Layers composited in software because a plane rejected them
    pub layer_fallbacks: u64,
    pub fps: f64,
    /// Time between the last two content commits
    pub frame_time_ms: Option<f64>,
}

impl FrameStats {
    pub(crate) fn with_timing(&self, counter: &FpsCounter) -> Self {
        Self {
            fps: counter.fps(),
            frame_time_ms: counter.frame_time().map(|gap| gap.as_secs_f64() * 1000.0),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(100);

    #[test]
    fn test_fps_reports_when_window_closes() {
        let start = Instant::now();
        let mut counter = FpsCounter::starting_at(start, WINDOW);
        for ms in [25, 50, 75] {
            assert!(counter.tick_at(start + Duration::from_millis(ms)).is_none());
        }
        let fps = counter.tick_at(start + WINDOW).unwrap();
        assert!((fps - 40.0).abs() < 1e-6);
        assert_eq!(counter.frame_time(), Some(Duration::from_millis(25)));
    }

    #[test]
    fn test_idle_output_reads_zero() {
        let start = Instant::now();
        let mut counter = FpsCounter::starting_at(start, WINDOW);
        counter.tick_at(start + WINDOW);
        assert!(counter.fps_at(start + WINDOW) > 0.0);
        assert_eq!(counter.fps_at(start + WINDOW * 3), 0.0);
    }

    #[test]
    fn test_stats_serialize() {
        let stats = FrameStats {
            output: "HEADLESS-1".into(),
            commits: 3,
            ..Default::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["output"], "HEADLESS-1");
        assert_eq!(json["commits"], 3);
        assert!(json["frame_time_ms"].is_null());
    }
}
