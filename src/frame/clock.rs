// Uptime and once-a-second FPS reporting.

use std::time::{Duration, Instant};

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FpsReport {
    pub fps: f64,
    pub uptime: f64,
}

impl FpsReport {
    pub fn title(&self, base: &str) -> String {
        format!("{} [Uptime: {:.0}s, FPS: {:.1}]", base, self.uptime, self.fps)
    }
}

#[derive(Debug)]
pub struct FrameClock {
    start: Instant,
    window_start: Instant,
    frames_in_window: u32,
}

impl FrameClock {
    pub fn new(start: Instant) -> Self {
        Self {
            start,
            window_start: start,
            frames_in_window: 0,
        }
    }

    /// Seconds since the clock started.
    pub fn uptime(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.start).as_secs_f64()
    }

    /// Count a finished frame. Once a full second has passed since the last
    /// report, returns the average frame rate over that window.
    pub fn frame_finished(&mut self, now: Instant) -> Option<FpsReport> {
        self.frames_in_window += 1;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < REPORT_INTERVAL {
            return None;
        }

        let report = FpsReport {
            fps: self.frames_in_window as f64 / elapsed.as_secs_f64(),
            uptime: self.uptime(now),
        };
        self.window_start = now;
        self.frames_in_window = 0;
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sixty_frames_in_one_second_is_sixty_fps() {
        let start = Instant::now();
        let mut clock = FrameClock::new(start);
        // Rounded up so the 60th frame lands on (not just before) one second.
        let step = Duration::from_nanos(16_666_667);

        let mut report = None;
        for frame in 1..=60 {
            report = clock.frame_finished(start + step * frame);
            if frame < 60 {
                assert!(report.is_none(), "reported early at frame {frame}");
            }
        }

        let report = report.expect("a report after one second");
        assert!((report.fps - 60.0).abs() < 0.05);
        assert_eq!(format!("{:.1}", report.fps), "60.0");
    }

    #[test]
    fn window_restarts_after_report() {
        let start = Instant::now();
        let mut clock = FrameClock::new(start);
        assert!(clock.frame_finished(start + Duration::from_millis(1000)).is_some());
        assert!(clock.frame_finished(start + Duration::from_millis(1500)).is_none());
        let report = clock
            .frame_finished(start + Duration::from_millis(2000))
            .unwrap();
        assert!((report.fps - 2.0).abs() < 1e-9);
        assert!((report.uptime - 2.0).abs() < 1e-9);
    }

    #[test]
    fn title_format() {
        let report = FpsReport { fps: 59.94, uptime: 12.4 };
        assert_eq!(report.title("Hello Triangle"), "Hello Triangle [Uptime: 12s, FPS: 59.9]");
    }
}
