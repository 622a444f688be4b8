use std::time::{Duration, Instant};

use tracing::info;

/// Frames between two FPS samples.
pub const FPS_SAMPLE_INTERVAL: u64 = 120;

const FPS_ENV: &str = "MPP_DECODE_LOG_FPS";

/// `enabled` wins over the environment when set.
pub fn should_report_fps(enabled: Option<bool>) -> bool {
    enabled.unwrap_or_else(|| {
        std::env::var(FPS_ENV)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    })
}

/// Logs decode throughput every [`FPS_SAMPLE_INTERVAL`] output frames.
#[derive(Debug)]
pub(crate) struct FpsMeter {
    enabled: bool,
    frames: u64,
    window_start: Option<Instant>,
    last_fps: Option<f64>,
}

impl FpsMeter {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            frames: 0,
            window_start: None,
            last_fps: None,
        }
    }

    pub(crate) fn frame(&mut self) {
        if !self.enabled {
            return;
        }
        let now = Instant::now();
        let start = *self.window_start.get_or_insert(now);
        self.frames += 1;
        if self.frames % FPS_SAMPLE_INTERVAL == 0 {
            self.sample(now.saturating_duration_since(start));
            self.window_start = Some(now);
        }
    }

    fn sample(&mut self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return;
        }
        let fps = FPS_SAMPLE_INTERVAL as f64 / secs;
        self.last_fps = Some(fps);
        info!(frames = self.frames, fps = format_args!("{fps:.2}"), "decode fps");
    }

    pub(crate) fn last_fps(&self) -> Option<f64> {
        self.last_fps
    }

    #[cfg(test)]
    fn frames(&self) -> u64 {
        self.frames
    }

    pub(crate) fn reset(&mut self) {
        self.frames = 0;
        self.window_start = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_setting_overrides_environment() {
        assert!(should_report_fps(Some(true)));
        assert!(!should_report_fps(Some(false)));
    }

    #[test]
    fn disabled_meter_counts_nothing() {
        let mut meter = FpsMeter::new(false);
        for _ in 0..FPS_SAMPLE_INTERVAL * 2 {
            meter.frame();
        }
        assert_eq!(meter.frames(), 0);
        assert_eq!(meter.last_fps(), None);
    }

    #[test]
    fn samples_on_interval_and_restarts_after_reset() {
        let mut meter = FpsMeter::new(true);
        for _ in 0..FPS_SAMPLE_INTERVAL - 1 {
            meter.frame();
        }
        assert_eq!(meter.last_fps(), None);

        std::thread::sleep(Duration::from_millis(2));
        meter.frame();
        assert_eq!(meter.frames(), FPS_SAMPLE_INTERVAL);
        assert!(meter.last_fps().is_some_and(|fps| fps > 0.0));

        meter.reset();
        assert_eq!(meter.frames(), 0);
        meter.frame();
        assert_eq!(meter.frames(), 1);
    }
}
