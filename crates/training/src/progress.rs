//! Single-line training progress on stderr.

use std::io::Write;
use std::time::Instant;

/// Metric keys never shown on the bar.
const HIDDEN_KEYS: [&str; 1] = ["v_num"];

pub struct ProgressReporter {
    refresh_rate: usize,
    show_steps: bool,
    started: Instant,
    /// Global step at the first reported batch; the rate counts from here.
    first_step: Option<usize>,
    last_width: usize,
    enabled: bool,
}

impl ProgressReporter {
    pub fn new(refresh_rate: usize, show_steps: bool) -> Self {
        Self {
            refresh_rate: refresh_rate.max(1),
            show_steps,
            started: Instant::now(),
            first_step: None,
            last_width: 0,
            enabled: true,
        }
    }

    /// Reporter that formats lines but never prints them.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(1, true)
        }
    }

    pub fn should_refresh(&self, step: usize) -> bool {
        step % self.refresh_rate == 0
    }

    /// Metrics shown on the bar: `steps` (when enabled) followed by the given
    /// metrics, minus hidden keys.
    pub fn metrics_line(&self, global_step: usize, metrics: &[(&str, f32)]) -> String {
        let mut parts = Vec::with_capacity(metrics.len() + 1);
        if self.show_steps {
            parts.push(format!("steps={global_step}"));
        }
        for (key, value) in metrics {
            if HIDDEN_KEYS.contains(key) {
                continue;
            }
            parts.push(format!("{key}={value:.4}"));
        }
        parts.join(", ")
    }

    /// Steps per second since the first batch this reporter saw.
    pub fn rate(&mut self, global_step: usize) -> f32 {
        let first = *self.first_step.get_or_insert_with(|| {
            self.started = Instant::now();
            global_step
        });
        let elapsed = self.started.elapsed().as_secs_f32();
        if elapsed > 0.0 {
            global_step.saturating_sub(first) as f32 / elapsed
        } else {
            0.0
        }
    }

    pub fn line(
        &mut self,
        epoch: usize,
        global_step: usize,
        max_steps: usize,
        metrics: &[(&str, f32)],
    ) -> String {
        let rate = self.rate(global_step);
        format!(
            "epoch {epoch} [{global_step}/{max_steps}] {rate:.2} it/s | {}",
            self.metrics_line(global_step, metrics)
        )
    }

    pub fn on_train_batch_end(
        &mut self,
        epoch: usize,
        global_step: usize,
        max_steps: usize,
        metrics: &[(&str, f32)],
    ) {
        if !self.enabled || !self.should_refresh(global_step) {
            return;
        }
        let line = self.line(epoch, global_step, max_steps, metrics);
        let pad = self.last_width.saturating_sub(line.len());
        self.last_width = line.len();
        let mut err = std::io::stderr().lock();
        let _ = write!(err, "\r{line}{}", " ".repeat(pad));
        let _ = err.flush();
    }

    /// End the current bar line so log output starts on a fresh line.
    pub fn finish_line(&mut self) {
        if self.enabled && self.last_width > 0 {
            eprintln!();
            self.last_width = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_added_and_version_hidden() {
        let bar = ProgressReporter::disabled();
        let line = bar.metrics_line(42, &[("v_num", 3.0), ("loss", 0.5)]);
        assert_eq!(line, "steps=42, loss=0.5000");
    }

    #[test]
    fn steps_can_be_hidden() {
        let bar = ProgressReporter {
            show_steps: false,
            ..ProgressReporter::disabled()
        };
        assert_eq!(bar.metrics_line(1, &[("loss", 1.0)]), "loss=1.0000");
    }

    #[test]
    fn refresh_rate_gates_updates() {
        let bar = ProgressReporter::new(10, true);
        assert!(bar.should_refresh(20));
        assert!(!bar.should_refresh(21));
    }

    #[test]
    fn rate_counts_only_steps_seen_by_this_reporter() {
        let mut bar = ProgressReporter::disabled();
        assert_eq!(bar.rate(5000), 0.0);
        std::thread::sleep(std::time::Duration::from_millis(20));
        let rate = bar.rate(5002);
        assert!(rate > 0.0 && rate <= 2.0 / 0.02, "{rate}");
        assert!(bar.line(3, 5002, 6000, &[]).starts_with("epoch 3 [5002/6000]"));
    }
}
