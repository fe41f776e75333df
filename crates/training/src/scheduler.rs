//! Learning-rate and loss-weight schedules.

use std::f64::consts::PI;

/// One-cycle schedule with cosine annealing in both phases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OneCycleSchedule {
    pub max_lr: f64,
    pub total_steps: usize,
    pub pct_start: f64,
    pub div_factor: f64,
    pub final_div_factor: f64,
}

impl OneCycleSchedule {
    pub fn new(max_lr: f64, total_steps: usize) -> Self {
        Self {
            max_lr,
            total_steps,
            pct_start: 0.3,
            div_factor: 25.0,
            final_div_factor: 1e4,
        }
    }

    pub fn initial_lr(&self) -> f64 {
        self.max_lr / self.div_factor
    }

    pub fn min_lr(&self) -> f64 {
        self.initial_lr() / self.final_div_factor
    }

    fn anneal(start: f64, end: f64, pct: f64) -> f64 {
        let cos_out = (PI * pct).cos() + 1.0;
        end + (start - end) / 2.0 * cos_out
    }

    /// Learning rate for optimizer step `step` (0-based). Steps past the end
    /// hold the final rate.
    pub fn lr_at(&self, step: usize) -> f64 {
        let last = self.total_steps.saturating_sub(1) as f64;
        if last <= 0.0 {
            return self.max_lr;
        }
        let step = (step as f64).min(last);
        let warmup_end = (self.pct_start * self.total_steps as f64 - 1.0).max(0.0);
        if step <= warmup_end && warmup_end > 0.0 {
            Self::anneal(self.initial_lr(), self.max_lr, step / warmup_end)
        } else {
            let span = (last - warmup_end).max(1.0);
            Self::anneal(self.max_lr, self.min_lr(), (step - warmup_end) / span)
        }
    }
}

/// Gaussian ramp-up factor `exp(-5 (1 - min(step/total, 1))^2)`.
pub fn ramp_up_factor(step: usize, total_steps: usize) -> f32 {
    if total_steps == 0 {
        return 1.0;
    }
    let progress = (step as f32 / total_steps as f32).min(1.0);
    (-5.0 * (1.0 - progress).powi(2)).exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_cycle_shape() {
        let sched = OneCycleSchedule::new(1e-3, 1001);
        assert!((sched.lr_at(0) - 1e-3 / 25.0).abs() < 1e-12);
        // 30% of 1001 steps, minus one.
        assert!((sched.lr_at(299) - 1e-3).abs() < 1e-8);
        assert!(sched.lr_at(150) > sched.lr_at(0));
        assert!(sched.lr_at(600) < sched.lr_at(300));
        let end = sched.lr_at(1000);
        assert!((end - 1e-3 / 25.0 / 1e4).abs() < 1e-12);
        assert_eq!(sched.lr_at(5000), end);
    }

    #[test]
    fn ramp_up_reaches_one() {
        assert!((ramp_up_factor(0, 100) - (-5.0f32).exp()).abs() < 1e-7);
        assert!(ramp_up_factor(50, 100) < ramp_up_factor(80, 100));
        assert_eq!(ramp_up_factor(100, 100), 1.0);
        assert_eq!(ramp_up_factor(200, 100), 1.0);
    }
}
