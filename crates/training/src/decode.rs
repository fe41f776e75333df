//! Viterbi forced alignment and alignment metrics.

use data_contracts::SILENCE_ID;

const LOG_EPS: f32 = 1e-6;

fn safe_ln(p: f32) -> f32 {
    p.max(LOG_EPS).ln()
}

/// Frame interval of every phone in the target sequence. Skipped silences
/// have no interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alignment {
    pub intervals: Vec<Option<(usize, usize)>>,
}

impl Alignment {
    /// Intervals with skipped phones collapsed to empty spans at the
    /// preceding boundary.
    pub fn dense(&self) -> Vec<(usize, usize)> {
        let mut cursor = 0;
        self.intervals
            .iter()
            .map(|iv| match iv {
                Some((s, e)) => {
                    cursor = *e;
                    (*s, *e)
                }
                None => (cursor, cursor),
            })
            .collect()
    }

    pub fn durations(&self) -> Vec<usize> {
        self.dense().iter().map(|(s, e)| e - s).collect()
    }
}

#[derive(Clone, Copy)]
enum Step {
    Stay,
    Next,
    SkipSilence,
}

/// Align `ph_seq` to `num_frames` frames.
///
/// `frame_logp` is row-major `[num_frames, vocab_size]` log-probabilities and
/// `edge_prob` the per-frame boundary probability. With `skip_silence`,
/// silence phones (id 0) may receive no frames. Returns `None` when the
/// required phones cannot fit.
pub fn viterbi_align(
    frame_logp: &[f32],
    vocab_size: usize,
    edge_prob: &[f32],
    ph_seq: &[u32],
    num_frames: usize,
    skip_silence: bool,
) -> Option<Alignment> {
    let s_len = ph_seq.len();
    if s_len == 0 || num_frames == 0 {
        return None;
    }
    if frame_logp.len() < num_frames * vocab_size || edge_prob.len() < num_frames {
        return None;
    }
    if ph_seq.iter().any(|ph| *ph as usize >= vocab_size) {
        return None;
    }
    let skippable = |s: usize| skip_silence && ph_seq[s] == SILENCE_ID;
    let emit = |t: usize, s: usize| frame_logp[t * vocab_size + ph_seq[s] as usize];

    let mut score = vec![f32::NEG_INFINITY; num_frames * s_len];
    let mut back = vec![Step::Stay; num_frames * s_len];
    score[0] = emit(0, 0);
    if s_len > 1 && skippable(0) {
        score[1] = emit(0, 1);
        back[1] = Step::SkipSilence;
    }

    for t in 1..num_frames {
        let stay = safe_ln(1.0 - edge_prob[t]);
        let go = safe_ln(edge_prob[t]);
        for s in 0..s_len {
            let prev = (t - 1) * s_len;
            let mut best = score[prev + s] + stay;
            let mut step = Step::Stay;
            if s >= 1 {
                let cand = score[prev + s - 1] + go;
                if cand > best {
                    best = cand;
                    step = Step::Next;
                }
            }
            if s >= 2 && skippable(s - 1) {
                let cand = score[prev + s - 2] + go;
                if cand > best {
                    best = cand;
                    step = Step::SkipSilence;
                }
            }
            if best.is_finite() {
                score[t * s_len + s] = best + emit(t, s);
                back[t * s_len + s] = step;
            }
        }
    }

    let last = (num_frames - 1) * s_len;
    let mut state = s_len - 1;
    if s_len > 1 && skippable(s_len - 1) && score[last + s_len - 2] > score[last + s_len - 1] {
        state = s_len - 2;
    }
    if !score[last + state].is_finite() {
        return None;
    }

    let mut intervals: Vec<Option<(usize, usize)>> = vec![None; s_len];
    let mut end = num_frames;
    let mut t = num_frames - 1;
    loop {
        let step = back[t * s_len + state];
        let at_start = t == 0;
        let leaving = !matches!(step, Step::Stay) || at_start;
        if leaving {
            intervals[state] = Some((t, end));
            end = t;
        }
        if at_start {
            break;
        }
        match step {
            Step::Stay => {}
            Step::Next => state -= 1,
            Step::SkipSilence => state -= 2,
        }
        t -= 1;
    }
    Some(Alignment { intervals })
}

fn iou(a: (usize, usize), b: (usize, usize)) -> f32 {
    let inter = a.1.min(b.1).saturating_sub(a.0.max(b.0));
    let union = a.1.max(b.1) - a.0.min(b.0);
    if union == 0 {
        return 1.0;
    }
    inter as f32 / union as f32
}

/// Running totals for `boundary_edit_ratio` and `phone_iou`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlignmentMetrics {
    pub boundary_distance: f64,
    pub total_frames: f64,
    pub iou_sum: f64,
    pub phones: usize,
    pub items: usize,
}

impl AlignmentMetrics {
    /// Compare a predicted alignment with reference intervals of the same phones.
    pub fn update(&mut self, predicted: &Alignment, reference: &[(usize, usize)], num_frames: usize) {
        let pred = predicted.dense();
        if pred.len() != reference.len() {
            return;
        }
        let distance: usize = pred
            .iter()
            .zip(reference)
            .skip(1)
            .map(|(p, r)| p.0.abs_diff(r.0))
            .sum();
        self.boundary_distance += distance as f64;
        self.total_frames += num_frames as f64;
        for (p, r) in pred.iter().zip(reference) {
            self.iou_sum += iou(*p, *r) as f64;
        }
        self.phones += reference.len();
        self.items += 1;
    }

    pub fn boundary_edit_ratio(&self) -> f64 {
        if self.total_frames == 0.0 {
            return 0.0;
        }
        self.boundary_distance / self.total_frames
    }

    pub fn phone_iou(&self) -> f64 {
        if self.phones == 0 {
            return 0.0;
        }
        self.iou_sum / self.phones as f64
    }
}
