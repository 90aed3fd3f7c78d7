//! Token sampling: penalties plus the top-k / tail-free / typical / top-p
//! chain, greedy argmax, and the two Mirostat controllers.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone)]
pub struct Params {
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub tfs_z: f32,
    pub typical_p: f32,
    pub repeat_penalty: f32,
    pub repeat_last_n: i32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub mirostat: i32,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub penalize_newline: bool,
    pub logit_bias: HashMap<i32, f32>,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: i32,
    logit: f32,
    p: f32,
}

/// Per-predict sampling state: the RNG stream and the Mirostat running mean.
/// Created fresh for every predict call.
pub struct Sampler {
    rng: StdRng,
    mu: Option<f32>,
}

impl Sampler {
    pub fn new(seed: u64) -> Self {
        Sampler {
            rng: StdRng::seed_from_u64(seed),
            mu: None,
        }
    }

    /// Pick the next token id from raw logits. `last_tokens` is the window of
    /// committed token ids, oldest first.
    pub fn sample(
        &mut self,
        logits: &mut [f32],
        last_tokens: &[i32],
        newline_token: i32,
        params: &Params,
    ) -> i32 {
        for (&id, &bias) in &params.logit_bias {
            if let Some(l) = logits.get_mut(id as usize) {
                *l += bias;
            }
        }

        let newline_logit = logits.get(newline_token as usize).copied();

        let mut candidates: Vec<Candidate> = logits
            .iter()
            .enumerate()
            .map(|(id, &logit)| Candidate {
                id: id as i32,
                logit,
                p: 0.0,
            })
            .collect();

        let window = if params.repeat_last_n < 0 {
            last_tokens
        } else {
            let n = (params.repeat_last_n as usize).min(last_tokens.len());
            &last_tokens[last_tokens.len() - n..]
        };
        apply_penalties(&mut candidates, window, params);

        if !params.penalize_newline {
            if let Some(logit) = newline_logit {
                if let Some(c) = candidates.iter_mut().find(|c| c.id == newline_token) {
                    c.logit = logit;
                }
            }
        }

        if params.temperature <= 0.0 {
            return greedy(&candidates);
        }

        match params.mirostat {
            1 => {
                temperature(&mut candidates, params.temperature);
                self.mirostat_v1(candidates, params)
            }
            2 => {
                temperature(&mut candidates, params.temperature);
                self.mirostat_v2(candidates, params)
            }
            _ => {
                top_k(&mut candidates, params.top_k);
                tail_free(&mut candidates, params.tfs_z);
                typical(&mut candidates, params.typical_p);
                top_p(&mut candidates, params.top_p);
                temperature(&mut candidates, params.temperature);
                self.pick(&mut candidates)
            }
        }
    }

    /// Categorical draw over the remaining candidates.
    fn pick(&mut self, candidates: &mut Vec<Candidate>) -> i32 {
        softmax(candidates);
        let r: f32 = self.rng.gen();
        let mut cumulative = 0.0;
        for c in candidates.iter() {
            cumulative += c.p;
            if cumulative >= r {
                return c.id;
            }
        }
        candidates.last().map(|c| c.id).unwrap_or(0)
    }

    fn mirostat_v1(&mut self, mut candidates: Vec<Candidate>, params: &Params) -> i32 {
        let tau = params.mirostat_tau;
        let mu = *self.mu.get_or_insert(2.0 * tau);
        let n_vocab = candidates.len() as f32;

        softmax(&mut candidates);

        // Estimate the Zipf exponent from the head of the distribution.
        let m = 100.min(candidates.len().saturating_sub(1));
        let mut sum_ti_bi = 0.0f32;
        let mut sum_ti_sq = 0.0f32;
        for i in 0..m {
            let t_i = ((i as f32 + 2.0) / (i as f32 + 1.0)).ln();
            let b_i = (candidates[i].p / candidates[i + 1].p.max(f32::MIN_POSITIVE)).ln();
            sum_ti_bi += t_i * b_i;
            sum_ti_sq += t_i * t_i;
        }
        let s_hat = if sum_ti_sq > 0.0 { sum_ti_bi / sum_ti_sq } else { 1.0 };

        let epsilon_hat = s_hat - 1.0;
        let k = ((epsilon_hat * 2.0f32.powf(mu)) / (1.0 - n_vocab.powf(-epsilon_hat)))
            .powf(1.0 / s_hat);
        let k = (k.round() as i32).max(1);

        top_k(&mut candidates, k);
        let id = self.pick(&mut candidates);
        self.update_mu(&candidates, id, params);
        id
    }

    fn mirostat_v2(&mut self, mut candidates: Vec<Candidate>, params: &Params) -> i32 {
        let mu = *self.mu.get_or_insert(2.0 * params.mirostat_tau);

        softmax(&mut candidates);

        // Drop every candidate whose surprise exceeds mu, keeping at least one.
        let keep = candidates
            .iter()
            .take_while(|c| -c.p.max(f32::MIN_POSITIVE).log2() <= mu)
            .count()
            .max(1);
        candidates.truncate(keep);

        let id = self.pick(&mut candidates);
        self.update_mu(&candidates, id, params);
        id
    }

    fn update_mu(&mut self, candidates: &[Candidate], id: i32, params: &Params) {
        let observed = candidates
            .iter()
            .find(|c| c.id == id)
            .map(|c| -c.p.max(f32::MIN_POSITIVE).log2())
            .unwrap_or(0.0);
        let e = observed - params.mirostat_tau;
        if let Some(mu) = self.mu.as_mut() {
            *mu -= params.mirostat_eta * e;
        }
    }
}

fn apply_penalties(candidates: &mut [Candidate], window: &[i32], params: &Params) {
    if window.is_empty() {
        return;
    }

    let mut counts: HashMap<i32, u32> = HashMap::new();
    for &id in window {
        *counts.entry(id).or_default() += 1;
    }

    for c in candidates.iter_mut() {
        let Some(&count) = counts.get(&c.id) else {
            continue;
        };
        if params.repeat_penalty != 1.0 {
            if c.logit <= 0.0 {
                c.logit *= params.repeat_penalty;
            } else {
                c.logit /= params.repeat_penalty;
            }
        }
        c.logit -=
            count as f32 * params.frequency_penalty + params.presence_penalty;
    }
}

fn greedy(candidates: &[Candidate]) -> i32 {
    candidates
        .iter()
        .max_by(|a, b| a.logit.total_cmp(&b.logit))
        .map(|c| c.id)
        .unwrap_or(0)
}

/// Sort descending by logit and fill in normalised probabilities.
fn softmax(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.logit.total_cmp(&a.logit));
    let max = candidates.first().map(|c| c.logit).unwrap_or(0.0);
    let mut sum = 0.0f32;
    for c in candidates.iter_mut() {
        c.p = (c.logit - max).exp();
        sum += c.p;
    }
    for c in candidates.iter_mut() {
        c.p /= sum;
    }
}

fn top_k(candidates: &mut Vec<Candidate>, k: i32) {
    let k = if k <= 0 {
        candidates.len()
    } else {
        (k as usize).min(candidates.len())
    };
    candidates.sort_by(|a, b| b.logit.total_cmp(&a.logit));
    candidates.truncate(k.max(1));
}

fn top_p(candidates: &mut Vec<Candidate>, p: f32) {
    if p >= 1.0 || candidates.len() <= 1 {
        return;
    }
    softmax(candidates);
    let mut cumulative = 0.0f32;
    let mut keep = candidates.len();
    for (i, c) in candidates.iter().enumerate() {
        cumulative += c.p;
        if cumulative > p {
            keep = i + 1;
            break;
        }
    }
    candidates.truncate(keep.max(1));
}

/// Tail-free sampling: cut the tail where the curvature of the sorted
/// probability distribution flattens out.
fn tail_free(candidates: &mut Vec<Candidate>, z: f32) {
    if z >= 1.0 || candidates.len() <= 2 {
        return;
    }
    softmax(candidates);

    let first: Vec<f32> = candidates
        .windows(2)
        .map(|w| w[0].p - w[1].p)
        .collect();
    let mut second: Vec<f32> = first.windows(2).map(|w| (w[0] - w[1]).abs()).collect();
    let sum: f32 = second.iter().sum();
    if sum > 0.0 {
        for s in second.iter_mut() {
            *s /= sum;
        }
    }

    let mut cumulative = 0.0f32;
    let mut keep = candidates.len();
    for (i, s) in second.iter().enumerate() {
        cumulative += s;
        if cumulative > z {
            keep = i + 1;
            break;
        }
    }
    candidates.truncate(keep.max(1));
}

/// Locally-typical sampling: prefer tokens whose surprise is close to the
/// entropy of the whole distribution.
fn typical(candidates: &mut Vec<Candidate>, p: f32) {
    if p >= 1.0 || candidates.len() <= 1 {
        return;
    }
    softmax(candidates);

    let entropy: f32 = candidates
        .iter()
        .map(|c| {
            let p = c.p.max(f32::MIN_POSITIVE);
            -p * p.ln()
        })
        .sum();

    let mut scored: Vec<(f32, Candidate)> = candidates
        .iter()
        .map(|c| {
            let surprise = -c.p.max(f32::MIN_POSITIVE).ln();
            ((surprise - entropy).abs(), *c)
        })
        .collect();
    scored.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut cumulative = 0.0f32;
    let mut keep = scored.len();
    for (i, (_, c)) in scored.iter().enumerate() {
        cumulative += c.p;
        if cumulative >= p {
            keep = i + 1;
            break;
        }
    }

    *candidates = scored
        .into_iter()
        .take(keep.max(1))
        .map(|(_, c)| c)
        .collect();
}

fn temperature(candidates: &mut [Candidate], t: f32) {
    for c in candidates.iter_mut() {
        c.logit /= t;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Params {
        Params {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            tfs_z: 1.0,
            typical_p: 1.0,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            penalize_newline: true,
            logit_bias: HashMap::new(),
        }
    }

    #[test]
    fn greedy_picks_argmax() {
        let mut p = params();
        p.temperature = 0.0;
        let mut sampler = Sampler::new(0);
        let mut logits = vec![0.1, 2.5, 0.3, 1.0];
        assert_eq!(sampler.sample(&mut logits, &[], 0, &p), 1);
    }

    #[test]
    fn repeat_penalty_discourages_recent_tokens() {
        let mut p = params();
        p.temperature = 0.0;
        p.repeat_penalty = 10.0;
        let mut sampler = Sampler::new(0);
        // Token 1 leads, but it was just emitted and the penalty drops it
        // below token 2.
        let mut logits = vec![0.1, 2.5, 2.0, 1.0];
        assert_eq!(sampler.sample(&mut logits, &[1], 0, &p), 2);
    }

    #[test]
    fn logit_bias_is_additive() {
        let mut p = params();
        p.temperature = 0.0;
        p.logit_bias.insert(3, 100.0);
        let mut sampler = Sampler::new(0);
        let mut logits = vec![0.1, 2.5, 0.3, 1.0];
        assert_eq!(sampler.sample(&mut logits, &[], 0, &p), 3);
    }

    #[test]
    fn newline_can_be_exempt_from_penalties() {
        let mut p = params();
        p.temperature = 0.0;
        p.repeat_penalty = 10.0;
        p.penalize_newline = false;
        let mut sampler = Sampler::new(0);
        // Id 1 plays the newline token here; the penalty from its presence
        // in the window is undone.
        let mut logits = vec![0.1, 2.5, 2.0, 1.0];
        assert_eq!(sampler.sample(&mut logits, &[1], 1, &p), 1);
    }

    #[test]
    fn same_seed_same_draws() {
        let p = params();
        let logits = vec![1.0, 0.9, 0.8, 0.7, 0.6, 0.5];
        let run = |seed: u64| {
            let mut sampler = Sampler::new(seed);
            (0..32)
                .map(|_| sampler.sample(&mut logits.clone(), &[], 0, &p))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(42), run(42));
    }

    #[test]
    fn top_p_keeps_the_head() {
        let mut candidates: Vec<Candidate> = [5.0f32, 4.0, 0.1, 0.05]
            .iter()
            .enumerate()
            .map(|(id, &logit)| Candidate {
                id: id as i32,
                logit,
                p: 0.0,
            })
            .collect();
        top_p(&mut candidates, 0.9);
        assert!(candidates.len() < 4);
        assert_eq!(candidates[0].id, 0);
    }

    #[test]
    fn mirostat_v2_tracks_target_surprise() {
        let mut p = params();
        p.mirostat = 2;
        let mut sampler = Sampler::new(7);
        let mut logits = vec![0.0; 64];
        for (i, l) in logits.iter_mut().enumerate() {
            *l = -(i as f32) * 0.1;
        }
        let id = sampler.sample(&mut logits, &[], 0, &p);
        assert!((0..64).contains(&id));
        // The running mean moved off its 2*tau initialisation.
        assert!(sampler.mu.is_some());
        assert_ne!(sampler.mu.unwrap(), 2.0 * p.mirostat_tau);
    }
}
