//! Next-token selection from a logits vector.
//!
//! Sampling applies, in order: repetition penalty, temperature, top-k,
//! top-p, then draws from the renormalized distribution. Greedy decoding
//! skips all of it and takes the argmax.

use candle_core::{DType, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use tracing::warn;

use crate::config::GenerationConfig;
use crate::error::Result;

/// Picks the next token id from `(vocab,)` logits. `history` is the full
/// sequence so far, used for the repetition penalty.
pub fn sample(logits: &Tensor, history: &[u32], config: &GenerationConfig, rng: &mut StdRng) -> Result<u32> {
    let logits = logits.flatten_all()?.to_dtype(DType::F32)?;
    if !config.do_sample {
        return Ok(argmax(&logits.to_vec1::<f32>()?));
    }

    let probs = sampling_distribution(&logits, history, config)?;
    match probs.and_then(|probs| WeightedIndex::new(&probs).ok()) {
        Some(distribution) => Ok(distribution.sample(rng) as u32),
        None => {
            warn!("Degenerate sampling distribution, falling back to argmax");
            Ok(argmax(&logits.to_vec1::<f32>()?))
        }
    }
}

/// Probabilities after every sampling transform, `None` when no candidate
/// has positive mass.
pub(crate) fn sampling_distribution(
    logits: &Tensor,
    history: &[u32],
    config: &GenerationConfig,
) -> Result<Option<Vec<f32>>> {
    let logits = if config.repetition_penalty > 0.0 && config.repetition_penalty != 1.0 {
        candle_transformers::utils::apply_repeat_penalty(logits, config.repetition_penalty, history)?
    } else {
        logits.clone()
    };
    let mut scores = logits.to_vec1::<f32>()?;
    for score in scores.iter_mut() {
        *score /= config.temperature;
    }
    apply_top_k(&mut scores, config.top_k);
    apply_top_p(&mut scores, config.top_p);
    Ok(softmax(&scores))
}

/// Index of the largest logit, the lowest index on ties. NaNs never win.
pub fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (i, &value) in logits.iter().enumerate() {
        if value > best_value {
            best = i;
            best_value = value;
        }
    }
    best as u32
}

/// Masks everything outside the `k` largest scores. Ties are broken by
/// index so exactly `k` survive.
fn apply_top_k(scores: &mut [f32], top_k: usize) {
    if top_k == 0 || top_k >= scores.len() {
        return;
    }
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.select_nth_unstable_by(top_k - 1, |&a, &b| {
        scores[b].total_cmp(&scores[a]).then(a.cmp(&b))
    });
    for &i in &order[top_k..] {
        scores[i] = f32::NEG_INFINITY;
    }
}

/// Keeps the smallest set of highest-probability candidates whose mass
/// reaches `top_p`.
fn apply_top_p(scores: &mut [f32], top_p: f32) {
    if top_p >= 1.0 {
        return;
    }
    let Some(probs) = softmax(scores) else {
        return;
    };
    let mut order: Vec<usize> = (0..probs.len()).filter(|&i| probs[i] > 0.0).collect();
    order.sort_unstable_by(|&a, &b| probs[b].total_cmp(&probs[a]).then(a.cmp(&b)));

    let mut cumulative = 0.0;
    let mut keep = order.len();
    for (rank, &i) in order.iter().enumerate() {
        cumulative += probs[i];
        if cumulative >= top_p {
            keep = rank + 1;
            break;
        }
    }
    for &i in &order[keep..] {
        scores[i] = f32::NEG_INFINITY;
    }
}

fn softmax(scores: &[f32]) -> Option<Vec<f32>> {
    let max = scores
        .iter()
        .copied()
        .filter(|s| s.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return None;
    }
    let exps: Vec<f32> = scores
        .iter()
        .map(|&s| if s.is_finite() { (s - max).exp() } else { 0.0 })
        .collect();
    let sum: f32 = exps.iter().sum();
    if !(sum > 0.0) || !sum.is_finite() {
        return None;
    }
    Some(exps.into_iter().map(|e| e / sum).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::SeedableRng;

    fn tensor(values: &[f32]) -> Tensor {
        Tensor::new(values, &Device::Cpu).unwrap()
    }

    fn sampling(top_k: usize, top_p: f32) -> GenerationConfig {
        GenerationConfig {
            do_sample: true,
            top_k,
            top_p,
            temperature: 1.0,
            repetition_penalty: 1.0,
            ..Default::default()
        }
    }

    fn support(probs: &[f32]) -> Vec<usize> {
        (0..probs.len()).filter(|&i| probs[i] > 0.0).collect()
    }

    #[test]
    fn test_greedy_takes_lowest_index_on_ties() {
        let mut rng = StdRng::seed_from_u64(0);
        let config = GenerationConfig::greedy();
        let logits = tensor(&[0.5, 3.0, -1.0, 3.0]);
        for _ in 0..5 {
            assert_eq!(sample(&logits, &[], &config, &mut rng).unwrap(), 1);
        }
    }

    #[test]
    fn test_argmax_ignores_nan() {
        assert_eq!(argmax(&[f32::NAN, 1.0, 2.0]), 2);
        assert_eq!(argmax(&[f32::NEG_INFINITY; 3]), 0);
    }

    #[test]
    fn test_top_k_keeps_exactly_k() {
        let logits = tensor(&[1.0, 4.0, 2.0, 4.0, 3.0]);
        let probs = sampling_distribution(&logits, &[], &sampling(2, 1.0))
            .unwrap()
            .unwrap();
        assert_eq!(support(&probs), vec![1, 3]);
    }

    #[test]
    fn test_top_p_keeps_smallest_prefix() {
        // softmax of ln(p) is p
        let logits = tensor(&[0.5f32.ln(), 0.3f32.ln(), 0.15f32.ln(), 0.05f32.ln()]);
        let probs = sampling_distribution(&logits, &[], &sampling(0, 0.7))
            .unwrap()
            .unwrap();
        assert_eq!(support(&probs), vec![0, 1]);
        assert!((probs[0] - 0.625).abs() < 1e-4);

        let probs = sampling_distribution(&logits, &[], &sampling(0, 0.45))
            .unwrap()
            .unwrap();
        assert_eq!(support(&probs), vec![0]);
    }

    #[test]
    fn test_disabled_filters_match_plain_softmax() {
        let values = [0.1, -2.0, 1.5, 0.7];
        let mut config = sampling(0, 1.0);
        config.temperature = 0.5;
        let probs = sampling_distribution(&tensor(&values), &[0, 2], &config)
            .unwrap()
            .unwrap();
        let scaled: Vec<f32> = values.iter().map(|v| v / 0.5).collect();
        let expected = softmax(&scaled).unwrap();
        for (p, e) in probs.iter().zip(&expected) {
            assert!((p - e).abs() < 1e-6);
        }
    }

    #[test]
    fn test_repetition_penalty_lowers_seen_tokens() {
        let logits = tensor(&[2.0, 2.0, -1.0, -1.0]);
        let mut config = sampling(0, 1.0);
        let base = sampling_distribution(&logits, &[0, 2], &config).unwrap().unwrap();
        config.repetition_penalty = 1.5;
        let penalized = sampling_distribution(&logits, &[0, 2], &config).unwrap().unwrap();

        assert!(penalized[0] / penalized[1] < base[0] / base[1]);
        assert!(penalized[2] / penalized[3] < base[2] / base[3]);
    }

    #[test]
    fn test_degenerate_logits_fall_back_to_argmax() {
        let mut rng = StdRng::seed_from_u64(0);
        let logits = tensor(&[f32::NEG_INFINITY; 4]);
        assert_eq!(sample(&logits, &[], &sampling(0, 0.7), &mut rng).unwrap(), 0);
    }

    #[test]
    fn test_sampling_follows_distribution() {
        let mut rng = StdRng::seed_from_u64(42);
        let logits = tensor(&[0.9f32.ln(), 0.1f32.ln()]);
        let config = sampling(0, 1.0);
        let hits = (0..1000)
            .filter(|_| sample(&logits, &[], &config, &mut rng).unwrap() == 0)
            .count();
        assert!((800..=980).contains(&hits), "hits = {hits}");
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let logits = tensor(&[0.3, 0.2, 0.1, 0.0, -0.1]);
        let config = sampling(0, 1.0);
        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..20)
                .map(|_| sample(&logits, &[], &config, &mut rng).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(9), draw(9));
    }
}
