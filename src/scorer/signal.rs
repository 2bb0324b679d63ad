//! Pure scoring functions. Every function here is deterministic and total:
//! no input in the declared domain produces NaN or ±∞.

/// Ceiling for the KL term, in bits. Boundary moves (into p=0 or p=1 from a
/// non-boundary start) would otherwise be unbounded and drown every other
/// factor in the composite.
const KL_CAP_BITS: f64 = 50.0;

/// Below this σ a history is treated as flat.
const SNR_FLAT_SIGMA: f64 = 1e-4;

const SNR_FLOOR: f64 = 0.5;
const SNR_CEILING: f64 = 5.0;

/// Floor of the log volume weight, applied to zero-volume markets.
const LVW_FLOOR: f64 = 0.1;

/// Binary Kullback–Leibler divergence D(new ‖ old) in bits: the information
/// gained by moving from Bernoulli(p_old) to Bernoulli(p_new).
///
/// At equal absolute magnitude, moves near the tails score differently from
/// mid-range moves — the regime sensitivity that raw magnitude lacks.
/// The 0·log 0 = 0 convention applies at the boundaries and the result is
/// clamped to [0, KL_CAP_BITS].
pub fn kl_divergence(p_old: f64, p_new: f64) -> f64 {
    let p_old = p_old.clamp(0.0, 1.0);
    let p_new = p_new.clamp(0.0, 1.0);

    let kl = kl_term(p_new, p_old) + kl_term(1.0 - p_new, 1.0 - p_old);
    if kl.is_nan() {
        return 0.0;
    }
    kl.clamp(0.0, KL_CAP_BITS)
}

/// One term p·log₂(p/q) with 0·log 0 = 0; +∞ when q = 0 < p (clamped by the
/// caller).
fn kl_term(p: f64, q: f64) -> f64 {
    if p == 0.0 {
        return 0.0;
    }
    if q == 0.0 {
        return f64::INFINITY;
    }
    p * (p / q).log2()
}

/// Liquidity weight `max(0.1, log₂(1 + vol/v_ref))`. Grows without bound but
/// slowly; a market at the reference volume weighs ≈ 1.0. `v_ref <= 0` is
/// treated as 1 to avoid the singularity.
pub fn log_volume_weight(volume: f64, v_ref: f64) -> f64 {
    let v_ref = if v_ref > 0.0 { v_ref } else { 1.0 };
    let volume = volume.max(0.0);
    (1.0 + volume / v_ref).log2().max(LVW_FLOOR)
}

/// Signal-to-noise of the net move against the window's own volatility,
/// clamped to [0.5, 5.0].
///
/// The clamp is load-bearing: without the floor a small move on a volatile
/// market would zero the composite, without the ceiling a large move on a
/// flat market would dominate every ranking.
pub fn historical_snr(history: &[f64], net_delta: f64) -> f64 {
    if history.len() < 2 {
        return 1.0;
    }
    let sigma = std_dev(history);
    if sigma < SNR_FLAT_SIGMA {
        return 1.0;
    }
    (net_delta.abs() / sigma).clamp(SNR_FLOOR, SNR_CEILING)
}

fn std_dev(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    var.sqrt()
}

/// Trajectory consistency `|Σ Δᵢ| / Σ |Δᵢ|` over consecutive window
/// snapshots, in [0,1]. A monotone path gives 1.0, a perfectly oscillating
/// path (net zero) gives 0. Fewer than 3 snapshots show no oscillation and
/// score 1.0; a zero denominator maps to 1.0.
pub fn trajectory_consistency(window_probs: &[f64]) -> f64 {
    if window_probs.len() < 3 {
        return 1.0;
    }
    let mut net = 0.0;
    let mut total = 0.0;
    for pair in window_probs.windows(2) {
        let delta = pair[1] - pair[0];
        net += delta;
        total += delta.abs();
    }
    if total == 0.0 {
        return 1.0;
    }
    (net.abs() / total).clamp(0.0, 1.0)
}

/// `KL × LVW × SNR × TC`. Multiplicative so each factor vetoes independently.
pub fn composite_score(kl: f64, lvw: f64, snr: f64, tc: f64) -> f64 {
    kl * lvw * snr * tc
}

/// Scores one detected change: the KL of the endpoint move, weighted by
/// liquidity, the window's signal-to-noise, and trajectory consistency.
/// `window_probs` is the ascending series of yes-probabilities inside the
/// detection window (the same series the detector extracted endpoints from).
pub fn score_change(
    old_prob: f64,
    new_prob: f64,
    volume: f64,
    v_ref: f64,
    window_probs: &[f64],
) -> f64 {
    let kl = kl_divergence(old_prob, new_prob);
    let lvw = log_volume_weight(volume, v_ref);
    let snr = historical_snr(window_probs, new_prob - old_prob);
    let tc = trajectory_consistency(window_probs);
    composite_score(kl, lvw, snr, tc)
}
