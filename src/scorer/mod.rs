mod signal;

pub use signal::{
    composite_score, historical_snr, kl_divergence, log_volume_weight, score_change,
    trajectory_consistency,
};
