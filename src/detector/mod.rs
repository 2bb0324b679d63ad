mod change;

pub use change::{detect, MIN_DETECTABLE_DELTA};
