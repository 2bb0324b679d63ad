mod cooldown;
mod filters;
mod grouping;

pub use cooldown::CooldownLedger;
pub use filters::{pre_filter, RejectReason};
pub use grouping::group_changes;
