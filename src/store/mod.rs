mod market_store;
mod persist;

pub use market_store::MarketStore;
pub use persist::{StatePersister, STATE_VERSION};
