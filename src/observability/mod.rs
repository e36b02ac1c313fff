pub mod collector;

pub use collector::{ExchangeRecord, TrafficCollector};
