mod fleet;
mod handler;

pub use fleet::StoreFleet;
pub use handler::{Concurrency, ParseSummary, StoreHandler};
