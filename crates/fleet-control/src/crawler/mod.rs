mod client;
mod registry;

pub use client::{Connector, CrawlerClient, CrawlerHandle, ParseStream};
pub use registry::CrawlerRegistry;
