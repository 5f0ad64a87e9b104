//! Frames exchanged with scraping nodes and the models shared across the
//! crawl fleet control plane.

mod frame;
mod model;

pub use frame::{
    Command, CommandError, CommandRequest, FrameError, HeartbeatPing, HeartbeatPong, Inbound,
    JoinPing, JoinPong, Outbound,
};
pub use model::{
    Crawler, Item, NodeDescriptor, NodeStatus, ParseFailure, ParseOutput, ParseTask, RawResponse,
    Request, RequestOptions, RequestStatus, StatusEvent,
};
