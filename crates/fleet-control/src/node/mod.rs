mod frames;
mod registry;
mod session;

pub use frames::{FrameSink, Frames};
pub use registry::NodeRegistry;
pub use session::{Node, NodeSnapshot, Session};
