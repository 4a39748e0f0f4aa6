pub mod lock;
pub mod model;
pub mod parser;

pub use lock::FileLock;
pub use model::{Block, Location, ProxyConfig, ProxyError, Upstream, VirtualServer};
pub use parser::parse;
