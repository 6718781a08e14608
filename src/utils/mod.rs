pub mod errors;
pub mod logger;
pub mod paths;

pub use errors::{AgentError, Result};
pub use logger::setup_logging;
