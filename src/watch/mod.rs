pub mod filter;
pub mod watcher;

pub use filter::WatchFilter;
pub use watcher::{DirWatcher, WatchEvent, WatchSettings};
