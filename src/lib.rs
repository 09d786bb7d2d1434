pub mod cli;
pub mod config;
pub mod debounce;
pub mod events;
pub mod filter;
pub mod sink;
pub mod supervisor;
pub mod watcher;

pub use config::*;
pub use debounce::*;
pub use events::*;
pub use filter::*;
pub use sink::*;
pub use supervisor::*;
pub use watcher::*;
