pub mod channel;
pub mod observer;
pub mod snapshot;

pub use channel::ProgressChannel;
pub use observer::{EventKind, FileLogObserver, LogObserver, SessionEvent, SessionObserver};
pub use snapshot::{format_bytes, DownloadSnapshot, SpeedTracker};
