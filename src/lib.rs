//! Read-side access to the Windows Event Log.
//!
//! Enumerate channels, run filtered queries over stored records, subscribe to new records,
//! persist positions with bookmarks, and render records either as event markup or as typed
//! system fields and values.
//!
//! Every native handle is owned by exactly one value and released exactly once.
//!
//! ```rust
//! use std::sync::Arc;
//! use winevt::{EventLog, MemoryEventLog, MemoryRecord, RenderMode, Variant};
//!
//! let store = Arc::new(MemoryEventLog::new());
//! store.append(
//!     "Application",
//!     MemoryRecord::new("MyService", 1000)
//!         .with_data(vec![Variant::String("started".to_string())]),
//! );
//!
//! let log = EventLog::from_shared(store);
//! let mut query = log
//!     .query("Application", "*")
//!     .unwrap()
//!     .with_render_mode(RenderMode::Structured);
//!
//! while query.advance().unwrap() {
//!     let record = query.render().unwrap().into_structured().unwrap();
//!     assert_eq!(record.system.channel, "Application");
//!     assert_eq!(record.data[0].to_string(), "started");
//! }
//! ```
//!
//! On Windows, [`EventLog::local`] talks to the event-log service of the local machine.

#![deny(unused_must_use)]
#![forbid(unsafe_op_in_unsafe_fn)]

mod bookmark;
mod buffer;
mod channel;
mod cursor;
pub mod err;
mod event_log;
mod handle;
pub mod native;
mod query;
mod render;
mod subscription;
mod utils;
mod value;

pub use bookmark::Bookmark;
pub use channel::ChannelEnumerator;
pub use cursor::{RecordCursor, Records};
pub use err::{EvtError, Result};
pub use event_log::EventLog;
pub use handle::{EvtHandle, HandleKind};
pub use native::{
    EventLogApi, INFINITE, MemoryEventLog, MemoryRecord, RawHandle, SeekFlags, StartPosition,
    Variant,
};
#[cfg(windows)]
pub use native::WindowsEventLog;
pub use query::{Query, QueryDirection, SeekTarget};
pub use render::{RenderMode, RenderedRecord, StructuredRecord, SystemFields};
pub use subscription::Subscription;
pub use value::Value;

#[cfg(test)]
pub(crate) fn ensure_env_logger_initialized() {
    use std::sync::Once;
    static LOGGER_INIT: Once = Once::new();
    LOGGER_INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}
