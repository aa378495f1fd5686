use crate::bookmark::Bookmark;
use crate::channel::ChannelEnumerator;
use crate::err::Result;
use crate::native::EventLogApi;
use crate::query::{Query, QueryDirection};
use crate::subscription::Subscription;

use std::fmt;
use std::sync::Arc;

/// Entry point: a connection to an event-log service.
///
/// Cheap to clone, every clone talks to the same backend.
#[derive(Clone)]
pub struct EventLog {
    api: Arc<dyn EventLogApi>,
}

impl EventLog {
    /// The event log of the local machine.
    #[cfg(windows)]
    pub fn local() -> Self {
        EventLog::with_api(crate::native::WindowsEventLog::new())
    }

    pub fn with_api(api: impl EventLogApi + 'static) -> Self {
        EventLog { api: Arc::new(api) }
    }

    /// Shares a backend the caller keeps a reference to, e.g. a
    /// [`MemoryEventLog`](crate::MemoryEventLog) that is appended to while querying.
    pub fn from_shared(api: Arc<dyn EventLogApi>) -> Self {
        EventLog { api }
    }

    pub fn api(&self) -> &Arc<dyn EventLogApi> {
        &self.api
    }

    pub fn channels(&self) -> Result<ChannelEnumerator> {
        ChannelEnumerator::new(self)
    }

    pub fn query(&self, channel: &str, filter: &str) -> Result<Query> {
        Query::new(self, channel, filter)
    }

    pub fn query_with_direction(
        &self,
        channel: &str,
        filter: &str,
        direction: QueryDirection,
    ) -> Result<Query> {
        Query::with_direction(self, channel, filter, direction)
    }

    pub fn subscribe(
        &self,
        path: &str,
        filter: &str,
        bookmark: Option<Bookmark>,
        tailing: bool,
    ) -> Result<Subscription> {
        Subscription::new(self, path, filter, bookmark, tailing)
    }

    pub fn bookmark(&self) -> Result<Bookmark> {
        Bookmark::create(self)
    }

    pub fn bookmark_from(&self, markup: &str) -> Result<Bookmark> {
        Bookmark::create_from(self, markup)
    }
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog").finish_non_exhaustive()
    }
}
