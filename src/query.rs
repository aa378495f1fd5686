use crate::bookmark::Bookmark;
use crate::cursor::{RecordCursor, Records};
use crate::err::{EvtError, Result};
use crate::event_log::EventLog;
use crate::handle::{EvtHandle, HandleKind};
use crate::native::{EventLogApi, QueryFlags, SeekFlags, Status};
use crate::render::{RenderMode, RenderedRecord, Renderer};

use log::debug;
use std::sync::Arc;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryDirection {
    /// Oldest record first.
    #[default]
    Forward,
    /// Newest record first.
    Reverse,
}

impl QueryDirection {
    fn flags(self) -> QueryFlags {
        match self {
            QueryDirection::Forward => QueryFlags::FORWARD_DIRECTION,
            QueryDirection::Reverse => QueryFlags::REVERSE_DIRECTION,
        }
    }
}

/// Where [`Query::seek`] moves the cursor to, before applying the offset.
#[derive(Debug, Clone, Copy)]
pub enum SeekTarget<'b> {
    Origin(SeekFlags),
    Bookmark(&'b Bookmark),
}

/// A pull cursor over the records of one channel that match a filter.
///
/// Malformed filters are tolerated when the query is opened, they surface as errors from
/// [`Query::advance`] instead.
pub struct Query {
    current: Option<EvtHandle>,
    query: EvtHandle,
    renderer: Renderer,
    api: Arc<dyn EventLogApi>,
    channel: String,
    offset: i64,
    timeout: u32,
    render_mode: RenderMode,
}

impl Query {
    pub fn new(log: &EventLog, channel: &str, filter: &str) -> Result<Self> {
        Self::with_direction(log, channel, filter, QueryDirection::Forward)
    }

    pub fn with_direction(
        log: &EventLog,
        channel: &str,
        filter: &str,
        direction: QueryDirection,
    ) -> Result<Self> {
        let api = Arc::clone(log.api());
        let flags =
            QueryFlags::CHANNEL_PATH | QueryFlags::TOLERATE_QUERY_ERRORS | direction.flags();

        let raw = api
            .query(channel, filter, flags)
            .map_err(|status| EvtError::native(api.as_ref(), "EvtQuery", status))?;
        debug!(
            "Opened query on `{}` ({:?}) with filter `{}`",
            channel, direction, filter
        );

        Ok(Query {
            current: None,
            query: EvtHandle::new(&api, raw, HandleKind::Query),
            renderer: Renderer::new(&api),
            api,
            channel: channel.to_string(),
            offset: 0,
            timeout: 0,
            render_mode: RenderMode::default(),
        })
    }

    /// Pulls the next record, waiting at most [`Query::timeout`] milliseconds.
    ///
    /// Returns `false` once the query is exhausted. The previous current record is released
    /// before pulling.
    pub fn advance(&mut self) -> Result<bool> {
        self.current = None;

        match self.api.next(self.query.raw(), self.timeout) {
            Ok(raw) => {
                self.current = Some(EvtHandle::new(&self.api, raw, HandleKind::Event));
                Ok(true)
            }
            Err(Status::NoMoreItems) => Ok(false),
            Err(status) => Err(EvtError::native(self.api.as_ref(), "EvtNext", status)),
        }
    }

    /// Repositions the cursor at `target` plus [`Query::offset`]. Returns whether the service
    /// accepted the move.
    pub fn seek(&mut self, target: SeekTarget<'_>) -> bool {
        let (flags, bookmark) = match target {
            SeekTarget::Origin(flags) => (flags, None),
            SeekTarget::Bookmark(bookmark) => {
                (SeekFlags::RELATIVE_TO_BOOKMARK, Some(bookmark.raw()))
            }
        };

        match self
            .api
            .seek(self.query.raw(), self.offset, bookmark, self.timeout, flags)
        {
            Ok(()) => {
                debug!(
                    "Seeked `{}` to {:?} with offset {}",
                    self.channel, flags, self.offset
                );
                true
            }
            Err(status) => {
                debug!(
                    "Seek on `{}` to {:?} with offset {} failed: error code {}",
                    self.channel,
                    flags,
                    self.offset,
                    status.code()
                );
                false
            }
        }
    }

    /// Like [`Query::seek`] with an origin given by name, see [`SeekFlags::from_origin_name`].
    pub fn seek_to(&mut self, origin: &str) -> Result<bool> {
        let flags = SeekFlags::from_origin_name(origin)?;
        Ok(self.seek(SeekTarget::Origin(flags)))
    }

    /// Renders the current record in [`Query::render_mode`].
    pub fn render(&mut self) -> Result<RenderedRecord> {
        let current = self.current.as_ref().ok_or(EvtError::NoCurrentRecord)?;
        self.renderer.render(current, self.render_mode)
    }

    /// The current record's message from its provider's message table.
    pub fn render_message(&mut self) -> Result<String> {
        let current = self.current.as_ref().ok_or(EvtError::NoCurrentRecord)?;
        self.renderer.render_message(current)
    }

    /// The current record's user-data values as display strings.
    pub fn string_inserts(&mut self) -> Result<Vec<String>> {
        let current = self.current.as_ref().ok_or(EvtError::NoCurrentRecord)?;
        self.renderer.string_inserts(current)
    }

    /// The record handle set by the last successful [`Query::advance`].
    pub fn current(&self) -> Option<&EvtHandle> {
        self.current.as_ref()
    }

    /// Releases the current record early. The cursor stays usable.
    pub fn close_current(&mut self) -> Result<()> {
        match self.current.take() {
            Some(record) => record.close(),
            None => Ok(()),
        }
    }

    /// Renders each remaining record.
    pub fn records(&mut self) -> Records<'_, Self> {
        Records::new(self)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn set_offset(&mut self, offset: i64) {
        self.offset = offset;
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    /// Milliseconds `advance` and `seek` wait. `0` returns immediately, [`crate::INFINITE`]
    /// blocks.
    pub fn timeout(&self) -> u32 {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: u32) {
        self.timeout = timeout;
    }

    pub fn with_timeout(mut self, timeout: u32) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn render_mode(&self) -> RenderMode {
        self.render_mode
    }

    pub fn set_render_mode(&mut self, mode: RenderMode) {
        self.render_mode = mode;
    }

    pub fn with_render_mode(mut self, mode: RenderMode) -> Self {
        self.render_mode = mode;
        self
    }
}

impl RecordCursor for Query {
    fn advance(&mut self) -> Result<bool> {
        Query::advance(self)
    }

    fn render(&mut self) -> Result<RenderedRecord> {
        Query::render(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{MemoryEventLog, MemoryRecord};
    use pretty_assertions::assert_eq;

    fn sample_log() -> (Arc<MemoryEventLog>, EventLog) {
        crate::ensure_env_logger_initialized();
        let mem = Arc::new(MemoryEventLog::new());
        for id in 1..=3 {
            mem.append("Application", MemoryRecord::new("App", id));
        }
        let log = EventLog::from_shared(mem.clone());
        (mem, log)
    }

    #[test]
    fn test_render_before_advance_fails() {
        let (_mem, log) = sample_log();
        let mut query = Query::new(&log, "Application", "*").unwrap();

        assert!(matches!(query.render(), Err(EvtError::NoCurrentRecord)));
        assert!(matches!(
            query.string_inserts(),
            Err(EvtError::NoCurrentRecord)
        ));
    }

    #[test]
    fn test_only_one_record_handle_is_held() {
        let (mem, log) = sample_log();
        let mut query = Query::new(&log, "Application", "*").unwrap();

        // the query handle itself
        assert_eq!(mem.open_handle_count(), 1);
        assert!(query.advance().unwrap());
        assert!(query.advance().unwrap());
        assert_eq!(mem.open_handle_count(), 2);

        assert!(query.advance().unwrap());
        assert!(!query.advance().unwrap());
        assert!(query.current().is_none());
        assert_eq!(mem.open_handle_count(), 1);

        drop(query);
        assert_eq!(mem.open_handle_count(), 0);
        assert_eq!(mem.rejected_close_count(), 0);
    }

    #[test]
    fn test_settings() {
        let (_mem, log) = sample_log();
        let mut query = Query::new(&log, "Application", "*")
            .unwrap()
            .with_timeout(1000)
            .with_render_mode(RenderMode::Structured);

        assert_eq!(query.timeout(), 1000);
        assert_eq!(query.offset(), 0);
        assert_eq!(query.render_mode(), RenderMode::Structured);

        query.set_offset(-1);
        assert_eq!(query.offset(), -1);
        assert_eq!(query.channel(), "Application");
    }

    #[test]
    fn test_unknown_seek_origin_is_invalid_argument() {
        let (_mem, log) = sample_log();
        let mut query = Query::new(&log, "Application", "*").unwrap();

        assert!(matches!(
            query.seek_to("middle"),
            Err(EvtError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_missing_channel_fails_construction() {
        let (mem, log) = sample_log();

        let err = Query::new(&log, "NoSuchChannel", "*").err().unwrap();
        assert_eq!(err.code(), Some(crate::err::ERROR_EVT_CHANNEL_NOT_FOUND));
        assert_eq!(mem.open_handle_count(), 0);
    }

    #[test]
    fn test_close_current_releases_the_record() {
        let (mem, log) = sample_log();
        let mut query = Query::new(&log, "Application", "*").unwrap();

        assert!(query.advance().unwrap());
        assert_eq!(mem.open_handle_count(), 2);

        query.close_current().unwrap();
        assert_eq!(mem.open_handle_count(), 1);
        assert!(matches!(query.render(), Err(EvtError::NoCurrentRecord)));
        // Nothing left to release.
        query.close_current().unwrap();

        assert!(query.advance().unwrap());
        let record = query.render().unwrap();
        assert!(record.as_xml().unwrap().contains("<EventRecordID>2</EventRecordID>"));
        assert_eq!(mem.rejected_close_count(), 0);
    }
}
