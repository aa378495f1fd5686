use crate::bookmark::Bookmark;
use crate::cursor::{RecordCursor, Records};
use crate::err::{EvtError, Result};
use crate::event_log::EventLog;
use crate::handle::{EvtHandle, HandleKind};
use crate::native::{EventLogApi, INFINITE, StartPosition, Status};
use crate::render::{RenderMode, RenderedRecord, Renderer};

use log::{debug, trace};
use std::sync::Arc;

/// A cursor over records delivered to a channel, live or replayed.
///
/// Where delivery starts is decided once, at construction:
/// 1. after the given bookmark, if there is one,
/// 2. otherwise at the next new record when `tailing`,
/// 3. otherwise at the oldest record in the channel.
///
/// The subscription keeps a bookmark (the caller's, or a fresh one) that is moved to every
/// delivered record. Persist [`Subscription::bookmark`] to resume after a restart. A crash
/// between delivery and persisting can redeliver the last record.
pub struct Subscription {
    // Released in declaration order.
    signal: EvtHandle,
    subscription: EvtHandle,
    bookmark: Bookmark,
    current: Option<EvtHandle>,
    renderer: Renderer,
    api: Arc<dyn EventLogApi>,
    channel: String,
    start: StartPosition,
    tailing: bool,
    render_mode: RenderMode,
    wait_timeout: u32,
    /// Set once the service reported no more records, the next advance waits for the signal.
    drained: bool,
    timed_out: bool,
}

impl Subscription {
    pub fn new(
        log: &EventLog,
        path: &str,
        filter: &str,
        bookmark: Option<Bookmark>,
        tailing: bool,
    ) -> Result<Self> {
        let api = Arc::clone(log.api());
        let start = StartPosition::resolve(bookmark.is_some(), tailing);

        let signal = api
            .create_signal()
            .map_err(|status| EvtError::native(api.as_ref(), "CreateEventW", status))?;
        let signal = EvtHandle::new(&api, signal, HandleKind::Signal);

        let bookmark = match bookmark {
            Some(bookmark) => bookmark,
            None => Bookmark::create(log)?,
        };
        let resume_after = match start {
            StartPosition::AfterBookmark => Some(bookmark.raw()),
            _ => None,
        };

        let subscription = api
            .subscribe(signal.raw(), path, filter, resume_after, start)
            .map_err(|status| EvtError::native(api.as_ref(), "EvtSubscribe", status))?;
        let subscription = EvtHandle::new(&api, subscription, HandleKind::Subscription);
        debug!(
            "Subscribed to `{}` with filter `{}` starting at {:?}",
            path, filter, start
        );

        Ok(Subscription {
            signal,
            subscription,
            bookmark,
            current: None,
            renderer: Renderer::new(&api),
            api,
            channel: path.to_string(),
            start,
            tailing,
            render_mode: RenderMode::default(),
            wait_timeout: INFINITE,
            drained: true,
            timed_out: false,
        })
    }

    /// Pulls the next delivered record and moves the bookmark to it.
    ///
    /// When the previous pull found nothing, first waits for the service to signal new records,
    /// at most [`Subscription::wait_timeout`] milliseconds. Returns `false` when the wait timed
    /// out or no record was available.
    pub fn advance(&mut self) -> Result<bool> {
        self.current = None;
        self.timed_out = false;

        if self.drained {
            let signalled = self
                .api
                .wait_signal(self.signal.raw(), self.wait_timeout)
                .map_err(|status| {
                    EvtError::native(self.api.as_ref(), "WaitForSingleObject", status)
                })?;
            if !signalled {
                trace!("No new records on `{}` within {} ms", self.channel, self.wait_timeout);
                self.timed_out = true;
                return Ok(false);
            }
        }

        match self.api.next(self.subscription.raw(), INFINITE) {
            Ok(raw) => {
                let record = EvtHandle::new(&self.api, raw, HandleKind::Event);
                self.bookmark.update(&record)?;
                self.current = Some(record);
                self.drained = false;
                Ok(true)
            }
            Err(Status::NoMoreItems) => {
                self.drained = true;
                Ok(false)
            }
            Err(status) => Err(EvtError::native(self.api.as_ref(), "EvtNext", status)),
        }
    }

    /// Renders the current record in [`Subscription::render_mode`].
    pub fn render(&mut self) -> Result<RenderedRecord> {
        let current = self.current.as_ref().ok_or(EvtError::NoCurrentRecord)?;
        self.renderer.render(current, self.render_mode)
    }

    pub fn render_message(&mut self) -> Result<String> {
        let current = self.current.as_ref().ok_or(EvtError::NoCurrentRecord)?;
        self.renderer.render_message(current)
    }

    pub fn string_inserts(&mut self) -> Result<Vec<String>> {
        let current = self.current.as_ref().ok_or(EvtError::NoCurrentRecord)?;
        self.renderer.string_inserts(current)
    }

    /// Markup of the position of the last delivered record.
    pub fn bookmark(&self) -> Result<String> {
        self.bookmark.render()
    }

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

    /// Whether the last [`Subscription::advance`] returned `false` because the wait for new
    /// records timed out, rather than because the backlog was drained.
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn records(&mut self) -> Records<'_, Self> {
        Records::new(self)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn start_position(&self) -> StartPosition {
        self.start
    }

    pub fn tailing(&self) -> bool {
        self.tailing
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

    pub fn wait_timeout(&self) -> u32 {
        self.wait_timeout
    }

    /// Bounds the wait for new records, [`INFINITE`] by default.
    pub fn set_wait_timeout(&mut self, timeout: u32) {
        self.wait_timeout = timeout;
    }

    pub fn with_wait_timeout(mut self, timeout: u32) -> Self {
        self.wait_timeout = timeout;
        self
    }
}

impl RecordCursor for Subscription {
    fn advance(&mut self) -> Result<bool> {
        Subscription::advance(self)
    }

    fn render(&mut self) -> Result<RenderedRecord> {
        Subscription::render(self)
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
        mem.append("Application", MemoryRecord::new("App", 1));
        let log = EventLog::from_shared(mem.clone());
        (mem, log)
    }

    #[test]
    fn test_failed_subscribe_releases_partial_state() {
        let (mem, log) = sample_log();

        let err = Subscription::new(&log, "Application", "*[Broken", None, false)
            .err()
            .unwrap();
        assert_eq!(err.code(), Some(crate::err::ERROR_EVT_INVALID_QUERY));
        // signal and bookmark were acquired, then released
        assert_eq!(mem.open_handle_count(), 0);
        assert_eq!(mem.rejected_close_count(), 0);
    }

    #[test]
    fn test_drop_releases_everything() {
        let (mem, log) = sample_log();
        let mut subscription = Subscription::new(&log, "Application", "*", None, false).unwrap();
        assert!(subscription.advance().unwrap());
        assert!(matches!(
            subscription.render().unwrap(),
            RenderedRecord::Xml(_)
        ));

        drop(subscription);
        assert_eq!(mem.open_handle_count(), 0);
        assert_eq!(mem.rejected_close_count(), 0);
    }

    #[test]
    fn test_start_position_follows_arguments() {
        let (_mem, log) = sample_log();

        let replay = Subscription::new(&log, "Application", "*", None, false).unwrap();
        assert_eq!(replay.start_position(), StartPosition::OldestRecord);

        let tail = Subscription::new(&log, "Application", "*", None, true).unwrap();
        assert_eq!(tail.start_position(), StartPosition::FutureEvents);
        assert!(tail.tailing());

        let bookmark = Bookmark::create(&log).unwrap();
        let resume = Subscription::new(&log, "Application", "*", Some(bookmark), true).unwrap();
        assert_eq!(resume.start_position(), StartPosition::AfterBookmark);
    }

    #[test]
    fn test_bounded_wait_returns_false() {
        let (_mem, log) = sample_log();
        let mut subscription = Subscription::new(&log, "Application", "*", None, true)
            .unwrap()
            .with_wait_timeout(10);

        assert!(!subscription.advance().unwrap());
        assert!(subscription.current().is_none());
        assert!(subscription.timed_out());
    }

    #[test]
    fn test_drained_backlog_is_not_a_timeout() {
        let (_mem, log) = sample_log();
        let mut subscription = Subscription::new(&log, "Application", "*", None, false)
            .unwrap()
            .with_wait_timeout(10);

        while subscription.advance().unwrap() {
            assert!(!subscription.timed_out());
        }
        assert!(!subscription.timed_out());

        assert!(!subscription.advance().unwrap());
        assert!(subscription.timed_out());
    }

    #[test]
    fn test_close_current_releases_the_record() {
        let (mem, log) = sample_log();
        mem.append("Application", MemoryRecord::new("App", 2));
        let mut subscription = Subscription::new(&log, "Application", "*", None, false).unwrap();
        let idle = mem.open_handle_count();

        assert!(subscription.advance().unwrap());
        assert_eq!(mem.open_handle_count(), idle + 1);

        subscription.close_current().unwrap();
        assert_eq!(mem.open_handle_count(), idle);
        assert!(subscription.current().is_none());
        assert!(matches!(
            subscription.render(),
            Err(EvtError::NoCurrentRecord)
        ));
        subscription.close_current().unwrap();

        assert!(subscription.advance().unwrap());
        assert_eq!(mem.open_handle_count(), idle + 1);
        assert_eq!(mem.rejected_close_count(), 0);
    }
}
