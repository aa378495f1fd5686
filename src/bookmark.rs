use crate::err::{EvtError, Result};
use crate::event_log::EventLog;
use crate::handle::{EvtHandle, HandleKind};
use crate::native::{EventLogApi, RawHandle, RenderFlags};
use crate::render::render_markup;

use log::debug;
use std::sync::Arc;

/// A resumable position in a channel.
///
/// The markup produced by [`Bookmark::render`] is the only durable form: persist it and pass it
/// to [`Bookmark::create_from`] to continue where a previous run stopped.
#[derive(Debug)]
pub struct Bookmark {
    handle: EvtHandle,
    record_count: u64,
}

impl Bookmark {
    /// A bookmark positioned before all records.
    pub fn create(log: &EventLog) -> Result<Self> {
        let api = log.api();
        let raw = api
            .create_bookmark(None)
            .map_err(|status| EvtError::native(api.as_ref(), "EvtCreateBookmark", status))?;

        Ok(Bookmark {
            handle: EvtHandle::new(api, raw, HandleKind::Bookmark),
            record_count: 0,
        })
    }

    /// A bookmark restored from markup previously produced by [`Bookmark::render`].
    pub fn create_from(log: &EventLog, markup: &str) -> Result<Self> {
        let api = log.api();
        let raw = api.create_bookmark(Some(markup)).map_err(|status| {
            let code = status.code();
            EvtError::InvalidFormat {
                code,
                message: api.format_message(code),
            }
        })?;

        Ok(Bookmark {
            handle: EvtHandle::new(api, raw, HandleKind::Bookmark),
            record_count: 0,
        })
    }

    /// Moves the bookmark to the position of `record`.
    pub fn update(&mut self, record: &EvtHandle) -> Result<()> {
        let api = self.api();
        api.update_bookmark(self.handle.raw(), record.raw())
            .map_err(|status| {
                let code = status.code();
                EvtError::UpdateFailed {
                    code,
                    message: api.format_message(code),
                }
            })?;

        self.record_count += 1;
        debug!(
            "Bookmark {} moved to record handle {} ({} updates)",
            self.handle.raw(),
            record.raw(),
            self.record_count
        );
        Ok(())
    }

    /// The bookmark markup. Deterministic, and round-trips through [`Bookmark::create_from`].
    pub fn render(&self) -> Result<String> {
        render_markup(self.api(), self.handle.raw(), RenderFlags::Bookmark)
    }

    /// Number of successful [`Bookmark::update`] calls on this instance.
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn raw(&self) -> RawHandle {
        self.handle.raw()
    }

    /// Releases the native bookmark now.
    pub fn close(self) -> Result<()> {
        self.handle.close()
    }

    fn api(&self) -> &Arc<dyn EventLogApi> {
        self.handle.api()
    }
}
