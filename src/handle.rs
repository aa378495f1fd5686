use crate::err::{EvtError, Result};
use crate::native::{EventLogApi, NativeResult, RawHandle};

use log::{debug, warn};
use std::fmt;
use std::sync::Arc;

/// What a native handle refers to, used for releasing it through the right primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    ChannelEnum,
    Query,
    Subscription,
    Signal,
    Bookmark,
    Event,
    RenderContext,
    PublisherMetadata,
}

/// Sole owner of one native handle.
///
/// The handle is released exactly once, either by [`EvtHandle::close`] or on drop. The type is
/// move-only, so two owners of the same handle cannot exist.
pub struct EvtHandle {
    api: Arc<dyn EventLogApi>,
    raw: RawHandle,
    kind: HandleKind,
    released: bool,
}

impl EvtHandle {
    pub(crate) fn new(api: &Arc<dyn EventLogApi>, raw: RawHandle, kind: HandleKind) -> Self {
        debug!("Opened {:?} handle {}", kind, raw);
        EvtHandle {
            api: Arc::clone(api),
            raw,
            kind,
            released: false,
        }
    }

    pub fn raw(&self) -> RawHandle {
        self.raw
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub(crate) fn api(&self) -> &Arc<dyn EventLogApi> {
        &self.api
    }

    /// Releases the handle now, reporting failures that a drop would only log.
    pub fn close(mut self) -> Result<()> {
        let call = match self.kind {
            HandleKind::Signal => "CloseHandle",
            _ => "EvtClose",
        };
        self.release()
            .map_err(|status| EvtError::native(self.api.as_ref(), call, status))
    }

    fn release(&mut self) -> NativeResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        debug!("Closing {:?} handle {}", self.kind, self.raw);

        match self.kind {
            HandleKind::Signal => self.api.close_signal(self.raw),
            _ => self.api.close(self.raw),
        }
    }
}

impl Drop for EvtHandle {
    fn drop(&mut self) {
        if let Err(status) = self.release() {
            warn!(
                "Failed to close {:?} handle {}: error code {}",
                self.kind,
                self.raw,
                status.code()
            );
        }
    }
}

impl fmt::Debug for EvtHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvtHandle")
            .field("raw", &self.raw)
            .field("kind", &self.kind)
            .finish()
    }
}
