use crate::buffer::{Fill, fill};
use crate::err::{EvtError, Result};
use crate::event_log::EventLog;
use crate::handle::{EvtHandle, HandleKind};
use crate::native::EventLogApi;
use crate::utils::decode_utf16le_bytes_z;

use log::debug;
use std::sync::Arc;

/// Lazily lists the names of all channels.
///
/// Forward-only and not restartable. The enumeration handle is closed as soon as the sequence
/// ends (exhausted or failed), or when the enumerator is dropped.
pub struct ChannelEnumerator {
    api: Arc<dyn EventLogApi>,
    handle: Option<EvtHandle>,
}

impl ChannelEnumerator {
    pub fn new(log: &EventLog) -> Result<Self> {
        let api = Arc::clone(log.api());
        let raw = api
            .open_channel_enum()
            .map_err(|status| EvtError::native(api.as_ref(), "EvtOpenChannelEnum", status))?;
        let handle = EvtHandle::new(&api, raw, HandleKind::ChannelEnum);

        Ok(ChannelEnumerator {
            api,
            handle: Some(handle),
        })
    }

    /// Shorthand for [`ChannelEnumerator::new`].
    pub fn enumerate(log: &EventLog) -> Result<Self> {
        Self::new(log)
    }

    fn next_name(&mut self) -> Result<Option<String>> {
        let Some(handle) = &self.handle else {
            return Ok(None);
        };
        let raw = handle.raw();

        let api = &self.api;
        match fill(api.as_ref(), "EvtNextChannelPath", |buf| {
            api.next_channel_path(raw, buf)
        })? {
            Fill::Filled(buffer, used) => {
                let used = used.min(buffer.len());
                Ok(Some(decode_utf16le_bytes_z(&buffer.as_bytes()[..used])))
            }
            Fill::NoMoreItems => Ok(None),
        }
    }
}

impl Iterator for ChannelEnumerator {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_name() {
            Ok(Some(name)) => Some(Ok(name)),
            Ok(None) => {
                if self.handle.take().is_some() {
                    debug!("Channel enumeration exhausted");
                }
                None
            }
            Err(e) => {
                self.handle = None;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::MemoryEventLog;
    use pretty_assertions::assert_eq;

    fn log_with_channels(names: &[&str]) -> (Arc<MemoryEventLog>, EventLog) {
        let mem = Arc::new(MemoryEventLog::new());
        for name in names {
            mem.add_channel(name);
        }
        let log = EventLog::from_shared(mem.clone());
        (mem, log)
    }

    #[test]
    fn test_enumerates_all_channels_in_order() {
        let (mem, log) = log_with_channels(&["System", "Application", "Security"]);

        let names: Vec<String> = ChannelEnumerator::new(&log)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(names, vec!["Application", "Security", "System"]);
        assert_eq!(mem.open_handle_count(), 0);
    }

    #[test]
    fn test_handle_closed_when_abandoned_early() {
        let (mem, log) = log_with_channels(&["Application", "System"]);

        let mut channels = ChannelEnumerator::new(&log).unwrap();
        assert_eq!(channels.next().unwrap().unwrap(), "Application");
        assert_eq!(mem.open_handle_count(), 1);

        drop(channels);
        assert_eq!(mem.open_handle_count(), 0);
        assert_eq!(mem.rejected_close_count(), 0);
    }

    #[test]
    fn test_exhausted_enumerator_stays_exhausted() {
        let (_mem, log) = log_with_channels(&["Application"]);

        let mut channels = ChannelEnumerator::new(&log).unwrap();
        assert!(channels.next().is_some());
        assert!(channels.next().is_none());
        assert!(channels.next().is_none());
    }

    #[test]
    fn test_stale_name_size_is_retried() {
        let (mem, log) = log_with_channels(&["Microsoft-Windows-Sysmon/Operational"]);
        mem.set_render_drift(2);

        let names: Vec<String> = ChannelEnumerator::new(&log)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(names, vec!["Microsoft-Windows-Sysmon/Operational"]);
    }

    #[test]
    fn test_failure_ends_the_sequence() {
        let (mem, log) = log_with_channels(&["Application"]);
        mem.set_render_drift(3);

        let mut channels = ChannelEnumerator::new(&log).unwrap();
        let err = channels.next().unwrap().unwrap_err();
        assert_eq!(err.code(), Some(crate::err::ERROR_INSUFFICIENT_BUFFER));
        assert!(channels.next().is_none());
        assert_eq!(mem.open_handle_count(), 0);
    }
}
