//! The "ask for the size, then fill" protocol shared by every call with variable-length output.

use crate::err::{EvtError, Result};
use crate::native::{EventLogApi, NativeResult, Status};

use log::trace;

/// How many times a fill may be retried after the size reported by the sizing call turned out stale.
pub(crate) const EXTRA_GROW_RETRIES: usize = 2;

/// A zeroed, 8-byte aligned byte buffer.
///
/// Value renders hand back arrays of native variants whose pointers refer into the buffer
/// itself, so the storage is kept in `u64` words to satisfy their alignment.
pub(crate) struct RenderBuffer {
    storage: Vec<u64>,
    len: usize,
}

impl RenderBuffer {
    pub(crate) fn empty() -> Self {
        RenderBuffer {
            storage: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn with_len(len: usize) -> Result<Self> {
        let words = len.div_ceil(8);
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(words)
            .map_err(|_| EvtError::OutOfMemory { size: len })?;
        storage.resize(words, 0);

        Ok(RenderBuffer { storage, len })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        // Safety: `storage` owns at least `len` initialized bytes and `u8` has no alignment
        // requirement.
        unsafe { std::slice::from_raw_parts(self.storage.as_ptr().cast::<u8>(), self.len) }
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        // Safety: see `as_bytes`, the mutable borrow of `self` makes the slice unique.
        unsafe { std::slice::from_raw_parts_mut(self.storage.as_mut_ptr().cast::<u8>(), self.len) }
    }
}

pub(crate) enum Fill<T> {
    Filled(RenderBuffer, T),
    NoMoreItems,
}

/// Drives `native` through the two-phase protocol.
///
/// The first call gets an empty buffer and is expected to report the size it needs. The buffer
/// is then reallocated to exactly that size and the call repeated. If the data grew in between,
/// the fill is retried at most [`EXTRA_GROW_RETRIES`] more times before giving up with the
/// native "insufficient buffer" status. Intermediate buffers are dropped on every exit path.
pub(crate) fn fill<T>(
    api: &dyn EventLogApi,
    call: &'static str,
    mut native: impl FnMut(&mut [u8]) -> NativeResult<T>,
) -> Result<Fill<T>> {
    let mut buffer = RenderBuffer::empty();
    let mut grows = 0usize;

    loop {
        match native(buffer.as_bytes_mut()) {
            Ok(output) => return Ok(Fill::Filled(buffer, output)),
            Err(Status::NoMoreItems) => return Ok(Fill::NoMoreItems),
            Err(Status::InsufficientBuffer { needed }) => {
                if grows > EXTRA_GROW_RETRIES {
                    return Err(EvtError::native(
                        api,
                        call,
                        Status::InsufficientBuffer { needed },
                    ));
                }
                grows += 1;
                trace!(
                    "{} needs {} bytes (had {}, grow #{})",
                    call,
                    needed,
                    buffer.len(),
                    grows
                );
                buffer = RenderBuffer::with_len(needed)?;
            }
            Err(status) => return Err(EvtError::native(api, call, status)),
        }
    }
}

/// Like [`fill`], for calls where running out of items is itself a failure.
pub(crate) fn fill_required<T>(
    api: &dyn EventLogApi,
    call: &'static str,
    native: impl FnMut(&mut [u8]) -> NativeResult<T>,
) -> Result<(RenderBuffer, T)> {
    match fill(api, call, native)? {
        Fill::Filled(buffer, output) => Ok((buffer, output)),
        Fill::NoMoreItems => Err(EvtError::native(api, call, Status::NoMoreItems)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::err::ERROR_INSUFFICIENT_BUFFER;
    use crate::native::MemoryEventLog;

    fn write_payload(buffer: &mut [u8], payload: &[u8]) -> NativeResult<usize> {
        if buffer.len() < payload.len() {
            return Err(Status::InsufficientBuffer {
                needed: payload.len(),
            });
        }
        buffer[..payload.len()].copy_from_slice(payload);
        Ok(payload.len())
    }

    #[test]
    fn test_size_query_then_fill() {
        let api = MemoryEventLog::new();
        let mut calls = 0;
        let (buffer, used) = fill_required(&api, "EvtRender", |buf| {
            calls += 1;
            write_payload(buf, b"payload")
        })
        .unwrap();

        assert_eq!(calls, 2);
        assert_eq!(used, 7);
        assert_eq!(buffer.len(), 7);
        assert_eq!(&buffer.as_bytes()[..used], b"payload");
    }

    #[test]
    fn test_stale_size_is_retried() {
        let api = MemoryEventLog::new();
        let mut calls = 0;
        let (buffer, used) = fill_required(&api, "EvtRender", |buf| {
            calls += 1;
            // The data grows by 4 bytes after the sizing call.
            let payload = if calls == 1 { &b"four"[..] } else { &b"eight!!!"[..] };
            write_payload(buf, payload)
        })
        .unwrap();

        assert_eq!(calls, 3);
        assert_eq!(&buffer.as_bytes()[..used], b"eight!!!");
    }

    #[test]
    fn test_gives_up_after_retry_budget() {
        let api = MemoryEventLog::new();
        let mut calls = 0;
        let result = fill_required(&api, "EvtRender", |_buf| -> NativeResult<usize> {
            calls += 1;
            Err(Status::InsufficientBuffer { needed: 16 })
        });

        // sizing call + fill + two extra retries
        assert_eq!(calls, 2 + EXTRA_GROW_RETRIES);
        match result {
            Err(err) => assert_eq!(err.code(), Some(ERROR_INSUFFICIENT_BUFFER)),
            Ok(_) => panic!("expected the retry budget to be exhausted"),
        }
    }

    #[test]
    fn test_other_failures_surface_immediately() {
        let api = MemoryEventLog::new();
        let mut calls = 0;
        let result = fill(&api, "EvtNextChannelPath", |_buf| -> NativeResult<usize> {
            calls += 1;
            Err(Status::Failed(5))
        });

        assert_eq!(calls, 1);
        assert!(matches!(
            result,
            Err(EvtError::NativeCallFailed { code: 5, .. })
        ));
    }

    #[test]
    fn test_no_more_items_is_not_an_error() {
        let api = MemoryEventLog::new();
        let result = fill(&api, "EvtNextChannelPath", |_buf| -> NativeResult<usize> {
            Err(Status::NoMoreItems)
        })
        .unwrap();

        assert!(matches!(result, Fill::NoMoreItems));
    }

    #[test]
    fn test_oversized_request_is_out_of_memory() {
        let api = MemoryEventLog::new();
        let mut calls = 0;
        let result = fill(&api, "EvtRender", |_buf| -> NativeResult<usize> {
            calls += 1;
            Err(Status::InsufficientBuffer { needed: usize::MAX })
        });

        assert_eq!(calls, 1);
        assert!(matches!(
            result,
            Err(EvtError::OutOfMemory { size: usize::MAX })
        ));
    }

    #[test]
    fn test_buffer_is_aligned_for_variants() {
        let mut buffer = RenderBuffer::with_len(13).unwrap();
        assert_eq!(buffer.len(), 13);
        assert_eq!(buffer.as_bytes().as_ptr() as usize % 8, 0);
        assert!(buffer.as_bytes_mut().iter().all(|&b| b == 0));
    }
}
