use crate::err::Result;
use crate::render::RenderedRecord;

/// A cursor that pulls one record at a time and renders the current one.
pub trait RecordCursor {
    /// Moves to the next record. Returns `false` when no record is available.
    fn advance(&mut self) -> Result<bool>;

    /// Renders the record the last successful [`RecordCursor::advance`] moved to.
    fn render(&mut self) -> Result<RenderedRecord>;
}

/// Iterator of rendered records over a [`RecordCursor`].
///
/// Ends after the cursor runs out of records, or after yielding the first error.
pub struct Records<'c, C: RecordCursor + ?Sized> {
    cursor: &'c mut C,
    done: bool,
}

impl<'c, C: RecordCursor + ?Sized> Records<'c, C> {
    pub(crate) fn new(cursor: &'c mut C) -> Self {
        Records {
            cursor,
            done: false,
        }
    }
}

impl<C: RecordCursor + ?Sized> Iterator for Records<'_, C> {
    type Item = Result<RenderedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let rendered = match self.cursor.advance() {
            Ok(true) => self.cursor.render(),
            Ok(false) => {
                self.done = true;
                return None;
            }
            Err(e) => Err(e),
        };

        if rendered.is_err() {
            self.done = true;
        }
        Some(rendered)
    }
}
