//! Glue between a text widget and a [`Session`].
//!
//! The widget speaks in its own offsets (UTF-16 code units for most web
//! editors); the shared document is indexed by visible characters. The
//! binding keeps a mirror of what the widget currently shows and uses it to
//! translate in both directions.

use crate::session::{ChangeOrigin, Session, SessionError, TextEvent};
use crate::text::{TextChange, TextError};
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OffsetEncoding {
    #[default]
    Utf16,
    Utf8,
    Chars,
}

impl OffsetEncoding {
    fn width(self, value: char) -> usize {
        match self {
            OffsetEncoding::Utf16 => value.len_utf16(),
            OffsetEncoding::Utf8 => value.len_utf8(),
            OffsetEncoding::Chars => 1,
        }
    }
}

/// A widget-side edit: `deleted` units removed at `offset`, then `inserted`
/// placed there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorEdit {
    pub offset: usize,
    pub deleted: usize,
    pub inserted: String,
}

impl EditorEdit {
    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            deleted: 0,
            inserted: text.into(),
        }
    }

    pub fn delete(offset: usize, deleted: usize) -> Self {
        Self {
            offset,
            deleted,
            inserted: String::new(),
        }
    }
}

pub trait EditorSink {
    /// The widget should now show `text`; `changed` is the span of `text`
    /// (in widget offsets) that differs from what it showed before.
    fn on_remote_change(&mut self, text: &str, changed: Range<usize>);
}

/// Keeps a widget in step with a session.
///
/// `mirror` is the document as of the last event this binding consumed.
/// Every event, local or remote, is replayed into it in the order the session
/// published it, so it never drifts from the replica. Between calls it is
/// also exactly what the widget shows.
#[derive(Debug)]
pub struct EditorBinding<S> {
    session: Arc<Session>,
    events: broadcast::Receiver<TextEvent>,
    encoding: OffsetEncoding,
    mirror: Vec<char>,
    sink: S,
}

impl<S: EditorSink> EditorBinding<S> {
    pub fn new(session: Arc<Session>, encoding: OffsetEncoding, sink: S) -> Self {
        let (text, events) = session.subscribe_text_from_now();
        Self {
            session,
            events,
            encoding,
            mirror: text.chars().collect(),
            sink,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// What the widget is expected to show.
    pub fn text(&self) -> String {
        self.mirror.iter().collect()
    }

    /// Fills an empty shared document with the widget's initial content.
    /// Returns whether the document was seeded.
    pub fn seed_if_empty(&mut self, default: &str) -> Result<bool, SessionError> {
        self.pump();
        if !self.session.is_empty() || default.is_empty() {
            return Ok(false);
        }
        let before = self.mirror.clone();
        let result = self.session.insert(0, default);
        self.drain(&mut (0..0));
        self.notify(&before);
        result.map(|()| true)
    }

    /// Applies an edit the user made in the widget.
    ///
    /// The widget already shows the edit. If remote changes landed first, or
    /// the edit could not be applied, the widget is told what the document
    /// really looks like.
    pub fn on_local_edit(&mut self, edit: EditorEdit) -> Result<(), SessionError> {
        let shown_units = self.units(&self.mirror);
        let end_offset = edit
            .offset
            .checked_add(edit.deleted)
            .filter(|end| *end <= shown_units)
            .ok_or(TextError::PositionOutOfBounds {
                position: edit.offset.saturating_add(edit.deleted),
                len: shown_units,
            })?;
        let mut range = char_index(&self.mirror, self.encoding, edit.offset)
            ..char_index(&self.mirror, self.encoding, end_offset);

        let mut shown = self.mirror.clone();
        shown.splice(range.clone(), edit.inserted.chars());
        // The offsets refer to what the widget showed; move them past changes
        // it has not been told about yet.
        self.drain(&mut range);
        let result = self
            .session
            .replace(range.start, range.len(), &edit.inserted);
        self.drain(&mut (0..0));
        self.notify(&shown);
        result
    }

    /// Forwards every pending change to the widget. Returns how many events
    /// were consumed.
    pub fn pump(&mut self) -> usize {
        let before = self.mirror.clone();
        let applied = self.drain(&mut (0..0));
        self.notify(&before);
        applied
    }

    /// Waits for the next change event and applies it.
    pub async fn next_change(&mut self) -> Option<()> {
        let before = self.mirror.clone();
        match self.events.recv().await {
            Ok(event) => self.apply_event(event, &mut (0..0)),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "binding fell behind, reloading document");
                self.reload();
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
        self.notify(&before);
        Some(())
    }

    /// Replays every queued event into the mirror without telling the widget,
    /// shifting `tracked` along with the text around it.
    fn drain(&mut self, tracked: &mut Range<usize>) -> usize {
        let mut applied = 0;
        loop {
            match self.events.try_recv() {
                Ok(event) => self.apply_event(event, tracked),
                Err(TryRecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "binding fell behind, reloading document");
                    self.reload();
                    clamp(tracked, self.mirror.len());
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return applied,
            }
            applied += 1;
        }
    }

    fn apply_event(&mut self, event: TextEvent, tracked: &mut Range<usize>) {
        if event.origin == ChangeOrigin::Snapshot {
            self.reload();
            clamp(tracked, self.mirror.len());
            return;
        }
        for change in event.changes {
            match change {
                TextChange::Inserted { index, value } => {
                    let index = index.min(self.mirror.len());
                    self.mirror.insert(index, value);
                    if index <= tracked.start {
                        tracked.start += 1;
                        tracked.end += 1;
                    } else if index < tracked.end {
                        tracked.end += 1;
                    }
                }
                TextChange::Deleted { index, .. } => {
                    if index < self.mirror.len() {
                        self.mirror.remove(index);
                        if index < tracked.start {
                            tracked.start -= 1;
                            tracked.end -= 1;
                        } else if index < tracked.end {
                            tracked.end -= 1;
                        }
                    }
                }
            }
        }
    }

    /// Re-reads the document and resubscribes in one step, dropping queued
    /// events the fresh text already contains.
    fn reload(&mut self) {
        let (text, events) = self.session.subscribe_text_from_now();
        self.events = events;
        self.mirror = text.chars().collect();
    }

    /// Tells the widget, which shows `before`, what the document now is.
    fn notify(&mut self, before: &[char]) {
        if before == self.mirror.as_slice() {
            return;
        }
        let prefix = before
            .iter()
            .zip(&self.mirror)
            .take_while(|(a, b)| a == b)
            .count();
        let suffix = before[prefix..]
            .iter()
            .rev()
            .zip(self.mirror[prefix..].iter().rev())
            .take_while(|(a, b)| a == b)
            .count();
        let start = self.units(&self.mirror[..prefix]);
        let end = self.units(&self.mirror[..self.mirror.len() - suffix]);
        let text = self.text();
        self.sink.on_remote_change(&text, start..end);
    }

    fn units(&self, chars: &[char]) -> usize {
        chars.iter().map(|c| self.encoding.width(*c)).sum()
    }
}

fn clamp(range: &mut Range<usize>, len: usize) {
    range.end = range.end.min(len);
    range.start = range.start.min(range.end);
}

/// Visible character index for a widget offset. Offsets inside a surrogate
/// pair or multi-byte sequence round up to the next character.
fn char_index(chars: &[char], encoding: OffsetEncoding, offset: usize) -> usize {
    let mut units = 0;
    for (index, value) in chars.iter().enumerate() {
        if units >= offset {
            return index;
        }
        units += encoding.width(*value);
    }
    chars.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chars(text: &str) -> Vec<char> {
        text.chars().collect()
    }

    #[test]
    fn test_utf16_offsets_skip_surrogate_pairs() {
        let mirror = chars("a😀b");
        let encoding = OffsetEncoding::Utf16;
        assert_eq!(char_index(&mirror, encoding, 0), 0);
        assert_eq!(char_index(&mirror, encoding, 1), 1);
        assert_eq!(char_index(&mirror, encoding, 2), 2);
        assert_eq!(char_index(&mirror, encoding, 3), 2);
        assert_eq!(char_index(&mirror, encoding, 4), 3);
    }

    #[test]
    fn test_utf8_offsets() {
        let mirror = chars("é!");
        let encoding = OffsetEncoding::Utf8;
        assert_eq!(char_index(&mirror, encoding, 2), 1);
        assert_eq!(char_index(&mirror, encoding, 3), 2);
    }

    #[test]
    fn test_default_encoding_is_utf16() {
        assert_eq!(OffsetEncoding::default(), OffsetEncoding::Utf16);
        assert_eq!(OffsetEncoding::Chars.width('😀'), 1);
    }
}
