use crate::models::LogEntry;

/// The most recently forwarded entry: everything up to and including it has
/// already been delivered. Absent until the first successful cycle.
#[derive(Debug, Clone, Default)]
pub struct Cursor {
    last: Option<LogEntry>,
}

impl Cursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<&LogEntry> {
        self.last.as_ref()
    }

    pub fn is_set(&self) -> bool {
        self.last.is_some()
    }

    /// Moves the cursor forward. Only the poll cycle writes it, and only
    /// after the entries up to `entry` were handed to the notifier.
    pub(crate) fn advance(&mut self, entry: LogEntry) {
        self.last = Some(entry);
    }
}

/// Entries of `fresh` (newest first) that are newer than `cursor`.
///
/// Takes from the newest end up to, but excluding, the first entry equal to
/// the cursor. When the cursor is absent, or has scrolled out of the feed
/// window, every fetched entry counts as new. Order is preserved.
pub fn diff<'a>(fresh: &'a [LogEntry], cursor: Option<&LogEntry>) -> &'a [LogEntry] {
    let Some(cursor) = cursor else {
        return fresh;
    };
    let boundary = fresh
        .iter()
        .position(|entry| entry == cursor)
        .unwrap_or(fresh.len());
    &fresh[..boundary]
}
