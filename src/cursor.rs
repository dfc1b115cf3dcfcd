//! High-water-mark tracking and search-expression templating.
//!
//! The cursor only ever moves forward within a run. There is no persistence
//! across restarts; a fresh process starts from the mailbox's current
//! maximum UID (or from zero when backfill is requested).

/// Literal placeholder substituted into the configured search template.
pub const LAST_UID_PLACEHOLDER: &str = "${lastUID}";

/// The incremental-fetch cursor for one mailbox.
#[derive(Debug, Clone)]
pub struct MailboxCursor {
    last_seen_uid: Option<u32>,
    search_template: String,
    /// One-shot backfill: treat the floor as zero on the next poll.
    backfill_pending: bool,
    backfill_done: bool,
}

impl MailboxCursor {
    pub fn new(search_template: impl Into<String>, backfill: bool) -> Self {
        Self {
            last_seen_uid: None,
            search_template: search_template.into(),
            backfill_pending: backfill,
            backfill_done: false,
        }
    }

    /// Whether the mailbox's current maximum UID still has to be queried.
    pub fn needs_initial_uid(&self) -> bool {
        self.last_seen_uid.is_none()
    }

    /// Seed the cursor with the mailbox's current maximum UID.
    pub fn set_initial_uid(&mut self, max_uid: u32) {
        if self.last_seen_uid.is_none() {
            self.last_seen_uid = Some(max_uid);
        }
    }

    pub fn last_seen_uid(&self) -> u32 {
        self.last_seen_uid.unwrap_or(0)
    }

    /// The UID floor for the next poll: zero while a backfill is pending,
    /// otherwise the high-water mark.
    pub fn effective_floor(&self) -> u32 {
        if self.backfill_pending {
            0
        } else {
            self.last_seen_uid()
        }
    }

    /// Render the search expression for the current floor. The output never
    /// contains the literal `${lastUID}` placeholder.
    pub fn build_search_expression(&self) -> String {
        self.search_template
            .replace(LAST_UID_PLACEHOLDER, &self.effective_floor().to_string())
    }

    /// Latch the backfill off once its poll has run. Never re-triggers.
    pub fn finish_backfill(&mut self) {
        if self.backfill_pending {
            self.backfill_pending = false;
            self.backfill_done = true;
        }
    }

    pub fn backfill_pending(&self) -> bool {
        self.backfill_pending
    }

    pub fn backfill_done(&self) -> bool {
        self.backfill_done
    }

    /// Move the high-water mark up to `new_max`. Calls with a smaller value
    /// are ignored; the cursor is monotonically non-decreasing.
    pub fn advance(&mut self, new_max: u32) {
        if new_max > self.last_seen_uid() {
            self.last_seen_uid = Some(new_max);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_SEARCH;

    #[test]
    fn search_expression_substitutes_placeholder() {
        let mut cursor = MailboxCursor::new(DEFAULT_SEARCH, false);
        cursor.set_initial_uid(42);

        let expression = cursor.build_search_expression();
        assert_eq!(expression, "(UID 42:* UNSEEN)");
        assert!(!expression.contains(LAST_UID_PLACEHOLDER));
    }

    #[test]
    fn search_expression_never_leaves_placeholder_for_any_template() {
        for template in ["UID ${lastUID}:*", "${lastUID}", "ALL", "${lastUID} ${lastUID}"] {
            let mut cursor = MailboxCursor::new(template, false);
            cursor.set_initial_uid(7);
            assert!(
                !cursor.build_search_expression().contains(LAST_UID_PLACEHOLDER),
                "template '{template}' leaked the placeholder"
            );
        }
    }

    #[test]
    fn advance_is_monotonic() {
        let mut cursor = MailboxCursor::new(DEFAULT_SEARCH, false);
        cursor.set_initial_uid(10);
        cursor.advance(15);
        assert_eq!(cursor.last_seen_uid(), 15);
        cursor.advance(12);
        assert_eq!(cursor.last_seen_uid(), 15);
        cursor.advance(15);
        assert_eq!(cursor.last_seen_uid(), 15);
    }

    #[test]
    fn backfill_uses_zero_floor_then_latches_off() {
        let mut cursor = MailboxCursor::new(DEFAULT_SEARCH, true);
        cursor.set_initial_uid(99);

        assert_eq!(cursor.effective_floor(), 0);
        assert_eq!(cursor.build_search_expression(), "(UID 0:* UNSEEN)");

        cursor.finish_backfill();
        assert!(!cursor.backfill_pending());
        assert!(cursor.backfill_done());
        assert_eq!(cursor.effective_floor(), 99);

        // A second finish must not re-open the backfill window.
        cursor.finish_backfill();
        assert!(cursor.backfill_done());
        assert_eq!(cursor.effective_floor(), 99);
    }

    #[test]
    fn initial_uid_is_set_once() {
        let mut cursor = MailboxCursor::new(DEFAULT_SEARCH, false);
        assert!(cursor.needs_initial_uid());
        cursor.set_initial_uid(5);
        cursor.set_initial_uid(3);
        assert_eq!(cursor.last_seen_uid(), 5);
        assert!(!cursor.needs_initial_uid());
    }
}
