//! # Transaction Journal
//!
//! Durable, ordered queue of local writes made while the authoritative
//! terminal could not be reached.
//!
//! ## Guarantees
//! - An acknowledged `enqueue` is on disk (FULL synchronous commit).
//! - A retried enqueue with the same entry key returns the original seq.
//! - `pending_entries` yields drainable entries in seq order, bounded by
//!   the highest seq present when the stream started.
//! - After `max_retries` failed attempts an entry is dead-lettered and
//!   never drained again.

use chrono::Utc;
use futures_util::stream::{self, Stream};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use meridian_core::{JournalEntry, JournalStatus, NewJournalEntry};
use meridian_db::{Database, JournalRead, JournalRepository, JournalStats};

use crate::error::{SyncError, SyncResult};

const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone)]
pub struct TransactionJournal {
    repo: JournalRepository,
    /// Single writer: appends are serialized in-process as well as by SQLite.
    write_lock: Arc<Mutex<()>>,
    max_retries: u32,
    page_size: u32,
}

impl TransactionJournal {
    pub fn new(db: &Database, max_retries: u32) -> Self {
        TransactionJournal {
            repo: db.journal(),
            write_lock: Arc::new(Mutex::new(())),
            max_retries,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Appends an entry and returns its sequence number.
    pub async fn enqueue(&self, entry: NewJournalEntry) -> SyncResult<i64> {
        let _guard = self.write_lock.lock().await;
        let appended = self.repo.append(&entry, Utc::now()).await?;
        log_append(&entry, appended.seq, appended.inserted);
        Ok(appended.seq)
    }

    /// Applies a local write to this terminal's replica and journals it in
    /// the same transaction.
    pub async fn enqueue_local_write(&self, entry: NewJournalEntry) -> SyncResult<i64> {
        let record = entry
            .envelope
            .payload
            .to_record(entry.operation, &entry.origin_terminal_id)?;

        let _guard = self.write_lock.lock().await;
        let appended = self
            .repo
            .append_with_record(&entry, &record, Utc::now())
            .await?;
        log_append(&entry, appended.seq, appended.inserted);
        Ok(appended.seq)
    }

    /// Drainable entries in seq order, optionally for one table.
    ///
    /// Corrupt rows come through as [`SyncError::CorruptJournalRecord`] and
    /// the stream carries on past them. A database failure ends the stream
    /// after yielding the error.
    pub fn pending_entries(
        &self,
        table: Option<&str>,
    ) -> impl Stream<Item = SyncResult<JournalEntry>> + Send + 'static {
        self.pending_entries_after(0, table)
    }

    /// Same as [`pending_entries`](Self::pending_entries), resuming after `after_seq`.
    pub fn pending_entries_after(
        &self,
        after_seq: i64,
        table: Option<&str>,
    ) -> impl Stream<Item = SyncResult<JournalEntry>> + Send + 'static {
        let state = DrainCursor {
            repo: self.repo.clone(),
            table: table.map(str::to_string),
            cursor: after_seq,
            high_water: None,
            buffer: VecDeque::new(),
            page_size: self.page_size,
            exhausted: false,
        };

        stream::unfold(state, |mut state| async move {
            let item = state.next_item().await?;
            Some((item, state))
        })
    }

    /// Idempotent; returns whether the entry changed state.
    pub async fn mark_applied(&self, seq: i64) -> SyncResult<bool> {
        Ok(self.repo.mark_applied(seq, Utc::now()).await?)
    }

    /// Records a failed attempt and returns the entry's new status.
    pub async fn mark_failed(&self, seq: i64, reason: &str) -> SyncResult<JournalStatus> {
        self.repo
            .mark_failed(seq, reason, self.max_retries, Utc::now())
            .await?
            .ok_or_else(|| SyncError::JournalEntryApplyFailed {
                seq,
                reason: "entry is no longer drainable".into(),
            })
    }

    /// Moves an undecodable entry to dead-letter.
    pub async fn quarantine(&self, seq: i64, reason: &str) -> SyncResult<bool> {
        error!(seq, %reason, "Quarantining corrupt journal entry");
        Ok(self.repo.quarantine(seq, reason, Utc::now()).await?)
    }

    pub async fn dead_letters(&self, limit: u32) -> SyncResult<Vec<JournalRead>> {
        Ok(self.repo.dead_letters(limit).await?)
    }

    /// Entries still waiting to be applied (pending or failed).
    pub async fn count_pending(&self) -> SyncResult<i64> {
        Ok(self.repo.count_pending().await?)
    }

    pub async fn stats(&self) -> SyncResult<JournalStats> {
        Ok(self.repo.stats().await?)
    }

    /// Deletes applied entries older than `older_than`.
    pub async fn purge_applied(&self, older_than: chrono::Duration) -> SyncResult<u64> {
        let purged = self.repo.purge_applied(Utc::now() - older_than).await?;
        if purged > 0 {
            info!(purged, "Purged applied journal entries");
        }
        Ok(purged)
    }
}

fn log_append(entry: &NewJournalEntry, seq: i64, inserted: bool) {
    if inserted {
        debug!(seq, table = entry.target_table(), entry_key = %entry.entry_key, "Journal entry appended");
    } else {
        debug!(seq, entry_key = %entry.entry_key, "Duplicate enqueue, returning original seq");
    }
}

// =============================================================================
// Drain Cursor
// =============================================================================

struct DrainCursor {
    repo: JournalRepository,
    table: Option<String>,
    cursor: i64,
    /// Captured on the first page; later appends wait for the next drain.
    high_water: Option<i64>,
    buffer: VecDeque<JournalRead>,
    page_size: u32,
    exhausted: bool,
}

impl DrainCursor {
    async fn next_item(&mut self) -> Option<SyncResult<JournalEntry>> {
        loop {
            if let Some(read) = self.buffer.pop_front() {
                self.cursor = read.seq();
                return Some(match read {
                    JournalRead::Entry(entry) => Ok(entry),
                    JournalRead::Corrupt { seq, reason } => {
                        Err(SyncError::CorruptJournalRecord { seq, reason })
                    }
                });
            }

            if self.exhausted {
                return None;
            }

            if let Err(e) = self.fill().await {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
    }

    async fn fill(&mut self) -> SyncResult<()> {
        let high_water = match self.high_water {
            Some(seq) => seq,
            None => {
                let seq = self.repo.high_water_seq().await?;
                self.high_water = Some(seq);
                seq
            }
        };

        let page = self
            .repo
            .fetch_drainable(self.cursor, high_water, self.table.as_deref(), self.page_size)
            .await?;

        if (page.len() as u32) < self.page_size {
            self.exhausted = true;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{customer_entry, memory_db};
    use futures_util::{pin_mut, StreamExt};
    use meridian_db::DbConfig;

    async fn collect(journal: &TransactionJournal, table: Option<&str>) -> Vec<SyncResult<JournalEntry>> {
        let stream = journal.pending_entries(table);
        pin_mut!(stream);
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.push(item);
        }
        out
    }

    fn seqs(items: &[SyncResult<JournalEntry>]) -> Vec<i64> {
        items
            .iter()
            .map(|item| match item {
                Ok(entry) => entry.seq,
                Err(SyncError::CorruptJournalRecord { seq, .. }) => -seq,
                Err(e) => panic!("unexpected error: {}", e),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_on_key() {
        let db = memory_db().await;
        let journal = TransactionJournal::new(&db, 3);

        let entry = customer_entry("TERM-B", "c-1", "Ada", 1_000).with_key("sale-77");
        let first = journal.enqueue(entry.clone()).await.unwrap();
        let second = journal.enqueue(entry).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(journal.count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pending_entries_in_seq_order_with_table_filter() {
        let db = memory_db().await;
        let journal = TransactionJournal::new(&db, 3).with_page_size(2);

        for i in 0..5 {
            journal
                .enqueue(customer_entry("TERM-B", &format!("c-{}", i), "x", 1_000 + i))
                .await
                .unwrap();
        }

        let items = collect(&journal, None).await;
        assert_eq!(seqs(&items), vec![1, 2, 3, 4, 5]);

        assert!(collect(&journal, Some("customers")).await.len() == 5);
        assert!(collect(&journal, Some("products")).await.is_empty());
    }

    #[tokio::test]
    async fn test_stream_is_bounded_by_high_water() {
        let db = memory_db().await;
        let journal = TransactionJournal::new(&db, 3).with_page_size(1);

        journal.enqueue(customer_entry("TERM-B", "c-1", "a", 1)).await.unwrap();
        journal.enqueue(customer_entry("TERM-B", "c-2", "b", 2)).await.unwrap();

        let stream = journal.pending_entries(None);
        pin_mut!(stream);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.seq, 1);

        // Appended mid-drain: belongs to the next drain
        journal.enqueue(customer_entry("TERM-B", "c-3", "c", 3)).await.unwrap();

        let mut rest = Vec::new();
        while let Some(item) = stream.next().await {
            rest.push(item.unwrap().seq);
        }
        assert_eq!(rest, vec![2]);

        let resumed = journal.pending_entries_after(2, None);
        pin_mut!(resumed);
        assert_eq!(resumed.next().await.unwrap().unwrap().seq, 3);
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_retries() {
        let db = memory_db().await;
        let journal = TransactionJournal::new(&db, 3);
        let seq = journal
            .enqueue(customer_entry("TERM-B", "c-1", "Ada", 1_000))
            .await
            .unwrap();

        assert_eq!(journal.mark_failed(seq, "timeout").await.unwrap(), JournalStatus::Failed);
        assert_eq!(journal.mark_failed(seq, "timeout").await.unwrap(), JournalStatus::Failed);
        assert_eq!(
            journal.mark_failed(seq, "timeout").await.unwrap(),
            JournalStatus::DeadLetter
        );

        assert!(collect(&journal, None).await.is_empty());
        assert_eq!(journal.count_pending().await.unwrap(), 0);
        assert_eq!(journal.dead_letters(10).await.unwrap().len(), 1);

        // Settled entries can't fail again
        assert!(journal.mark_failed(seq, "late").await.is_err());
    }

    #[tokio::test]
    async fn test_mark_applied_is_idempotent() {
        let db = memory_db().await;
        let journal = TransactionJournal::new(&db, 3);
        let seq = journal
            .enqueue(customer_entry("TERM-B", "c-1", "Ada", 1_000))
            .await
            .unwrap();

        assert!(journal.mark_applied(seq).await.unwrap());
        assert!(!journal.mark_applied(seq).await.unwrap());
        assert_eq!(journal.stats().await.unwrap().applied, 1);
    }

    #[tokio::test]
    async fn test_corrupt_row_surfaces_without_blocking() {
        let db = memory_db().await;
        let journal = TransactionJournal::new(&db, 3);

        journal.enqueue(customer_entry("TERM-B", "c-1", "a", 1)).await.unwrap();
        journal.enqueue(customer_entry("TERM-B", "c-2", "b", 2)).await.unwrap();
        journal.enqueue(customer_entry("TERM-B", "c-3", "c", 3)).await.unwrap();

        sqlx::query("UPDATE journal_entries SET payload = '{\"version\":1,' WHERE seq = 2")
            .execute(db.pool())
            .await
            .unwrap();

        let items = collect(&journal, None).await;
        assert_eq!(seqs(&items), vec![1, -2, 3]);

        assert!(journal.quarantine(2, "truncated payload").await.unwrap());
        assert_eq!(seqs(&collect(&journal, None).await), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_acknowledged_entries_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("terminal.db");

        {
            let db = Database::new(DbConfig::new(&path)).await.unwrap();
            let journal = TransactionJournal::new(&db, 3);
            for i in 0..3 {
                journal
                    .enqueue_local_write(customer_entry("TERM-B", &format!("c-{}", i), "x", 10 + i))
                    .await
                    .unwrap();
            }
            db.close().await;
        }

        let db = Database::new(DbConfig::new(&path)).await.unwrap();
        let journal = TransactionJournal::new(&db, 3);
        let items = collect(&journal, None).await;
        assert_eq!(seqs(&items), vec![1, 2, 3]);

        // The replica rows were written with their entries
        assert_eq!(db.records().count("customers").await.unwrap(), 3);
    }
}
