//! The poll loop tying the pipeline together.
//!
//! [`MailWorker`] is the blocking half: it drives the IMAP session, runs the
//! incremental search and decodes what it fetched. [`run`] is the async half:
//! it moves the worker through `spawn_blocking` each cycle, composes and
//! dispatches the results, then sleeps until the next cycle.

use crate::config::{Config, MailConfig};
use crate::cursor::MailboxCursor;
use crate::decoder;
use crate::dispatch::Dispatcher;
use crate::session::{MailConnector, MailSession, SessionManager};
use crate::telegram::ChatTransport;
use crate::{compose, ConnectError, DecodedMail, Error};
use std::time::Duration;

/// Owns the mailbox session and the fetch cursor. All methods block; drive
/// it from `spawn_blocking`.
pub struct MailWorker<C: MailConnector> {
    sessions: SessionManager<C>,
    cursor: MailboxCursor,
    config: MailConfig,
}

impl<C: MailConnector> MailWorker<C> {
    pub fn new(connector: C, config: MailConfig) -> Self {
        let cursor = MailboxCursor::new(config.search.clone(), config.read_old_mails);
        Self {
            sessions: SessionManager::new(connector, config.folder.clone()),
            cursor,
            config,
        }
    }

    pub fn last_seen_uid(&self) -> u32 {
        self.cursor.last_seen_uid()
    }

    /// One poll cycle: ensure a session, seed the cursor on first contact,
    /// search, fetch and decode everything above the cursor floor.
    ///
    /// The cursor advances only when the whole batch was fetched; a search or
    /// fetch error abandons the batch, drops the session and leaves the
    /// cursor where it was so the next cycle retries the same mail.
    pub fn poll(&mut self) -> Result<Vec<DecodedMail>, Error> {
        let outcome = {
            let session = self.sessions.ensure_connected()?;
            poll_session(session, &mut self.cursor, &self.config)
        };

        if matches!(outcome, Err(Error::Search { .. } | Error::Fetch { .. })) {
            self.sessions.disconnect();
        }
        outcome
    }

    /// Orderly logout, if a session is open.
    pub fn disconnect(&mut self) {
        self.sessions.disconnect();
    }
}

fn poll_session<S: MailSession>(
    session: &mut S,
    cursor: &mut MailboxCursor,
    config: &MailConfig,
) -> Result<Vec<DecodedMail>, Error> {
    if cursor.needs_initial_uid() {
        // `UID *` matches the message with the highest UID.
        let uids = session.uid_search("UID *").map_err(|reason| Error::Search {
            query: "UID *".to_string(),
            reason,
        })?;
        let max_uid = uids.last().copied().unwrap_or(0);
        cursor.set_initial_uid(max_uid);
        tracing::info!(max_uid, "most recent mailbox UID");
    }

    let query = cursor.build_search_expression();
    let uids = session.uid_search(&query).map_err(|reason| Error::Search {
        query: query.clone(),
        reason,
    })?;

    let floor = cursor.effective_floor();
    if cursor.backfill_pending() {
        tracing::info!(
            last_uid = cursor.last_seen_uid(),
            "ignoring cursor once, processing pre-existing mail first"
        );
    }

    let mut mails = Vec::new();
    let mut max_seen = cursor.last_seen_uid();
    for uid in uids.into_iter().filter(|candidate| *candidate > floor) {
        let raw = session
            .uid_fetch(uid)
            .map_err(|reason| Error::Fetch { uid, reason })?;

        if config.mark_as_read
            && let Err(reason) = session.uid_mark_seen(uid)
        {
            tracing::warn!(uid, %reason, "cannot flag mail as seen");
        }

        max_seen = max_seen.max(uid);
        match decoder::decode(uid, &raw) {
            Ok(mail) => mails.push(mail),
            // The UID is still consumed; a mail that cannot be decoded today
            // will not decode tomorrow either.
            Err(error) => tracing::error!(uid, %error, "cannot process mail"),
        }
    }

    cursor.finish_backfill();
    cursor.advance(max_seen);

    if !mails.is_empty() {
        tracing::info!(
            count = mails.len(),
            last_uid = cursor.last_seen_uid(),
            "new mail fetched"
        );
    }
    Ok(mails)
}

/// Poll until a shutdown signal arrives, forwarding every new mail.
pub async fn run<C, T>(
    mut worker: MailWorker<C>,
    dispatcher: Dispatcher<T>,
    config: Config,
) -> crate::Result<()>
where
    C: MailConnector + Send + 'static,
    C::Session: Send + 'static,
    T: ChatTransport,
{
    dispatcher.announce_destination().await;

    let refresh = Duration::from_secs(config.mail.refresh_secs);
    let disconnect_after_poll = config.mail.disconnect_after_poll;

    loop {
        let (returned, outcome) = tokio::task::spawn_blocking(move || {
            let mut worker = worker;
            let outcome = worker.poll();
            if disconnect_after_poll {
                worker.disconnect();
            }
            (worker, outcome)
        })
        .await
        .map_err(|error| Error::Other(anyhow::anyhow!("poll task failed: {error}")))?;
        worker = returned;

        let mut cycle_failed = false;
        match outcome {
            Ok(mails) => {
                for mail in mails {
                    let mut message = compose::compose(&mail, &config);
                    let report = dispatcher.deliver(&mut message).await;
                    if report.is_clean() {
                        tracing::debug!(
                            uid = mail.uid,
                            delivered = report.delivered,
                            "mail forwarded"
                        );
                    } else {
                        tracing::warn!(
                            uid = mail.uid,
                            failures = report.failures.len(),
                            "mail forwarded with failures"
                        );
                    }
                }
            }
            Err(Error::Connect(ConnectError::BackoffActive)) => {
                tracing::debug!("reconnect backoff active, skipping cycle");
                cycle_failed = true;
            }
            Err(error) => {
                tracing::error!(%error, "poll cycle failed");
                cycle_failed = true;
            }
        }

        // Push mode re-polls immediately, but a failed cycle always honors
        // the refresh interval so a broken server is not hammered.
        let delay = if config.mail.push_mode && !cycle_failed {
            Duration::ZERO
        } else {
            refresh
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
            () = tokio::time::sleep(delay) => {}
        }
    }

    tokio::task::spawn_blocking(move || worker.disconnect())
        .await
        .ok();
    Ok(())
}
