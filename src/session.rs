//! IMAP session lifecycle: connect, select, liveness probe, reconnect
//! backoff, disconnect.
//!
//! The mail protocol is consumed through the [`MailSession`] capability trait
//! so the poll loop can be exercised against a mock mailbox. The production
//! implementation wraps the blocking `imap` crate over `native-tls` and is
//! only ever driven from inside `spawn_blocking`.

use crate::ConnectError;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

/// Interval during which reconnect attempts are suppressed after a failure.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(60);

/// The mail-protocol operations the forwarding pipeline consumes.
pub trait MailSession {
    fn list_folders(&mut self) -> Result<Vec<String>, String>;
    fn select(&mut self, folder: &str) -> Result<(), String>;
    /// Liveness probe (NOOP).
    fn check_alive(&mut self) -> bool;
    /// UID search returning matching identifiers in ascending order.
    fn uid_search(&mut self, query: &str) -> Result<Vec<u32>, String>;
    /// Fetch the full raw message (RFC 822) for one UID.
    fn uid_fetch(&mut self, uid: u32) -> Result<Vec<u8>, String>;
    fn uid_mark_seen(&mut self, uid: u32) -> Result<(), String>;
    fn logout(&mut self);
}

/// Produces fresh sessions; the seam the backoff logic is tested through.
pub trait MailConnector {
    type Session: MailSession;

    fn connect(&self) -> Result<Self::Session, ConnectError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

/// Owns the mailbox session and its reconnect policy.
pub struct SessionManager<C: MailConnector> {
    connector: C,
    folder: String,
    session: Option<C::Session>,
    state: SessionState,
    next_attempt_allowed_at: Option<Instant>,
}

impl<C: MailConnector> SessionManager<C> {
    pub fn new(connector: C, folder: impl Into<String>) -> Self {
        Self {
            connector,
            folder: folder.into(),
            session: None,
            state: SessionState::Disconnected,
            next_attempt_allowed_at: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Return a live session, reconnecting if the current one fails its
    /// liveness probe. After a failed attempt the manager is Degraded and
    /// further attempts are suppressed until the backoff window elapses.
    pub fn ensure_connected(&mut self) -> Result<&mut C::Session, ConnectError> {
        self.ensure_connected_at(Instant::now())
    }

    pub fn ensure_connected_at(&mut self, now: Instant) -> Result<&mut C::Session, ConnectError> {
        let alive = self
            .session
            .as_mut()
            .is_some_and(MailSession::check_alive);
        if alive {
            self.state = SessionState::Connected;
            return Ok(self.session.as_mut().expect("session present"));
        }
        if self.session.is_some() {
            tracing::warn!("liveness probe failed, dropping mailbox session");
            self.drop_session();
        }

        if let Some(allowed_at) = self.next_attempt_allowed_at
            && now < allowed_at
        {
            return Err(ConnectError::BackoffActive);
        }

        self.state = SessionState::Connecting;
        match self.open_session() {
            Ok(()) => {
                self.state = SessionState::Connected;
                self.next_attempt_allowed_at = None;
                Ok(self.session.as_mut().expect("session just opened"))
            }
            Err(error) => {
                self.state = SessionState::Degraded;
                self.next_attempt_allowed_at = Some(now + RECONNECT_BACKOFF);
                Err(error)
            }
        }
    }

    fn open_session(&mut self) -> Result<(), ConnectError> {
        let mut session = self.connector.connect()?;

        // Diagnostic only; a listing failure is not fatal to the connect.
        match session.list_folders() {
            Ok(folders) => tracing::info!(?folders, "mailbox folders"),
            Err(error) => tracing::debug!(%error, "cannot list mailbox folders"),
        }

        session
            .select(&self.folder)
            .map_err(|error| ConnectError::Protocol(format!(
                "cannot select folder '{}': {error}",
                self.folder
            )))?;

        tracing::info!(folder = %self.folder, "mailbox session established");
        self.session = Some(session);
        Ok(())
    }

    /// Orderly logout and drop of the current session, if any.
    pub fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.logout();
        }
        self.state = SessionState::Disconnected;
    }

    fn drop_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.logout();
        }
        self.state = SessionState::Disconnected;
    }
}

// -- Production connector --

type ImapSession = imap::Session<native_tls::TlsStream<TcpStream>>;

/// Connects to the IMAP server over TLS with a socket timeout.
pub struct TlsMailConnector {
    host: String,
    port: u16,
    user: String,
    password: String,
    timeout: Duration,
}

impl TlsMailConnector {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
            timeout,
        }
    }
}

impl MailConnector for TlsMailConnector {
    type Session = ImapMailSession;

    fn connect(&self) -> Result<Self::Session, ConnectError> {
        let address = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|error| ConnectError::Dns {
                host: self.host.clone(),
                port: self.port,
                reason: error.to_string(),
            })?
            .next()
            .ok_or_else(|| ConnectError::Dns {
                host: self.host.clone(),
                port: self.port,
                reason: "no address resolved".to_string(),
            })?;

        let tcp = TcpStream::connect_timeout(&address, self.timeout).map_err(|error| {
            ConnectError::Dns {
                host: self.host.clone(),
                port: self.port,
                reason: error.to_string(),
            }
        })?;
        tcp.set_read_timeout(Some(self.timeout))
            .and_then(|()| tcp.set_write_timeout(Some(self.timeout)))
            .map_err(|error| ConnectError::Protocol(error.to_string()))?;

        let tls = native_tls::TlsConnector::builder()
            .build()
            .map_err(|error| ConnectError::Protocol(error.to_string()))?;
        let mut tls_stream = tls
            .connect(&self.host, tcp)
            .map_err(|error| ConnectError::Protocol(error.to_string()))?;

        // The server greeting has to be consumed before the first command,
        // since the stream is handed to the client untouched.
        let greeting = read_line(&mut tls_stream)
            .map_err(|error| ConnectError::Protocol(format!("cannot read greeting: {error}")))?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(ConnectError::Protocol(format!(
                "unexpected server greeting: {}",
                greeting.trim_end()
            )));
        }

        let client = imap::Client::new(tls_stream);
        let session = client
            .login(&self.user, &self.password)
            .map_err(|(error, _client)| ConnectError::Auth {
                user: self.user.clone(),
                reason: error.to_string(),
            })?;

        Ok(ImapMailSession { session })
    }
}

/// Read one CRLF-terminated protocol line from an unbuffered stream.
fn read_line<S: Read>(stream: &mut S) -> std::io::Result<String> {
    let mut line = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !line.ends_with(b"\r\n") {
        if stream.read(&mut byte)? == 0 {
            break;
        }
        line.push(byte[0]);
        if line.len() > 8 * 1024 {
            return Err(std::io::Error::other("greeting line too long"));
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// [`MailSession`] over a live `imap` TLS session.
pub struct ImapMailSession {
    session: ImapSession,
}

impl MailSession for ImapMailSession {
    fn list_folders(&mut self) -> Result<Vec<String>, String> {
        let names = self
            .session
            .list(Some(""), Some("*"))
            .map_err(|error| error.to_string())?;
        Ok(names.iter().map(|name| name.name().to_string()).collect())
    }

    fn select(&mut self, folder: &str) -> Result<(), String> {
        self.session
            .select(folder)
            .map(|_| ())
            .map_err(|error| error.to_string())
    }

    fn check_alive(&mut self) -> bool {
        self.session.noop().is_ok()
    }

    fn uid_search(&mut self, query: &str) -> Result<Vec<u32>, String> {
        let uids = self
            .session
            .uid_search(query)
            .map_err(|error| error.to_string())?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    fn uid_fetch(&mut self, uid: u32) -> Result<Vec<u8>, String> {
        let fetches = self
            .session
            .uid_fetch(uid.to_string(), "(UID RFC822)")
            .map_err(|error| error.to_string())?;
        let fetch = fetches
            .iter()
            .find(|fetch| fetch.uid.unwrap_or(uid) == uid)
            .or_else(|| fetches.first())
            .ok_or_else(|| format!("no fetch response for UID {uid}"))?;
        fetch
            .body()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| format!("fetch response for UID {uid} has no body"))
    }

    fn uid_mark_seen(&mut self, uid: u32) -> Result<(), String> {
        self.session
            .uid_store(uid.to_string(), "+FLAGS (\\Seen)")
            .map(|_| ())
            .map_err(|error| error.to_string())
    }

    fn logout(&mut self) {
        self.session.close().ok();
        self.session.logout().ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct FakeSession {
        alive: bool,
    }

    impl MailSession for FakeSession {
        fn list_folders(&mut self) -> Result<Vec<String>, String> {
            Ok(vec!["INBOX".to_string()])
        }

        fn select(&mut self, _folder: &str) -> Result<(), String> {
            Ok(())
        }

        fn check_alive(&mut self) -> bool {
            self.alive
        }

        fn uid_search(&mut self, _query: &str) -> Result<Vec<u32>, String> {
            Ok(Vec::new())
        }

        fn uid_fetch(&mut self, uid: u32) -> Result<Vec<u8>, String> {
            Err(format!("no such uid {uid}"))
        }

        fn uid_mark_seen(&mut self, _uid: u32) -> Result<(), String> {
            Ok(())
        }

        fn logout(&mut self) {}
    }

    struct FlakyConnector {
        attempts: Rc<RefCell<u32>>,
        fail_first: u32,
    }

    impl MailConnector for FlakyConnector {
        type Session = FakeSession;

        fn connect(&self) -> Result<FakeSession, ConnectError> {
            let mut attempts = self.attempts.borrow_mut();
            *attempts += 1;
            if *attempts <= self.fail_first {
                Err(ConnectError::Protocol("server unavailable".to_string()))
            } else {
                Ok(FakeSession { alive: true })
            }
        }
    }

    #[test]
    fn connects_and_reuses_live_session() {
        let attempts = Rc::new(RefCell::new(0));
        let connector = FlakyConnector {
            attempts: attempts.clone(),
            fail_first: 0,
        };
        let mut manager = SessionManager::new(connector, "INBOX");

        let now = Instant::now();
        assert!(manager.ensure_connected_at(now).is_ok());
        assert_eq!(manager.state(), SessionState::Connected);
        assert!(manager.ensure_connected_at(now).is_ok());
        // Second call reused the live session instead of reconnecting.
        assert_eq!(*attempts.borrow(), 1);
    }

    #[test]
    fn failed_connect_opens_backoff_window() {
        let attempts = Rc::new(RefCell::new(0));
        let connector = FlakyConnector {
            attempts: attempts.clone(),
            fail_first: u32::MAX,
        };
        let mut manager = SessionManager::new(connector, "INBOX");

        let start = Instant::now();
        assert!(matches!(
            manager.ensure_connected_at(start),
            Err(ConnectError::Protocol(_))
        ));
        assert_eq!(manager.state(), SessionState::Degraded);

        // Inside the window no further attempt happens.
        assert!(matches!(
            manager.ensure_connected_at(start + Duration::from_secs(5)),
            Err(ConnectError::BackoffActive)
        ));
        assert!(matches!(
            manager.ensure_connected_at(start + Duration::from_secs(59)),
            Err(ConnectError::BackoffActive)
        ));
        assert_eq!(*attempts.borrow(), 1);

        // Once the window elapses a fresh attempt is made.
        assert!(manager.ensure_connected_at(start + RECONNECT_BACKOFF).is_err());
        assert_eq!(*attempts.borrow(), 2);
    }

    #[test]
    fn successful_reconnect_clears_backoff() {
        let attempts = Rc::new(RefCell::new(0));
        let connector = FlakyConnector {
            attempts: attempts.clone(),
            fail_first: 1,
        };
        let mut manager = SessionManager::new(connector, "INBOX");

        let start = Instant::now();
        assert!(manager.ensure_connected_at(start).is_err());
        assert!(manager.ensure_connected_at(start + RECONNECT_BACKOFF).is_ok());
        assert_eq!(manager.state(), SessionState::Connected);

        manager.disconnect();
        assert_eq!(manager.state(), SessionState::Disconnected);
        // No backoff window after the successful connect.
        assert!(manager.ensure_connected_at(start + RECONNECT_BACKOFF).is_ok());
    }

    #[test]
    fn dead_session_triggers_reconnect() {
        struct DeadFirstConnector {
            attempts: Rc<RefCell<u32>>,
        }

        impl MailConnector for DeadFirstConnector {
            type Session = FakeSession;

            fn connect(&self) -> Result<FakeSession, ConnectError> {
                let mut attempts = self.attempts.borrow_mut();
                *attempts += 1;
                // First session comes up dead; replacements are healthy.
                Ok(FakeSession {
                    alive: *attempts > 1,
                })
            }
        }

        let attempts = Rc::new(RefCell::new(0));
        let connector = DeadFirstConnector {
            attempts: attempts.clone(),
        };
        let mut manager = SessionManager::new(connector, "INBOX");

        let now = Instant::now();
        assert!(manager.ensure_connected_at(now).is_ok());
        assert!(manager.ensure_connected_at(now).is_ok());
        assert_eq!(*attempts.borrow(), 2);
    }
}
