//! Account session lifecycle.
//!
//! Two states: logged in or logged out. The platform signals expiry
//! asynchronously; from then on the account is unusable until a re-login
//! succeeds, so the re-login loop never gives up: three attempts with a
//! 30 second pause after each failure, a 60 second breather, repeat. A
//! login that fails because a mobile confirmation is required is surfaced
//! as a warning (the operator has to act) but stays in the same loop.
//!
//! Concurrent expiry signals coalesce into the one running loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use swap_common::Credentials;

use crate::events::EventSink;
use crate::platform::{AuthError, CodeGenerator, SessionToken, SessionTransport};

const ATTEMPTS_PER_CYCLE: u32 = 3;
const ATTEMPT_PAUSE: Duration = Duration::from_secs(30);
const CYCLE_PAUSE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    LoggedIn,
    LoggedOut,
}

pub struct SessionCoordinator {
    transport: Arc<dyn SessionTransport>,
    codes: Arc<dyn CodeGenerator>,
    credentials: Credentials,
    state: Mutex<SessionState>,
    relogin_running: AtomicBool,
    events: EventSink,
}

impl SessionCoordinator {
    pub fn new(
        transport: Arc<dyn SessionTransport>,
        codes: Arc<dyn CodeGenerator>,
        credentials: Credentials,
        events: EventSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            codes,
            credentials,
            state: Mutex::new(SessionState::LoggedOut),
            relogin_running: AtomicBool::new(false),
            events,
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_logged_in(&self) -> bool {
        self.state() == SessionState::LoggedIn
    }

    /// One login attempt with a fresh one-time code.
    pub async fn login_once(&self) -> Result<SessionToken, AuthError> {
        let code = self.codes.auth_code(&self.credentials.shared_secret);
        match self.transport.login(&self.credentials, &code).await {
            Ok(token) => {
                *self.state.lock() = SessionState::LoggedIn;
                self.events.info("Logged in successfully");
                Ok(token)
            }
            Err(err) => {
                self.report_login_failure(&err);
                Err(err)
            }
        }
    }

    /// Platform signalled session expiry: mark logged out and start the
    /// re-login loop, unless one is already running.
    pub fn handle_session_expired(self: &Arc<Self>) {
        *self.state.lock() = SessionState::LoggedOut;
        if self.relogin_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.relogin_loop().await;
        });
    }

    async fn relogin_loop(self: Arc<Self>) {
        self.events.info("Session expired, logging in again");
        loop {
            for _ in 0..ATTEMPTS_PER_CYCLE {
                if self.login_once().await.is_ok() {
                    self.relogin_running.store(false, Ordering::SeqCst);
                    return;
                }
                tokio::time::sleep(ATTEMPT_PAUSE).await;
            }
            self.events.err(
                "Unable to log in, waiting a minute before retrying",
                None,
            );
            tokio::time::sleep(CYCLE_PAUSE).await;
        }
    }

    fn report_login_failure(&self, err: &AuthError) {
        match err {
            AuthError::MobileConfirmationRequired => {
                // Not a transient fault: retrying alone cannot fix it.
                self.events
                    .warning("Login requires a mobile confirmation, operator action needed");
            }
            other => self
                .events
                .err("Error logging in", Some(other.to_string())),
        }
    }
}
