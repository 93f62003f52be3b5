//! Client session states.
//!
//! ```text
//! NotStarted ─┬─► ClientConnected ──eom──► EndRequests ─┐
//!             ├─► EndRequests                           ├─all processed─► AllRequestDone
//!             └─► GetResponseOnly ──────────────────────┘
//! any non-terminal ──idle / purge / done & unbound──► Disconnected (terminal)
//! ```

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Constructed, initial state not yet chosen.
    NotStarted,
    /// Accepting requests and flushes.
    ClientConnected,
    /// End-of-message accepted; waiting for processing.
    EndRequests,
    /// Reattached after every request was processed; serving responses only.
    GetResponseOnly,
    /// Store reported every admitted request processed.
    AllRequestDone,
    /// Terminal; the session is evicted from the registry.
    Disconnected,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Disconnected)
    }

    /// Counts toward the registry's "all done" aggregate.
    pub fn is_done(self) -> bool {
        matches!(
            self,
            SessionState::AllRequestDone | SessionState::GetResponseOnly
        )
    }

    /// States from which the store's all-processed signal moves to `AllRequestDone`.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::ClientConnected
                | SessionState::EndRequests
                | SessionState::GetResponseOnly
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::NotStarted => "not_started",
            SessionState::ClientConnected => "client_connected",
            SessionState::EndRequests => "end_requests",
            SessionState::GetResponseOnly => "get_response_only",
            SessionState::AllRequestDone => "all_request_done",
            SessionState::Disconnected => "disconnected",
        }
    }
}
