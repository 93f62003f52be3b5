use async_trait::async_trait;

/// Response-delivery handler bound to a session by the transport layer.
///
/// A session holds at most one reader; installing another disposes the previous.
#[async_trait]
pub trait ResponseReader: Send + Sync + 'static {
    /// Releases the reader. Called once, when it is replaced or the session ends.
    async fn dispose(&self);

    /// The session's store failed; pending readers should fault.
    async fn session_failed(&self);

    /// The client went away; `purged` when its work was thrown away.
    async fn client_disconnect(&self, purged: bool);
}
