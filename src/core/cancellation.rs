use tokio_util::sync::CancellationToken;

/// Stop handle for one in-flight generation.
///
/// The same token is handed to the request future and to the chunk reader, so
/// a single [`stop`](Self::stop) both aborts the connection and ends the
/// consume loop. A new send allocates a new controller; a stopped one is
/// never reused.
#[derive(Debug, Clone, Default)]
pub struct CancellationController {
    token: CancellationToken,
}

impl CancellationController {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token to thread into network calls and stream readers.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}
