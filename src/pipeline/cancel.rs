use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::PipelineError;

type DisconnectProbe = Arc<dyn Fn() -> bool + Send + Sync>;

/// Cooperative cancellation for one request.
///
/// The orchestrator checks the token before staging, before every frame and
/// before each durable write. Clones share the explicit flag.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
    probe: Option<DisconnectProbe>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// `probe` returns true once the client has gone away.
    pub fn with_disconnect_probe<F>(mut self, probe: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.probe = Some(Arc::new(probe));
        self
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn reason(&self) -> Option<&'static str> {
        if self.flag.load(Ordering::SeqCst) {
            return Some("cancelled");
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Some("request timed out");
            }
        }
        if let Some(probe) = &self.probe {
            if probe() {
                return Some("client disconnected");
            }
        }
        None
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    pub fn check(&self) -> Result<(), PipelineError> {
        match self.reason() {
            Some(reason) => Err(PipelineError::Cancelled(reason.to_string())),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.flag.load(Ordering::SeqCst))
            .field("deadline", &self.deadline)
            .field("probe", &self.probe.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_cancel_is_shared_by_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(matches!(token.check(), Err(PipelineError::Cancelled(_))));
    }

    #[test]
    fn elapsed_deadline_cancels() {
        let token = CancelToken::new().with_deadline(Instant::now());
        assert_eq!(token.reason(), Some("request timed out"));
        let token = CancelToken::new().with_timeout(Duration::from_secs(60));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn disconnect_probe_cancels() {
        let gone = Arc::new(AtomicBool::new(false));
        let observed = gone.clone();
        let token = CancelToken::new().with_disconnect_probe(move || observed.load(Ordering::SeqCst));
        assert!(!token.is_cancelled());
        gone.store(true, Ordering::SeqCst);
        assert_eq!(token.reason(), Some("client disconnected"));
    }
}
