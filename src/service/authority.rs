use std::sync::mpsc;
use std::time::Duration;

/// Polkit-style action identifiers for the privileged operations.
pub const ACTION_VERIFY: &str = "io.ridgeline.device.verify";
pub const ACTION_ENROLL: &str = "io.ridgeline.device.enroll";

/// Outcome of one authorization check. Computed per (requester, action),
/// never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Authorized,
    Denied,
    /// The user closed the credential prompt without answering.
    Dismissed,
}

impl AuthDecision {
    pub fn is_authorized(&self) -> bool {
        matches!(self, AuthDecision::Authorized)
    }
}

/// The interactive authorization oracle. `check` may block for as long as a
/// credential prompt stays open, so it is only ever called from a worker
/// thread, never from a device scheduler.
pub trait Authority: Send + Sync + 'static {
    fn check(&self, identity: &str, action_id: &str) -> AuthDecision;
}

/// Fixed-answer authority for development and tests.
pub struct StaticAuthority {
    decision: AuthDecision,
}

impl StaticAuthority {
    pub fn allow_all() -> Self {
        Self {
            decision: AuthDecision::Authorized,
        }
    }

    pub fn deny_all() -> Self {
        Self {
            decision: AuthDecision::Denied,
        }
    }

    pub fn dismissing() -> Self {
        Self {
            decision: AuthDecision::Dismissed,
        }
    }
}

impl Authority for StaticAuthority {
    fn check(&self, identity: &str, action_id: &str) -> AuthDecision {
        tracing::debug!(identity, action_id, decision = ?self.decision, "static authority");
        self.decision
    }
}

/// Run `authority.check` off-thread and hand the decision to `deliver`.
/// When the oracle takes longer than `timeout` the decision is Denied; the
/// worker's late answer is dropped.
pub fn spawn_check<A, F>(
    authority: std::sync::Arc<A>,
    identity: String,
    action_id: &'static str,
    timeout: Duration,
    deliver: F,
) where
    A: Authority + ?Sized,
    F: FnOnce(AuthDecision) + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let worker_identity = identity.clone();
    std::thread::spawn(move || {
        let decision = authority.check(&worker_identity, action_id);
        let _ = tx.send(decision);
    });

    std::thread::spawn(move || {
        let decision = match rx.recv_timeout(timeout) {
            Ok(decision) => decision,
            Err(_) => {
                tracing::warn!(%identity, action_id, "authorization check timed out");
                AuthDecision::Denied
            }
        };
        deliver(decision);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn decision_is_delivered() {
        let (tx, rx) = mpsc::channel();
        spawn_check(
            Arc::new(StaticAuthority::allow_all()),
            "alice".into(),
            ACTION_VERIFY,
            Duration::from_secs(1),
            move |decision| {
                tx.send(decision).unwrap();
            },
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            AuthDecision::Authorized
        );
    }

    struct SlowAuthority;
    impl Authority for SlowAuthority {
        fn check(&self, _identity: &str, _action_id: &str) -> AuthDecision {
            std::thread::sleep(Duration::from_millis(500));
            AuthDecision::Authorized
        }
    }

    #[test]
    fn timeout_is_denied() {
        let (tx, rx) = mpsc::channel();
        spawn_check(
            Arc::new(SlowAuthority),
            "alice".into(),
            ACTION_ENROLL,
            Duration::from_millis(20),
            move |decision| {
                tx.send(decision).unwrap();
            },
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            AuthDecision::Denied
        );
    }
}
