use tokio::sync::watch;

/// Process-wide "active" switch.
///
/// While inactive, pollers and the merge scheduler park in
/// [`ActivityGate::wait_active`] instead of starting new iterations. Work
/// already in flight is not interrupted.
#[derive(Clone, Debug)]
pub struct ActivityGate {
    tx: watch::Sender<bool>,
}

impl ActivityGate {
    pub fn new(active: bool) -> Self {
        let (tx, _rx) = watch::channel(active);
        Self { tx }
    }

    pub fn is_active(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns whether the value changed.
    pub fn set_active(&self, active: bool) -> bool {
        self.tx.send_if_modified(|current| {
            let changed = *current != active;
            *current = active;
            changed
        })
    }

    /// Resolves once the gate is active. Immediate when it already is.
    pub async fn wait_active(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|active| *active).await;
    }
}

impl Default for ActivityGate {
    fn default() -> Self {
        Self::new(true)
    }
}
