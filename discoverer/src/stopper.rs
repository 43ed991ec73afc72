use std::sync::Arc;
use tokio::sync::watch;

/// Cancellation handle shared by the watcher's tasks. Cloning hands out
/// another handle to the same state; tripping it once releases every waiter,
/// and late subscribers observe the stop immediately.
#[derive(Clone)]
pub struct Stopper {
    state: Arc<watch::Sender<bool>>,
}

impl Stopper {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn stop(&self) {
        self.state.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.state.borrow()
    }

    pub async fn stopped(&self) {
        let mut receiver = self.state.subscribe();
        if !*receiver.borrow_and_update() {
            let _ = receiver.changed().await;
        }
    }
}

impl Default for Stopper {
    fn default() -> Self {
        Self::new()
    }
}
