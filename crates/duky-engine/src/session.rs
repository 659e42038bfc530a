use std::sync::{Arc, Mutex, MutexGuard};

use duky_contracts::tools::{ToolKey, ToolState};

type Observer = Box<dyn Fn(&ToolState) + Send + Sync>;

/// Shared tool state. Every mutation made through `update` is followed by a
/// call to the observer with the new state.
#[derive(Clone)]
pub struct ToolSession {
    state: Arc<Mutex<ToolState>>,
    observer: Option<Arc<Observer>>,
}

impl ToolSession {
    pub fn new(state: ToolState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            observer: None,
        }
    }

    pub fn for_tool(tool: ToolKey) -> Self {
        Self::new(ToolState::new(tool))
    }

    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&ToolState) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(Box::new(observer)));
        self
    }

    pub fn snapshot(&self) -> ToolState {
        self.lock().clone()
    }

    pub fn read<T>(&self, f: impl FnOnce(&ToolState) -> T) -> T {
        f(&self.lock())
    }

    pub fn update<T>(&self, f: impl FnOnce(&mut ToolState) -> T) -> T {
        let mut guard = self.lock();
        let out = f(&mut guard);
        if let Some(observer) = self.observer.as_ref() {
            observer(&guard);
        }
        out
    }

    /// Abandons an in-flight batch. Late results are dropped by epoch.
    pub fn cancel(&self) {
        self.update(ToolState::cancel);
    }

    fn lock(&self) -> MutexGuard<'_, ToolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use duky_contracts::tools::{Stage, ToolKey};

    use super::ToolSession;

    #[test]
    fn updates_notify_observer_and_cancel_rolls_back() -> anyhow::Result<()> {
        let notified = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&notified);
        let session = ToolSession::for_tool(ToolKey::FreeGeneration)
            .with_observer(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });

        let epoch = session.update(|state| state.begin_generation(&["a".to_string()]))?;
        assert_eq!(session.read(|state| state.stage), Stage::Generating);

        session.cancel();
        assert_eq!(session.read(|state| state.stage), Stage::Configuring);
        assert!(!session.update(|state| state.resolve_slot(epoch, 0, "late.png")));
        assert_eq!(notified.load(Ordering::SeqCst), 3);
        Ok(())
    }
}
