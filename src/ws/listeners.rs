use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use dashmap::DashMap;

use super::types::{Event, EventKind};

/// Callback registered for an [`EventKind`]. Identity is the `Arc` allocation.
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Wrap a closure as a [`Listener`] so it can later be passed to `remove`.
pub fn listener<F>(callback: F) -> Listener
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    Arc::new(callback)
}

/// Ordered callbacks per event kind.
pub(crate) struct Listeners {
    by_kind: DashMap<EventKind, Vec<Listener>>,
}

impl Listeners {
    pub(crate) fn new() -> Self {
        let by_kind = DashMap::new();
        for kind in EventKind::ALL {
            by_kind.insert(kind, Vec::new());
        }

        Self { by_kind }
    }

    pub(crate) fn on(&self, kind: EventKind, listener: Listener) {
        self.by_kind.entry(kind).or_default().push(listener);
    }

    /// Remove the first registration of `listener`; returns whether one was found.
    pub(crate) fn remove(&self, kind: EventKind, listener: &Listener) -> bool {
        let Some(mut registered) = self.by_kind.get_mut(&kind) else {
            return false;
        };

        match registered.iter().position(|l| Arc::ptr_eq(l, listener)) {
            Some(index) => {
                registered.remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn count(&self, kind: EventKind) -> usize {
        self.by_kind.get(&kind).map_or(0, |registered| registered.len())
    }

    /// Invoke every listener for the event's kind in registration order.
    ///
    /// Dispatch runs over a snapshot, so listeners may add or remove listeners. A
    /// panicking listener is logged and skipped.
    pub(crate) fn emit(&self, event: &Event) {
        let snapshot: Vec<Listener> = self
            .by_kind
            .get(&event.kind())
            .map(|registered| registered.clone())
            .unwrap_or_default();

        for listener in snapshot {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
                #[cfg(feature = "tracing")]
                tracing::warn!(kind = %event.kind(), ?panic, "Listener panicked during dispatch");
                #[cfg(not(feature = "tracing"))]
                let _ = &panic;
            }
        }
    }
}
