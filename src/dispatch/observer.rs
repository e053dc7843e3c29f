// src/dispatch/observer.rs
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::models::FileMessage;

pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

/// Receives every file message produced by the dispatcher's receive loops.
///
/// `on_next` runs on a receive loop task while the observer set is locked
/// for reading, so it must not subscribe or dispose from inside the call.
pub trait Observer: Send + Sync {
    fn on_next(&self, message: &FileMessage) -> Result<(), ObserverError>;
}

/// Identifies one registration in an [`ObserverSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

struct Registration {
    id: RegistrationId,
    observer: Arc<dyn Observer>,
    /// Cancelled when the registration is removed.
    released: CancellationToken,
}

/// Registered observers, unique by allocation.
#[derive(Default)]
pub struct ObserverSet {
    next_id: AtomicU64,
    entries: RwLock<Vec<Registration>>,
}

fn same_observer(a: &Arc<dyn Observer>, b: &Arc<dyn Observer>) -> bool {
    // Compare data pointers only; vtable pointers can differ between codegen units.
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the observer unless already present. Returns its registration
    /// and whether it was newly added.
    pub fn insert(&self, observer: Arc<dyn Observer>) -> (RegistrationId, bool) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entries.iter().find(|r| same_observer(&r.observer, &observer)) {
            return (existing.id, false);
        }

        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        entries.push(Registration {
            id,
            observer,
            released: CancellationToken::new(),
        });
        (id, true)
    }

    /// Removes a registration. Unknown ids are ignored.
    pub fn remove(&self, id: RegistrationId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.iter().position(|r| r.id == id) {
            Some(index) => {
                entries.remove(index).released.cancel();
                true
            }
            None => false,
        }
    }

    /// Token cancelled once the registration is removed, by whoever removes it.
    pub fn released(&self, id: RegistrationId) -> Option<CancellationToken> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.released.clone())
    }

    pub fn contains(&self, observer: &Arc<dyn Observer>) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|r| same_observer(&r.observer, observer))
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes a message to every observer in registration order.
    ///
    /// A failing or panicking observer is logged and skipped. Returns how
    /// many observers accepted the message.
    pub fn broadcast(&self, message: &FileMessage) -> usize {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut delivered = 0;
        for registration in entries.iter() {
            match panic::catch_unwind(AssertUnwindSafe(|| registration.observer.on_next(message))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!(
                    registration = registration.id.0,
                    file = %message.name,
                    "Observer failed to handle file message: {}", e
                ),
                Err(_) => error!(
                    registration = registration.id.0,
                    file = %message.name,
                    "Observer panicked while handling file message"
                ),
            }
        }
        delivered
    }
}
