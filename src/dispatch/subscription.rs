// src/dispatch/subscription.rs
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::observer::{ObserverSet, RegistrationId};
use crate::models::BindingKind;

/// Handle returned by the dispatcher's subscribe calls.
///
/// Disposing (or dropping) the handle stops delivery to its observer. It
/// does not stop receive loops; those follow the cancellation token given
/// when subscribing.
#[must_use = "dropping a Subscription unsubscribes its observer"]
pub struct Subscription {
    observers: Arc<ObserverSet>,
    registration: RegistrationId,
    kind: BindingKind,
    disposed: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(observers: Arc<ObserverSet>, registration: RegistrationId, kind: BindingKind) -> Self {
        Self {
            observers,
            registration,
            kind,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> BindingKind {
        self.kind
    }

    pub fn registration(&self) -> RegistrationId {
        self.registration
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Removes the observer from the dispatcher. Safe to call repeatedly.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let removed = self.observers.remove(self.registration);
        debug!(kind = %self.kind, removed, "Subscription disposed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("registration", &self.registration)
            .field("kind", &self.kind)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
