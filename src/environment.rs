//! Abstract contract for environment signals the cache reacts to.
//!
//! Platforms provide memory pressure, window visibility and network
//! connectivity through [`EventProvider`]. [`Unsupported`] is the default for
//! platforms without a signal; [`EventSource`] is a manually driven provider
//! for glue code and tests.

use parking_lot::Mutex;
use std::sync::Arc;

/// How hard the platform is asking the process to release memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressureLevel {
    Low,
    /// The application moved to the background.
    Background,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowVisibilityEvent {
    Foreground,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkConnectivityEvent {
    Available,
    Lost,
}

/// Receives events from an [`EventProvider`].
pub trait EventObserver<E>: Send + Sync {
    fn on_event(&self, event: E);
}

impl<E, F> EventObserver<E> for F
where
    F: Fn(E) + Send + Sync,
{
    fn on_event(&self, event: E) {
        self(event)
    }
}

/// A source of environment events with observer registration.
pub trait EventProvider<E>: Send + Sync {
    fn add_observer(&self, observer: Arc<dyn EventObserver<E>>);

    /// Remove an observer previously passed to `add_observer` (compared by pointer).
    fn remove_observer(&self, observer: &Arc<dyn EventObserver<E>>);
}

pub type MemoryPressure = dyn EventProvider<MemoryPressureLevel>;
pub type WindowVisibility = dyn EventProvider<WindowVisibilityEvent>;
pub type NetworkConnectivity = dyn EventProvider<NetworkConnectivityEvent>;

/// Provider for platforms that cannot observe a signal. Never emits.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unsupported;

impl<E> EventProvider<E> for Unsupported {
    fn add_observer(&self, _observer: Arc<dyn EventObserver<E>>) {}

    fn remove_observer(&self, _observer: &Arc<dyn EventObserver<E>>) {}
}

/// Provider whose events are pushed by hand with [`EventSource::emit`].
pub struct EventSource<E> {
    observers: Mutex<Vec<Arc<dyn EventObserver<E>>>>,
}

impl<E> Default for EventSource<E> {
    fn default() -> Self {
        EventSource {
            observers: Mutex::new(Vec::new()),
        }
    }
}

impl<E: Copy> EventSource<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every registered observer.
    pub fn emit(&self, event: E) {
        // Clone the list so observers may (de)register while being notified.
        let observers = self.observers.lock().clone();
        for observer in observers {
            observer.on_event(event);
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }
}

impl<E> EventProvider<E> for EventSource<E> {
    fn add_observer(&self, observer: Arc<dyn EventObserver<E>>) {
        self.observers.lock().push(observer);
    }

    fn remove_observer(&self, observer: &Arc<dyn EventObserver<E>>) {
        self.observers.lock().retain(|o| !Arc::ptr_eq(o, observer));
    }
}
