//! The seam between broker-facing services and the process that backs them.

use async_trait::async_trait;

use crate::supervisor::SupervisorError;

/// Lifecycle control of the broker, as seen by the registry and the health monitor.
#[async_trait]
pub trait BrokerControl: Send + Sync {
    /// Whether the broker API answers. Positive answers may be cached briefly.
    async fn is_ready(&self) -> bool;

    /// Start (or adopt) the broker.
    async fn start_service(&self) -> Result<(), SupervisorError>;

    /// Stop the broker unless it was adopted.
    async fn stop_service(&self) -> Result<(), SupervisorError>;

    /// Drop any cached readiness so the next `is_ready` probes for real.
    fn invalidate_ready_cache(&self);
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::BrokerControl;
    use crate::supervisor::SupervisorError;

    /// Scripted broker lifecycle for registry and health tests.
    #[derive(Default)]
    pub struct MockControl {
        pub ready: AtomicBool,
        /// Whether `start_service` makes the broker ready.
        pub start_succeeds: AtomicBool,
        pub starts: AtomicU32,
        pub stops: AtomicU32,
        pub invalidations: AtomicU32,
    }

    impl MockControl {
        pub fn ready() -> Self {
            let control = Self::default();
            control.ready.store(true, Ordering::SeqCst);
            control.start_succeeds.store(true, Ordering::SeqCst);
            control
        }

        pub fn down(start_succeeds: bool) -> Self {
            let control = Self::default();
            control.start_succeeds.store(start_succeeds, Ordering::SeqCst);
            control
        }

        pub fn starts(&self) -> u32 {
            self.starts.load(Ordering::SeqCst)
        }

        pub fn stops(&self) -> u32 {
            self.stops.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BrokerControl for MockControl {
        async fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        async fn start_service(&self) -> Result<(), SupervisorError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.start_succeeds.load(Ordering::SeqCst) {
                self.ready.store(true, Ordering::SeqCst);
                Ok(())
            } else {
                Err(SupervisorError::NotReady { attempts: 1 })
            }
        }

        async fn stop_service(&self) -> Result<(), SupervisorError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.ready.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn invalidate_ready_cache(&self) {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
        }
    }
}
