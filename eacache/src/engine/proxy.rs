//! Engine-side stand-in for a native fetcher.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::bridge::{CorrelationToken, NativeCallbacks};
use crate::error::FetcherError;
use crate::fetcher::FetchValue;
use crate::labels::FetchLabels;

/// Forwards fetch calls to native code by correlation token.
///
/// Shared between the reference table and every engine task submitted with
/// it. When the last holder drops, an owning proxy tells native code that its
/// fetcher may be released.
pub struct FetcherProxy {
    token: CorrelationToken,
    owns_fetcher: bool,
    callbacks: Arc<dyn NativeCallbacks>,
}

impl FetcherProxy {
    pub fn new(token: CorrelationToken, owns_fetcher: bool, callbacks: Arc<dyn NativeCallbacks>) -> Self {
        Self {
            token,
            owns_fetcher,
            callbacks,
        }
    }

    pub fn token(&self) -> CorrelationToken {
        self.token
    }

    pub fn call(&self, labels: FetchLabels) -> Result<FetchValue, FetcherError> {
        trace!(token = %self.token, labels = ?labels, "Invoking native fetcher");
        self.callbacks.call(self.token, labels)
    }

    pub fn bytes_to_transfer(&self) -> u64 {
        self.callbacks.bytes_to_transfer(self.token)
    }

    pub fn on_cancelled(&self) {
        self.callbacks.on_cancelled(self.token);
    }
}

impl Drop for FetcherProxy {
    fn drop(&mut self) {
        if self.owns_fetcher {
            self.callbacks.on_proxy_released(self.token);
        }
    }
}

impl fmt::Debug for FetcherProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetcherProxy")
            .field("token", &self.token)
            .field("owns_fetcher", &self.owns_fetcher)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingCallbacks {
        released: Mutex<Vec<CorrelationToken>>,
    }

    impl NativeCallbacks for RecordingCallbacks {
        fn call(&self, _: CorrelationToken, labels: FetchLabels) -> Result<FetchValue, FetcherError> {
            Ok(Arc::new(labels.bits()))
        }

        fn bytes_to_transfer(&self, _: CorrelationToken) -> u64 {
            42
        }

        fn estimate_fetch_time(&self, _: CorrelationToken, _: u32, _: u32, _: u32) -> f64 {
            0.0
        }

        fn on_cancelled(&self, _: CorrelationToken) {}

        fn on_proxy_released(&self, token: CorrelationToken) {
            self.released.lock().push(token);
        }
    }

    #[test]
    fn test_owning_proxy_notifies_once_on_drop() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let proxy = Arc::new(FetcherProxy::new(
            CorrelationToken::from_raw(3),
            true,
            callbacks.clone(),
        ));
        let held_by_task = Arc::clone(&proxy);

        drop(proxy);
        assert!(callbacks.released.lock().is_empty());

        drop(held_by_task);
        assert_eq!(*callbacks.released.lock(), vec![CorrelationToken::from_raw(3)]);
    }

    #[test]
    fn test_non_owning_proxy_never_notifies() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        drop(FetcherProxy::new(CorrelationToken::from_raw(4), false, callbacks.clone()));
        assert!(callbacks.released.lock().is_empty());
    }

    #[test]
    fn test_proxy_forwards_calls() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let proxy = FetcherProxy::new(CorrelationToken::from_raw(5), false, callbacks);
        let value = proxy.call(FetchLabels::BACKGROUND).unwrap();
        assert_eq!(*value.downcast::<u32>().unwrap(), 0x8);
        assert_eq!(proxy.bytes_to_transfer(), 42);
        assert_eq!(proxy.token(), CorrelationToken::from_raw(5));
    }
}
