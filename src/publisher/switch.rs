//! Scoped switch that turns event publishing off for a unit of work.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::debug;

/// Shared publishing on/off flag.
///
/// Clones share the same flag. While disabled, transactions run their mutation
/// without locking or publishing.
#[derive(Debug, Clone, Default)]
pub struct PublishSwitch {
    disabled: Arc<AtomicBool>,
}

impl PublishSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide switch.
    pub fn global() -> &'static PublishSwitch {
        static GLOBAL: OnceLock<PublishSwitch> = OnceLock::new();
        GLOBAL.get_or_init(PublishSwitch::new)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Disable publishing until the returned scope is dropped.
    ///
    /// Dropping the scope restores the value seen when it was created, so scopes nest.
    #[must_use = "publishing is re-enabled as soon as the scope is dropped"]
    pub fn disable(&self) -> DisabledScope {
        let previous = self.disabled.swap(true, Ordering::SeqCst);
        debug!(previous = previous, "Publishing disabled");
        DisabledScope {
            disabled: self.disabled.clone(),
            previous,
        }
    }

    /// Run `work` with publishing disabled.
    pub async fn without_publishing<F: Future>(&self, work: F) -> F::Output {
        let _scope = self.disable();
        work.await
    }
}

/// Guard returned by [`PublishSwitch::disable`].
#[derive(Debug)]
pub struct DisabledScope {
    disabled: Arc<AtomicBool>,
    previous: bool,
}

impl Drop for DisabledScope {
    fn drop(&mut self) {
        self.disabled.store(self.previous, Ordering::SeqCst);
        debug!(disabled = self.previous, "Publishing switch restored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabled_by_default() {
        assert!(!PublishSwitch::new().is_disabled());
    }

    #[test]
    fn test_scopes_nest() {
        let switch = PublishSwitch::new();
        {
            let _outer = switch.disable();
            {
                let _inner = switch.disable();
                assert!(switch.is_disabled());
            }
            assert!(switch.is_disabled());
        }
        assert!(!switch.is_disabled());
    }

    #[test]
    fn test_clones_share_flag() {
        let switch = PublishSwitch::new();
        let clone = switch.clone();
        let _scope = clone.disable();
        assert!(switch.is_disabled());
    }

    #[test]
    fn test_restored_after_panic() {
        let switch = PublishSwitch::new();
        let inner = switch.clone();

        let result = std::panic::catch_unwind(move || {
            let _scope = inner.disable();
            panic!("unit of work failed");
        });

        assert!(result.is_err());
        assert!(!switch.is_disabled());
    }

    #[tokio::test]
    async fn test_without_publishing_restores_on_error() {
        let switch = PublishSwitch::new();

        let result: Result<(), &str> = switch
            .without_publishing(async {
                assert!(switch.is_disabled());
                Err("boom")
            })
            .await;

        assert!(result.is_err());
        assert!(!switch.is_disabled());
    }

    #[tokio::test]
    async fn test_restored_when_cancelled() {
        let switch = PublishSwitch::new();

        let work = switch.without_publishing(std::future::pending::<()>());
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(5), work).await;

        assert!(timed_out.is_err());
        assert!(!switch.is_disabled());
    }

    #[test]
    fn test_global_is_shared() {
        assert!(std::ptr::eq(PublishSwitch::global(), PublishSwitch::global()));
    }
}
