//! Resource lifecycle strategy injected into a [`crate::Pool`].

use std::future::Future;

/// Creates, validates and disposes of pooled resources.
///
/// `ping`, `on_release` and `close` run while the pool state is locked and
/// must not block.
pub trait Manager: Send + Sync + 'static {
    type Resource: Send + 'static;
    type Error: std::fmt::Display + Send + 'static;

    /// Establish a new resource.
    fn create(&self) -> impl Future<Output = Result<Self::Resource, Self::Error>> + Send;

    /// Liveness check run before an idle resource is handed out.
    fn ping(&self, _resource: &mut Self::Resource) -> bool {
        true
    }

    /// Clean-up hook run when a lease ends. Returning `false` discards the
    /// resource instead of returning it to the idle queue.
    fn on_release(&self, _resource: &mut Self::Resource) -> bool {
        true
    }

    /// Dispose of a resource leaving the pool.
    fn close(&self, _resource: Self::Resource) {}
}
