//! Exactly-once release of remote resources.
//!
//! An [`AllocationGuard`] pairs a remote resource (heap block, file
//! descriptor, library handle) with the operation that gives it back.
//! Release happens once: either through an explicit
//! [`release`](AllocationGuard::release), or when the guard is dropped, in
//! which case the release is spawned on the current tokio runtime.
//!
//! The released flag is atomic, so a guard shared across tasks can still
//! never free twice.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::backend::BoxFuture;
use crate::error::Result;

/// A remote resource that must be given back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// `malloc`ed block, released with `free`.
    Memory(u64),
    /// Open file descriptor, released with `close`.
    Fd(i32),
    /// `dlopen` handle, released with `dlclose`.
    Library(u64),
}

/// Performs the release for a [`Resource`].
pub trait Release: Send + Sync + 'static {
    fn release(&self, resource: Resource) -> BoxFuture<'_, Result<()>>;
}

/// Scoped owner of one remote resource.
pub struct AllocationGuard {
    resource: Resource,
    releaser: Arc<dyn Release>,
    released: AtomicBool,
}

impl AllocationGuard {
    pub fn new(resource: Resource, releaser: Arc<dyn Release>) -> Self {
        Self {
            resource,
            releaser,
            released: AtomicBool::new(false),
        }
    }

    pub fn resource(&self) -> Resource {
        self.resource
    }

    /// Address of a memory block or library handle.
    pub fn address(&self) -> Option<u64> {
        match self.resource {
            Resource::Memory(addr) | Resource::Library(addr) => Some(addr),
            Resource::Fd(_) => None,
        }
    }

    pub fn fd(&self) -> Option<i32> {
        match self.resource {
            Resource::Fd(fd) => Some(fd),
            _ => None,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Release the resource. Later calls return `Ok(())` without traffic.
    pub async fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(resource = ?self.resource, "Releasing");
        self.releaser.release(self.resource).await
    }

    /// Give up ownership without releasing.
    pub fn leak(self) -> Resource {
        self.released.store(true, Ordering::Release);
        self.resource
    }

    /// Run `body` with the resource, then release it on every exit path.
    ///
    /// An error from `body` takes precedence over a release error.
    pub async fn scoped<T, F, Fut>(self, body: F) -> Result<T>
    where
        F: FnOnce(Resource) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let outcome = body(self.resource).await;
        let released = self.release().await;
        match outcome {
            Ok(value) => released.map(|_| value),
            Err(e) => {
                if let Err(release_err) = released {
                    warn!(error = %release_err, resource = ?self.resource, "Release failed after error");
                }
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for AllocationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationGuard")
            .field("resource", &self.resource)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for AllocationGuard {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let resource = self.resource;
        match Handle::try_current() {
            Ok(handle) => {
                let releaser = self.releaser.clone();
                handle.spawn(async move {
                    if let Err(e) = releaser.release(resource).await {
                        warn!(error = %e, ?resource, "Release on drop failed");
                    }
                });
            }
            Err(_) => warn!(?resource, "Guard dropped outside a runtime; resource leaked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        released: Mutex<Vec<Resource>>,
        fail: bool,
    }

    impl Release for Recorder {
        fn release(&self, resource: Resource) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                self.released.lock().unwrap().push(resource);
                if self.fail {
                    return Err(RpcError::BadReturnValue("free".into()));
                }
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_release_twice_frees_once() {
        let recorder = Arc::new(Recorder::default());
        let guard = AllocationGuard::new(Resource::Memory(0x8000), recorder.clone());

        guard.release().await.unwrap();
        guard.release().await.unwrap();
        assert!(guard.is_released());
        drop(guard);
        tokio::task::yield_now().await;

        assert_eq!(*recorder.released.lock().unwrap(), vec![Resource::Memory(0x8000)]);
    }

    #[tokio::test]
    async fn test_concurrent_release_frees_once() {
        let recorder = Arc::new(Recorder::default());
        let guard = Arc::new(AllocationGuard::new(Resource::Fd(4), recorder.clone()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let g = guard.clone();
                tokio::spawn(async move { g.release().await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(recorder.released.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_drop_releases_in_background() {
        let recorder = Arc::new(Recorder::default());
        drop(AllocationGuard::new(Resource::Library(0x10), recorder.clone()));

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*recorder.released.lock().unwrap(), vec![Resource::Library(0x10)]);
    }

    #[tokio::test]
    async fn test_leak_skips_release() {
        let recorder = Arc::new(Recorder::default());
        let guard = AllocationGuard::new(Resource::Memory(1), recorder.clone());
        assert_eq!(guard.leak(), Resource::Memory(1));
        tokio::task::yield_now().await;
        assert!(recorder.released.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scoped_releases_on_error() {
        let recorder = Arc::new(Recorder::default());
        let guard = AllocationGuard::new(Resource::Memory(0x20), recorder.clone());

        let res: Result<()> = guard
            .scoped(|_| async { Err(RpcError::Argument("boom".into())) })
            .await;
        assert!(matches!(res, Err(RpcError::Argument(_))));
        assert_eq!(recorder.released.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scoped_surfaces_release_error() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let guard = AllocationGuard::new(Resource::Fd(9), recorder);
        let res = guard.scoped(|r| async move { Ok(r) }).await;
        assert!(matches!(res, Err(RpcError::BadReturnValue(_))));
    }
}
