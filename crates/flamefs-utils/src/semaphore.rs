use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore as TokioSemaphore};

/// A cloneable counting semaphore handing out owned permits.
///
/// Used to bound in-flight requests per node and I/O buffer usage;
/// acquisition is a task suspension point, which is how back-pressure
/// propagates.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<TokioSemaphore>,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            inner: Arc::new(TokioSemaphore::new(permits)),
        }
    }

    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.inner
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore closed")
    }

    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.inner.clone().try_acquire_owned().ok()
    }

    pub fn available_permits(&self) -> usize {
        self.inner.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_release() {
        let sem = Semaphore::new(2);
        let p1 = sem.acquire().await;
        let _p2 = sem.acquire().await;
        assert_eq!(sem.available_permits(), 0);
        assert!(sem.try_acquire().is_none());
        drop(p1);
        assert_eq!(sem.available_permits(), 1);
        assert!(sem.try_acquire().is_some());
    }
}
