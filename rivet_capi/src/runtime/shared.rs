//! A runtime shared between host threads.

use super::{InitError, Runtime};
use crate::config::CapiConfig;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// One runtime, one logical thread of managed execution at a time.
///
/// Every operation runs under the lock, so handle-table mutation and
/// collection safepoints are serialized with each other.
#[derive(Clone)]
pub struct SharedRuntime {
    inner: Arc<Mutex<Runtime>>,
}

impl SharedRuntime {
    pub fn new(config: CapiConfig) -> Result<Self, InitError> {
        Ok(Self::from_runtime(Runtime::new(config)?))
    }

    pub fn from_runtime(rt: Runtime) -> Self {
        Self {
            inner: Arc::new(Mutex::new(rt)),
        }
    }

    /// Lock for a sequence of operations.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, Runtime> {
        self.inner.lock()
    }

    /// Run `f` with exclusive access.
    pub fn with<R>(&self, f: impl FnOnce(&mut Runtime) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_threads_take_turns() {
        let shared = SharedRuntime::new(CapiConfig::default()).unwrap();
        let array = shared.with(|rt| {
            let ary = rt.ary_new().unwrap();
            rt.gc_register_mark_object(ary);
            ary
        });

        let workers: Vec<_> = (0..4)
            .map(|i| {
                let shared = shared.clone();
                thread::spawn(move || {
                    for j in 0..25 {
                        shared.with(|rt| {
                            let n = rt.int2num(i * 100 + j);
                            rt.ary_push(array, n).unwrap();
                        });
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let mut rt = shared.lock();
        assert_eq!(rt.ary_len(array).unwrap(), 100);
        rt.gc_start();
        assert_eq!(rt.ary_len(array).unwrap(), 100);
    }
}
