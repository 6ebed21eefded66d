//! Opaque native payloads.

use rivet_core::Value;
use std::ffi::c_void;

/// Release callback run when a Data object is collected.
pub type DataFreeFn = unsafe extern "C" fn(*mut c_void);

/// Native pointer wrapped in a managed object.
///
/// The collector cannot see inside the native struct, so any managed
/// values it refers to are listed in `retained` (see
/// [`Runtime::data_retain`](crate::Runtime::data_retain)).
#[derive(Debug)]
pub struct DataBody {
    pub ptr: *mut c_void,
    pub free: Option<DataFreeFn>,
    pub retained: Vec<Value>,
}

// SAFETY: the pointer is only touched by the thread holding the runtime.
unsafe impl Send for DataBody {}

impl DataBody {
    pub fn new(ptr: *mut c_void, free: Option<DataFreeFn>) -> Self {
        Self {
            ptr,
            free,
            retained: Vec::new(),
        }
    }

    /// Run the free callback once.
    pub(crate) fn release(&mut self) {
        if let Some(free) = self.free.take() {
            if !self.ptr.is_null() {
                // SAFETY: the extension promised `free` accepts `ptr`.
                unsafe { free(self.ptr) };
            }
        }
        self.ptr = std::ptr::null_mut();
    }
}

impl Default for DataBody {
    fn default() -> Self {
        Self::new(std::ptr::null_mut(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static FREED: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn count_free(ptr: *mut c_void) {
        // SAFETY: test allocates a Box<u32> below.
        drop(unsafe { Box::from_raw(ptr as *mut u32) });
        FREED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_release_runs_once() {
        let ptr = Box::into_raw(Box::new(7u32)) as *mut c_void;
        let mut data = DataBody::new(ptr, Some(count_free));
        data.release();
        data.release();
        assert_eq!(FREED.load(Ordering::SeqCst), 1);
        assert!(data.ptr.is_null());
    }
}
