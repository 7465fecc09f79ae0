use crate::{Serial, SerialSource};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct ResourceUseInner {
    serial: AtomicU64,
    cpu_read_dirty: AtomicBool,
}

/// Records the last queue serial that referenced a resource. Cloning (or calling `share`) hands out
/// another handle to the same record, so two views of one allocation are in use if either is.
///
/// Updates are atomic since the reclaim check may run on a different thread than recording.
#[derive(Clone, Debug, Default)]
pub struct ResourceUse {
    inner: Arc<ResourceUseInner>,
}

impl ResourceUse {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn share(&self) -> ResourceUse {
        self.clone()
    }

    pub fn is_shared_with(
        &self,
        other: &ResourceUse,
    ) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn serial(&self) -> Serial {
        Serial::new(self.inner.serial.load(Ordering::Acquire))
    }

    /// Never lowers the recorded serial
    pub fn update_serial(
        &self,
        serial: Serial,
    ) {
        self.inner
            .serial
            .fetch_max(serial.value(), Ordering::AcqRel);
    }

    pub fn use_in_recording(
        &self,
        serials: &dyn SerialSource,
    ) {
        self.update_serial(serials.current_serial());
    }

    /// True if the GPU may still be touching the resource
    pub fn is_in_use(
        &self,
        serials: &dyn SerialSource,
    ) -> bool {
        serials.is_serial_in_use(self.serial())
    }

    /// True if the commands currently being recorded reference the resource
    pub fn used_in_recording(
        &self,
        serials: &dyn SerialSource,
    ) -> bool {
        self.serial() == serials.current_serial()
    }

    pub fn is_cpu_read_dirty(&self) -> bool {
        self.inner.cpu_read_dirty.load(Ordering::Acquire)
    }

    pub fn set_cpu_read_dirty(&self) {
        self.inner.cpu_read_dirty.store(true, Ordering::Release);
    }

    pub fn clear_cpu_read_dirty(&self) {
        self.inner.cpu_read_dirty.store(false, Ordering::Release);
    }
}
