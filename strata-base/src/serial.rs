use std::sync::atomic::{AtomicU64, Ordering};

/// Marks a point in queue submission order. Serials are handed out monotonically by a
/// [`SerialSource`]; work tagged with a serial is finished once the source's last completed serial
/// has caught up to it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Serial(u64);

impl Serial {
    /// Never submitted. Always considered complete.
    pub const NONE: Serial = Serial(0);

    pub fn new(value: u64) -> Self {
        Serial(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Serial {
        Serial(self.0 + 1)
    }
}

impl std::fmt::Display for Serial {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Provided by whatever owns command submission. Resource helpers only read serials, they never
/// advance them.
pub trait SerialSource {
    /// Serial that commands recorded right now will be submitted with
    fn current_serial(&self) -> Serial;

    /// Highest serial the GPU is known to have finished
    fn last_completed_serial(&self) -> Serial;

    fn is_serial_in_use(
        &self,
        serial: Serial,
    ) -> bool {
        serial > self.last_completed_serial()
    }
}

/// Straightforward atomic [`SerialSource`]. The submitting thread calls `submit` after each
/// submission, and whoever observes fence completion calls `complete`.
#[derive(Debug)]
pub struct QueueSerialTracker {
    current_serial: AtomicU64,
    last_completed_serial: AtomicU64,
}

impl Default for QueueSerialTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueSerialTracker {
    pub fn new() -> Self {
        QueueSerialTracker {
            current_serial: AtomicU64::new(1),
            last_completed_serial: AtomicU64::new(0),
        }
    }

    /// Closes the current serial and returns it. Later recordings get the next serial.
    pub fn submit(&self) -> Serial {
        Serial(self.current_serial.fetch_add(1, Ordering::AcqRel))
    }

    pub fn complete(
        &self,
        serial: Serial,
    ) {
        debug_assert!(serial.0 < self.current_serial.load(Ordering::Acquire));
        let previous = self
            .last_completed_serial
            .fetch_max(serial.0, Ordering::AcqRel);
        if previous < serial.0 {
            log::trace!("Serial {} completed", serial);
        }
    }

    /// Marks everything submitted so far as finished, as after a device wait-idle
    pub fn complete_all_submitted(&self) {
        let current = self.current_serial.load(Ordering::Acquire);
        self.complete(Serial(current - 1));
    }
}

impl SerialSource for QueueSerialTracker {
    fn current_serial(&self) -> Serial {
        Serial(self.current_serial.load(Ordering::Acquire))
    }

    fn last_completed_serial(&self) -> Serial {
        Serial(self.last_completed_serial.load(Ordering::Acquire))
    }
}
