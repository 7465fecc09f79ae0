use crate::DeviceContext;
use ash::vk;
use std::collections::VecDeque;
use strata_base::{ResourceUse, SerialSource};

/// A native object waiting for the GPU to stop using it
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GarbageObject {
    Buffer(vk::Buffer),
    Image(vk::Image),
    DeviceMemory(vk::DeviceMemory),
    DescriptorPool(vk::DescriptorPool),
    QueryPool(vk::QueryPool),
    Semaphore(vk::Semaphore),
}

impl GarbageObject {
    pub fn destroy(
        self,
        device: &dyn DeviceContext,
    ) {
        match self {
            GarbageObject::Buffer(buffer) => device.destroy_buffer(buffer),
            GarbageObject::Image(image) => device.destroy_image(image),
            GarbageObject::DeviceMemory(memory) => device.free_memory(memory),
            GarbageObject::DescriptorPool(pool) => device.destroy_descriptor_pool(pool),
            GarbageObject::QueryPool(pool) => device.destroy_query_pool(pool),
            GarbageObject::Semaphore(semaphore) => device.destroy_semaphore(semaphore),
        }
    }
}

struct GarbageInFlight {
    // Shared with the owner that released the objects, so a late use still delays destruction
    resource_use: ResourceUse,
    objects: Vec<GarbageObject>,
}

/// Holds released objects until the last serial that referenced them has completed. Unlike a
/// frame-count based drop sink, batches may complete out of order, so every batch is checked on
/// `cleanup`.
#[derive(Default)]
pub struct GarbageCollector {
    in_flight: VecDeque<GarbageInFlight>,
}

impl GarbageCollector {
    pub fn new() -> Self {
        Default::default()
    }

    /// Schedule the objects to be destroyed once `resource_use` is no longer in use. Objects are
    /// destroyed in the order given.
    pub fn collect(
        &mut self,
        resource_use: &ResourceUse,
        objects: Vec<GarbageObject>,
    ) {
        if objects.is_empty() {
            return;
        }

        self.in_flight.push_back(GarbageInFlight {
            resource_use: resource_use.share(),
            objects,
        });
    }

    /// Destroys every batch whose use has completed. Returns the number of objects destroyed.
    #[profiling::function]
    pub fn cleanup(
        &mut self,
        device: &dyn DeviceContext,
        serials: &dyn SerialSource,
    ) -> usize {
        let mut destroyed_count = 0;
        let mut still_in_flight = VecDeque::with_capacity(self.in_flight.len());
        for garbage in self.in_flight.drain(..) {
            if garbage.resource_use.is_in_use(serials) {
                still_in_flight.push_back(garbage);
            } else {
                destroyed_count += garbage.objects.len();
                for object in garbage.objects {
                    object.destroy(device);
                }
            }
        }
        self.in_flight = still_in_flight;

        if destroyed_count > 0 {
            log::debug!(
                "Destroyed {} garbage objects, {} batches still in flight",
                destroyed_count,
                self.in_flight.len()
            );
        }

        destroyed_count
    }

    /// Immediately destroy everything. We assume the device is idle and nothing is in flight.
    pub fn destroy_all(
        &mut self,
        device: &dyn DeviceContext,
    ) {
        for garbage in self.in_flight.drain(..) {
            for object in garbage.objects {
                object.destroy(device);
            }
        }
    }

    pub fn pending_object_count(&self) -> usize {
        self.in_flight
            .iter()
            .map(|garbage| garbage.objects.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        if !self.in_flight.is_empty() {
            log::warn!(
                "GarbageCollector dropped with {} objects still pending, they will leak",
                self.pending_object_count()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{DeviceContextHeadless, HeadlessDeviceConfig};
    use strata_base::QueueSerialTracker;

    #[test]
    fn test_garbage_waits_for_serial() {
        let device = DeviceContextHeadless::new(HeadlessDeviceConfig::default());
        let tracker = QueueSerialTracker::new();
        let mut garbage = GarbageCollector::new();

        let buffer = device
            .create_buffer(256, vk::BufferUsageFlags::TRANSFER_SRC)
            .unwrap();
        let resource_use = ResourceUse::new();
        resource_use.use_in_recording(&tracker);
        garbage.collect(&resource_use, vec![GarbageObject::Buffer(buffer)]);
        assert_eq!(garbage.pending_object_count(), 1);

        assert_eq!(garbage.cleanup(&device, &tracker), 0);
        assert_eq!(device.live_buffer_count(), 1);

        let serial = tracker.submit();
        tracker.complete(serial);
        assert_eq!(garbage.cleanup(&device, &tracker), 1);
        assert_eq!(device.live_buffer_count(), 0);
        assert!(garbage.is_empty());
    }

    #[test]
    fn test_batches_complete_out_of_order() {
        let device = DeviceContextHeadless::new(HeadlessDeviceConfig::default());
        let tracker = QueueSerialTracker::new();
        let mut garbage = GarbageCollector::new();

        // The first batch is used again in a later submission after being released
        let late_use = ResourceUse::new();
        late_use.use_in_recording(&tracker);
        let semaphore = device.create_semaphore().unwrap();
        garbage.collect(&late_use, vec![GarbageObject::Semaphore(semaphore)]);

        let early_use = ResourceUse::new();
        early_use.use_in_recording(&tracker);
        let query_pool = device
            .create_query_pool(vk::QueryType::TIMESTAMP, 4)
            .unwrap();
        garbage.collect(&early_use, vec![GarbageObject::QueryPool(query_pool)]);

        let first = tracker.submit();
        late_use.use_in_recording(&tracker);
        tracker.complete(first);

        assert_eq!(garbage.cleanup(&device, &tracker), 1);
        assert_eq!(garbage.pending_object_count(), 1);

        garbage.destroy_all(&device);
        assert!(garbage.is_empty());
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn test_empty_batch_is_ignored() {
        let mut garbage = GarbageCollector::new();
        garbage.collect(&ResourceUse::new(), vec![]);
        assert!(garbage.is_empty());
    }
}
