use crate::{DeviceContext, GarbageCollector, GarbageObject};
use strata_base::{ResourceUse, Serial, SerialSource};

/// What a resource helper needs from the renderer to allocate, record and retire objects
pub struct ResourceContext<'a> {
    device: &'a dyn DeviceContext,
    serials: &'a dyn SerialSource,
    garbage: &'a mut GarbageCollector,
}

impl<'a> ResourceContext<'a> {
    pub fn new(
        device: &'a dyn DeviceContext,
        serials: &'a dyn SerialSource,
        garbage: &'a mut GarbageCollector,
    ) -> Self {
        ResourceContext {
            device,
            serials,
            garbage,
        }
    }

    pub fn device(&self) -> &'a dyn DeviceContext {
        self.device
    }

    pub fn serials(&self) -> &'a dyn SerialSource {
        self.serials
    }

    pub fn current_serial(&self) -> Serial {
        self.serials.current_serial()
    }

    pub fn is_serial_in_use(
        &self,
        serial: Serial,
    ) -> bool {
        self.serials.is_serial_in_use(serial)
    }

    pub fn collect_garbage(
        &mut self,
        resource_use: &ResourceUse,
        objects: Vec<GarbageObject>,
    ) {
        self.garbage.collect(resource_use, objects);
    }

    /// Destroys whatever garbage has finished, usually called once per submission
    pub fn cleanup_garbage(&mut self) -> usize {
        self.garbage.cleanup(self.device, self.serials)
    }
}
