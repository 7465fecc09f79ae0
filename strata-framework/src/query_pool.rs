use crate::{RecyclingPool, RecyclingPoolConfig};
use ash::vk;
use strata_api::{CommandRecorder, DeviceContext, StrataResult};
use strata_base::{Serial, SerialSource};

/// Native query pools of one query type, recycled once every query in them has been freed
pub struct DynamicQueryPool {
    pool: RecyclingPool<vk::QueryPool>,
    query_type: vk::QueryType,
}

impl DynamicQueryPool {
    /// Creates the first native pool up front
    pub fn new(
        device: &dyn DeviceContext,
        query_type: vk::QueryType,
        config: RecyclingPoolConfig,
    ) -> StrataResult<Self> {
        let mut pool = RecyclingPool::new(config);
        let query_pool = device.create_query_pool(query_type, config.pool_size)?;
        pool.allocate_new_entry_pool(query_pool);

        Ok(DynamicQueryPool { pool, query_type })
    }

    pub fn query_type(&self) -> vk::QueryType {
        self.query_type
    }

    pub fn pool_count(&self) -> usize {
        self.pool.pools().len()
    }

    pub fn query_pool(
        &self,
        pool_index: usize,
    ) -> vk::QueryPool {
        *self.pool.pool(pool_index)
    }

    pub fn allocate_query(
        &mut self,
        device: &dyn DeviceContext,
        serials: &dyn SerialSource,
    ) -> StrataResult<QueryHelper> {
        let query_type = self.query_type;
        let pool_size = self.pool.pool_size();
        let entry = self.pool.allocate_entry(serials, || {
            device.create_query_pool(query_type, pool_size)
        })?;

        Ok(QueryHelper {
            query_pool: *self.pool.pool(entry.pool_index),
            pool_index: entry.pool_index,
            query: entry.entry_index,
            most_recent_serial: Serial::NONE,
        })
    }

    /// Returns the query to its pool. Does nothing if the helper holds no query.
    pub fn free_query(
        &mut self,
        serials: &dyn SerialSource,
        query: &mut QueryHelper,
    ) {
        if query.valid() {
            debug_assert_eq!(query.query_pool, *self.pool.pool(query.pool_index));
            self.pool.on_entry_freed(serials, query.pool_index);
            *query = QueryHelper::default();
        }
    }

    /// The device must be idle
    pub fn destroy(
        &mut self,
        device: &dyn DeviceContext,
    ) {
        for query_pool in self.pool.take_pools() {
            device.destroy_query_pool(query_pool);
        }
    }
}

/// A single query allocated from a [`DynamicQueryPool`]
#[derive(Debug, Default)]
pub struct QueryHelper {
    query_pool: vk::QueryPool,
    pool_index: usize,
    query: u32,
    most_recent_serial: Serial,
}

impl QueryHelper {
    pub fn valid(&self) -> bool {
        self.query_pool != vk::QueryPool::null()
    }

    pub fn query_pool(&self) -> vk::QueryPool {
        self.query_pool
    }

    pub fn pool_index(&self) -> usize {
        self.pool_index
    }

    pub fn query(&self) -> u32 {
        self.query
    }

    /// Serial of the last recording that touched the query
    pub fn serial(&self) -> Serial {
        self.most_recent_serial
    }

    pub fn begin_query(
        &mut self,
        serials: &dyn SerialSource,
        recorder: &mut dyn CommandRecorder,
    ) {
        recorder.reset_query_pool(self.query_pool, self.query, 1);
        recorder.begin_query(self.query_pool, self.query, vk::QueryControlFlags::empty());
        self.most_recent_serial = serials.current_serial();
    }

    pub fn end_query(
        &mut self,
        serials: &dyn SerialSource,
        recorder: &mut dyn CommandRecorder,
    ) {
        recorder.end_query(self.query_pool, self.query);
        self.most_recent_serial = serials.current_serial();
    }

    pub fn write_timestamp(
        &mut self,
        serials: &dyn SerialSource,
        recorder: &mut dyn CommandRecorder,
    ) {
        recorder.reset_query_pool(self.query_pool, self.query, 1);
        recorder.write_timestamp(
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            self.query_pool,
            self.query,
        );
        self.most_recent_serial = serials.current_serial();
    }

    /// True while the commands that touched this query have not been submitted yet. Waiting on the
    /// result in that state would never return.
    pub fn has_pending_work(
        &self,
        serials: &dyn SerialSource,
    ) -> bool {
        self.most_recent_serial == serials.current_serial()
    }

    /// Returns `None` if the result is not available and `wait` is false
    pub fn get_uint64_result(
        &self,
        device: &dyn DeviceContext,
        wait: bool,
    ) -> StrataResult<Option<u64>> {
        assert!(self.valid());
        device.get_query_result(self.query_pool, self.query, wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_api::headless::{
        DeviceContextHeadless, HeadlessCommandBuffer, HeadlessDeviceConfig, RecordedCommand,
    };
    use strata_base::QueueSerialTracker;

    fn config(pool_size: u32) -> RecyclingPoolConfig {
        RecyclingPoolConfig {
            pool_size,
            ..Default::default()
        }
    }

    #[test]
    fn test_queries_come_from_first_pool_until_exhausted() {
        let device = DeviceContextHeadless::new(HeadlessDeviceConfig::default());
        let serials = QueueSerialTracker::new();
        let mut query_pool =
            DynamicQueryPool::new(&device, vk::QueryType::OCCLUSION, config(2)).unwrap();
        assert_eq!(device.created_query_pool_count(), 1);

        let a = query_pool.allocate_query(&device, &serials).unwrap();
        let b = query_pool.allocate_query(&device, &serials).unwrap();
        assert_eq!(a.query_pool(), b.query_pool());
        assert_eq!((a.query(), b.query()), (0, 1));
        assert_eq!(device.created_query_pool_count(), 1);

        let c = query_pool.allocate_query(&device, &serials).unwrap();
        assert_eq!(c.pool_index(), 1);
        assert_ne!(c.query_pool(), a.query_pool());
        assert_eq!(device.created_query_pool_count(), 2);

        query_pool.destroy(&device);
        assert_eq!(device.live_query_pool_count(), 0);
    }

    #[test]
    fn test_freed_pool_is_recycled_after_completion() {
        let device = DeviceContextHeadless::new(HeadlessDeviceConfig::default());
        let serials = QueueSerialTracker::new();
        let mut query_pool =
            DynamicQueryPool::new(&device, vk::QueryType::TIMESTAMP, config(1)).unwrap();

        let mut a = query_pool.allocate_query(&device, &serials).unwrap();
        let first_pool = a.query_pool();
        query_pool.free_query(&serials, &mut a);
        assert!(!a.valid());

        // Freed in the current recording, so the GPU might still write to it
        let b = query_pool.allocate_query(&device, &serials).unwrap();
        assert_ne!(b.query_pool(), first_pool);

        serials.complete(serials.submit());
        let c = query_pool.allocate_query(&device, &serials).unwrap();
        assert_eq!(c.query_pool(), first_pool);
        assert_eq!(device.created_query_pool_count(), 2);

        query_pool.destroy(&device);
    }

    #[test]
    fn test_free_of_invalid_query_is_ignored() {
        let device = DeviceContextHeadless::new(HeadlessDeviceConfig::default());
        let serials = QueueSerialTracker::new();
        let mut query_pool =
            DynamicQueryPool::new(&device, vk::QueryType::OCCLUSION, config(4)).unwrap();

        let mut query = QueryHelper::default();
        query_pool.free_query(&serials, &mut query);
        assert_eq!(query_pool.pool.pool_stats(0).freed_count, 0);

        query_pool.destroy(&device);
    }

    #[test]
    fn test_query_commands_and_pending_work() {
        let device = DeviceContextHeadless::new(HeadlessDeviceConfig::default());
        let serials = QueueSerialTracker::new();
        let mut recorder = HeadlessCommandBuffer::new();
        let mut query_pool =
            DynamicQueryPool::new(&device, vk::QueryType::OCCLUSION, config(4)).unwrap();

        let mut query = query_pool.allocate_query(&device, &serials).unwrap();
        assert!(!query.has_pending_work(&serials));

        query.begin_query(&serials, &mut recorder);
        query.end_query(&serials, &mut recorder);
        assert_eq!(query.serial(), serials.current_serial());
        assert!(query.has_pending_work(&serials));

        let commands = recorder.take_commands();
        assert_eq!(commands.len(), 3);
        assert!(matches!(
            commands[0],
            RecordedCommand::ResetQueryPool {
                first_query: 0,
                query_count: 1,
                ..
            }
        ));
        assert!(matches!(commands[1], RecordedCommand::BeginQuery { query: 0, .. }));
        assert!(matches!(commands[2], RecordedCommand::EndQuery { query: 0, .. }));

        serials.submit();
        assert!(!query.has_pending_work(&serials));
        assert_eq!(query.get_uint64_result(&device, true).unwrap(), Some(0));

        query.write_timestamp(&serials, &mut recorder);
        let commands = recorder.take_commands();
        assert_eq!(commands.len(), 2);
        match &commands[1] {
            RecordedCommand::WriteTimestamp {
                pipeline_stage,
                query,
                ..
            } => {
                assert_eq!(*pipeline_stage, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
                assert_eq!(*query, 0);
            }
            command => panic!("unexpected command {:?}", command),
        }

        query_pool.free_query(&serials, &mut query);
        query_pool.destroy(&device);
    }
}
