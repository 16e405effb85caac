use std::{collections::HashMap, sync::Arc};

use ash::vk;
use truvis_gfx::{
    GfxDevice, GfxResult,
    commands::{
        queue::GfxQueue,
        recorder::GfxCommandRecorder,
        submit_info::{GfxSemaphoreSubmit, GfxSubmitInfo},
    },
    device::GfxSemaphoreKind,
};
use truvis_render_interface::{
    errors::{ConfigurationError, RenderResult, SubmissionError},
    handles::{Handle, ResourceCategory},
    resource_store::{ResourceStore, StoreRecord},
};

use crate::command_buffer_request::{CommandBufferRequest, QueueType, RecordCallback, SubmitMode, SubmitPhase};

/// 一次 `update` 的统计
#[derive(Debug, Clone, Default)]
pub struct SubmitStats {
    pub frame_slot: usize,
    pub groups_submitted: usize,
    pub command_buffers_submitted: usize,
    /// 本帧重新录制的 command buffer 数量，不包括 record_once 的重复提交
    pub command_buffers_recorded: usize,
    /// 录制失败而被跳过的 group
    pub failures: Vec<SubmissionError>,
}

struct CommandBufferRecord {
    name: String,
    queue_type: QueueType,
    phase: SubmitPhase,
    sub_order: u32,
    mode: SubmitMode,
    record_once: bool,
    record: RecordCallback,
    /// 注册顺序，sub_order 相同时按注册顺序录制
    seq: u64,

    /// 每个 frame in flight slot 一个
    command_buffers: Vec<(vk::CommandPool, vk::CommandBuffer)>,
    recorded: Vec<bool>,

    /// 以下只对下一次 update 有效
    submit_this_frame: bool,
    waits: Vec<GfxSemaphoreSubmit>,
    signals: Vec<GfxSemaphoreSubmit>,
}

impl CommandBufferRecord {
    #[inline]
    fn is_active(&self) -> bool {
        match self.mode {
            SubmitMode::Standard => true,
            SubmitMode::Dynamic => self.submit_this_frame,
        }
    }
}

impl StoreRecord for CommandBufferRecord {
    fn is_ready(&self) -> bool {
        true
    }

    fn cleanup(&mut self, device: &dyn GfxDevice) {
        for (pool, command_buffer) in self.command_buffers.drain(..) {
            device.free_command_buffer(pool, command_buffer);
        }
    }
}

/// 一个 queue type 的提交状态
struct SubmitLane {
    queue_type: QueueType,
    /// 在 `CommandBufferManager::queues` 中的下标
    queue_index: usize,
    family_index: u32,
    /// 每个 slot 一个 pool
    pools: Vec<vk::CommandPool>,
    /// 每个 slot 一个 fence，由这一帧最后一个 group 的提交 signal
    fences: Vec<vk::Fence>,
    fence_pending: Vec<bool>,
    /// group 之间的 binary semaphore，按 (phase, slot) 复用
    semaphores: HashMap<(SubmitPhase, usize), vk::Semaphore>,
}

/// 已经注销、等待所在 slot 的 GPU 工作结束后释放的 command buffer
struct RetiredCommand {
    lane_index: usize,
    slot: usize,
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
}

/// 一个已经录制好的 group
struct RecordedGroup {
    phase: SubmitPhase,
    command_buffers: Vec<vk::CommandBuffer>,
    waits: Vec<GfxSemaphoreSubmit>,
    signals: Vec<GfxSemaphoreSubmit>,
    /// 实际录制的数量
    recorded: usize,
    /// 录制失败时 command buffer 为空，额外的 semaphore 仍然需要提交
    failure: Option<SubmissionError>,
}

impl RecordedGroup {
    /// 失败并且没有额外 semaphore 的 group 不需要提交
    #[inline]
    fn is_empty(&self) -> bool {
        self.command_buffers.is_empty() && self.waits.is_empty() && self.signals.is_empty()
    }
}

/// 每帧的提交调度
///
/// 按照 queue type -> phase -> sub_order 对注册的请求分组。每帧：
/// 1. 等待当前 slot 在 N 帧之前的 fence
/// 2. 按照 phase 的顺序录制每个非空的 group
/// 3. 相邻的 group 通过 binary semaphore 串联，最后一个 group signal fence
///
/// 录制失败的 group 在这一帧被跳过，前后的 group 直接串联。
/// 它的请求上额外的 wait / signal 仍然通过一个空的批次提交，保证 binary semaphore 的配对。
pub struct CommandBufferManager {
    device: Arc<dyn GfxDevice>,
    fif_count: usize,

    queues: Vec<GfxQueue>,
    /// 按照 `QueueType::ALL` 的顺序
    lanes: Vec<SubmitLane>,

    records: ResourceStore<CommandBufferRecord>,
    retired: Vec<RetiredCommand>,

    next_seq: u64,
    submitted_frames: u64,
    total_failures: usize,

    destroyed: bool,
}

// new & init
impl CommandBufferManager {
    /// compute / transfer 为 `None` 时，对应的请求提交到 graphics queue；present 总是使用 graphics queue
    pub fn new(
        device: Arc<dyn GfxDevice>,
        graphics: GfxQueue,
        compute: Option<GfxQueue>,
        transfer: Option<GfxQueue>,
        fif_count: usize,
        capacity: usize,
    ) -> RenderResult<Self> {
        if fif_count == 0 {
            for queue in std::iter::once(graphics).chain(compute).chain(transfer) {
                device.release_queue(queue);
            }
            return Err(ConfigurationError::InvalidConfig("frames_in_flight must be at least 1".to_string()).into());
        }

        let mut queues = vec![graphics];
        let mut route = |queue: Option<GfxQueue>, queue_type: QueueType| match queue {
            Some(queue) => {
                queues.push(queue);
                queues.len() - 1
            }
            None => {
                log::info!("no dedicated {} queue, {} submissions use the graphics queue", queue_type, queue_type);
                0
            }
        };
        let compute_index = route(compute, QueueType::Compute);
        let transfer_index = route(transfer, QueueType::Transfer);

        let mut manager = Self {
            device,
            fif_count,
            queues,
            lanes: Vec::with_capacity(QueueType::ALL.len()),
            records: ResourceStore::new(ResourceCategory::CommandBuffer, capacity),
            retired: vec![],
            next_seq: 0,
            submitted_frames: 0,
            total_failures: 0,
            destroyed: false,
        };

        for queue_type in QueueType::ALL {
            let queue_index = match queue_type {
                QueueType::Graphics | QueueType::Present => 0,
                QueueType::Compute => compute_index,
                QueueType::Transfer => transfer_index,
            };
            // 失败时 drop 会销毁已经创建的对象
            let lane = manager.create_lane(queue_type, queue_index)?;
            manager.lanes.push(lane);
        }

        Ok(manager)
    }

    fn create_lane(&self, queue_type: QueueType, queue_index: usize) -> GfxResult<SubmitLane> {
        let family_index = self.queues[queue_index].family_index();
        let mut lane = SubmitLane {
            queue_type,
            queue_index,
            family_index,
            pools: Vec::with_capacity(self.fif_count),
            fences: Vec::with_capacity(self.fif_count),
            fence_pending: vec![false; self.fif_count],
            semaphores: HashMap::new(),
        };

        for slot in 0..self.fif_count {
            let pool = self.device.create_command_pool(
                family_index,
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                &format!("[{}]{}-command-pool", slot, queue_type),
            );
            let fence = pool.and_then(|pool| {
                lane.pools.push(pool);
                self.device.create_fence(false, &format!("[{}]{}-fence", slot, queue_type))
            });
            match fence {
                Ok(fence) => lane.fences.push(fence),
                Err(e) => {
                    Self::destroy_lane(&*self.device, lane);
                    return Err(e);
                }
            }
        }
        Ok(lane)
    }

    /// 等待所有提交完成，销毁所有对象并归还 queue
    pub fn destroy(mut self) {
        self.destroy_mut();
    }

    fn destroy_mut(&mut self) {
        if self.destroyed {
            return;
        }
        let _span = truvis_crate_tools::profile_span!("CommandBufferManager::destroy");
        let device = &*self.device;

        let pending_fences = self
            .lanes
            .iter()
            .flat_map(|lane| lane.fences.iter().zip(&lane.fence_pending).filter(|(_, pending)| **pending))
            .map(|(fence, _)| *fence)
            .collect::<Vec<_>>();
        if !pending_fences.is_empty() {
            if let Err(e) = device.wait_fences(&pending_fences, u64::MAX) {
                log::error!("failed to wait submission fences: {}", e);
            }
        }

        self.records.cleanup_all(device);
        for retired in self.retired.drain(..) {
            device.free_command_buffer(retired.pool, retired.command_buffer);
        }
        for lane in self.lanes.drain(..) {
            Self::destroy_lane(device, lane);
        }
        for queue in self.queues.drain(..) {
            device.release_queue(queue);
        }

        self.destroyed = true;
        log::info!("CommandBufferManager destroyed");
    }

    fn destroy_lane(device: &dyn GfxDevice, lane: SubmitLane) {
        for semaphore in lane.semaphores.into_values() {
            device.destroy_semaphore(semaphore);
        }
        for fence in lane.fences {
            device.destroy_fence(fence);
        }
        for pool in lane.pools {
            device.destroy_command_pool(pool);
        }
    }
}

impl Drop for CommandBufferManager {
    fn drop(&mut self) {
        self.destroy_mut();
    }
}

// getters
impl CommandBufferManager {
    #[inline]
    pub fn fif_count(&self) -> usize {
        self.fif_count
    }

    #[inline]
    pub fn registered_count(&self) -> usize {
        self.records.len()
    }

    /// 所有帧中录制失败的 group 总数
    #[inline]
    pub fn total_failures(&self) -> usize {
        self.total_failures
    }

    /// queue type 实际使用的 queue family
    #[inline]
    pub fn queue_family(&self, queue_type: QueueType) -> u32 {
        self.lanes[Self::lane_index(queue_type)].family_index
    }

    #[inline]
    fn lane_index(queue_type: QueueType) -> usize {
        match queue_type {
            QueueType::Graphics => 0,
            QueueType::Compute => 1,
            QueueType::Transfer => 2,
            QueueType::Present => 3,
        }
    }
}

// registration
impl CommandBufferManager {
    /// 注册一个提交请求，为每个 frame in flight slot 分配一个 command buffer
    pub fn register_command_buffer(&mut self, request: CommandBufferRequest) -> RenderResult<Handle> {
        if self.records.len() >= self.records.capacity() {
            return Err(ConfigurationError::CapacityExceeded {
                category: ResourceCategory::CommandBuffer,
                capacity: self.records.capacity(),
            }
            .into());
        }

        let lane = &self.lanes[Self::lane_index(request.queue_type)];
        let mut command_buffers = Vec::with_capacity(self.fif_count);
        for (slot, pool) in lane.pools.iter().enumerate() {
            match self.device.allocate_command_buffer(*pool, &format!("[{}]{}", slot, request.name)) {
                Ok(command_buffer) => command_buffers.push((*pool, command_buffer)),
                Err(e) => {
                    for (pool, command_buffer) in command_buffers {
                        self.device.free_command_buffer(pool, command_buffer);
                    }
                    return Err(e.into());
                }
            }
        }

        let record = CommandBufferRecord {
            name: request.name,
            queue_type: request.queue_type,
            phase: request.phase,
            sub_order: request.sub_order,
            mode: request.mode,
            record_once: request.record_once,
            record: request.record,
            seq: self.next_seq,
            command_buffers,
            recorded: vec![false; self.fif_count],
            submit_this_frame: false,
            waits: vec![],
            signals: vec![],
        };
        self.next_seq += 1;

        let (name, queue_type, phase) = (record.name.clone(), record.queue_type, record.phase);
        let handle = self.records.insert(record)?;
        log::debug!("register command buffer `{}` as {} ({} / {:?})", name, handle, queue_type, phase);
        Ok(handle)
    }

    /// 注销请求，command buffer 在对应 slot 的 GPU 工作结束后释放
    pub fn unregister(&mut self, handle: Handle) -> RenderResult<()> {
        let mut record = self.records.take(handle)?;
        let lane_index = Self::lane_index(record.queue_type);
        let lane = &self.lanes[lane_index];
        for (slot, (pool, command_buffer)) in record.command_buffers.drain(..).enumerate() {
            if lane.fence_pending[slot] {
                self.retired.push(RetiredCommand {
                    lane_index,
                    slot,
                    pool,
                    command_buffer,
                });
            } else {
                self.device.free_command_buffer(pool, command_buffer);
            }
        }
        Ok(())
    }

    /// 在下一次 update 中提交这个 dynamic 请求
    pub fn submit_dynamic_buffer(&mut self, handle: Handle) -> RenderResult<()> {
        let record = self.records.get_mut(handle)?;
        if record.mode == SubmitMode::Standard {
            log::warn!("`{}` is a standard command buffer, it is submitted every frame", record.name);
        }
        record.submit_this_frame = true;
        Ok(())
    }

    /// 下一次提交这个请求所在的 group 时额外等待的 semaphore
    pub fn add_wait_semaphore(&mut self, handle: Handle, wait: GfxSemaphoreSubmit) -> RenderResult<()> {
        self.records.get_mut(handle)?.waits.push(wait);
        Ok(())
    }

    /// 下一次提交这个请求所在的 group 时额外 signal 的 semaphore
    pub fn add_signal_semaphore(&mut self, handle: Handle, signal: GfxSemaphoreSubmit) -> RenderResult<()> {
        self.records.get_mut(handle)?.signals.push(signal);
        Ok(())
    }
}

// update
impl CommandBufferManager {
    /// 录制并提交 `frame_slot` 这一帧所有 active 的请求
    pub fn update(&mut self, frame_slot: usize) -> RenderResult<SubmitStats> {
        let _span = truvis_crate_tools::profile_span!("CommandBufferManager::update");
        if frame_slot >= self.fif_count {
            return Err(ConfigurationError::InvalidFrameIndex {
                index: frame_slot,
                frames_in_flight: self.fif_count,
            }
            .into());
        }

        let frame_id = self.submitted_frames;
        self.submitted_frames += 1;
        let mut stats = SubmitStats {
            frame_slot,
            ..Default::default()
        };

        let submitted = self.submit_lanes(frame_slot, frame_id, &mut stats);

        // dynamic 标记和额外的 semaphore 只对这一帧有效，提交出错时也要清除
        for (_, record) in self.records.iter_mut() {
            record.submit_this_frame = false;
            record.waits.clear();
            record.signals.clear();
        }
        self.total_failures += stats.failures.len();

        if let Err(e) = submitted {
            log::error!("[F{}-{}] submit failed: {}", frame_id, frame_slot, e);
            return Err(e.into());
        }
        Ok(stats)
    }

    fn submit_lanes(&mut self, slot: usize, frame_id: u64, stats: &mut SubmitStats) -> Result<(), SubmissionError> {
        for lane_index in 0..self.lanes.len() {
            self.wait_slot(lane_index, slot)?;
            self.submit_lane(lane_index, slot, frame_id, stats)?;
        }
        Ok(())
    }

    /// 等待 slot 上一次的提交结束，并释放已经注销的 command buffer
    fn wait_slot(&mut self, lane_index: usize, slot: usize) -> Result<(), SubmissionError> {
        let lane = &mut self.lanes[lane_index];
        if lane.fence_pending[slot] {
            let fence = lane.fences[slot];
            self.device.wait_fences(&[fence], u64::MAX)?;
            self.device.reset_fences(&[fence])?;
            lane.fence_pending[slot] = false;
        }

        let device = &*self.device;
        self.retired.retain(|retired| {
            if retired.lane_index == lane_index && retired.slot == slot {
                device.free_command_buffer(retired.pool, retired.command_buffer);
                false
            } else {
                true
            }
        });
        Ok(())
    }

    fn submit_lane(
        &mut self,
        lane_index: usize,
        slot: usize,
        frame_id: u64,
        stats: &mut SubmitStats,
    ) -> Result<(), SubmissionError> {
        let queue_type = self.lanes[lane_index].queue_type;
        let mut active = self
            .records
            .iter()
            .filter(|(_, record)| record.queue_type == queue_type && record.is_active())
            .map(|(handle, record)| (record.phase, record.sub_order, record.seq, handle))
            .collect::<Vec<_>>();
        if active.is_empty() {
            return Ok(());
        }
        active.sort_unstable_by_key(|(phase, sub_order, seq, _)| (*phase, *sub_order, *seq));

        let mut groups = Vec::with_capacity(SubmitPhase::ALL.len());
        for phase in SubmitPhase::ALL {
            let handles = active.iter().filter(|item| item.0 == phase).map(|item| item.3).collect::<Vec<_>>();
            if handles.is_empty() {
                continue;
            }
            let mut group = self.record_group(lane_index, phase, &handles, slot, frame_id);
            stats.command_buffers_recorded += group.recorded;
            if let Some(e) = group.failure.take() {
                log::error!("[F{}-{}] skip {} group {:?}: {}", frame_id, slot, queue_type, phase, e);
                stats.failures.push(e);
                if group.is_empty() {
                    continue;
                }
            } else {
                stats.groups_submitted += 1;
            }
            groups.push(group);
        }
        if groups.is_empty() {
            return Ok(());
        }

        let mut batches = Vec::with_capacity(groups.len());
        let mut previous: Option<vk::Semaphore> = None;
        for (index, group) in groups.iter().enumerate() {
            let mut batch = GfxSubmitInfo::new(&group.command_buffers)
                .waits(group.waits.iter().copied())
                .signals(group.signals.iter().copied());
            if let Some(previous) = previous {
                batch = batch.wait(previous, vk::PipelineStageFlags2::ALL_COMMANDS, None);
            }
            // 只有后面还有 group 时才需要 signal
            previous = if index + 1 < groups.len() {
                let semaphore = self.group_semaphore(lane_index, group.phase, slot)?;
                batch = batch.signal(semaphore, vk::PipelineStageFlags2::ALL_COMMANDS, None);
                Some(semaphore)
            } else {
                None
            };
            batches.push(batch);
        }

        let lane = &mut self.lanes[lane_index];
        self.device.queue_submit(&self.queues[lane.queue_index], &batches, Some(lane.fences[slot]))?;
        lane.fence_pending[slot] = true;

        stats.command_buffers_submitted += groups.iter().map(|group| group.command_buffers.len()).sum::<usize>();
        Ok(())
    }

    /// 按顺序录制一个 group
    ///
    /// 某个请求录制失败后，group 中剩下的请求不再录制，但仍然收集所有请求额外的 semaphore
    fn record_group(
        &mut self,
        lane_index: usize,
        phase: SubmitPhase,
        handles: &[Handle],
        slot: usize,
        frame_id: u64,
    ) -> RecordedGroup {
        let device = &*self.device;
        let family_index = self.lanes[lane_index].family_index;
        let mut group = RecordedGroup {
            phase,
            command_buffers: Vec::with_capacity(handles.len()),
            waits: vec![],
            signals: vec![],
            recorded: 0,
            failure: None,
        };

        for handle in handles {
            let Ok(record) = self.records.get_mut(*handle) else {
                continue;
            };
            group.waits.extend(record.waits.iter().copied());
            group.signals.extend(record.signals.iter().copied());
            if group.failure.is_some() {
                continue;
            }

            let (_, command_buffer) = record.command_buffers[slot];
            if !(record.record_once && record.recorded[slot]) {
                if let Err(e) = Self::record_one(device, record, command_buffer, family_index, slot, frame_id) {
                    group.command_buffers.clear();
                    group.failure = Some(e);
                    continue;
                }
                group.recorded += 1;
            }
            group.command_buffers.push(command_buffer);
        }

        group
    }

    fn record_one(
        device: &dyn GfxDevice,
        record: &mut CommandBufferRecord,
        command_buffer: vk::CommandBuffer,
        family_index: u32,
        slot: usize,
        frame_id: u64,
    ) -> Result<(), SubmissionError> {
        let usage = if record.record_once {
            vk::CommandBufferUsageFlags::empty()
        } else {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        };
        device.begin_command_buffer(command_buffer, usage)?;
        let recorder = GfxCommandRecorder::new(device, command_buffer, family_index);
        if let Err(e) = (record.record)(&recorder, slot) {
            // 回到 initial 状态，下一帧可以重新录制
            if let Err(reset_err) = device.reset_command_buffer(command_buffer) {
                log::error!("failed to reset `{}`: {}", record.name, reset_err);
            }
            record.recorded[slot] = false;
            return Err(SubmissionError::RecordFailed {
                frame_id,
                name: record.name.clone(),
                reason: format!("{:#}", e),
            });
        }
        device.end_command_buffer(command_buffer)?;
        record.recorded[slot] = true;
        Ok(())
    }

    fn group_semaphore(&mut self, lane_index: usize, phase: SubmitPhase, slot: usize) -> GfxResult<vk::Semaphore> {
        let lane = &mut self.lanes[lane_index];
        if let Some(semaphore) = lane.semaphores.get(&(phase, slot)) {
            return Ok(*semaphore);
        }
        let semaphore = self
            .device
            .create_semaphore(GfxSemaphoreKind::Binary, &format!("[{}]{}-{:?}", slot, lane.queue_type, phase))?;
        lane.semaphores.insert((phase, slot), semaphore);
        Ok(semaphore)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::HashSet, rc::Rc};

    use truvis_gfx::headless::HeadlessDevice;
    use truvis_render_interface::errors::RenderCoreError;

    use super::*;

    type CallLog = Rc<RefCell<Vec<String>>>;

    fn manager(device: &Arc<HeadlessDevice>, fif_count: usize) -> CommandBufferManager {
        let graphics = device.acquire_queue(0, 0).unwrap();
        CommandBufferManager::new(device.clone(), graphics, None, None, fif_count, 16).unwrap()
    }

    fn logging_request(name: &str, queue_type: QueueType, phase: SubmitPhase, log: &CallLog) -> CommandBufferRequest {
        let log = log.clone();
        let entry = name.to_string();
        CommandBufferRequest::new(name, queue_type, phase, move |_recorder, _slot| {
            log.borrow_mut().push(entry.clone());
            Ok(())
        })
    }

    #[test]
    fn test_standard_and_dynamic_scenario() {
        truvis_crate_tools::init_log::init_test_log();
        let device = Arc::new(HeadlessDevice::new());
        let mut cbm = manager(&device, 3);
        let log: CallLog = Rc::default();

        // 注册顺序和 sub_order 不同
        for (name, sub_order) in [("standard-2", 2), ("standard-0", 0), ("standard-1", 1)] {
            cbm.register_command_buffer(
                logging_request(name, QueueType::Graphics, SubmitPhase::MainRenderPass, &log).sub_order(sub_order),
            )
            .unwrap();
        }
        let screenshot = cbm
            .register_command_buffer(
                logging_request("screenshot", QueueType::Transfer, SubmitPhase::EndOfFrame, &log).dynamic(),
            )
            .unwrap();

        let mut dynamic_frames = vec![];
        for frame in 0..10usize {
            if frame == 5 {
                cbm.submit_dynamic_buffer(screenshot).unwrap();
            }
            let stats = cbm.update(frame % 3).unwrap();
            assert!(stats.failures.is_empty());

            let calls = std::mem::take(&mut *log.borrow_mut());
            let standard = calls.iter().filter(|name| name.starts_with("standard")).cloned().collect::<Vec<_>>();
            assert_eq!(standard, vec!["standard-0", "standard-1", "standard-2"]);
            if calls.iter().any(|name| name == "screenshot") {
                dynamic_frames.push(frame);
            }
        }

        assert_eq!(dynamic_frames, vec![5]);
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn test_semaphore_slots_reused() {
        let device = Arc::new(HeadlessDevice::new());
        let fif_count = 2;
        let mut cbm = manager(&device, fif_count);
        let log: CallLog = Rc::default();
        for phase in [SubmitPhase::BeforeRenderPass, SubmitPhase::MainRenderPass, SubmitPhase::AfterRenderPass] {
            cbm.register_command_buffer(logging_request(&format!("{:?}", phase), QueueType::Graphics, phase, &log))
                .unwrap();
        }

        let binary_signals = |device: &HeadlessDevice| {
            device
                .submissions()
                .iter()
                .flat_map(|submission| submission.signals.clone())
                .filter(|signal| !signal.is_timeline())
                .map(|signal| signal.semaphore)
                .collect::<HashSet<_>>()
        };

        for frame in 0..fif_count {
            cbm.update(frame % fif_count).unwrap();
        }
        // 三个 group 之间有两个 semaphore，每个 slot 一份
        let first_round = binary_signals(&device);
        assert_eq!(first_round.len(), 2 * fif_count);

        for frame in fif_count..5 * fif_count {
            cbm.update(frame % fif_count).unwrap();
        }
        assert_eq!(binary_signals(&device), first_round);
        assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
    }

    #[test]
    fn test_failing_callback_skips_group() {
        let device = Arc::new(HeadlessDevice::new());
        let mut cbm = manager(&device, 2);
        let log: CallLog = Rc::default();
        let fail_on_frame = Rc::new(RefCell::new(false));

        cbm.register_command_buffer(logging_request("before", QueueType::Graphics, SubmitPhase::BeforeRenderPass, &log))
            .unwrap();
        let fail = fail_on_frame.clone();
        cbm.register_command_buffer(CommandBufferRequest::new(
            "flaky",
            QueueType::Graphics,
            SubmitPhase::MainRenderPass,
            move |_recorder, _slot| {
                if *fail.borrow() {
                    anyhow::bail!("pipeline not compiled");
                }
                Ok(())
            },
        ))
        .unwrap();
        cbm.register_command_buffer(logging_request("after", QueueType::Graphics, SubmitPhase::AfterRenderPass, &log))
            .unwrap();

        cbm.update(0).unwrap();
        *fail_on_frame.borrow_mut() = true;
        let submissions_before = device.submissions().len();
        let stats = cbm.update(1).unwrap();

        assert_eq!(stats.groups_submitted, 2);
        assert!(matches!(&stats.failures[..], [SubmissionError::RecordFailed { name, .. }] if name == "flaky"));
        // before 和 after 直接串联
        let frame_batches = &device.submissions()[submissions_before..];
        assert_eq!(frame_batches.len(), 2);
        assert_eq!(frame_batches[1].waits.len(), 1);
        assert_eq!(frame_batches[1].waits[0].semaphore, frame_batches[0].signals[0].semaphore);

        *fail_on_frame.borrow_mut() = false;
        for frame in 2..6 {
            assert!(cbm.update(frame % 2).unwrap().failures.is_empty());
        }
        assert_eq!(cbm.total_failures(), 1);
        assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
    }

    #[test]
    fn test_failing_consumer_still_waits_binary_semaphore() {
        truvis_crate_tools::init_log::init_test_log();
        let device = Arc::new(HeadlessDevice::new());
        let graphics = device.acquire_queue(0, 0).unwrap();
        let compute = device.acquire_queue(1, 0).unwrap();
        let mut cbm = CommandBufferManager::new(device.clone(), graphics, Some(compute), None, 2, 16).unwrap();
        let log: CallLog = Rc::default();
        let fail_on_frame = Rc::new(RefCell::new(false));

        // graphics 生成，compute 通过 binary semaphore 接收
        let shadow = cbm
            .register_command_buffer(logging_request("shadow", QueueType::Graphics, SubmitPhase::MainRenderPass, &log))
            .unwrap();
        let fail = fail_on_frame.clone();
        let blur = cbm
            .register_command_buffer(CommandBufferRequest::new(
                "blur",
                QueueType::Compute,
                SubmitPhase::MainRenderPass,
                move |_recorder, _slot| {
                    if *fail.borrow() {
                        anyhow::bail!("descriptor set missing");
                    }
                    Ok(())
                },
            ))
            .unwrap();
        let handoff = device.create_semaphore(GfxSemaphoreKind::Binary, "shadow-handoff").unwrap();

        for frame in 0..6usize {
            *fail_on_frame.borrow_mut() = frame == 1;
            cbm.add_signal_semaphore(shadow, GfxSemaphoreSubmit::binary(handoff, vk::PipelineStageFlags2::ALL_COMMANDS))
                .unwrap();
            cbm.add_wait_semaphore(blur, GfxSemaphoreSubmit::binary(handoff, vk::PipelineStageFlags2::COMPUTE_SHADER))
                .unwrap();

            let submissions_before = device.submissions().len();
            let stats = cbm.update(frame % 2).unwrap();
            if frame == 1 {
                assert!(matches!(&stats.failures[..], [SubmissionError::RecordFailed { name, .. }] if name == "blur"));
                assert_eq!(stats.groups_submitted, 1);
                // 跳过的 group 只提交等待，不提交 command buffer
                let compute_batch = device.submissions()[submissions_before..]
                    .iter()
                    .find(|submission| submission.family_index == 1)
                    .cloned()
                    .unwrap();
                assert!(compute_batch.command_buffers.is_empty());
                assert_eq!(compute_batch.waits.len(), 1);
                assert_eq!(compute_batch.waits[0].semaphore, handoff);
            } else {
                assert!(stats.failures.is_empty());
                assert_eq!(stats.groups_submitted, 2);
            }
        }

        assert_eq!(cbm.total_failures(), 1);
        assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
        cbm.destroy();
        device.destroy_semaphore(handoff);
    }

    #[test]
    fn test_device_error_still_clears_frame_state() {
        let device = Arc::new(HeadlessDevice::new());
        let mut cbm = manager(&device, 2);
        let log: CallLog = Rc::default();
        let draw = cbm
            .register_command_buffer(logging_request("draw", QueueType::Graphics, SubmitPhase::MainRenderPass, &log))
            .unwrap();
        let orphan = device.create_semaphore(GfxSemaphoreKind::Binary, "orphan").unwrap();

        // 没有任何提交会 signal 这个 semaphore，device 拒绝这次提交
        cbm.add_wait_semaphore(draw, GfxSemaphoreSubmit::binary(orphan, vk::PipelineStageFlags2::ALL_COMMANDS))
            .unwrap();
        assert!(matches!(cbm.update(0), Err(RenderCoreError::Submission(SubmissionError::Device(_)))));

        // 无效的 wait 只对出错的那一帧有效
        for frame in 1..4 {
            assert!(cbm.update(frame % 2).unwrap().failures.is_empty());
        }
        assert!(device.submissions().last().unwrap().waits.is_empty());
        cbm.destroy();
        device.destroy_semaphore(orphan);
    }

    #[test]
    fn test_record_once_records_each_slot_once() {
        let device = Arc::new(HeadlessDevice::new());
        let mut cbm = manager(&device, 2);
        let log: CallLog = Rc::default();
        cbm.register_command_buffer(
            logging_request("static-blit", QueueType::Graphics, SubmitPhase::EndOfFrame, &log).record_once(),
        )
        .unwrap();

        let mut submitted = 0;
        for frame in 0..6 {
            submitted += cbm.update(frame % 2).unwrap().command_buffers_submitted;
        }
        assert_eq!(log.borrow().len(), 2);
        assert_eq!(submitted, 6);
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn test_queue_fallback_and_extra_semaphores() {
        let device = Arc::new(HeadlessDevice::new());
        let graphics = device.acquire_queue(0, 0).unwrap();
        let compute = device.acquire_queue(1, 0).unwrap();
        let mut cbm = CommandBufferManager::new(device.clone(), graphics, Some(compute), None, 2, 16).unwrap();
        assert_eq!(cbm.queue_family(QueueType::Compute), 1);
        assert_eq!(cbm.queue_family(QueueType::Transfer), 0);
        assert_eq!(cbm.queue_family(QueueType::Present), 0);

        let log: CallLog = Rc::default();
        let skinning = cbm
            .register_command_buffer(logging_request("skinning", QueueType::Compute, SubmitPhase::BeforeRenderPass, &log))
            .unwrap();
        let timeline = device.create_semaphore(GfxSemaphoreKind::Timeline { initial_value: 0 }, "skinning-done").unwrap();

        cbm.add_signal_semaphore(
            skinning,
            GfxSemaphoreSubmit::timeline(timeline, vk::PipelineStageFlags2::COMPUTE_SHADER, 1),
        )
        .unwrap();
        cbm.update(0).unwrap();
        assert_eq!(device.semaphore_value(timeline).unwrap(), 1);
        assert_eq!(device.submissions().last().unwrap().family_index, 1);

        // 额外的 semaphore 只对一帧有效
        cbm.add_wait_semaphore(skinning, GfxSemaphoreSubmit::timeline(timeline, vk::PipelineStageFlags2::ALL_COMMANDS, 1))
            .unwrap();
        cbm.update(1).unwrap();
        assert_eq!(device.submissions().last().unwrap().waits.len(), 1);
        cbm.update(0).unwrap();
        assert!(device.submissions().last().unwrap().waits.is_empty());

        cbm.destroy();
        device.destroy_semaphore(timeline);
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn test_invalid_frame_index_and_unregister() {
        let device = Arc::new(HeadlessDevice::new());
        let mut cbm = manager(&device, 2);
        assert!(matches!(
            cbm.update(2),
            Err(RenderCoreError::Configuration(ConfigurationError::InvalidFrameIndex { index: 2, .. }))
        ));

        let log: CallLog = Rc::default();
        let handle = cbm
            .register_command_buffer(logging_request("temp", QueueType::Graphics, SubmitPhase::MainRenderPass, &log))
            .unwrap();
        let command_buffers = device.live_objects().command_buffers;
        cbm.update(0).unwrap();
        cbm.unregister(handle).unwrap();
        assert!(cbm.submit_dynamic_buffer(handle).is_err());

        // slot 1 没有提交过，立即释放；slot 0 在下一次使用时释放
        assert_eq!(device.live_objects().command_buffers, command_buffers - 1);
        cbm.update(1).unwrap();
        cbm.update(0).unwrap();
        assert_eq!(device.live_objects().command_buffers, command_buffers - 2);
        assert_eq!(log.borrow().len(), 1);

        cbm.destroy();
        let live = device.live_objects();
        assert_eq!((live.command_pools, live.fences, live.semaphores), (0, 0, 0));
    }
}
