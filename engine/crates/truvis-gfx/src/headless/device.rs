use std::{
    ptr::NonNull,
    sync::{
        Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use ash::vk::{self, Handle};

use crate::{
    commands::{
        barrier::{GfxBufferBarrier, GfxImageBarrier},
        queue::{GfxQueue, GfxQueueFamily},
        submit_info::{GfxSemaphoreSubmit, GfxSubmitInfo},
    },
    device::{GfxBuffer, GfxBufferDesc, GfxDevice, GfxImage, GfxImageDesc, GfxMemoryLocation, GfxSemaphoreKind},
    error::{GfxError, GfxResult},
    headless::state::{
        CommandBufferState, HeadlessBuffer, HeadlessCommand, HeadlessCommandBuffer, HeadlessFence, HeadlessImage,
        HeadlessPool, HeadlessSemaphore, HeadlessState, QueueItem,
    },
    resources::format::format_texel_size,
};

/// 一次提交中的一个批次
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeadlessSubmission {
    pub family_index: u32,
    pub queue_index: u32,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub waits: Vec<GfxSemaphoreSubmit>,
    pub signals: Vec<GfxSemaphoreSubmit>,
    pub fence: Option<vk::Fence>,
}

/// 当前存活的对象数量
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeadlessObjectCounts {
    pub buffers: usize,
    pub images: usize,
    pub semaphores: usize,
    pub fences: usize,
    pub command_pools: usize,
    pub command_buffers: usize,
}

pub struct HeadlessDevice {
    name: String,
    queue_families: Vec<GfxQueueFamily>,
    next_raw: AtomicU64,
    state: Mutex<HeadlessState>,
    /// 任意批次执行完毕后通知
    progress: Condvar,
}

// new & init
impl HeadlessDevice {
    /// 默认的 queue family 布局：
    /// - 0: gfx，graphics + compute + transfer，2 个 queue，支持 present
    /// - 1: compute-only，compute + transfer，1 个 queue
    /// - 2: transfer-only，2 个 queue
    pub fn new() -> Self {
        Self::with_families(vec![
            GfxQueueFamily {
                name: "gfx".to_string(),
                queue_family_index: 0,
                queue_flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                queue_count: 2,
                supports_present: true,
            },
            GfxQueueFamily {
                name: "compute-only".to_string(),
                queue_family_index: 1,
                queue_flags: vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                queue_count: 1,
                supports_present: false,
            },
            GfxQueueFamily {
                name: "transfer-only".to_string(),
                queue_family_index: 2,
                queue_flags: vk::QueueFlags::TRANSFER,
                queue_count: 2,
                supports_present: false,
            },
        ])
    }

    pub fn with_families(queue_families: Vec<GfxQueueFamily>) -> Self {
        Self {
            name: "headless".to_string(),
            queue_families,
            next_raw: AtomicU64::new(1),
            state: Mutex::new(HeadlessState::default()),
            progress: Condvar::new(),
        }
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

// tools
impl HeadlessDevice {
    #[inline]
    fn lock(&self) -> MutexGuard<'_, HeadlessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    fn next_handle<T: Handle>(&self) -> T {
        T::from_raw(self.next_raw.fetch_add(1, Ordering::Relaxed))
    }

    /// 报告一个使用错误，并作为 `InvalidUsage` 返回
    fn invalid(state: &mut HeadlessState, message: String) -> GfxError {
        state.report(message.clone());
        GfxError::InvalidUsage(message)
    }

    /// 在一个 command buffer 上录制命令
    fn record(&self, command_buffer: vk::CommandBuffer, command: HeadlessCommand) {
        let mut state = self.lock();
        match state.command_buffers.get_mut(&command_buffer) {
            Some(cmd) if cmd.state == CommandBufferState::Recording => cmd.commands.push(command),
            Some(cmd) => {
                let message = format!("record into `{}` while it is {:?}", cmd.name, cmd.state);
                state.report(message);
            }
            None => state.report(format!("record into unknown command buffer {:?}", command_buffer)),
        }
    }

    /// 检查并登记一次提交中的 semaphore 操作
    fn validate_batch(state: &mut HeadlessState, batch: &GfxSubmitInfo) -> Result<(), String> {
        for wait in &batch.wait_infos {
            match state.semaphores.get_mut(&wait.semaphore) {
                Some(HeadlessSemaphore::Binary {
                    signaled,
                    pending_signal,
                    pending_wait,
                }) => {
                    if wait.value.is_some() {
                        return Err(format!("timeline wait on binary semaphore {:?}", wait.semaphore));
                    }
                    if *pending_wait {
                        return Err(format!("binary semaphore {:?} already has a pending wait", wait.semaphore));
                    }
                    if !*signaled && !*pending_signal {
                        return Err(format!("wait on binary semaphore {:?} with no signal submitted", wait.semaphore));
                    }
                    *pending_wait = true;
                }
                Some(HeadlessSemaphore::Timeline { .. }) => {
                    if wait.value.is_none() {
                        return Err(format!("binary wait on timeline semaphore {:?}", wait.semaphore));
                    }
                }
                None => return Err(format!("wait on unknown semaphore {:?}", wait.semaphore)),
            }
        }

        for signal in &batch.signal_infos {
            match state.semaphores.get_mut(&signal.semaphore) {
                Some(HeadlessSemaphore::Binary {
                    signaled,
                    pending_signal,
                    ..
                }) => {
                    if signal.value.is_some() {
                        return Err(format!("timeline signal on binary semaphore {:?}", signal.semaphore));
                    }
                    if *signaled || *pending_signal {
                        return Err(format!(
                            "binary semaphore {:?} signaled again before being waited on",
                            signal.semaphore
                        ));
                    }
                    *pending_signal = true;
                }
                Some(HeadlessSemaphore::Timeline { value, pending_value }) => {
                    let Some(new_value) = signal.value else {
                        return Err(format!("binary signal on timeline semaphore {:?}", signal.semaphore));
                    };
                    if new_value <= *value || new_value <= *pending_value {
                        return Err(format!(
                            "timeline semaphore {:?} signal value {} is not increasing (current {}, pending {})",
                            signal.semaphore, new_value, value, pending_value
                        ));
                    }
                    *pending_value = new_value;
                }
                None => return Err(format!("signal on unknown semaphore {:?}", signal.semaphore)),
            }
        }
        Ok(())
    }

    fn wait_until(&self, timeout_ns: u64, mut done: impl FnMut(&HeadlessState) -> bool) -> bool {
        let deadline = Instant::now().checked_add(Duration::from_nanos(timeout_ns));
        let mut state = self.lock();
        loop {
            if done(&*state) {
                return true;
            }
            match deadline {
                None => {
                    state = self.progress.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    state = self
                        .progress
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }
}

// 测试辅助
impl HeadlessDevice {
    /// 暂停一个 queue family：之后提交到该 family 的批次不会执行
    pub fn pause_family(&self, family_index: u32) {
        self.lock().paused_families.insert(family_index);
    }

    /// 恢复一个 queue family，并立即执行所有可以执行的批次
    pub fn resume_family(&self, family_index: u32) {
        let mut state = self.lock();
        state.paused_families.remove(&family_index);
        state.pump();
        drop(state);
        self.progress.notify_all();
    }

    /// 之后所有名字为 `name` 的 buffer 或 image 的创建都会失败
    pub fn fail_allocation_named(&self, name: impl Into<String>) {
        self.lock().failing_allocations.insert(name.into());
    }

    pub fn clear_allocation_failures(&self) {
        self.lock().failing_allocations.clear();
    }

    pub fn read_buffer(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.lock().buffers.get(&buffer).map(|buffer| buffer.data.to_vec())
    }

    pub fn read_image(&self, image: vk::Image) -> Option<Vec<u8>> {
        self.lock().images.get(&image).map(|image| image.data.to_vec())
    }

    pub fn image_layout(&self, image: vk::Image) -> Option<vk::ImageLayout> {
        self.lock().images.get(&image).map(|image| image.layout)
    }

    pub fn submissions(&self) -> Vec<HeadlessSubmission> {
        self.lock().submissions.clone()
    }

    pub fn validation_errors(&self) -> Vec<String> {
        self.lock().validation_errors.clone()
    }

    pub fn live_objects(&self) -> HeadlessObjectCounts {
        let state = self.lock();
        HeadlessObjectCounts {
            buffers: state.buffers.len(),
            images: state.images.len(),
            semaphores: state.semaphores.len(),
            fences: state.fences.len(),
            command_pools: state.pools.len(),
            command_buffers: state.command_buffers.len(),
        }
    }

    pub fn destroyed_pipelines(&self) -> usize {
        self.lock().destroyed_pipelines
    }

    /// 是否还有没有执行的批次
    pub fn has_pending_work(&self) -> bool {
        self.lock().has_pending_work()
    }
}

impl GfxDevice for HeadlessDevice {
    fn device_name(&self) -> &str {
        &self.name
    }

    fn queue_families(&self) -> &[GfxQueueFamily] {
        &self.queue_families
    }

    fn acquire_queue(&self, family_index: u32, queue_index: u32) -> GfxResult<GfxQueue> {
        let family = self
            .queue_families
            .iter()
            .find(|family| family.queue_family_index == family_index && queue_index < family.queue_count)
            .ok_or(GfxError::QueueUnavailable {
                family_index,
                queue_index,
            })?;

        let mut state = self.lock();
        if !state.acquired_queues.insert((family_index, queue_index)) {
            return Err(GfxError::QueueUnavailable {
                family_index,
                queue_index,
            });
        }
        state.queues.entry((family_index, queue_index)).or_default();

        let raw = ((family_index as u64) << 32) | (queue_index as u64 + 1);
        Ok(GfxQueue::new(vk::Queue::from_raw(raw), family.clone(), queue_index))
    }

    fn release_queue(&self, queue: GfxQueue) {
        self.lock().acquired_queues.remove(&(queue.family_index(), queue.queue_index()));
    }

    fn create_buffer(&self, desc: &GfxBufferDesc) -> GfxResult<GfxBuffer> {
        let mut state = self.lock();
        if state.failing_allocations.contains(&desc.name) {
            return Err(GfxError::AllocationFailed {
                name: desc.name.clone(),
                reason: "injected failure".to_string(),
            });
        }

        let handle: vk::Buffer = self.next_handle();
        state.buffers.insert(
            handle,
            HeadlessBuffer {
                name: desc.name.clone(),
                data: vec![0; desc.size as usize].into_boxed_slice(),
                location: desc.location,
                map_count: 0,
            },
        );
        Ok(GfxBuffer {
            handle,
            size: desc.size,
            usage: desc.usage,
        })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.lock();
        match state.buffers.remove(&buffer) {
            Some(removed) if removed.map_count > 0 => {
                state.report(format!("buffer `{}` destroyed while mapped", removed.name));
            }
            Some(_) => {}
            None => state.report(format!("destroy unknown buffer {:?}", buffer)),
        }
    }

    fn map_buffer(&self, buffer: vk::Buffer) -> GfxResult<NonNull<u8>> {
        let mut state = self.lock();
        let Some(headless_buffer) = state.buffers.get_mut(&buffer) else {
            return Err(GfxError::UnknownObject {
                kind: "buffer",
                raw: buffer.as_raw(),
            });
        };
        if headless_buffer.location != GfxMemoryLocation::HostSequentialWrite {
            return Err(GfxError::MapFailed {
                raw: buffer.as_raw(),
                reason: format!("`{}` is not host visible", headless_buffer.name),
            });
        }
        headless_buffer.map_count += 1;
        // boxed slice 的堆内存在 buffer 销毁前不会移动
        Ok(NonNull::new(headless_buffer.data.as_mut_ptr()).unwrap_or(NonNull::dangling()))
    }

    fn unmap_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.lock();
        match state.buffers.get_mut(&buffer) {
            Some(headless_buffer) if headless_buffer.map_count > 0 => headless_buffer.map_count -= 1,
            Some(headless_buffer) => {
                let message = format!("unmap `{}` which is not mapped", headless_buffer.name);
                state.report(message);
            }
            None => state.report(format!("unmap unknown buffer {:?}", buffer)),
        }
    }

    fn flush_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) -> GfxResult<()> {
        let state = self.lock();
        let headless_buffer = state.buffers.get(&buffer).ok_or(GfxError::UnknownObject {
            kind: "buffer",
            raw: buffer.as_raw(),
        })?;
        if size != vk::WHOLE_SIZE && offset + size > headless_buffer.data.len() as vk::DeviceSize {
            return Err(GfxError::InvalidUsage(format!(
                "flush {}..{} out of `{}`",
                offset,
                offset + size,
                headless_buffer.name
            )));
        }
        Ok(())
    }

    fn create_image(&self, desc: &GfxImageDesc) -> GfxResult<GfxImage> {
        let mut state = self.lock();
        if state.failing_allocations.contains(&desc.name) {
            return Err(GfxError::AllocationFailed {
                name: desc.name.clone(),
                reason: "injected failure".to_string(),
            });
        }
        let texel_size = format_texel_size(desc.format).ok_or_else(|| GfxError::AllocationFailed {
            name: desc.name.clone(),
            reason: format!("format {:?} is not supported by the headless device", desc.format),
        })?;
        let texels = desc.extent.width as usize * desc.extent.height as usize * desc.extent.depth.max(1) as usize;

        let handle: vk::Image = self.next_handle();
        state.images.insert(
            handle,
            HeadlessImage {
                name: desc.name.clone(),
                extent: desc.extent,
                texel_size,
                data: vec![0; texels * texel_size as usize].into_boxed_slice(),
                layout: vk::ImageLayout::UNDEFINED,
            },
        );
        Ok(GfxImage {
            handle,
            extent: desc.extent,
            format: desc.format,
            usage: desc.usage,
        })
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = self.lock();
        if state.images.remove(&image).is_none() {
            state.report(format!("destroy unknown image {:?}", image));
        }
    }

    fn create_semaphore(&self, kind: GfxSemaphoreKind, _debug_name: &str) -> GfxResult<vk::Semaphore> {
        let handle: vk::Semaphore = self.next_handle();
        let semaphore = match kind {
            GfxSemaphoreKind::Binary => HeadlessSemaphore::Binary {
                signaled: false,
                pending_signal: false,
                pending_wait: false,
            },
            GfxSemaphoreKind::Timeline { initial_value } => HeadlessSemaphore::Timeline {
                value: initial_value,
                pending_value: initial_value,
            },
        };
        self.lock().semaphores.insert(handle, semaphore);
        Ok(handle)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.lock();
        match state.semaphores.remove(&semaphore) {
            Some(HeadlessSemaphore::Binary {
                pending_signal: true, ..
            })
            | Some(HeadlessSemaphore::Binary { pending_wait: true, .. }) => {
                state.report(format!("semaphore {:?} destroyed while in use by a submission", semaphore));
            }
            Some(HeadlessSemaphore::Timeline { value, pending_value }) if pending_value > value => {
                state.report(format!("timeline semaphore {:?} destroyed with pending signals", semaphore));
            }
            Some(_) => {}
            None => state.report(format!("destroy unknown semaphore {:?}", semaphore)),
        }
    }

    fn semaphore_value(&self, semaphore: vk::Semaphore) -> GfxResult<u64> {
        match self.lock().semaphores.get(&semaphore) {
            Some(HeadlessSemaphore::Timeline { value, .. }) => Ok(*value),
            Some(HeadlessSemaphore::Binary { .. }) => {
                Err(GfxError::InvalidUsage(format!("query counter value of binary semaphore {:?}", semaphore)))
            }
            None => Err(GfxError::UnknownObject {
                kind: "semaphore",
                raw: semaphore.as_raw(),
            }),
        }
    }

    fn create_fence(&self, signaled: bool, _debug_name: &str) -> GfxResult<vk::Fence> {
        let handle: vk::Fence = self.next_handle();
        self.lock().fences.insert(
            handle,
            HeadlessFence {
                signaled,
                pending: false,
            },
        );
        Ok(handle)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.lock();
        match state.fences.remove(&fence) {
            Some(HeadlessFence { pending: true, .. }) => {
                state.report(format!("fence {:?} destroyed while in use by a submission", fence));
            }
            Some(_) => {}
            None => state.report(format!("destroy unknown fence {:?}", fence)),
        }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> GfxResult<bool> {
        self.lock().fences.get(&fence).map(|fence| fence.signaled).ok_or(GfxError::UnknownObject {
            kind: "fence",
            raw: fence.as_raw(),
        })
    }

    fn wait_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> GfxResult<bool> {
        {
            let mut state = self.lock();
            for fence in fences {
                match state.fences.get(fence) {
                    None => {
                        return Err(GfxError::UnknownObject {
                            kind: "fence",
                            raw: fence.as_raw(),
                        });
                    }
                    Some(HeadlessFence {
                        signaled: false,
                        pending: false,
                    }) => {
                        return Err(Self::invalid(
                            &mut state,
                            format!("wait on fence {:?} which was never submitted", fence),
                        ));
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(self.wait_until(timeout_ns, |state| {
            fences.iter().all(|fence| state.fences.get(fence).is_none_or(|fence| fence.signaled))
        }))
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> GfxResult<()> {
        let mut state = self.lock();
        for fence in fences {
            match state.fences.get_mut(fence) {
                Some(HeadlessFence { pending: true, .. }) => {
                    return Err(Self::invalid(&mut state, format!("reset fence {:?} while pending", fence)));
                }
                Some(headless_fence) => headless_fence.signaled = false,
                None => {
                    return Err(GfxError::UnknownObject {
                        kind: "fence",
                        raw: fence.as_raw(),
                    });
                }
            }
        }
        Ok(())
    }

    fn create_command_pool(
        &self,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
        _debug_name: &str,
    ) -> GfxResult<vk::CommandPool> {
        if !self.queue_families.iter().any(|family| family.queue_family_index == queue_family_index) {
            return Err(GfxError::InvalidUsage(format!("queue family {} does not exist", queue_family_index)));
        }
        let handle: vk::CommandPool = self.next_handle();
        self.lock().pools.insert(
            handle,
            HeadlessPool {
                family_index: queue_family_index,
                flags,
                command_buffers: vec![],
            },
        );
        Ok(handle)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.lock();
        let Some(removed) = state.pools.remove(&pool) else {
            state.report(format!("destroy unknown command pool {:?}", pool));
            return;
        };
        for cmd in removed.command_buffers {
            if let Some(command_buffer) = state.command_buffers.remove(&cmd) {
                if command_buffer.state == CommandBufferState::Pending {
                    state.report(format!("command buffer `{}` destroyed while pending", command_buffer.name));
                }
            }
        }
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> GfxResult<()> {
        let mut state = self.lock();
        let command_buffers = match state.pools.get(&pool) {
            Some(pool) => pool.command_buffers.clone(),
            None => {
                return Err(GfxError::UnknownObject {
                    kind: "command pool",
                    raw: pool.as_raw(),
                });
            }
        };
        let pending = command_buffers
            .iter()
            .filter_map(|cmd| state.command_buffers.get(cmd))
            .find(|command_buffer| command_buffer.state == CommandBufferState::Pending)
            .map(|command_buffer| command_buffer.name.clone());
        if let Some(name) = pending {
            return Err(Self::invalid(&mut state, format!("reset pool while `{}` is pending", name)));
        }
        for cmd in &command_buffers {
            if let Some(command_buffer) = state.command_buffers.get_mut(cmd) {
                command_buffer.state = CommandBufferState::Initial;
                command_buffer.commands.clear();
            }
        }
        Ok(())
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool, debug_name: &str) -> GfxResult<vk::CommandBuffer> {
        let handle: vk::CommandBuffer = self.next_handle();
        let mut state = self.lock();
        let Some(headless_pool) = state.pools.get_mut(&pool) else {
            return Err(GfxError::UnknownObject {
                kind: "command pool",
                raw: pool.as_raw(),
            });
        };
        headless_pool.command_buffers.push(handle);
        state.command_buffers.insert(
            handle,
            HeadlessCommandBuffer {
                pool,
                name: debug_name.to_string(),
                state: CommandBufferState::Initial,
                one_time: false,
                commands: vec![],
            },
        );
        Ok(handle)
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        let mut state = self.lock();
        if let Some(headless_pool) = state.pools.get_mut(&pool) {
            headless_pool.command_buffers.retain(|cmd| *cmd != command_buffer);
        }
        match state.command_buffers.remove(&command_buffer) {
            Some(removed) if removed.state == CommandBufferState::Pending => {
                state.report(format!("command buffer `{}` freed while pending", removed.name));
            }
            Some(_) => {}
            None => state.report(format!("free unknown command buffer {:?}", command_buffer)),
        }
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    ) -> GfxResult<()> {
        let mut state = self.lock();
        let (pool, cmd_state, name) = match state.command_buffers.get(&command_buffer) {
            Some(cmd) => (cmd.pool, cmd.state, cmd.name.clone()),
            None => {
                return Err(GfxError::UnknownObject {
                    kind: "command buffer",
                    raw: command_buffer.as_raw(),
                });
            }
        };
        let resettable = state
            .pools
            .get(&pool)
            .is_some_and(|pool| pool.flags.contains(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER));

        match cmd_state {
            CommandBufferState::Pending => {
                return Err(Self::invalid(&mut state, format!("begin `{}` while it is pending", name)));
            }
            CommandBufferState::Recording => {
                return Err(Self::invalid(&mut state, format!("begin `{}` while it is recording", name)));
            }
            CommandBufferState::Executable | CommandBufferState::Invalid if !resettable => {
                return Err(Self::invalid(
                    &mut state,
                    format!("implicit reset of `{}` from a pool without RESET_COMMAND_BUFFER", name),
                ));
            }
            _ => {}
        }

        if let Some(cmd) = state.command_buffers.get_mut(&command_buffer) {
            cmd.state = CommandBufferState::Recording;
            cmd.one_time = usage.contains(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            cmd.commands.clear();
        }
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GfxResult<()> {
        let mut state = self.lock();
        match state.command_buffers.get_mut(&command_buffer) {
            Some(cmd) if cmd.state == CommandBufferState::Recording => {
                cmd.state = CommandBufferState::Executable;
                Ok(())
            }
            Some(cmd) => {
                let message = format!("end `{}` while it is {:?}", cmd.name, cmd.state);
                Err(Self::invalid(&mut state, message))
            }
            None => Err(GfxError::UnknownObject {
                kind: "command buffer",
                raw: command_buffer.as_raw(),
            }),
        }
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GfxResult<()> {
        let mut state = self.lock();
        let Some(cmd) = state.command_buffers.get(&command_buffer) else {
            return Err(GfxError::UnknownObject {
                kind: "command buffer",
                raw: command_buffer.as_raw(),
            });
        };
        let (pool, cmd_state, name) = (cmd.pool, cmd.state, cmd.name.clone());
        let resettable = state
            .pools
            .get(&pool)
            .is_some_and(|pool| pool.flags.contains(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER));
        if !resettable {
            return Err(Self::invalid(&mut state, format!("reset `{}` from a pool without RESET_COMMAND_BUFFER", name)));
        }
        if cmd_state == CommandBufferState::Pending {
            return Err(Self::invalid(&mut state, format!("reset `{}` while it is pending", name)));
        }
        if let Some(cmd) = state.command_buffers.get_mut(&command_buffer) {
            cmd.state = CommandBufferState::Initial;
            cmd.commands.clear();
        }
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.record(
            command_buffer,
            HeadlessCommand::CopyBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.record(
            command_buffer,
            HeadlessCommand::CopyBufferToImage {
                src,
                dst,
                dst_layout,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        image_barriers: &[GfxImageBarrier],
        buffer_barriers: &[GfxBufferBarrier],
    ) {
        self.record(
            command_buffer,
            HeadlessCommand::Barrier {
                image_barriers: image_barriers.to_vec(),
                _buffer_barriers: buffer_barriers.to_vec(),
            },
        );
    }

    fn queue_submit(&self, queue: &GfxQueue, batches: &[GfxSubmitInfo], fence: Option<vk::Fence>) -> GfxResult<()> {
        let family_index = queue.family_index();
        let queue_index = queue.queue_index();
        let mut state = self.lock();

        if !state.acquired_queues.contains(&(family_index, queue_index)) {
            let message = format!("submit to queue {}-{} which is not acquired", family_index, queue_index);
            return Err(Self::invalid(&mut state, message));
        }

        if let Some(fence) = fence {
            match state.fences.get(&fence) {
                Some(HeadlessFence {
                    signaled: false,
                    pending: false,
                }) => {}
                Some(_) => {
                    return Err(Self::invalid(
                        &mut state,
                        format!("submit with fence {:?} which is signaled or pending", fence),
                    ));
                }
                None => {
                    return Err(GfxError::UnknownObject {
                        kind: "fence",
                        raw: fence.as_raw(),
                    });
                }
            }
        }

        for batch in batches {
            for cmd in &batch.command_buffers {
                let message = match state.command_buffers.get(cmd) {
                    Some(command_buffer) if command_buffer.state != CommandBufferState::Executable => {
                        Some(format!("submit `{}` while it is {:?}", command_buffer.name, command_buffer.state))
                    }
                    Some(command_buffer) => match state.pools.get(&command_buffer.pool) {
                        Some(pool) if pool.family_index != family_index => Some(format!(
                            "submit `{}` allocated for family {} to family {}",
                            command_buffer.name, pool.family_index, family_index
                        )),
                        _ => None,
                    },
                    None => Some(format!("submit unknown command buffer {:?}", cmd)),
                };
                if let Some(message) = message {
                    return Err(Self::invalid(&mut state, message));
                }
            }
            if let Err(message) = Self::validate_batch(&mut state, batch) {
                return Err(Self::invalid(&mut state, message));
            }
        }

        // 没有批次但有 fence 时，也需要一个空的批次来 signal fence
        let mut items = batches
            .iter()
            .map(|batch| QueueItem {
                command_buffers: batch.command_buffers.clone(),
                waits: batch.wait_infos.clone(),
                signals: batch.signal_infos.clone(),
                fence: None,
            })
            .collect::<Vec<_>>();
        if items.is_empty() && fence.is_some() {
            items.push(QueueItem {
                command_buffers: vec![],
                waits: vec![],
                signals: vec![],
                fence: None,
            });
        }
        if let Some(last) = items.last_mut() {
            last.fence = fence;
        }

        if let Some(fence) = fence.and_then(|fence| state.fences.get_mut(&fence)) {
            fence.pending = true;
        }
        for item in items {
            for cmd in &item.command_buffers {
                if let Some(command_buffer) = state.command_buffers.get_mut(cmd) {
                    command_buffer.state = CommandBufferState::Pending;
                }
            }
            state.submission_log(family_index, queue_index, &item);
            state.queues.entry((family_index, queue_index)).or_default().push_back(item);
        }

        let progressed = state.pump();
        drop(state);
        if progressed {
            self.progress.notify_all();
        }
        Ok(())
    }

    fn queue_wait_idle(&self, queue: &GfxQueue) -> GfxResult<()> {
        let key = (queue.family_index(), queue.queue_index());
        self.wait_until(u64::MAX, |state| state.queues.get(&key).is_none_or(|items| items.is_empty()));
        Ok(())
    }

    fn destroy_pipeline(&self, _pipeline: vk::Pipeline, _layout: vk::PipelineLayout) {
        self.lock().destroyed_pipelines += 1;
    }

    fn wait_idle(&self) -> GfxResult<()> {
        self.wait_until(u64::MAX, |state| !state.has_pending_work());
        Ok(())
    }
}
