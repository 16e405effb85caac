use std::sync::Arc;

use ash::vk;
use truvis_gfx::{GfxDevice, GfxResult, device::GfxBuffer};

use crate::transfer_signal::TransferSignal;

/// 已经提交、等待 GPU 完成的上传
pub(crate) struct InFlightUpload {
    pub id: u64,
    pub name: String,
    pub staging: GfxBuffer,
    pub signal: Arc<TransferSignal>,
}

/// 一次上传使用的 command pool、command buffer 和 fence
///
/// 每个 context 同时只服务一个上传，fence signal 之后才能复用
pub(crate) struct UploadContext {
    pub pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
    pub in_flight: Option<InFlightUpload>,
}

impl UploadContext {
    fn new(device: &dyn GfxDevice, family_index: u32, debug_name: &str) -> GfxResult<Self> {
        let pool =
            device.create_command_pool(family_index, vk::CommandPoolCreateFlags::TRANSIENT, debug_name)?;
        let command_buffer = match device.allocate_command_buffer(pool, debug_name) {
            Ok(command_buffer) => command_buffer,
            Err(e) => {
                device.destroy_command_pool(pool);
                return Err(e);
            }
        };
        let fence = match device.create_fence(false, debug_name) {
            Ok(fence) => fence,
            Err(e) => {
                device.free_command_buffer(pool, command_buffer);
                device.destroy_command_pool(pool);
                return Err(e);
            }
        };
        Ok(Self {
            pool,
            command_buffer,
            fence,
            in_flight: None,
        })
    }

    /// 重置 pool 并开始录制
    pub fn begin(&self, device: &dyn GfxDevice) -> GfxResult<()> {
        device.reset_command_pool(self.pool)?;
        device.begin_command_buffer(self.command_buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
    }

    fn destroy(self, device: &dyn GfxDevice) {
        device.free_command_buffer(self.pool, self.command_buffer);
        device.destroy_command_pool(self.pool);
        device.destroy_fence(self.fence);
    }
}

/// 一个 worker 线程拥有的 UploadContext 集合，按需创建，数量有上限
pub(crate) struct UploadContextPool {
    name: String,
    family_index: u32,
    limit: usize,
    contexts: Vec<UploadContext>,
    free: Vec<usize>,
}

// new & init
impl UploadContextPool {
    pub fn new(name: impl Into<String>, family_index: u32, limit: usize) -> Self {
        Self {
            name: name.into(),
            family_index,
            limit,
            contexts: Vec::with_capacity(limit),
            free: Vec::with_capacity(limit),
        }
    }
}

// getters
impl UploadContextPool {
    #[inline]
    pub fn in_flight_count(&self) -> usize {
        self.contexts.iter().filter(|ctx| ctx.in_flight.is_some()).count()
    }

    /// 是否能够立即拿到一个 context
    #[inline]
    pub fn has_capacity(&self) -> bool {
        !self.free.is_empty() || self.contexts.len() < self.limit
    }

    #[inline]
    pub fn get(&self, index: usize) -> &UploadContext {
        &self.contexts[index]
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> &mut UploadContext {
        &mut self.contexts[index]
    }
}

// tools
impl UploadContextPool {
    /// 取出一个空闲的 context，全部在使用中且达到上限时返回 `None`
    pub fn acquire(&mut self, device: &dyn GfxDevice) -> GfxResult<Option<usize>> {
        if let Some(index) = self.free.pop() {
            return Ok(Some(index));
        }
        if self.contexts.len() >= self.limit {
            return Ok(None);
        }

        let index = self.contexts.len();
        let ctx = UploadContext::new(device, self.family_index, &format!("{}-upload-{}", self.name, index))?;
        self.contexts.push(ctx);
        Ok(Some(index))
    }

    /// 归还一个没有提交成功的 context
    pub fn release(&mut self, index: usize) {
        debug_assert!(self.contexts[index].in_flight.is_none());
        self.free.push(index);
    }

    /// 非阻塞地回收 fence 已经 signal 的 context，返回回收的数量
    pub fn reclaim(&mut self, device: &dyn GfxDevice) -> usize {
        let mut reclaimed = 0;
        for index in 0..self.contexts.len() {
            let ctx = &mut self.contexts[index];
            if ctx.in_flight.is_none() {
                continue;
            }
            match device.fence_signaled(ctx.fence) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    log::error!("[{}] failed to query upload fence: {}", self.name, e);
                    continue;
                }
            }

            let Some(upload) = ctx.in_flight.take() else {
                continue;
            };
            device.destroy_buffer(upload.staging.handle);
            if let Err(e) = device.reset_fences(&[ctx.fence]) {
                log::error!("[{}] failed to reset upload fence: {}", self.name, e);
            }
            upload.signal.publish_complete();
            log::debug!("[{}] upload #{} `{}` complete", self.name, upload.id, upload.name);

            self.free.push(index);
            reclaimed += 1;
        }
        reclaimed
    }

    /// 阻塞等待所有在 GPU 上的上传完成，并回收
    pub fn wait_all(&mut self, device: &dyn GfxDevice) {
        let fences = self.contexts.iter().filter(|ctx| ctx.in_flight.is_some()).map(|ctx| ctx.fence).collect::<Vec<_>>();
        if fences.is_empty() {
            return;
        }
        if let Err(e) = device.wait_fences(&fences, u64::MAX) {
            log::error!("[{}] failed to wait upload fences: {}", self.name, e);
        }
        self.reclaim(device);
    }

    /// 需要先调用 [`UploadContextPool::wait_all`]
    pub fn destroy(self, device: &dyn GfxDevice) {
        for ctx in self.contexts {
            if let Some(upload) = &ctx.in_flight {
                log::error!("[{}] destroy upload context while #{} `{}` is in flight", self.name, upload.id, upload.name);
                continue;
            }
            ctx.destroy(device);
        }
    }
}
