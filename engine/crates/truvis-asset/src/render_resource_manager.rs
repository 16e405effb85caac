use std::{sync::Arc, thread};

use ash::vk;
use crossbeam_utils::Backoff;
use truvis_gfx::{
    GfxDevice,
    commands::{queue::GfxQueue, submit_info::GfxSemaphoreSubmit},
    device::{GfxBuffer, GfxImage, GfxSemaphoreKind},
};
use truvis_render_interface::{
    config::{RenderCoreConfig, TransferConfig},
    errors::{ConfigurationError, PreconditionError, RenderResult},
    frame_counter::FrameCounter,
    handles::{Handle, ResourceCategory},
    resource_store::{ResourceStore, StoreRecord},
};

use crate::{
    records::{
        DeferredRecord, DeferredRelease, PendingTransfer, PipelineRecord, ResourceStatus, SemaphoreRecord,
        TransferRecord,
    },
    transfer_request::{GpuResource, TransferRecipe, TransferRequest},
    transfer_worker::{TransferPriority, TransferWorker},
};

/// 当前各个 store 中的记录数量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceStats {
    pub buffers: usize,
    pub textures: usize,
    pub semaphores: usize,
    pub pipelines: usize,
    /// 已经释放 Handle、还没有销毁的记录
    pub deferred: usize,
}

/// 渲染资源的统一入口
///
/// - buffer / texture 通过 [`TransferRequest`] 创建，由后台的 [`TransferWorker`] 上传
/// - semaphore 由 manager 创建，pipeline 由外部创建后注册进来
/// - 所有资源都通过 [`Handle`] 访问；释放后会等到 GPU 不再使用时才真正销毁
///
/// 只能在一个线程（通常是主线程）上使用。
pub struct RenderResourceManager {
    device: Arc<dyn GfxDevice>,
    worker: TransferWorker,
    /// 除 transfer queue 之外，会访问上传资源的 queue family
    consumer_families: Vec<u32>,

    buffers: ResourceStore<TransferRecord>,
    textures: ResourceStore<TransferRecord>,
    semaphores: ResourceStore<SemaphoreRecord>,
    pipelines: ResourceStore<PipelineRecord>,

    deferred: Vec<DeferredRelease>,
    frame_id: u64,
    next_thread: usize,
    transfer_config: TransferConfig,

    destroyed: bool,
}

// new & init
impl RenderResourceManager {
    pub fn new(
        device: Arc<dyn GfxDevice>,
        transfer_queues: Vec<GfxQueue>,
        consumer_families: Vec<u32>,
        config: &RenderCoreConfig,
    ) -> RenderResult<Self> {
        if transfer_queues.is_empty() {
            return Err(ConfigurationError::NoQueueAvailable {
                purpose: "transfer worker".to_string(),
            }
            .into());
        }
        let worker = TransferWorker::new(device.clone(), transfer_queues, &config.transfer)?;
        let caps = &config.capacities;

        Ok(Self {
            device,
            worker,
            consumer_families,
            buffers: ResourceStore::new(ResourceCategory::Buffer, caps.buffers),
            textures: ResourceStore::new(ResourceCategory::Texture, caps.textures),
            semaphores: ResourceStore::new(ResourceCategory::Semaphore, caps.semaphores),
            pipelines: ResourceStore::new(ResourceCategory::Pipeline, caps.pipelines),
            deferred: vec![],
            frame_id: 0,
            next_thread: 0,
            transfer_config: config.transfer.clone(),
            destroyed: false,
        })
    }

    /// 等待所有上传结束，销毁所有资源
    pub fn destroy(mut self) {
        self.destroy_mut();
    }

    fn destroy_mut(&mut self) {
        if self.destroyed {
            return;
        }
        let _span = truvis_crate_tools::profile_span!("RenderResourceManager::destroy");
        self.worker.shutdown();

        let device = &*self.device;
        for mut entry in self.deferred.drain(..) {
            entry.record.cleanup(device);
        }
        self.buffers.cleanup_all(device);
        self.textures.cleanup_all(device);
        self.semaphores.cleanup_all(device);
        self.pipelines.cleanup_all(device);

        self.destroyed = true;
        log::info!("RenderResourceManager destroyed");
    }
}

impl Drop for RenderResourceManager {
    fn drop(&mut self) {
        self.destroy_mut();
    }
}

// getters
impl RenderResourceManager {
    #[inline]
    pub fn device(&self) -> &Arc<dyn GfxDevice> {
        &self.device
    }

    #[inline]
    pub fn transfer_thread_count(&self) -> usize {
        self.worker.thread_count()
    }

    pub fn stats(&self) -> ResourceStats {
        ResourceStats {
            buffers: self.buffers.len(),
            textures: self.textures.len(),
            semaphores: self.semaphores.len(),
            pipelines: self.pipelines.len(),
            deferred: self.deferred.len(),
        }
    }
}

// transfer
impl RenderResourceManager {
    /// 提交一个上传请求，立即返回 Handle
    ///
    /// `prep` 在当前线程执行，失败时直接返回错误，不会分配 Handle
    pub fn add_request(
        &mut self,
        request: impl Into<TransferRequest>,
        priority: TransferPriority,
    ) -> RenderResult<Handle> {
        let mut request = request.into();
        request.prep()?;

        let thread_index = self.next_thread % self.worker.thread_count().max(1);
        let record = TransferRecord::new(request.name(), thread_index, request.planned_resource());
        let store = match request.category() {
            ResourceCategory::Texture => &mut self.textures,
            _ => &mut self.buffers,
        };
        let handle = store.insert(record)?;
        self.next_thread = self.next_thread.wrapping_add(1);
        log::debug!("add {} request `{}` as {}", request.kind_name(), request.name(), handle);

        let (record, worker, families) = self.transfer_record_mut(handle)?;
        record.pending.push_back(PendingTransfer { request, priority });
        record.pump(handle, worker, families);
        Ok(handle)
    }

    /// 用新的数据覆盖已有的资源
    ///
    /// 会在之前的上传结束后再执行；资源在这次更新完成之前不是 ready 状态
    pub fn update_request(
        &mut self,
        handle: Handle,
        request: impl Into<TransferRequest>,
        priority: TransferPriority,
    ) -> RenderResult<()> {
        let mut request = request.into();
        let (record, worker, families) = self.transfer_record_mut(handle)?;
        if request.category() != handle.category() {
            return Err(PreconditionError::RequestKindMismatch {
                handle,
                expected: request.kind_name(),
            }
            .into());
        }
        request.prep()?;

        record.harvest();
        // 第一次上传还在进行中时，按照它将要创建的资源检查
        if let Some(target) = record.update_target() {
            request.check_update(handle, &target)?;
        }
        record.pending.push_back(PendingTransfer { request, priority });
        record.pump(handle, worker, families);
        Ok(())
    }

    /// 非阻塞
    pub fn is_ready(&self, handle: Handle) -> RenderResult<bool> {
        let ready = match handle.category() {
            ResourceCategory::Texture => self.textures.is_ready(handle)?,
            ResourceCategory::Semaphore => self.semaphores.is_ready(handle)?,
            ResourceCategory::Pipeline => self.pipelines.is_ready(handle)?,
            _ => self.buffers.is_ready(handle)?,
        };
        Ok(ready)
    }

    pub fn status(&self, handle: Handle) -> RenderResult<ResourceStatus> {
        Ok(self.transfer_record(handle)?.status())
    }

    /// 阻塞直到资源 ready，上传失败时返回失败的原因
    ///
    /// 先自旋一小段时间，之后挂起线程等待 worker 通知
    pub fn wait_for_ready(&mut self, handle: Handle) -> RenderResult<()> {
        let _span = truvis_crate_tools::profile_span!("RenderResourceManager::wait_for_ready");
        let spin_limit = self.transfer_config.wait_spin_limit;
        let idle_backoff = self.transfer_config.idle_backoff();

        loop {
            let (record, worker, families) = self.transfer_record_mut(handle)?;
            record.pump(handle, worker, families);
            if record.is_ready() {
                return Ok(());
            }
            if let Some(error) = record.settled_failure() {
                return Err(error.clone().into());
            }

            let Some(signal) = record.current.clone() else {
                if record.pending.is_empty() {
                    return Err(PreconditionError::NotReady { handle }.into());
                }
                // worker 的队列已满，稍后再发送
                thread::sleep(idle_backoff);
                continue;
            };

            let backoff = Backoff::new();
            let mut spins = 0;
            while !signal.is_terminal() && spins < spin_limit {
                backoff.snooze();
                spins += 1;
            }
            if !signal.is_terminal() {
                signal.wait();
            }
        }
    }

    pub fn get_buffer(&self, handle: Handle) -> RenderResult<GfxBuffer> {
        match self.buffers.get(handle)?.ready_resource() {
            Some(GpuResource::Buffer(buffer)) => Ok(buffer),
            _ => Err(PreconditionError::NotReady { handle }.into()),
        }
    }

    pub fn get_texture(&self, handle: Handle) -> RenderResult<GfxImage> {
        match self.textures.get(handle)?.ready_resource() {
            Some(GpuResource::Image(image)) => Ok(image),
            _ => Err(PreconditionError::NotReady { handle }.into()),
        }
    }

    /// 使用资源的 submit 需要等待的 timeline semaphore
    ///
    /// 在资源 ready 之前就可以拿到，用于 GPU 侧的等待，而不需要 CPU 阻塞
    pub fn gpu_wait(&self, handle: Handle) -> RenderResult<Option<GfxSemaphoreSubmit>> {
        Ok(self.transfer_record(handle)?.gpu_wait())
    }

    fn transfer_record(&self, handle: Handle) -> RenderResult<&TransferRecord> {
        let record = match handle.category() {
            ResourceCategory::Buffer => self.buffers.get(handle)?,
            ResourceCategory::Texture => self.textures.get(handle)?,
            _ => {
                return Err(ConfigurationError::CategoryMismatch {
                    handle,
                    expected: ResourceCategory::Buffer,
                }
                .into());
            }
        };
        Ok(record)
    }

    fn transfer_record_mut(&mut self, handle: Handle) -> RenderResult<(&mut TransferRecord, &TransferWorker, &[u32])> {
        let Self {
            buffers,
            textures,
            worker,
            consumer_families,
            ..
        } = self;
        let store = match handle.category() {
            ResourceCategory::Buffer => buffers,
            ResourceCategory::Texture => textures,
            _ => {
                return Err(ConfigurationError::CategoryMismatch {
                    handle,
                    expected: ResourceCategory::Buffer,
                }
                .into());
            }
        };
        let worker: &TransferWorker = worker;
        let consumer_families: &[u32] = consumer_families;
        Ok((store.get_mut(handle)?, worker, consumer_families))
    }
}

// sync objects & pipelines
impl RenderResourceManager {
    pub fn create_semaphore(&mut self, kind: GfxSemaphoreKind, name: impl Into<String>) -> RenderResult<Handle> {
        let name = name.into();
        let semaphore = self.device.create_semaphore(kind, &name)?;
        let record = SemaphoreRecord { name, semaphore, kind };
        match self.semaphores.insert(record) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.device.destroy_semaphore(semaphore);
                Err(e.into())
            }
        }
    }

    pub fn get_semaphore(&self, handle: Handle) -> RenderResult<vk::Semaphore> {
        Ok(self.semaphores.get(handle)?.semaphore)
    }

    /// 注册一个外部创建的 pipeline，之后由 manager 负责销毁
    pub fn register_pipeline(
        &mut self,
        name: impl Into<String>,
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
    ) -> RenderResult<Handle> {
        let record = PipelineRecord {
            name: name.into(),
            pipeline,
            layout,
        };
        Ok(self.pipelines.insert(record)?)
    }

    pub fn get_pipeline(&self, handle: Handle) -> RenderResult<(vk::Pipeline, vk::PipelineLayout)> {
        let record = self.pipelines.get(handle)?;
        Ok((record.pipeline, record.layout))
    }
}

// lifetime
impl RenderResourceManager {
    /// 释放 Handle
    ///
    /// Handle 立即失效；GPU 对象在上传结束、并且当前帧的 GPU 工作都完成之后才销毁
    pub fn release(&mut self, handle: Handle) -> RenderResult<()> {
        let record = match handle.category() {
            ResourceCategory::Buffer => DeferredRecord::Transfer(self.buffers.take(handle)?),
            ResourceCategory::Texture => DeferredRecord::Transfer(self.textures.take(handle)?),
            ResourceCategory::Semaphore => DeferredRecord::Semaphore(self.semaphores.take(handle)?),
            ResourceCategory::Pipeline => DeferredRecord::Pipeline(self.pipelines.take(handle)?),
            ResourceCategory::CommandBuffer => {
                return Err(ConfigurationError::CategoryMismatch {
                    handle,
                    expected: ResourceCategory::Buffer,
                }
                .into());
            }
        };
        self.deferred.push(DeferredRelease {
            handle,
            released_at: self.frame_id,
            record,
        });
        Ok(())
    }

    /// 每帧调用一次：发送排队的请求，销毁可以销毁的记录
    pub fn update(&mut self, frame_counter: &FrameCounter) {
        let _span = truvis_crate_tools::profile_span!("RenderResourceManager::update");
        self.frame_id = frame_counter.frame_id();

        for (handle, record) in self.buffers.iter_mut().chain(self.textures.iter_mut()) {
            record.pump(handle, &self.worker, &self.consumer_families);
        }

        let device = &*self.device;
        self.deferred.retain_mut(|entry| {
            if !frame_counter.is_retired(entry.released_at) || !entry.record.is_settled() {
                return true;
            }
            log::debug!("{} destroy released {}", frame_counter.frame_name(), entry.handle);
            entry.record.cleanup(device);
            false
        });
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use truvis_gfx::headless::HeadlessDevice;
    use truvis_render_interface::errors::{RenderCoreError, ResourceCreationError};

    use super::*;
    use crate::transfer_request::{BufferUpload, TextureUpload};

    const TRANSFER_FAMILY: u32 = 2;

    fn manager_with(device: &Arc<HeadlessDevice>, config: RenderCoreConfig) -> RenderResourceManager {
        let queue = device.acquire_queue(TRANSFER_FAMILY, 0).unwrap();
        RenderResourceManager::new(device.clone(), vec![queue], vec![0], &config).unwrap()
    }

    fn manager(device: &Arc<HeadlessDevice>) -> RenderResourceManager {
        manager_with(device, RenderCoreConfig::default())
    }

    fn vertex_upload(name: &str, data: &[f32]) -> BufferUpload {
        BufferUpload::from_slice(name, data, vk::BufferUsageFlags::VERTEX_BUFFER)
    }

    #[test]
    fn test_buffer_upload_round_trip() {
        truvis_crate_tools::init_log::init_test_log();
        let device = Arc::new(HeadlessDevice::new());
        let mut rm = manager(&device);

        let data = [1.0f32, 2.0, 3.0, 4.0];
        let handle = rm.add_request(vertex_upload("triangle", &data), TransferPriority::Standard).unwrap();
        rm.wait_for_ready(handle).unwrap();

        assert!(rm.is_ready(handle).unwrap());
        assert_eq!(rm.status(handle).unwrap(), ResourceStatus::Ready);
        let buffer = rm.get_buffer(handle).unwrap();
        assert_eq!(buffer.size, 16);
        assert!(buffer.usage.contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert_eq!(device.read_buffer(buffer.handle).unwrap(), bytemuck::cast_slice::<f32, u8>(&data));

        let wait = rm.gpu_wait(handle).unwrap().unwrap();
        assert_eq!(wait.value, Some(1));

        rm.destroy();
        assert_eq!(device.live_objects().buffers, 0);
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn test_not_ready_while_transfer_queue_is_paused() {
        let device = Arc::new(HeadlessDevice::new());
        device.pause_family(TRANSFER_FAMILY);
        let mut rm = manager(&device);

        let handle = rm.add_request(vertex_upload("slow", &[0.5; 8]), TransferPriority::High).unwrap();
        assert!(!rm.is_ready(handle).unwrap());
        assert!(matches!(
            rm.get_buffer(handle),
            Err(RenderCoreError::Precondition(PreconditionError::NotReady { .. }))
        ));
        assert_ne!(rm.status(handle).unwrap(), ResourceStatus::Ready);

        device.resume_family(TRANSFER_FAMILY);
        rm.wait_for_ready(handle).unwrap();
        assert!(rm.get_buffer(handle).is_ok());
    }

    #[test]
    fn test_png_texture_upload() {
        let device = Arc::new(HeadlessDevice::new());
        let mut rm = manager(&device);

        let pixels = (0..4 * 4 * 4).map(|i| (i * 3) as u8).collect::<Vec<_>>();
        let rgba = image::RgbaImage::from_raw(4, 4, pixels.clone()).unwrap();
        let mut png = vec![];
        rgba.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png).unwrap();

        let handle = rm
            .add_request(TextureUpload::encoded("checker", png, vk::ImageUsageFlags::SAMPLED), TransferPriority::Standard)
            .unwrap();
        assert_eq!(handle.category(), ResourceCategory::Texture);
        rm.wait_for_ready(handle).unwrap();

        let texture = rm.get_texture(handle).unwrap();
        assert_eq!((texture.extent.width, texture.extent.height), (4, 4));
        assert_eq!(texture.format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(device.read_image(texture.handle).unwrap(), pixels);
        assert_eq!(device.image_layout(texture.handle), Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL));
        // 类别不匹配
        assert!(rm.get_buffer(handle).is_err());
    }

    #[test]
    fn test_prep_failure_allocates_no_handle() {
        let device = Arc::new(HeadlessDevice::new());
        let mut rm = manager(&device);

        let result = rm.add_request(
            TextureUpload::encoded("garbage", vec![0xde, 0xad], vk::ImageUsageFlags::SAMPLED),
            TransferPriority::Standard,
        );
        assert!(matches!(result, Err(RenderCoreError::ResourceCreation(ResourceCreationError::Prep { .. }))));
        assert_eq!(rm.stats().textures, 0);
    }

    #[test]
    fn test_allocation_failure_marks_record_failed() {
        let device = Arc::new(HeadlessDevice::new());
        device.fail_allocation_named("broken");
        let mut rm = manager(&device);

        let broken = rm.add_request(vertex_upload("broken", &[1.0; 4]), TransferPriority::Standard).unwrap();
        let fine = rm.add_request(vertex_upload("fine", &[2.0; 4]), TransferPriority::Standard).unwrap();

        assert!(matches!(
            rm.wait_for_ready(broken),
            Err(RenderCoreError::ResourceCreation(ResourceCreationError::Gpu { .. }))
        ));
        assert_eq!(rm.status(broken).unwrap(), ResourceStatus::Failed);
        assert!(!rm.is_ready(broken).unwrap());

        // 其他请求不受影响
        rm.wait_for_ready(fine).unwrap();

        // 失败的记录可以通过 update 重试
        device.clear_allocation_failures();
        rm.update_request(broken, vertex_upload("broken", &[3.0; 4]), TransferPriority::High).unwrap();
        rm.wait_for_ready(broken).unwrap();
        assert_eq!(rm.get_buffer(broken).unwrap().size, 16);
    }

    #[test]
    fn test_updates_apply_in_order() {
        let device = Arc::new(HeadlessDevice::new());
        device.pause_family(TRANSFER_FAMILY);
        let mut rm = manager(&device);

        let handle = rm.add_request(vertex_upload("dynamic", &[1.0; 4]), TransferPriority::Standard).unwrap();
        rm.update_request(handle, vertex_upload("dynamic", &[2.0; 4]), TransferPriority::High).unwrap();
        rm.update_request(handle, vertex_upload("dynamic", &[3.0; 2]), TransferPriority::Standard).unwrap();
        assert!(matches!(rm.status(handle).unwrap(), ResourceStatus::Queued | ResourceStatus::Uploading));

        device.resume_family(TRANSFER_FAMILY);
        rm.wait_for_ready(handle).unwrap();

        let buffer = rm.get_buffer(handle).unwrap();
        let mut expected = bytemuck::cast_slice::<f32, u8>(&[3.0f32; 2]).to_vec();
        expected.extend_from_slice(bytemuck::cast_slice::<f32, u8>(&[2.0f32; 2]));
        assert_eq!(device.read_buffer(buffer.handle).unwrap(), expected);
        // 三次上传写入同一个 buffer
        assert_eq!(rm.gpu_wait(handle).unwrap().unwrap().value, Some(3));
        assert_eq!(device.live_objects().buffers, 1);
    }

    #[test]
    fn test_update_checks() {
        let device = Arc::new(HeadlessDevice::new());
        let mut rm = manager(&device);

        let handle = rm.add_request(vertex_upload("small", &[1.0; 2]), TransferPriority::Standard).unwrap();
        rm.wait_for_ready(handle).unwrap();

        assert!(matches!(
            rm.update_request(handle, vertex_upload("small", &[1.0; 3]), TransferPriority::Standard),
            Err(RenderCoreError::Precondition(PreconditionError::UpdateTooLarge { size: 12, capacity: 8, .. }))
        ));
        let texture = TextureUpload::raw(
            "small",
            vk::Extent2D { width: 1, height: 1 },
            vk::Format::R8G8B8A8_UNORM,
            vec![0; 4],
            vk::ImageUsageFlags::SAMPLED,
        );
        assert!(matches!(
            rm.update_request(handle, texture, TransferPriority::Standard),
            Err(RenderCoreError::Precondition(PreconditionError::RequestKindMismatch { .. }))
        ));
        // 失败的更新不影响已有的数据
        assert!(rm.is_ready(handle).unwrap());
    }

    #[test]
    fn test_update_checked_against_upload_in_flight() {
        let device = Arc::new(HeadlessDevice::new());
        device.pause_family(TRANSFER_FAMILY);
        let mut rm = manager(&device);

        let handle = rm.add_request(vertex_upload("growing", &[1.0; 2]), TransferPriority::Standard).unwrap();
        assert!(matches!(
            rm.update_request(handle, vertex_upload("growing", &[2.0; 4]), TransferPriority::Standard),
            Err(RenderCoreError::Precondition(PreconditionError::UpdateTooLarge { size: 16, capacity: 8, .. }))
        ));
        rm.update_request(handle, vertex_upload("growing", &[3.0; 2]), TransferPriority::Standard).unwrap();

        device.resume_family(TRANSFER_FAMILY);
        rm.wait_for_ready(handle).unwrap();
        let buffer = rm.get_buffer(handle).unwrap();
        assert_eq!(buffer.size, 8);
        assert_eq!(device.read_buffer(buffer.handle).unwrap(), bytemuck::cast_slice::<f32, u8>(&[3.0f32; 2]));
    }

    #[test]
    fn test_texture_update_checked_against_upload_in_flight() {
        let device = Arc::new(HeadlessDevice::new());
        device.pause_family(TRANSFER_FAMILY);
        let mut rm = manager(&device);

        let texture = |width: u32| {
            TextureUpload::raw(
                "tile",
                vk::Extent2D { width, height: 1 },
                vk::Format::R8G8B8A8_UNORM,
                vec![0x7f; width as usize * 4],
                vk::ImageUsageFlags::SAMPLED,
            )
        };
        let handle = rm.add_request(texture(2), TransferPriority::Standard).unwrap();
        assert!(matches!(
            rm.update_request(handle, texture(4), TransferPriority::Standard),
            Err(RenderCoreError::Precondition(PreconditionError::UpdateTooLarge { .. }))
        ));

        device.resume_family(TRANSFER_FAMILY);
        rm.wait_for_ready(handle).unwrap();
        assert_eq!(rm.get_texture(handle).unwrap().extent.width, 2);
    }

    #[test]
    fn test_update_rejected_at_dispatch_marks_failed() {
        let device = Arc::new(HeadlessDevice::new());
        let mut rm = manager(&device);

        let handle = rm.add_request(vertex_upload("fixed", &[1.0; 2]), TransferPriority::Standard).unwrap();
        rm.wait_for_ready(handle).unwrap();

        // 绕过 update_request 的检查，直接排队一个不匹配的更新
        {
            let (record, worker, families) = rm.transfer_record_mut(handle).unwrap();
            record.pending.push_back(PendingTransfer {
                request: vertex_upload("fixed", &[2.0; 8]).into(),
                priority: TransferPriority::Standard,
            });
            record.pump(handle, worker, families);
        }
        assert_eq!(rm.status(handle).unwrap(), ResourceStatus::Failed);
        assert!(!rm.is_ready(handle).unwrap());
        assert!(matches!(
            rm.wait_for_ready(handle),
            Err(RenderCoreError::ResourceCreation(ResourceCreationError::UpdateRejected { .. }))
        ));

        // 之后正确的更新可以恢复
        rm.update_request(handle, vertex_upload("fixed", &[4.0; 2]), TransferPriority::Standard).unwrap();
        rm.wait_for_ready(handle).unwrap();
        let buffer = rm.get_buffer(handle).unwrap();
        assert_eq!(device.read_buffer(buffer.handle).unwrap(), bytemuck::cast_slice::<f32, u8>(&[4.0f32; 2]));
    }

    #[test]
    fn test_ready_by_polling_update() {
        let device = Arc::new(HeadlessDevice::new());
        device.pause_family(TRANSFER_FAMILY);
        let mut config = RenderCoreConfig::default();
        config.transfer.queue_capacity = 1;
        config.transfer.contexts_per_thread = 1;
        let mut rm = manager_with(&device, config);
        let mut frames = FrameCounter::new(0, 2).unwrap();

        let handles = (0..3)
            .map(|i| rm.add_request(vertex_upload(&format!("polled-{}", i), &[i as f32; 4]), TransferPriority::Standard))
            .collect::<RenderResult<Vec<_>>>()
            .unwrap();
        rm.update(&frames);
        assert!(handles.iter().all(|handle| !rm.is_ready(*handle).unwrap()));

        device.resume_family(TRANSFER_FAMILY);
        // 只通过每帧的 update 推进，不调用 wait_for_ready
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !handles.iter().all(|handle| rm.is_ready(*handle).unwrap()) {
            assert!(std::time::Instant::now() < deadline, "uploads did not finish by polling");
            thread::sleep(std::time::Duration::from_millis(1));
            frames.next_frame();
            rm.update(&frames);
        }
        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(rm.status(*handle).unwrap(), ResourceStatus::Ready);
            let buffer = rm.get_buffer(*handle).unwrap();
            assert_eq!(device.read_buffer(buffer.handle).unwrap(), bytemuck::cast_slice::<f32, u8>(&[i as f32; 4]));
        }
    }

    #[test]
    fn test_release_is_deferred_until_frame_retired() {
        let device = Arc::new(HeadlessDevice::new());
        let mut rm = manager(&device);
        let mut frames = FrameCounter::new(0, 2).unwrap();

        let handle = rm.add_request(vertex_upload("transient", &[1.0; 4]), TransferPriority::Standard).unwrap();
        rm.wait_for_ready(handle).unwrap();
        rm.update(&frames);
        rm.release(handle).unwrap();

        // handle 立即失效
        assert!(matches!(
            rm.is_ready(handle),
            Err(RenderCoreError::Configuration(ConfigurationError::HandleNotFound { .. }))
        ));
        assert_eq!(rm.stats().deferred, 1);
        assert!(rm.release(handle).is_err());

        frames.next_frame();
        rm.update(&frames);
        assert_eq!(device.live_objects().buffers, 1);

        frames.next_frame();
        rm.update(&frames);
        assert_eq!(device.live_objects().buffers, 0);
        assert_eq!(rm.stats().deferred, 0);

        // slot 复用后旧的 handle 仍然无效
        let reused = rm.add_request(vertex_upload("reused", &[1.0; 4]), TransferPriority::Standard).unwrap();
        assert_ne!(reused, handle);
        assert!(rm.get_buffer(handle).is_err());
    }

    #[test]
    fn test_release_while_uploading() {
        let device = Arc::new(HeadlessDevice::new());
        device.pause_family(TRANSFER_FAMILY);
        let mut rm = manager(&device);
        let mut frames = FrameCounter::new(0, 1).unwrap();

        let handle = rm.add_request(vertex_upload("abandoned", &[1.0; 4]), TransferPriority::Standard).unwrap();
        rm.release(handle).unwrap();
        for _ in 0..3 {
            frames.next_frame();
            rm.update(&frames);
        }
        // 上传还没有结束，不能销毁
        assert_eq!(rm.stats().deferred, 1);

        device.resume_family(TRANSFER_FAMILY);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while rm.stats().deferred > 0 {
            assert!(std::time::Instant::now() < deadline);
            thread::sleep(std::time::Duration::from_millis(1));
            rm.update(&frames);
        }
        assert_eq!(device.live_objects().buffers, 0);
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn test_capacity_exceeded() {
        let device = Arc::new(HeadlessDevice::new());
        let mut config = RenderCoreConfig::default();
        config.capacities.buffers = 1;
        let mut rm = manager_with(&device, config);

        rm.add_request(vertex_upload("a", &[1.0]), TransferPriority::Standard).unwrap();
        assert!(matches!(
            rm.add_request(vertex_upload("b", &[1.0]), TransferPriority::Standard),
            Err(RenderCoreError::Configuration(ConfigurationError::CapacityExceeded { .. }))
        ));
    }

    #[test]
    fn test_backpressure_keeps_request_pending() {
        let device = Arc::new(HeadlessDevice::new());
        device.pause_family(TRANSFER_FAMILY);
        let mut config = RenderCoreConfig::default();
        config.transfer.queue_capacity = 1;
        config.transfer.contexts_per_thread = 1;
        let mut rm = manager_with(&device, config);

        let handles = (0..4)
            .map(|i| rm.add_request(vertex_upload(&format!("mesh-{}", i), &[i as f32; 4]), TransferPriority::Standard))
            .collect::<RenderResult<Vec<_>>>()
            .unwrap();
        assert!(handles.iter().all(|handle| !rm.is_ready(*handle).unwrap()));

        device.resume_family(TRANSFER_FAMILY);
        for handle in &handles {
            rm.wait_for_ready(*handle).unwrap();
        }
        for (i, handle) in handles.iter().enumerate() {
            let buffer = rm.get_buffer(*handle).unwrap();
            assert_eq!(device.read_buffer(buffer.handle).unwrap(), bytemuck::cast_slice::<f32, u8>(&[i as f32; 4]));
        }
    }

    #[test]
    fn test_semaphores_and_pipelines() {
        let device = Arc::new(HeadlessDevice::new());
        let mut rm = manager(&device);
        let frames = FrameCounter::new(0, 1).unwrap();

        let semaphore = rm.create_semaphore(GfxSemaphoreKind::Timeline { initial_value: 0 }, "frame-timeline").unwrap();
        assert!(rm.is_ready(semaphore).unwrap());
        assert_ne!(rm.get_semaphore(semaphore).unwrap(), vk::Semaphore::null());
        assert!(rm.status(semaphore).is_err());

        let pipeline = rm.register_pipeline("opaque", vk::Pipeline::null(), vk::PipelineLayout::null()).unwrap();
        assert!(rm.get_pipeline(pipeline).is_ok());
        assert!(rm.get_semaphore(pipeline).is_err());

        rm.release(pipeline).unwrap();
        let mut next = frames;
        next.next_frame();
        rm.update(&next);
        assert_eq!(device.destroyed_pipelines(), 1);

        let semaphores_before = device.live_objects().semaphores;
        rm.destroy();
        assert_eq!(device.live_objects().semaphores, semaphores_before - 2);
    }
}
