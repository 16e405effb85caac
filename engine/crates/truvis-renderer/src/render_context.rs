use std::sync::Arc;

use ash::vk;
use itertools::Itertools;
use truvis_asset::{RenderResourceManager, ResourceStats};
use truvis_gfx::{
    GfxDevice,
    commands::queue::{GfxQueue, GfxQueuePlanner},
};
use truvis_render_interface::{
    config::RenderCoreConfig,
    errors::{ConfigurationError, RenderResult},
    frame_counter::FrameCounter,
};

use crate::command_buffer_manager::{CommandBufferManager, SubmitStats};

/// 一帧 `tick` 的结果
#[derive(Debug, Clone)]
pub struct FrameStats {
    pub frame_id: u64,
    pub submit: SubmitStats,
    pub resources: ResourceStats,
}

/// 从 device 的 queue family 中分配给各个模块的 queue
struct QueuePlan {
    graphics: GfxQueue,
    compute: Option<GfxQueue>,
    transfer: Option<GfxQueue>,
    workers: Vec<GfxQueue>,
}

impl QueuePlan {
    /// graphics 最先分配，然后是 transfer worker，剩下的给 compute 和 transfer 提交
    fn acquire(device: &dyn GfxDevice, worker_threads: usize) -> RenderResult<Self> {
        let mut planner = GfxQueuePlanner::new(device.queue_families());

        let graphics = planner.take(vk::QueueFlags::GRAPHICS, vk::QueueFlags::empty()).ok_or_else(|| {
            ConfigurationError::NoQueueAvailable {
                purpose: "graphics".to_string(),
            }
        })?;

        let worker_candidates = [
            (vk::QueueFlags::TRANSFER, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            (vk::QueueFlags::TRANSFER, vk::QueueFlags::GRAPHICS),
            (vk::QueueFlags::TRANSFER, vk::QueueFlags::empty()),
        ];
        let workers = (0..worker_threads).map_while(|_| planner.take_preferred(&worker_candidates)).collect_vec();
        if workers.is_empty() {
            return Err(ConfigurationError::NoQueueAvailable {
                purpose: "transfer worker".to_string(),
            }
            .into());
        }
        if workers.len() < worker_threads {
            log::warn!("only {} of {} transfer worker queues available", workers.len(), worker_threads);
        }

        let compute = planner.take(vk::QueueFlags::COMPUTE, vk::QueueFlags::GRAPHICS);
        let transfer = planner.take(vk::QueueFlags::TRANSFER, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE);

        let graphics = device.acquire_queue(graphics.0, graphics.1)?;
        let mut others = Vec::with_capacity(workers.len() + 2);
        for (family_index, queue_index) in compute.iter().chain(transfer.iter()).chain(workers.iter()) {
            match device.acquire_queue(*family_index, *queue_index) {
                Ok(queue) => others.push(queue),
                Err(e) => {
                    // 把已经拿到的 queue 还回去
                    for queue in std::iter::once(graphics).chain(others) {
                        device.release_queue(queue);
                    }
                    return Err(e.into());
                }
            }
        }

        let mut others = others.into_iter();
        Ok(Self {
            graphics,
            compute: compute.and_then(|_| others.next()),
            transfer: transfer.and_then(|_| others.next()),
            workers: others.collect(),
        })
    }

    /// 会访问上传资源的 queue family
    fn consumer_families(&self) -> Vec<u32> {
        std::iter::once(&self.graphics)
            .chain(self.compute.as_ref())
            .chain(self.transfer.as_ref())
            .map(|queue| queue.family_index())
            .unique()
            .collect()
    }
}

/// 渲染核心的入口
///
/// 持有 device、帧计数器、[`RenderResourceManager`] 和 [`CommandBufferManager`]，
/// 每帧调用一次 [`RenderContext::tick`]。
pub struct RenderContext {
    device: Arc<dyn GfxDevice>,
    config: RenderCoreConfig,
    frame_counter: FrameCounter,

    /// command buffer 可能引用 resource manager 中的资源，需要先销毁
    command_buffer_manager: CommandBufferManager,
    resource_manager: RenderResourceManager,
}

// new & init
impl RenderContext {
    pub fn new(device: Arc<dyn GfxDevice>, config: RenderCoreConfig) -> RenderResult<Self> {
        let _span = truvis_crate_tools::profile_span!("RenderContext::new");
        config.validate()?;
        log::info!("create render context on `{}`: {:?}", device.device_name(), config);

        let plan = QueuePlan::acquire(&*device, config.transfer.threads)?;
        let consumer_families = plan.consumer_families();
        log::info!(
            "graphics family {}, compute family {:?}, transfer family {:?}, {} transfer worker(s)",
            plan.graphics.family_index(),
            plan.compute.as_ref().map(|queue| queue.family_index()),
            plan.transfer.as_ref().map(|queue| queue.family_index()),
            plan.workers.len()
        );

        let QueuePlan {
            graphics,
            compute,
            transfer,
            workers,
        } = plan;
        let resource_manager = match RenderResourceManager::new(device.clone(), workers, consumer_families, &config) {
            Ok(manager) => manager,
            Err(e) => {
                for queue in std::iter::once(graphics).chain(compute).chain(transfer) {
                    device.release_queue(queue);
                }
                return Err(e);
            }
        };
        let command_buffer_manager = CommandBufferManager::new(
            device.clone(),
            graphics,
            compute,
            transfer,
            config.frames_in_flight,
            config.capacities.command_buffers,
        )?;

        Ok(Self {
            frame_counter: FrameCounter::new(0, config.frames_in_flight)?,
            device,
            config,
            command_buffer_manager,
            resource_manager,
        })
    }

    /// 等待 GPU 空闲，然后依次销毁 command buffer 和资源
    pub fn destroy(self) {
        let _span = truvis_crate_tools::profile_span!("RenderContext::destroy");
        if let Err(e) = self.device.wait_idle() {
            log::error!("wait idle failed before destroy: {}", e);
        }
        self.command_buffer_manager.destroy();
        self.resource_manager.destroy();
        log::info!("render context destroyed after {} frames", self.frame_counter.frame_id());
    }
}

// update
impl RenderContext {
    /// 提交当前帧，然后推进帧计数器
    ///
    /// 先提交 command buffer（会等待当前 slot 在 N 帧之前的 fence），
    /// 再更新资源，这样延迟释放的资源只会在对应的 GPU 工作结束后销毁。
    pub fn tick(&mut self) -> RenderResult<FrameStats> {
        let _span = truvis_crate_tools::profile_span!("RenderContext::tick");
        let frame_id = self.frame_counter.frame_id();

        let submit = self.command_buffer_manager.update(self.frame_counter.frame_slot())?;
        self.resource_manager.update(&self.frame_counter);
        if !submit.failures.is_empty() {
            log::warn!("{} {} group(s) skipped", self.frame_counter.frame_name(), submit.failures.len());
        }

        self.frame_counter.next_frame();
        Ok(FrameStats {
            frame_id,
            submit,
            resources: self.resource_manager.stats(),
        })
    }
}

// getters
impl RenderContext {
    #[inline]
    pub fn device(&self) -> &Arc<dyn GfxDevice> {
        &self.device
    }

    #[inline]
    pub fn config(&self) -> &RenderCoreConfig {
        &self.config
    }

    #[inline]
    pub fn frame_counter(&self) -> &FrameCounter {
        &self.frame_counter
    }

    #[inline]
    pub fn resource_manager(&self) -> &RenderResourceManager {
        &self.resource_manager
    }

    #[inline]
    pub fn resource_manager_mut(&mut self) -> &mut RenderResourceManager {
        &mut self.resource_manager
    }

    #[inline]
    pub fn command_buffer_manager(&self) -> &CommandBufferManager {
        &self.command_buffer_manager
    }

    #[inline]
    pub fn command_buffer_manager_mut(&mut self) -> &mut CommandBufferManager {
        &mut self.command_buffer_manager
    }
}

#[cfg(test)]
mod tests {
    use truvis_asset::{BufferUpload, TransferPriority};
    use truvis_gfx::{
        commands::{queue::GfxQueueFamily, submit_info::GfxSemaphoreSubmit},
        headless::HeadlessDevice,
    };
    use truvis_render_interface::errors::RenderCoreError;

    use super::*;
    use crate::command_buffer_request::{CommandBufferRequest, QueueType, SubmitPhase};

    #[test]
    fn test_queue_plan_on_default_families() {
        let device = Arc::new(HeadlessDevice::new());
        let mut config = RenderCoreConfig::default();
        config.transfer.threads = 2;
        let context = RenderContext::new(device.clone(), config).unwrap();

        let cbm = context.command_buffer_manager();
        assert_eq!(cbm.queue_family(QueueType::Graphics), 0);
        assert_eq!(cbm.queue_family(QueueType::Compute), 1);
        assert_eq!(cbm.queue_family(QueueType::Present), 0);
        // transfer-only family 的两个 queue 都给了 worker
        assert_eq!(cbm.queue_family(QueueType::Transfer), 0);
        assert_eq!(context.resource_manager().transfer_thread_count(), 2);

        context.destroy();
        let live = device.live_objects();
        assert_eq!((live.fences, live.command_pools, live.semaphores), (0, 0, 0));
    }

    #[test]
    fn test_upload_then_draw() {
        truvis_crate_tools::init_log::init_test_log();
        let device = Arc::new(HeadlessDevice::new());
        let mut context = RenderContext::new(device.clone(), RenderCoreConfig::default()).unwrap();

        let vertices = context
            .resource_manager_mut()
            .add_request(
                BufferUpload::from_slice("triangle", &[0.0f32, 1.0, 2.0], vk::BufferUsageFlags::VERTEX_BUFFER),
                TransferPriority::High,
            )
            .unwrap();
        context.resource_manager_mut().wait_for_ready(vertices).unwrap();
        let upload_done: GfxSemaphoreSubmit = context.resource_manager().gpu_wait(vertices).unwrap().unwrap();

        let draw = context
            .command_buffer_manager_mut()
            .register_command_buffer(CommandBufferRequest::new(
                "draw",
                QueueType::Graphics,
                SubmitPhase::MainRenderPass,
                |_recorder, _slot| Ok(()),
            ))
            .unwrap();
        context.command_buffer_manager_mut().add_wait_semaphore(draw, upload_done).unwrap();

        for _ in 0..5 {
            let stats = context.tick().unwrap();
            assert_eq!(stats.submit.groups_submitted, 1);
            assert_eq!(stats.resources.buffers, 1);
        }
        assert_eq!(context.frame_counter().frame_id(), 5);

        context.resource_manager_mut().release(vertices).unwrap();
        for _ in 0..3 {
            context.tick().unwrap();
        }
        assert_eq!(context.resource_manager().stats(), ResourceStats::default());

        context.destroy();
        assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
        assert_eq!(device.live_objects().buffers, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let device = Arc::new(HeadlessDevice::new());
        let mut config = RenderCoreConfig::default();
        config.frames_in_flight = 0;
        assert!(RenderContext::new(device.clone(), config).is_err());

        // 只有一个 queue 时没有 transfer worker 可用
        let single_queue = Arc::new(HeadlessDevice::with_families(vec![GfxQueueFamily {
            name: "gfx".to_string(),
            queue_family_index: 0,
            queue_flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            queue_count: 1,
            supports_present: true,
        }]));
        assert!(matches!(
            RenderContext::new(single_queue.clone(), RenderCoreConfig::default()),
            Err(RenderCoreError::Configuration(ConfigurationError::NoQueueAvailable { .. }))
        ));
        // 失败时没有留下被占用的 queue
        assert!(single_queue.acquire_queue(0, 0).is_ok());
    }
}
