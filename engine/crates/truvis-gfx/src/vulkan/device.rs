use std::{
    collections::{HashMap, HashSet},
    ffi::CString,
    mem::ManuallyDrop,
    ptr::NonNull,
    sync::{Mutex, MutexGuard, PoisonError},
};

use ash::vk;
use itertools::Itertools;
use vk_mem::Alloc;

use crate::{
    commands::{
        barrier::{GfxBufferBarrier, GfxImageBarrier},
        queue::{GfxQueue, GfxQueueFamily},
        submit_info::GfxSubmitInfo,
    },
    device::{
        GfxBuffer, GfxBufferDesc, GfxDevice, GfxImage, GfxImageDesc, GfxMemoryLocation, GfxSemaphoreKind,
        sharing_families,
    },
    error::{GfxError, GfxResult},
    vulkan::init,
};

/// Vulkan 设备
///
/// 持有 instance、逻辑设备以及 vma allocator。
/// buffer 和 image 的 allocation 保存在内部表中，外部只拿到 vk 句柄。
pub struct VulkanDevice {
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    debug_utils: Option<ash::ext::debug_utils::Device>,

    /// allocator 需要在 device 之前销毁
    allocator: ManuallyDrop<vk_mem::Allocator>,

    device_name: String,
    queue_families: Vec<GfxQueueFamily>,
    acquired_queues: Mutex<HashSet<(u32, u32)>>,

    buffers: Mutex<HashMap<vk::Buffer, vk_mem::Allocation>>,
    images: Mutex<HashMap<vk::Image, vk_mem::Allocation>>,
}

#[inline]
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// new & init
impl VulkanDevice {
    /// 加载 vulkan，创建 instance 和 device
    pub fn new(app_name: &str) -> GfxResult<Self> {
        let _span = truvis_crate_tools::profile_span!("VulkanDevice::new");

        let entry = unsafe { ash::Entry::load() }.map_err(|e| GfxError::Loader(e.to_string()))?;
        let (instance, debug_utils) = init::create_instance(&entry, app_name)?;

        let created = (|| {
            let (pdevice, device_name) = init::pick_physical_device(&instance)?;
            let queue_families = init::query_queue_families(&instance, pdevice);
            let device = init::create_device(&instance, pdevice, &queue_families)?;
            Ok::<_, GfxError>((pdevice, device_name, queue_families, device))
        })();
        let (pdevice, device_name, queue_families, device) = match created {
            Ok(created) => created,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        let debug_utils = debug_utils.then(|| ash::ext::debug_utils::Device::new(&instance, &device));
        Self::from_raw(entry, instance, pdevice, device, debug_utils, device_name, queue_families)
    }

    /// 使用外部已经创建好的 instance 和 device
    ///
    /// device 需要开启 timeline semaphore 和 synchronization2，并申请 `queue_families` 中的所有 queue。
    /// 之后由 [`VulkanDevice`] 负责销毁。
    pub fn from_raw(
        entry: ash::Entry,
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        debug_utils: Option<ash::ext::debug_utils::Device>,
        device_name: String,
        queue_families: Vec<GfxQueueFamily>,
    ) -> GfxResult<Self> {
        let mut vma_ci = vk_mem::AllocatorCreateInfo::new(&instance, &device, physical_device);
        vma_ci.vulkan_api_version = vk::API_VERSION_1_3;
        let allocator = unsafe { vk_mem::Allocator::new(vma_ci)? };

        log::info!("vulkan device `{}` created with {} queue families", device_name, queue_families.len());

        Ok(Self {
            _entry: entry,
            instance,
            physical_device,
            device,
            debug_utils,
            allocator: ManuallyDrop::new(allocator),
            device_name,
            queue_families,
            acquired_queues: Mutex::new(HashSet::new()),
            buffers: Mutex::new(HashMap::new()),
            images: Mutex::new(HashMap::new()),
        })
    }
}

// getters
impl VulkanDevice {
    #[inline]
    pub fn ash_device(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn ash_instance(&self) -> &ash::Instance {
        &self.instance
    }

    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }
}

// tools
impl VulkanDevice {
    fn set_object_debug_name<T: vk::Handle + Copy>(&self, handle: T, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let name_info = vk::DebugUtilsObjectNameInfoEXT::default().object_name(name.as_c_str()).object_handle(handle);
        if let Err(e) = unsafe { debug_utils.set_debug_utils_object_name(&name_info) } {
            log::warn!("failed to set debug name `{}`: {:?}", name.to_string_lossy(), e);
        }
    }
}

impl GfxDevice for VulkanDevice {
    fn device_name(&self) -> &str {
        &self.device_name
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

        if !lock(&self.acquired_queues).insert((family_index, queue_index)) {
            return Err(GfxError::QueueUnavailable {
                family_index,
                queue_index,
            });
        }

        let vk_queue = unsafe { self.device.get_device_queue(family_index, queue_index) };
        self.set_object_debug_name(vk_queue, &format!("Queue::{}-{}", family.name, queue_index));
        Ok(GfxQueue::new(vk_queue, family.clone(), queue_index))
    }

    fn release_queue(&self, queue: GfxQueue) {
        lock(&self.acquired_queues).remove(&(queue.family_index(), queue.queue_index()));
    }

    fn create_buffer(&self, desc: &GfxBufferDesc) -> GfxResult<GfxBuffer> {
        let (sharing_mode, families) = sharing_families(&desc.queue_families);
        let buffer_ci = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(sharing_mode)
            .queue_family_indices(&families);
        let alloc_ci = match desc.location {
            GfxMemoryLocation::HostSequentialWrite => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::Auto,
                flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                ..Default::default()
            },
            GfxMemoryLocation::DeviceLocal => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                ..Default::default()
            },
        };

        let (buffer, allocation) =
            unsafe { self.allocator.create_buffer(&buffer_ci, &alloc_ci) }.map_err(|e| GfxError::AllocationFailed {
                name: desc.name.clone(),
                reason: format!("{:?}", e),
            })?;
        self.set_object_debug_name(buffer, &format!("Buffer::{}", desc.name));
        lock(&self.buffers).insert(buffer, allocation);

        Ok(GfxBuffer {
            handle: buffer,
            size: desc.size,
            usage: desc.usage,
        })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let Some(mut allocation) = lock(&self.buffers).remove(&buffer) else {
            log::error!("destroy unknown buffer {:?}", buffer);
            return;
        };
        unsafe { self.allocator.destroy_buffer(buffer, &mut allocation) };
    }

    fn map_buffer(&self, buffer: vk::Buffer) -> GfxResult<NonNull<u8>> {
        let mut buffers = lock(&self.buffers);
        let allocation = buffers.get_mut(&buffer).ok_or(GfxError::UnknownObject {
            kind: "buffer",
            raw: vk::Handle::as_raw(buffer),
        })?;
        let ptr = unsafe { self.allocator.map_memory(allocation) }.map_err(|e| GfxError::MapFailed {
            raw: vk::Handle::as_raw(buffer),
            reason: format!("{:?}", e),
        })?;
        NonNull::new(ptr).ok_or(GfxError::MapFailed {
            raw: vk::Handle::as_raw(buffer),
            reason: "null pointer".to_string(),
        })
    }

    fn unmap_buffer(&self, buffer: vk::Buffer) {
        if let Some(allocation) = lock(&self.buffers).get_mut(&buffer) {
            unsafe { self.allocator.unmap_memory(allocation) };
        }
    }

    fn flush_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) -> GfxResult<()> {
        let buffers = lock(&self.buffers);
        let allocation = buffers.get(&buffer).ok_or(GfxError::UnknownObject {
            kind: "buffer",
            raw: vk::Handle::as_raw(buffer),
        })?;
        self.allocator.flush_allocation(allocation, offset, size)?;
        Ok(())
    }

    fn create_image(&self, desc: &GfxImageDesc) -> GfxResult<GfxImage> {
        let (sharing_mode, families) = sharing_families(&desc.queue_families);
        let image_type = if desc.extent.depth > 1 {
            vk::ImageType::TYPE_3D
        } else {
            vk::ImageType::TYPE_2D
        };
        let image_ci = vk::ImageCreateInfo::default()
            .image_type(image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(sharing_mode)
            .queue_family_indices(&families)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };

        let (image, allocation) =
            unsafe { self.allocator.create_image(&image_ci, &alloc_ci) }.map_err(|e| GfxError::AllocationFailed {
                name: desc.name.clone(),
                reason: format!("{:?}", e),
            })?;
        self.set_object_debug_name(image, &format!("Image::{}", desc.name));
        lock(&self.images).insert(image, allocation);

        Ok(GfxImage {
            handle: image,
            extent: desc.extent,
            format: desc.format,
            usage: desc.usage,
        })
    }

    fn destroy_image(&self, image: vk::Image) {
        let Some(mut allocation) = lock(&self.images).remove(&image) else {
            log::error!("destroy unknown image {:?}", image);
            return;
        };
        unsafe { self.allocator.destroy_image(image, &mut allocation) };
    }

    fn create_semaphore(&self, kind: GfxSemaphoreKind, debug_name: &str) -> GfxResult<vk::Semaphore> {
        let semaphore = match kind {
            GfxSemaphoreKind::Binary => unsafe {
                self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?
            },
            GfxSemaphoreKind::Timeline { initial_value } => {
                let mut timeline_ci = vk::SemaphoreTypeCreateInfo::default()
                    .semaphore_type(vk::SemaphoreType::TIMELINE)
                    .initial_value(initial_value);
                let semaphore_ci = vk::SemaphoreCreateInfo::default().push_next(&mut timeline_ci);
                unsafe { self.device.create_semaphore(&semaphore_ci, None)? }
            }
        };
        self.set_object_debug_name(semaphore, &format!("Semaphore::{}", debug_name));
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn semaphore_value(&self, semaphore: vk::Semaphore) -> GfxResult<u64> {
        Ok(unsafe { self.device.get_semaphore_counter_value(semaphore)? })
    }

    fn create_fence(&self, signaled: bool, debug_name: &str) -> GfxResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::default().flags(flags), None)? };
        self.set_object_debug_name(fence, &format!("Fence::{}", debug_name));
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn fence_signaled(&self, fence: vk::Fence) -> GfxResult<bool> {
        Ok(unsafe { self.device.get_fence_status(fence)? })
    }

    fn wait_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> GfxResult<bool> {
        if fences.is_empty() {
            return Ok(true);
        }
        match unsafe { self.device.wait_for_fences(fences, true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> GfxResult<()> {
        if fences.is_empty() {
            return Ok(());
        }
        unsafe { self.device.reset_fences(fences)? };
        Ok(())
    }

    fn create_command_pool(
        &self,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
        debug_name: &str,
    ) -> GfxResult<vk::CommandPool> {
        let pool_ci = vk::CommandPoolCreateInfo::default().queue_family_index(queue_family_index).flags(flags);
        let pool = unsafe { self.device.create_command_pool(&pool_ci, None)? };
        self.set_object_debug_name(pool, &format!("CommandPool::{}", debug_name));
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> GfxResult<()> {
        unsafe { self.device.reset_command_pool(pool, vk::CommandPoolResetFlags::empty())? };
        Ok(())
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool, debug_name: &str) -> GfxResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { self.device.allocate_command_buffers(&info)? }
            .into_iter()
            .next()
            .ok_or(GfxError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY))?;
        self.set_object_debug_name(command_buffer, &format!("CommandBuffer::{}", debug_name));
        Ok(command_buffer)
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[command_buffer]) };
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    ) -> GfxResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(usage);
        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info)? };
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GfxResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer)? };
        Ok(())
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GfxResult<()> {
        unsafe { self.device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())? };
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer(command_buffer, src, dst, regions) };
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer_to_image(command_buffer, src, dst, dst_layout, regions) };
    }

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        image_barriers: &[GfxImageBarrier],
        buffer_barriers: &[GfxBufferBarrier],
    ) {
        let image_barriers = image_barriers.iter().map(GfxImageBarrier::to_vk).collect_vec();
        let buffer_barriers = buffer_barriers.iter().map(GfxBufferBarrier::to_vk).collect_vec();
        let dependency_info = vk::DependencyInfo::default()
            .image_memory_barriers(&image_barriers)
            .buffer_memory_barriers(&buffer_barriers);
        unsafe { self.device.cmd_pipeline_barrier2(command_buffer, &dependency_info) };
    }

    fn queue_submit(&self, queue: &GfxQueue, batches: &[GfxSubmitInfo], fence: Option<vk::Fence>) -> GfxResult<()> {
        let _span = truvis_crate_tools::profile_span!("VulkanDevice::queue_submit");

        // 先收集所有数组，SubmitInfo2 只保存引用
        let command_infos = batches
            .iter()
            .map(|batch| {
                batch
                    .command_buffers
                    .iter()
                    .map(|cmd| vk::CommandBufferSubmitInfo::default().command_buffer(*cmd))
                    .collect_vec()
            })
            .collect_vec();
        let wait_infos = batches.iter().map(|batch| batch.wait_infos.iter().map(|w| w.to_vk()).collect_vec()).collect_vec();
        let signal_infos =
            batches.iter().map(|batch| batch.signal_infos.iter().map(|s| s.to_vk()).collect_vec()).collect_vec();

        let submit_infos = (0..batches.len())
            .map(|idx| {
                vk::SubmitInfo2::default()
                    .command_buffer_infos(&command_infos[idx])
                    .wait_semaphore_infos(&wait_infos[idx])
                    .signal_semaphore_infos(&signal_infos[idx])
            })
            .collect_vec();

        unsafe {
            self.device.queue_submit2(queue.vk_handle(), &submit_infos, fence.unwrap_or_else(vk::Fence::null))?;
        }
        Ok(())
    }

    fn queue_wait_idle(&self, queue: &GfxQueue) -> GfxResult<()> {
        unsafe { self.device.queue_wait_idle(queue.vk_handle())? };
        Ok(())
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline, layout: vk::PipelineLayout) {
        unsafe {
            if pipeline != vk::Pipeline::null() {
                self.device.destroy_pipeline(pipeline, None);
            }
            if layout != vk::PipelineLayout::null() {
                self.device.destroy_pipeline_layout(layout, None);
            }
        }
    }

    fn wait_idle(&self) -> GfxResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("destroying vulkan device `{}`", self.device_name);
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("device_wait_idle failed during destroy: {:?}", e);
            }

            let buffers = std::mem::take(self.buffers.get_mut().unwrap_or_else(PoisonError::into_inner));
            if !buffers.is_empty() {
                log::warn!("{} buffers leaked, destroying them with the device", buffers.len());
            }
            for (buffer, mut allocation) in buffers {
                self.allocator.destroy_buffer(buffer, &mut allocation);
            }
            let images = std::mem::take(self.images.get_mut().unwrap_or_else(PoisonError::into_inner));
            if !images.is_empty() {
                log::warn!("{} images leaked, destroying them with the device", images.len());
            }
            for (image, mut allocation) in images {
                self.allocator.destroy_image(image, &mut allocation);
            }

            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}
