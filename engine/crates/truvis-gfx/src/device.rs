use std::ptr::NonNull;

use ash::vk;

use crate::{
    commands::{
        barrier::{GfxBufferBarrier, GfxImageBarrier},
        queue::{GfxQueue, GfxQueueFamily},
        submit_info::GfxSubmitInfo,
    },
    error::GfxResult,
};

/// Buffer 的内存位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GfxMemoryLocation {
    /// 主机可见，顺序写入；用于 stage buffer
    HostSequentialWrite,
    /// 设备本地内存
    DeviceLocal,
}

/// Buffer 的创建参数
#[derive(Debug, Clone)]
pub struct GfxBufferDesc {
    pub name: String,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: GfxMemoryLocation,
    /// 会访问这个 buffer 的 queue family；去重后多于一个时使用 CONCURRENT
    pub queue_families: Vec<u32>,
}

impl GfxBufferDesc {
    #[inline]
    pub fn stage(name: impl Into<String>, size: vk::DeviceSize) -> Self {
        Self {
            name: name.into(),
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            location: GfxMemoryLocation::HostSequentialWrite,
            queue_families: vec![],
        }
    }

    #[inline]
    pub fn device_local(
        name: impl Into<String>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        queue_families: Vec<u32>,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            usage,
            location: GfxMemoryLocation::DeviceLocal,
            queue_families,
        }
    }
}

/// 已经创建好的 Buffer
///
/// 只是一个描述，不拥有 GPU 内存，销毁需要调用 [`GfxDevice::destroy_buffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GfxBuffer {
    pub handle: vk::Buffer,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
}

/// Image 的创建参数，只支持 2D/3D 单 mip 的 image
#[derive(Debug, Clone)]
pub struct GfxImageDesc {
    pub name: String,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub queue_families: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GfxImage {
    pub handle: vk::Image,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GfxSemaphoreKind {
    Binary,
    Timeline { initial_value: u64 },
}

/// 渲染核心使用的设备接口
///
/// 对应 Vulkan 的 Device + Queue + Allocator 的一个子集。所有方法都是 `&self`，
/// 实现需要自行保证内部同步；调用方需要遵守 Vulkan 的外部同步规则：
/// - command pool 及其 command buffer 只能被一个线程使用
/// - [`GfxQueue`] 不可 Clone，只能被持有它的线程提交
pub trait GfxDevice: Send + Sync {
    /// 设备名称，用于日志
    fn device_name(&self) -> &str;

    /// 设备上所有的 queue family
    fn queue_families(&self) -> &[GfxQueueFamily];

    /// 独占地获取一个 queue，同一个 (family, index) 只能被获取一次
    fn acquire_queue(&self, family_index: u32, queue_index: u32) -> GfxResult<GfxQueue>;

    /// 归还 queue，之后可以被再次获取
    fn release_queue(&self, queue: GfxQueue);

    // ---------------- Buffer ----------------
    fn create_buffer(&self, desc: &GfxBufferDesc) -> GfxResult<GfxBuffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);

    /// map 一个主机可见的 buffer，返回内存起始地址
    ///
    /// 在 [`GfxDevice::unmap_buffer`] 之前指针保持有效
    fn map_buffer(&self, buffer: vk::Buffer) -> GfxResult<NonNull<u8>>;
    fn unmap_buffer(&self, buffer: vk::Buffer);
    fn flush_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) -> GfxResult<()>;

    // ---------------- Image ----------------
    fn create_image(&self, desc: &GfxImageDesc) -> GfxResult<GfxImage>;
    fn destroy_image(&self, image: vk::Image);

    // ---------------- Sync ----------------
    fn create_semaphore(&self, kind: GfxSemaphoreKind, debug_name: &str) -> GfxResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    /// 查询 timeline semaphore 的当前值（非阻塞）
    fn semaphore_value(&self, semaphore: vk::Semaphore) -> GfxResult<u64>;

    fn create_fence(&self, signaled: bool, debug_name: &str) -> GfxResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// 非阻塞地查询 fence 状态
    fn fence_signaled(&self, fence: vk::Fence) -> GfxResult<bool>;
    /// 等待所有 fence，超时返回 `Ok(false)`
    fn wait_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> GfxResult<bool>;
    fn reset_fences(&self, fences: &[vk::Fence]) -> GfxResult<()>;

    // ---------------- Command ----------------
    fn create_command_pool(
        &self,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
        debug_name: &str,
    ) -> GfxResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn reset_command_pool(&self, pool: vk::CommandPool) -> GfxResult<()>;
    fn allocate_command_buffer(&self, pool: vk::CommandPool, debug_name: &str) -> GfxResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer);

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer, usage: vk::CommandBufferUsageFlags)
    -> GfxResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GfxResult<()>;
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GfxResult<()>;

    fn cmd_copy_buffer(&self, command_buffer: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]);
    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );
    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        image_barriers: &[GfxImageBarrier],
        buffer_barriers: &[GfxBufferBarrier],
    );

    // ---------------- Queue ----------------
    fn queue_submit(&self, queue: &GfxQueue, batches: &[GfxSubmitInfo], fence: Option<vk::Fence>) -> GfxResult<()>;
    fn queue_wait_idle(&self, queue: &GfxQueue) -> GfxResult<()>;

    // ---------------- 外部创建的对象 ----------------
    /// pipeline 由外部模块创建，这里只负责在资源释放时销毁
    fn destroy_pipeline(&self, pipeline: vk::Pipeline, layout: vk::PipelineLayout);

    fn wait_idle(&self) -> GfxResult<()>;
}

/// 根据 queue family 列表决定 sharing mode
///
/// 返回去重后的 family 列表；只有一个 family 时返回空列表，表示 EXCLUSIVE
pub fn sharing_families(queue_families: &[u32]) -> (vk::SharingMode, Vec<u32>) {
    let mut families = queue_families.to_vec();
    families.sort_unstable();
    families.dedup();
    if families.len() > 1 {
        (vk::SharingMode::CONCURRENT, families)
    } else {
        (vk::SharingMode::EXCLUSIVE, vec![])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sharing_families_dedup() {
        let (mode, families) = sharing_families(&[2, 0, 2]);
        assert_eq!(mode, vk::SharingMode::CONCURRENT);
        assert_eq!(families, vec![0, 2]);

        let (mode, families) = sharing_families(&[1, 1]);
        assert_eq!(mode, vk::SharingMode::EXCLUSIVE);
        assert!(families.is_empty());
    }
}
