use ash::vk;

use crate::{
    commands::barrier::{GfxBufferBarrier, GfxImageBarrier},
    device::GfxDevice,
};

/// 正在录制中的 command buffer
///
/// 只在录制回调期间借出，所有命令都转发给 [`GfxDevice`]。
/// 需要使用 ash 直接录制的代码可以通过 [`GfxCommandRecorder::vk_handle`] 拿到原始句柄。
pub struct GfxCommandRecorder<'a> {
    device: &'a dyn GfxDevice,
    command_buffer: vk::CommandBuffer,
    queue_family_index: u32,
}

impl<'a> GfxCommandRecorder<'a> {
    #[inline]
    pub fn new(device: &'a dyn GfxDevice, command_buffer: vk::CommandBuffer, queue_family_index: u32) -> Self {
        Self {
            device,
            command_buffer,
            queue_family_index,
        }
    }

    #[inline]
    pub fn vk_handle(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    #[inline]
    pub fn device(&self) -> &'a dyn GfxDevice {
        self.device
    }

    #[inline]
    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        self.device.cmd_copy_buffer(self.command_buffer, src, dst, regions);
    }

    #[inline]
    pub fn copy_buffer_to_image(
        &self,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.device.cmd_copy_buffer_to_image(self.command_buffer, src, dst, dst_layout, regions);
    }

    #[inline]
    pub fn image_memory_barrier(&self, barriers: &[GfxImageBarrier]) {
        self.device.cmd_pipeline_barrier(self.command_buffer, barriers, &[]);
    }

    #[inline]
    pub fn buffer_memory_barrier(&self, barriers: &[GfxBufferBarrier]) {
        self.device.cmd_pipeline_barrier(self.command_buffer, &[], barriers);
    }
}
