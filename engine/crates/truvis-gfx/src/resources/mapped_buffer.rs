use std::ptr::NonNull;

use ash::vk;

use crate::{
    device::{GfxBuffer, GfxDevice},
    error::{GfxError, GfxResult},
};

/// 处于 map 状态的 buffer
///
/// 在 drop 时自动 unmap；需要 flush 时使用 [`GfxMappedBuffer::unmap`]
pub struct GfxMappedBuffer<'a> {
    device: &'a dyn GfxDevice,
    buffer: GfxBuffer,
    ptr: NonNull<u8>,
    written: vk::DeviceSize,
}

// new & init
impl<'a> GfxMappedBuffer<'a> {
    pub fn map(device: &'a dyn GfxDevice, buffer: GfxBuffer) -> GfxResult<Self> {
        let ptr = device.map_buffer(buffer.handle)?;
        Ok(Self {
            device,
            buffer,
            ptr,
            written: 0,
        })
    }
}

// tools
impl GfxMappedBuffer<'_> {
    /// 将 `data` 写入到 `offset` 处，越界时返回错误，不会写入任何数据
    pub fn write_bytes(&mut self, offset: vk::DeviceSize, data: &[u8]) -> GfxResult<()> {
        let end = offset.checked_add(data.len() as vk::DeviceSize).filter(|end| *end <= self.buffer.size).ok_or_else(
            || {
                GfxError::InvalidUsage(format!(
                    "write of {} bytes at offset {} exceeds buffer size {}",
                    data.len(),
                    offset,
                    self.buffer.size
                ))
            },
        )?;

        // SAFETY: map_buffer 保证指针在 unmap 之前有效且至少有 buffer.size 字节，上面已经检查过边界
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset as usize), data.len());
        }
        self.written = self.written.max(end);
        Ok(())
    }

    /// flush 已写入的范围并 unmap
    pub fn unmap(self) -> GfxResult<()> {
        let result = if self.written > 0 {
            self.device.flush_buffer(self.buffer.handle, 0, self.written)
        } else {
            Ok(())
        };
        // drop 中执行 unmap
        drop(self);
        result
    }
}

impl Drop for GfxMappedBuffer<'_> {
    fn drop(&mut self) {
        self.device.unmap_buffer(self.buffer.handle);
    }
}
