use ash::vk;
use truvis_gfx::{
    GfxDevice, GfxResult,
    commands::{
        barrier::{GfxBufferBarrier, GfxImageBarrier},
        recorder::GfxCommandRecorder,
    },
    device::{GfxBuffer, GfxBufferDesc, GfxImage, GfxImageDesc},
    resources::{format::image_byte_size, mapped_buffer::GfxMappedBuffer},
};
use truvis_render_interface::{
    errors::{PreconditionError, ResourceCreationError},
    handles::{Handle, ResourceCategory},
};

/// 上传完成后的最终资源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuResource {
    Buffer(GfxBuffer),
    Image(GfxImage),
}

impl GpuResource {
    pub fn destroy(self, device: &dyn GfxDevice) {
        match self {
            GpuResource::Buffer(buffer) => device.destroy_buffer(buffer.handle),
            GpuResource::Image(image) => device.destroy_image(image.handle),
        }
    }
}

/// 一次上传的配方
///
/// 上传流程：
/// 1. 在提交线程上执行 [`TransferRecipe::prep`]，例如解码图片
/// 2. 在 worker 线程上创建 stage buffer 和最终资源，写入 stage buffer
/// 3. 录制 stage buffer 到最终资源的拷贝，以及必要的 barrier
pub trait TransferRecipe {
    fn name(&self) -> &str;

    /// CPU 侧的准备工作，失败时请求不会进入队列
    fn prep(&mut self) -> Result<(), ResourceCreationError> {
        Ok(())
    }

    /// 需要经过 stage buffer 的字节数
    fn data_size(&self) -> vk::DeviceSize;

    fn create_staging_buffer(&self, device: &dyn GfxDevice) -> GfxResult<GfxBuffer> {
        device.create_buffer(&GfxBufferDesc::stage(format!("{}::stage", self.name()), self.data_size()))
    }

    /// 创建最终资源，`queue_families` 为所有会访问这个资源的 queue family
    fn create_final(&self, device: &dyn GfxDevice, queue_families: &[u32]) -> GfxResult<GpuResource>;

    fn write_data_to_stage(&self, device: &dyn GfxDevice, staging: GfxBuffer) -> GfxResult<()>;

    fn copy_staging_to_final(&self, recorder: &GfxCommandRecorder, staging: GfxBuffer, target: &GpuResource);

    /// 检查这次上传能否写入到已经存在的资源中
    fn check_update(&self, handle: Handle, existing: &GpuResource) -> Result<(), PreconditionError>;

    /// `create_final` 将会创建的资源的形状，handle 为 null
    ///
    /// 第一次上传还没有完成时，用它来检查之后的更新
    fn planned_resource(&self) -> Option<GpuResource>;
}

/// 上传到 device local buffer
pub struct BufferUpload {
    pub name: String,
    pub data: Vec<u8>,
    pub usage: vk::BufferUsageFlags,
}

impl BufferUpload {
    pub fn new(name: impl Into<String>, data: Vec<u8>, usage: vk::BufferUsageFlags) -> Self {
        Self {
            name: name.into(),
            data,
            usage,
        }
    }

    pub fn from_slice<T: bytemuck::Pod>(name: impl Into<String>, data: &[T], usage: vk::BufferUsageFlags) -> Self {
        Self::new(name, bytemuck::cast_slice(data).to_vec(), usage)
    }
}

impl TransferRecipe for BufferUpload {
    fn name(&self) -> &str {
        &self.name
    }

    fn prep(&mut self) -> Result<(), ResourceCreationError> {
        if self.data.is_empty() {
            return Err(ResourceCreationError::Prep {
                name: self.name.clone(),
                reason: "buffer data is empty".to_string(),
            });
        }
        Ok(())
    }

    fn data_size(&self) -> vk::DeviceSize {
        self.data.len() as vk::DeviceSize
    }

    fn create_final(&self, device: &dyn GfxDevice, queue_families: &[u32]) -> GfxResult<GpuResource> {
        let buffer = device.create_buffer(&GfxBufferDesc::device_local(
            self.name.clone(),
            self.data_size(),
            self.usage | vk::BufferUsageFlags::TRANSFER_DST,
            queue_families.to_vec(),
        ))?;
        Ok(GpuResource::Buffer(buffer))
    }

    fn write_data_to_stage(&self, device: &dyn GfxDevice, staging: GfxBuffer) -> GfxResult<()> {
        let mut mapped = GfxMappedBuffer::map(device, staging)?;
        mapped.write_bytes(0, &self.data)?;
        mapped.unmap()
    }

    fn copy_staging_to_final(&self, recorder: &GfxCommandRecorder, staging: GfxBuffer, target: &GpuResource) {
        let GpuResource::Buffer(dst) = target else {
            log::error!("buffer upload `{}` targets an image", self.name);
            return;
        };
        let size = self.data_size();
        recorder.copy_buffer(
            staging.handle,
            dst.handle,
            &[vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            }],
        );
        recorder.buffer_memory_barrier(&[GfxBufferBarrier::new()
            .buffer(dst.handle, 0, size)
            .src_mask(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE)
            .dst_mask(vk::PipelineStageFlags2::ALL_COMMANDS, vk::AccessFlags2::MEMORY_READ)]);
    }

    fn check_update(&self, handle: Handle, existing: &GpuResource) -> Result<(), PreconditionError> {
        let GpuResource::Buffer(buffer) = existing else {
            return Err(PreconditionError::RequestKindMismatch {
                handle,
                expected: "buffer",
            });
        };
        if self.data_size() > buffer.size {
            return Err(PreconditionError::UpdateTooLarge {
                handle,
                size: self.data_size(),
                capacity: buffer.size,
            });
        }
        Ok(())
    }

    fn planned_resource(&self) -> Option<GpuResource> {
        Some(GpuResource::Buffer(GfxBuffer {
            handle: vk::Buffer::null(),
            size: self.data_size(),
            usage: self.usage | vk::BufferUsageFlags::TRANSFER_DST,
        }))
    }
}

/// 纹理数据的来源
pub enum TextureSource {
    /// 已经是 GPU 格式的像素
    Raw {
        extent: vk::Extent2D,
        format: vk::Format,
        pixels: Vec<u8>,
    },
    /// PNG 等编码后的文件内容，prep 时解码为 RGBA8
    Encoded(Vec<u8>),
}

/// 上传到 2D 纹理，上传完成后处于 `SHADER_READ_ONLY_OPTIMAL`
pub struct TextureUpload {
    pub name: String,
    pub source: TextureSource,
    pub usage: vk::ImageUsageFlags,
}

impl TextureUpload {
    pub fn raw(
        name: impl Into<String>,
        extent: vk::Extent2D,
        format: vk::Format,
        pixels: Vec<u8>,
        usage: vk::ImageUsageFlags,
    ) -> Self {
        Self {
            name: name.into(),
            source: TextureSource::Raw { extent, format, pixels },
            usage,
        }
    }

    pub fn encoded(name: impl Into<String>, bytes: Vec<u8>, usage: vk::ImageUsageFlags) -> Self {
        Self {
            name: name.into(),
            source: TextureSource::Encoded(bytes),
            usage,
        }
    }

    #[inline]
    fn extent_3d(extent: vk::Extent2D) -> vk::Extent3D {
        vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        }
    }

    fn prep_error(&self, reason: impl Into<String>) -> ResourceCreationError {
        ResourceCreationError::Prep {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }
}

impl TransferRecipe for TextureUpload {
    fn name(&self) -> &str {
        &self.name
    }

    fn prep(&mut self) -> Result<(), ResourceCreationError> {
        let _span = truvis_crate_tools::profile_span!("TextureUpload::prep");
        if let TextureSource::Encoded(bytes) = &self.source {
            let decoded = image::load_from_memory(bytes).map_err(|e| self.prep_error(e.to_string()))?;
            // 目前统一转为 RGBA8
            let rgba = decoded.into_rgba8();
            let (width, height) = rgba.dimensions();
            self.source = TextureSource::Raw {
                extent: vk::Extent2D { width, height },
                format: vk::Format::R8G8B8A8_UNORM,
                pixels: rgba.into_raw(),
            };
        }

        let TextureSource::Raw { extent, format, pixels } = &self.source else {
            return Err(self.prep_error("texture source was not decoded"));
        };
        if extent.width == 0 || extent.height == 0 {
            return Err(self.prep_error(format!("empty extent {}x{}", extent.width, extent.height)));
        }
        let expected = image_byte_size(Self::extent_3d(*extent), *format)
            .ok_or_else(|| self.prep_error(format!("unsupported format {:?}", format)))?;
        if pixels.len() as vk::DeviceSize != expected {
            return Err(self.prep_error(format!(
                "{} bytes of pixels for {}x{} {:?}, expected {}",
                pixels.len(),
                extent.width,
                extent.height,
                format,
                expected
            )));
        }
        Ok(())
    }

    fn data_size(&self) -> vk::DeviceSize {
        match &self.source {
            TextureSource::Raw { pixels, .. } => pixels.len() as vk::DeviceSize,
            TextureSource::Encoded(_) => 0,
        }
    }

    fn create_final(&self, device: &dyn GfxDevice, queue_families: &[u32]) -> GfxResult<GpuResource> {
        let TextureSource::Raw { extent, format, .. } = &self.source else {
            return Err(truvis_gfx::GfxError::InvalidUsage(format!("texture `{}` was not prepared", self.name)));
        };
        let image = device.create_image(&GfxImageDesc {
            name: self.name.clone(),
            extent: Self::extent_3d(*extent),
            format: *format,
            usage: self.usage | vk::ImageUsageFlags::TRANSFER_DST,
            queue_families: queue_families.to_vec(),
        })?;
        Ok(GpuResource::Image(image))
    }

    fn write_data_to_stage(&self, device: &dyn GfxDevice, staging: GfxBuffer) -> GfxResult<()> {
        let TextureSource::Raw { pixels, .. } = &self.source else {
            return Err(truvis_gfx::GfxError::InvalidUsage(format!("texture `{}` was not prepared", self.name)));
        };
        let mut mapped = GfxMappedBuffer::map(device, staging)?;
        mapped.write_bytes(0, pixels)?;
        mapped.unmap()
    }

    fn copy_staging_to_final(&self, recorder: &GfxCommandRecorder, staging: GfxBuffer, target: &GpuResource) {
        let GpuResource::Image(image) = target else {
            log::error!("texture upload `{}` targets a buffer", self.name);
            return;
        };

        // 整张图都会被覆盖，因此从 UNDEFINED 开始转换
        recorder.image_memory_barrier(&[GfxImageBarrier::new()
            .image(image.handle)
            .image_aspect_flag(vk::ImageAspectFlags::COLOR)
            .layout_transfer(vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_mask(vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE)
            .dst_mask(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE)]);

        recorder.copy_buffer_to_image(
            staging.handle,
            image.handle,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: image.extent,
            }],
        );

        recorder.image_memory_barrier(&[GfxImageBarrier::new()
            .image(image.handle)
            .image_aspect_flag(vk::ImageAspectFlags::COLOR)
            .layout_transfer(vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .src_mask(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE)
            .dst_mask(vk::PipelineStageFlags2::ALL_COMMANDS, vk::AccessFlags2::SHADER_READ)]);
    }

    fn check_update(&self, handle: Handle, existing: &GpuResource) -> Result<(), PreconditionError> {
        let GpuResource::Image(image) = existing else {
            return Err(PreconditionError::RequestKindMismatch {
                handle,
                expected: "texture",
            });
        };
        let capacity = image_byte_size(image.extent, image.format).unwrap_or(0);
        let same_shape = match &self.source {
            TextureSource::Raw { extent, format, .. } => {
                Self::extent_3d(*extent) == image.extent && *format == image.format
            }
            TextureSource::Encoded(_) => false,
        };
        if !same_shape {
            return Err(PreconditionError::UpdateTooLarge {
                handle,
                size: self.data_size(),
                capacity,
            });
        }
        Ok(())
    }

    /// 没有 prep 的 encoded 纹理还不知道尺寸
    fn planned_resource(&self) -> Option<GpuResource> {
        let TextureSource::Raw { extent, format, .. } = &self.source else {
            return None;
        };
        Some(GpuResource::Image(GfxImage {
            handle: vk::Image::null(),
            extent: Self::extent_3d(*extent),
            format: *format,
            usage: self.usage | vk::ImageUsageFlags::TRANSFER_DST,
        }))
    }
}

/// 提交给 [`crate::render_resource_manager::RenderResourceManager`] 的上传请求
pub enum TransferRequest {
    Buffer(BufferUpload),
    Texture(TextureUpload),
}

impl TransferRequest {
    /// 错误信息中使用的名称
    #[inline]
    pub fn kind_name(&self) -> &'static str {
        match self {
            TransferRequest::Buffer(_) => "buffer",
            TransferRequest::Texture(_) => "texture",
        }
    }

    #[inline]
    pub fn category(&self) -> ResourceCategory {
        match self {
            TransferRequest::Buffer(_) => ResourceCategory::Buffer,
            TransferRequest::Texture(_) => ResourceCategory::Texture,
        }
    }

    #[inline]
    fn recipe(&self) -> &dyn TransferRecipe {
        match self {
            TransferRequest::Buffer(upload) => upload,
            TransferRequest::Texture(upload) => upload,
        }
    }
}

impl From<BufferUpload> for TransferRequest {
    fn from(upload: BufferUpload) -> Self {
        TransferRequest::Buffer(upload)
    }
}

impl From<TextureUpload> for TransferRequest {
    fn from(upload: TextureUpload) -> Self {
        TransferRequest::Texture(upload)
    }
}

impl TransferRecipe for TransferRequest {
    fn name(&self) -> &str {
        self.recipe().name()
    }

    fn prep(&mut self) -> Result<(), ResourceCreationError> {
        match self {
            TransferRequest::Buffer(upload) => upload.prep(),
            TransferRequest::Texture(upload) => upload.prep(),
        }
    }

    fn data_size(&self) -> vk::DeviceSize {
        self.recipe().data_size()
    }

    fn create_staging_buffer(&self, device: &dyn GfxDevice) -> GfxResult<GfxBuffer> {
        self.recipe().create_staging_buffer(device)
    }

    fn create_final(&self, device: &dyn GfxDevice, queue_families: &[u32]) -> GfxResult<GpuResource> {
        self.recipe().create_final(device, queue_families)
    }

    fn write_data_to_stage(&self, device: &dyn GfxDevice, staging: GfxBuffer) -> GfxResult<()> {
        self.recipe().write_data_to_stage(device, staging)
    }

    fn copy_staging_to_final(&self, recorder: &GfxCommandRecorder, staging: GfxBuffer, target: &GpuResource) {
        self.recipe().copy_staging_to_final(recorder, staging, target)
    }

    fn check_update(&self, handle: Handle, existing: &GpuResource) -> Result<(), PreconditionError> {
        self.recipe().check_update(handle, existing)
    }

    fn planned_resource(&self) -> Option<GpuResource> {
        self.recipe().planned_resource()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn encode_png(width: u32, height: u32, pixels: Vec<u8>) -> Vec<u8> {
        let rgba = image::RgbaImage::from_raw(width, height, pixels).unwrap();
        let mut bytes = vec![];
        rgba.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png).unwrap();
        bytes
    }

    #[test]
    fn test_buffer_from_pod_slice() {
        let mut upload = BufferUpload::from_slice("indices", &[1u32, 2, 3], vk::BufferUsageFlags::INDEX_BUFFER);
        assert!(upload.prep().is_ok());
        assert_eq!(upload.data_size(), 12);

        let mut empty = BufferUpload::new("empty", vec![], vk::BufferUsageFlags::VERTEX_BUFFER);
        assert!(matches!(empty.prep(), Err(ResourceCreationError::Prep { .. })));
    }

    #[test]
    fn test_png_is_decoded_to_rgba8() {
        let pixels = (0..2 * 3 * 4).map(|i| i as u8).collect::<Vec<_>>();
        let mut upload =
            TextureUpload::encoded("albedo", encode_png(2, 3, pixels.clone()), vk::ImageUsageFlags::SAMPLED);
        upload.prep().unwrap();

        let TextureSource::Raw { extent, format, pixels: decoded } = &upload.source else {
            panic!("texture source is still encoded");
        };
        assert_eq!((extent.width, extent.height), (2, 3));
        assert_eq!(*format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(decoded, &pixels);
        assert_eq!(upload.data_size(), 24);
    }

    #[test]
    fn test_bad_texture_fails_prep() {
        let mut garbage = TextureUpload::encoded("garbage", vec![1, 2, 3], vk::ImageUsageFlags::SAMPLED);
        assert!(matches!(garbage.prep(), Err(ResourceCreationError::Prep { .. })));

        let mut short = TextureUpload::raw(
            "short",
            vk::Extent2D { width: 4, height: 4 },
            vk::Format::R8G8B8A8_UNORM,
            vec![0; 10],
            vk::ImageUsageFlags::SAMPLED,
        );
        assert!(matches!(short.prep(), Err(ResourceCreationError::Prep { .. })));
    }
}
