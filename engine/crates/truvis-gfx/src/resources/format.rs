use ash::vk;

/// 每个 texel 占用的字节数
///
/// 只覆盖上传路径中会用到的非压缩格式，其他格式返回 `None`
pub fn format_texel_size(format: vk::Format) -> Option<vk::DeviceSize> {
    let size = match format {
        vk::Format::R8_UNORM | vk::Format::R8_SRGB | vk::Format::R8_UINT => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT | vk::Format::R16_UINT => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT => 4,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32_SFLOAT => 12,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => return None,
    };
    Some(size)
}

/// image 所有 texel 的总字节数
pub fn image_byte_size(extent: vk::Extent3D, format: vk::Format) -> Option<vk::DeviceSize> {
    let texel = format_texel_size(format)?;
    let depth = extent.depth.max(1) as vk::DeviceSize;
    Some(extent.width as vk::DeviceSize * extent.height as vk::DeviceSize * depth * texel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_byte_size() {
        let extent = vk::Extent3D {
            width: 4,
            height: 2,
            depth: 1,
        };
        assert_eq!(image_byte_size(extent, vk::Format::R8G8B8A8_UNORM), Some(32));
        assert_eq!(image_byte_size(extent, vk::Format::R32G32B32A32_SFLOAT), Some(128));
        assert_eq!(image_byte_size(extent, vk::Format::BC7_UNORM_BLOCK), None);
    }
}
