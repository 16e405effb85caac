use std::ffi::{CStr, CString};

use ash::vk;
use itertools::Itertools;

use crate::{
    commands::queue::GfxQueueFamily,
    error::{GfxError, GfxResult},
};

pub(super) const ENGINE_NAME: &str = "Truvis";

/// 创建 instance；如果驱动支持 debug utils，会一并启用
pub(super) fn create_instance(entry: &ash::Entry, app_name: &str) -> GfxResult<(ash::Instance, bool)> {
    let _span = truvis_crate_tools::profile_span!("VulkanDevice::create_instance");

    let app_name = CString::new(app_name).map_err(|e| GfxError::Loader(e.to_string()))?;
    let engine_name = CString::new(ENGINE_NAME).map_err(|e| GfxError::Loader(e.to_string()))?;
    let app_info = vk::ApplicationInfo::default()
        .application_name(app_name.as_c_str())
        .application_version(vk::make_api_version(0, 1, 0, 0))
        .engine_name(engine_name.as_c_str())
        .engine_version(vk::make_api_version(0, 1, 0, 0))
        .api_version(vk::API_VERSION_1_3);

    let available_exts = unsafe { entry.enumerate_instance_extension_properties(None)? };
    let debug_utils = available_exts.iter().any(|ext| {
        let name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
        name == ash::ext::debug_utils::NAME
    });

    let exts = if debug_utils {
        vec![ash::ext::debug_utils::NAME.as_ptr()]
    } else {
        vec![]
    };
    log::info!("instance exts: debug_utils = {}", debug_utils);

    let instance_ci = vk::InstanceCreateInfo::default().application_info(&app_info).enabled_extension_names(&exts);
    let instance = unsafe { entry.create_instance(&instance_ci, None)? };
    Ok((instance, debug_utils))
}

/// 优先选择独立显卡，如果没有则选择第一个支持 vulkan 1.3 的显卡
pub(super) fn pick_physical_device(instance: &ash::Instance) -> GfxResult<(vk::PhysicalDevice, String)> {
    let pdevices = unsafe { instance.enumerate_physical_devices()? };
    let candidates = pdevices
        .into_iter()
        .map(|pdevice| {
            let props = unsafe { instance.get_physical_device_properties(pdevice) };
            (pdevice, props)
        })
        .filter(|(_, props)| props.api_version >= vk::API_VERSION_1_3)
        .collect_vec();

    let (pdevice, props) = candidates
        .iter()
        // 优先使用独立显卡
        .find_or_first(|(_, props)| props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU)
        .ok_or_else(|| GfxError::Loader("no physical device supports vulkan 1.3".to_string()))?;

    let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy().into_owned();
    log::info!("found gpu: {}", name);
    Ok((*pdevice, name))
}

/// 收集所有 queue family 的信息
///
/// 不依赖 surface，因此假设支持 graphics 的 family 都可以 present
pub(super) fn query_queue_families(instance: &ash::Instance, pdevice: vk::PhysicalDevice) -> Vec<GfxQueueFamily> {
    let props = unsafe { instance.get_physical_device_queue_family_properties(pdevice) };
    log::info!("physical device: queue family props:\n{:#?}", props);

    props
        .iter()
        .enumerate()
        .map(|(family_idx, props)| {
            let flags = props.queue_flags;
            let name = if flags.contains(vk::QueueFlags::GRAPHICS) {
                "gfx"
            } else if flags.contains(vk::QueueFlags::COMPUTE) {
                "compute"
            } else if flags.contains(vk::QueueFlags::TRANSFER) {
                "transfer"
            } else {
                "other"
            };
            GfxQueueFamily {
                name: format!("{}-{}", name, family_idx),
                queue_family_index: family_idx as u32,
                queue_flags: flags,
                queue_count: props.queue_count,
                supports_present: flags.contains(vk::QueueFlags::GRAPHICS),
            }
        })
        .collect()
}

/// 创建逻辑设备，申请所有 family 的所有 queue
///
/// 需要的 features：timeline semaphore 和 synchronization2
pub(super) fn create_device(
    instance: &ash::Instance,
    pdevice: vk::PhysicalDevice,
    families: &[GfxQueueFamily],
) -> GfxResult<ash::Device> {
    let _span = truvis_crate_tools::profile_span!("VulkanDevice::create_device");

    let priorities = families.iter().map(|family| vec![1.0_f32; family.queue_count as usize]).collect_vec();
    let queue_cis = families
        .iter()
        .zip(priorities.iter())
        .filter(|(family, _)| family.queue_count > 0)
        .map(|(family, priorities)| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family.queue_family_index)
                .queue_priorities(priorities)
        })
        .collect_vec();

    let mut vk12_features = vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);
    let mut vk13_features = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);
    let mut features2 =
        vk::PhysicalDeviceFeatures2::default().push_next(&mut vk12_features).push_next(&mut vk13_features);

    let device_ci = vk::DeviceCreateInfo::default().queue_create_infos(&queue_cis).push_next(&mut features2);
    let device = unsafe { instance.create_device(pdevice, &device_ci, None)? };
    Ok(device)
}
