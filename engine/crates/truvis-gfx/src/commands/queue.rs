use std::collections::HashSet;

use ash::vk;

#[derive(Clone, Debug)]
pub struct GfxQueueFamily {
    pub name: String,
    pub queue_family_index: u32,
    pub queue_flags: vk::QueueFlags,
    pub queue_count: u32,
    pub supports_present: bool,
}

impl GfxQueueFamily {
    #[inline]
    pub fn supports_graphics(&self) -> bool {
        self.queue_flags.contains(vk::QueueFlags::GRAPHICS)
    }

    #[inline]
    pub fn supports_compute(&self) -> bool {
        self.queue_flags.contains(vk::QueueFlags::COMPUTE)
    }

    /// graphics 和 compute queue 隐式支持 transfer
    #[inline]
    pub fn supports_transfer(&self) -> bool {
        self.queue_flags.intersects(vk::QueueFlags::TRANSFER | vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
    }
}

/// 一个具体的 queue
///
/// 不实现 Clone：queue 只能被一个线程持有并提交，通过 [`crate::GfxDevice::acquire_queue`] 获取
#[derive(Debug)]
pub struct GfxQueue {
    vk_queue: vk::Queue,
    family: GfxQueueFamily,
    queue_index: u32,
}

impl GfxQueue {
    /// 只应该由 [`crate::GfxDevice`] 的实现调用
    #[inline]
    pub fn new(vk_queue: vk::Queue, family: GfxQueueFamily, queue_index: u32) -> Self {
        Self {
            vk_queue,
            family,
            queue_index,
        }
    }

    #[inline]
    pub fn vk_handle(&self) -> vk::Queue {
        self.vk_queue
    }

    #[inline]
    pub fn queue_family(&self) -> &GfxQueueFamily {
        &self.family
    }

    #[inline]
    pub fn family_index(&self) -> u32 {
        self.family.queue_family_index
    }

    #[inline]
    pub fn queue_index(&self) -> u32 {
        self.queue_index
    }
}

/// 在 queue family 之间挑选空闲 queue 的辅助结构
///
/// 只做规划，真正的获取需要调用 `acquire_queue`
pub struct GfxQueuePlanner<'a> {
    families: &'a [GfxQueueFamily],
    taken: HashSet<(u32, u32)>,
}

impl<'a> GfxQueuePlanner<'a> {
    pub fn new(families: &'a [GfxQueueFamily]) -> Self {
        Self {
            families,
            taken: HashSet::new(),
        }
    }

    /// 找到一个包含 `include` 且不包含 `exclude` 的 family 中的空闲 queue，并标记为已占用
    pub fn take(&mut self, include: vk::QueueFlags, exclude: vk::QueueFlags) -> Option<(u32, u32)> {
        let found = self
            .families
            .iter()
            .filter(|family| family.queue_flags.contains(include) && !family.queue_flags.intersects(exclude))
            .flat_map(|family| (0..family.queue_count).map(move |idx| (family.queue_family_index, idx)))
            .find(|slot| !self.taken.contains(slot))?;
        self.taken.insert(found);
        Some(found)
    }

    /// 依次尝试多组条件，返回第一个满足的
    pub fn take_preferred(&mut self, candidates: &[(vk::QueueFlags, vk::QueueFlags)]) -> Option<(u32, u32)> {
        candidates.iter().find_map(|(include, exclude)| self.take(*include, *exclude))
    }

    /// 第一个支持 present 的 graphics family
    pub fn present_family(&self) -> Option<u32> {
        self.families
            .iter()
            .find(|family| family.supports_present && family.supports_graphics())
            .map(|family| family.queue_family_index)
    }
}
