use ash::vk;

/// 一次 semaphore 的 wait 或 signal 操作
///
/// `value` 为 `None` 表示 binary semaphore
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GfxSemaphoreSubmit {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags2,
    pub value: Option<u64>,
}

impl GfxSemaphoreSubmit {
    #[inline]
    pub fn binary(semaphore: vk::Semaphore, stage: vk::PipelineStageFlags2) -> Self {
        Self {
            semaphore,
            stage,
            value: None,
        }
    }

    #[inline]
    pub fn timeline(semaphore: vk::Semaphore, stage: vk::PipelineStageFlags2, value: u64) -> Self {
        Self {
            semaphore,
            stage,
            value: Some(value),
        }
    }

    #[inline]
    pub fn is_timeline(&self) -> bool {
        self.value.is_some()
    }

    pub fn to_vk(&self) -> vk::SemaphoreSubmitInfo<'static> {
        vk::SemaphoreSubmitInfo::default()
            .semaphore(self.semaphore)
            .stage_mask(self.stage)
            .value(self.value.unwrap_or_default())
    }
}

/// Gfx 关于 submitInfo 的封装，更易用
///
/// 和 `vk::SubmitInfo2` 不同，这里只保存纯数据，可以跨线程传递，
/// 由设备实现在提交时转换
#[derive(Clone, Debug, Default)]
pub struct GfxSubmitInfo {
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub wait_infos: Vec<GfxSemaphoreSubmit>,
    pub signal_infos: Vec<GfxSemaphoreSubmit>,
}

impl GfxSubmitInfo {
    pub fn new(commands: &[vk::CommandBuffer]) -> Self {
        Self {
            command_buffers: commands.to_vec(),
            wait_infos: vec![],
            signal_infos: vec![],
        }
    }

    #[inline]
    pub fn wait(mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags2, value: Option<u64>) -> Self {
        self.wait_infos.push(GfxSemaphoreSubmit {
            semaphore,
            stage,
            value,
        });
        self
    }

    #[inline]
    pub fn signal(mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags2, value: Option<u64>) -> Self {
        self.signal_infos.push(GfxSemaphoreSubmit {
            semaphore,
            stage,
            value,
        });
        self
    }

    #[inline]
    pub fn waits(mut self, waits: impl IntoIterator<Item = GfxSemaphoreSubmit>) -> Self {
        self.wait_infos.extend(waits);
        self
    }

    #[inline]
    pub fn signals(mut self, signals: impl IntoIterator<Item = GfxSemaphoreSubmit>) -> Self {
        self.signal_infos.extend(signals);
        self
    }
}
