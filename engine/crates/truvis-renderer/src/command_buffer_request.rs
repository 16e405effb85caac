use std::fmt;

use truvis_gfx::commands::recorder::GfxCommandRecorder;

/// 提交到哪一类 queue
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueType {
    Graphics,
    Compute,
    Transfer,
    Present,
}

impl QueueType {
    /// 每帧处理的顺序
    pub const ALL: [QueueType; 4] = [QueueType::Graphics, QueueType::Compute, QueueType::Transfer, QueueType::Present];
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueType::Graphics => "graphics",
            QueueType::Compute => "compute",
            QueueType::Transfer => "transfer",
            QueueType::Present => "present",
        };
        f.write_str(name)
    }
}

/// 一帧内的提交阶段，按照声明的顺序执行
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubmitPhase {
    BeforeRenderPass,
    MainRenderPass,
    AfterRenderPass,
    EndOfFrame,
}

impl SubmitPhase {
    pub const ALL: [SubmitPhase; 4] = [
        SubmitPhase::BeforeRenderPass,
        SubmitPhase::MainRenderPass,
        SubmitPhase::AfterRenderPass,
        SubmitPhase::EndOfFrame,
    ];
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitMode {
    /// 每帧都录制并提交
    Standard,
    /// 只在通过 `submit_dynamic_buffer` 标记的那一帧提交
    Dynamic,
}

/// 录制回调，参数为正在录制的 command buffer 和 frame in flight 的 slot
pub type RecordCallback = Box<dyn FnMut(&GfxCommandRecorder, usize) -> anyhow::Result<()>>;

/// 向 CommandBufferManager 注册的一次提交请求
pub struct CommandBufferRequest {
    pub name: String,
    pub queue_type: QueueType,
    pub phase: SubmitPhase,
    /// 同一个 phase 内按照 sub_order 从小到大录制
    pub sub_order: u32,
    pub mode: SubmitMode,
    /// 每个 slot 只录制一次，之后直接重复提交
    pub record_once: bool,
    pub record: RecordCallback,
}

impl CommandBufferRequest {
    pub fn new(
        name: impl Into<String>,
        queue_type: QueueType,
        phase: SubmitPhase,
        record: impl FnMut(&GfxCommandRecorder, usize) -> anyhow::Result<()> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            queue_type,
            phase,
            sub_order: 0,
            mode: SubmitMode::Standard,
            record_once: false,
            record: Box::new(record),
        }
    }

    /// builder
    #[inline]
    pub fn sub_order(mut self, sub_order: u32) -> Self {
        self.sub_order = sub_order;
        self
    }

    /// builder
    #[inline]
    pub fn dynamic(mut self) -> Self {
        self.mode = SubmitMode::Dynamic;
        self
    }

    /// builder
    #[inline]
    pub fn record_once(mut self) -> Self {
        self.record_once = true;
        self
    }
}

impl fmt::Debug for CommandBufferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBufferRequest")
            .field("name", &self.name)
            .field("queue_type", &self.queue_type)
            .field("phase", &self.phase)
            .field("sub_order", &self.sub_order)
            .field("mode", &self.mode)
            .field("record_once", &self.record_once)
            .finish_non_exhaustive()
    }
}
