use std::collections::{HashMap, HashSet, VecDeque};

use ash::vk;

use crate::{
    commands::{
        barrier::{GfxBufferBarrier, GfxImageBarrier},
        submit_info::GfxSemaphoreSubmit,
    },
    device::GfxMemoryLocation,
    headless::device::HeadlessSubmission,
};

pub(super) struct HeadlessBuffer {
    pub name: String,
    pub data: Box<[u8]>,
    pub location: GfxMemoryLocation,
    pub map_count: u32,
}

pub(super) struct HeadlessImage {
    pub name: String,
    pub extent: vk::Extent3D,
    pub texel_size: vk::DeviceSize,
    pub data: Box<[u8]>,
    pub layout: vk::ImageLayout,
}

pub(super) enum HeadlessSemaphore {
    Binary {
        signaled: bool,
        /// 已经提交但还没有执行的 signal
        pending_signal: bool,
        /// 已经提交但还没有执行的 wait
        pending_wait: bool,
    },
    Timeline {
        value: u64,
        /// 已提交的最大 signal 值
        pending_value: u64,
    },
}

#[derive(Default)]
pub(super) struct HeadlessFence {
    pub signaled: bool,
    pub pending: bool,
}

pub(super) struct HeadlessPool {
    pub family_index: u32,
    pub flags: vk::CommandPoolCreateFlags,
    pub command_buffers: Vec<vk::CommandBuffer>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    Pending,
    /// ONE_TIME_SUBMIT 执行完毕之后
    Invalid,
}

pub(super) enum HeadlessCommand {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
    Barrier {
        image_barriers: Vec<GfxImageBarrier>,
        _buffer_barriers: Vec<GfxBufferBarrier>,
    },
}

pub(super) struct HeadlessCommandBuffer {
    pub pool: vk::CommandPool,
    pub name: String,
    pub state: CommandBufferState,
    pub one_time: bool,
    pub commands: Vec<HeadlessCommand>,
}

/// queue 上等待执行的一个批次
pub(super) struct QueueItem {
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub waits: Vec<GfxSemaphoreSubmit>,
    pub signals: Vec<GfxSemaphoreSubmit>,
    pub fence: Option<vk::Fence>,
}

#[derive(Default)]
pub(super) struct HeadlessState {
    pub acquired_queues: HashSet<(u32, u32)>,
    pub buffers: HashMap<vk::Buffer, HeadlessBuffer>,
    pub images: HashMap<vk::Image, HeadlessImage>,
    pub semaphores: HashMap<vk::Semaphore, HeadlessSemaphore>,
    pub fences: HashMap<vk::Fence, HeadlessFence>,
    pub pools: HashMap<vk::CommandPool, HeadlessPool>,
    pub command_buffers: HashMap<vk::CommandBuffer, HeadlessCommandBuffer>,

    /// key: (family, queue index)
    pub queues: HashMap<(u32, u32), VecDeque<QueueItem>>,
    pub paused_families: HashSet<u32>,
    pub failing_allocations: HashSet<String>,

    pub submissions: Vec<HeadlessSubmission>,
    pub validation_errors: Vec<String>,
    pub destroyed_pipelines: usize,
}

impl HeadlessState {
    pub fn report(&mut self, message: String) {
        log::error!("[headless validation] {}", message);
        self.validation_errors.push(message);
    }

    pub fn has_pending_work(&self) -> bool {
        self.queues.values().any(|items| !items.is_empty())
    }

    /// 执行所有可以执行的批次，直到没有进展
    ///
    /// 返回是否执行了至少一个批次
    pub fn pump(&mut self) -> bool {
        let mut any_progress = false;
        loop {
            let mut progress = false;
            let mut keys = self.queues.keys().copied().collect::<Vec<_>>();
            keys.sort_unstable();
            for key in keys {
                if self.paused_families.contains(&key.0) {
                    continue;
                }
                while let Some(item) = self.pop_ready(key) {
                    self.execute(item);
                    progress = true;
                }
            }
            if !progress {
                return any_progress;
            }
            any_progress = true;
        }
    }

    fn pop_ready(&mut self, key: (u32, u32)) -> Option<QueueItem> {
        let front = self.queues.get(&key)?.front()?;
        let ready = front.waits.iter().all(|wait| match self.semaphores.get(&wait.semaphore) {
            Some(HeadlessSemaphore::Binary { signaled, .. }) => *signaled,
            Some(HeadlessSemaphore::Timeline { value, .. }) => *value >= wait.value.unwrap_or_default(),
            // 不存在的 semaphore 在提交时已经报告过，这里直接放行
            None => true,
        });
        if !ready {
            return None;
        }
        self.queues.get_mut(&key)?.pop_front()
    }

    fn execute(&mut self, item: QueueItem) {
        for wait in &item.waits {
            if let Some(HeadlessSemaphore::Binary {
                signaled, pending_wait, ..
            }) = self.semaphores.get_mut(&wait.semaphore)
            {
                *signaled = false;
                *pending_wait = false;
            }
        }

        for cmd in &item.command_buffers {
            let Some(mut command_buffer) = self.command_buffers.remove(cmd) else {
                continue;
            };
            let commands = std::mem::take(&mut command_buffer.commands);
            for command in &commands {
                self.execute_command(&command_buffer.name, command);
            }
            command_buffer.commands = commands;
            command_buffer.state = if command_buffer.one_time {
                CommandBufferState::Invalid
            } else {
                CommandBufferState::Executable
            };
            self.command_buffers.insert(*cmd, command_buffer);
        }

        for signal in &item.signals {
            match self.semaphores.get_mut(&signal.semaphore) {
                Some(HeadlessSemaphore::Binary {
                    signaled,
                    pending_signal,
                    ..
                }) => {
                    *signaled = true;
                    *pending_signal = false;
                }
                Some(HeadlessSemaphore::Timeline { value, .. }) => {
                    *value = (*value).max(signal.value.unwrap_or_default());
                }
                None => {}
            }
        }

        if let Some(fence) = item.fence.and_then(|fence| self.fences.get_mut(&fence)) {
            fence.signaled = true;
            fence.pending = false;
        }
    }

    fn execute_command(&mut self, cmd_name: &str, command: &HeadlessCommand) {
        match command {
            HeadlessCommand::CopyBuffer { src, dst, regions } => {
                for region in regions {
                    let bytes = match self.buffers.get(src) {
                        Some(src_buffer) => {
                            let start = region.src_offset as usize;
                            let end = start + region.size as usize;
                            if end > src_buffer.data.len() {
                                let message = format!(
                                    "`{}`: copy reads {}..{} out of `{}` ({} bytes)",
                                    cmd_name,
                                    start,
                                    end,
                                    src_buffer.name,
                                    src_buffer.data.len()
                                );
                                self.report(message);
                                continue;
                            }
                            src_buffer.data[start..end].to_vec()
                        }
                        None => {
                            self.report(format!("`{}`: copy from destroyed buffer {:?}", cmd_name, src));
                            continue;
                        }
                    };
                    match self.buffers.get_mut(dst) {
                        Some(dst_buffer) => {
                            let start = region.dst_offset as usize;
                            let end = start + bytes.len();
                            if end > dst_buffer.data.len() {
                                let message = format!(
                                    "`{}`: copy writes {}..{} out of `{}` ({} bytes)",
                                    cmd_name,
                                    start,
                                    end,
                                    dst_buffer.name,
                                    dst_buffer.data.len()
                                );
                                self.report(message);
                                continue;
                            }
                            dst_buffer.data[start..end].copy_from_slice(&bytes);
                        }
                        None => self.report(format!("`{}`: copy to destroyed buffer {:?}", cmd_name, dst)),
                    }
                }
            }
            HeadlessCommand::CopyBufferToImage {
                src,
                dst,
                dst_layout,
                regions,
            } => self.copy_buffer_to_image(cmd_name, *src, *dst, *dst_layout, regions),
            HeadlessCommand::Barrier { image_barriers, .. } => {
                for barrier in image_barriers {
                    let Some(image) = self.images.get_mut(&barrier.image) else {
                        self.report(format!("`{}`: barrier on destroyed image {:?}", cmd_name, barrier.image));
                        continue;
                    };
                    if barrier.old_layout != vk::ImageLayout::UNDEFINED && barrier.old_layout != image.layout {
                        let message = format!(
                            "`{}`: barrier expects `{}` in {:?} but it is in {:?}",
                            cmd_name, image.name, barrier.old_layout, image.layout
                        );
                        image.layout = barrier.new_layout;
                        self.report(message);
                        continue;
                    }
                    image.layout = barrier.new_layout;
                }
            }
        }
    }

    fn copy_buffer_to_image(
        &mut self,
        cmd_name: &str,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        let Some(src_buffer) = self.buffers.get(&src) else {
            self.report(format!("`{}`: copy from destroyed buffer {:?}", cmd_name, src));
            return;
        };
        let Some(image) = self.images.get_mut(&dst) else {
            self.report(format!("`{}`: copy to destroyed image {:?}", cmd_name, dst));
            return;
        };

        let mut errors = vec![];
        if dst_layout != image.layout
            || !matches!(dst_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL | vk::ImageLayout::GENERAL)
        {
            errors.push(format!(
                "`{}`: copy to `{}` declared {:?} but the image is in {:?}",
                cmd_name, image.name, dst_layout, image.layout
            ));
        }

        let texel = image.texel_size as usize;
        let (width, height) = (image.extent.width as usize, image.extent.height as usize);
        for region in regions {
            let row_texels = if region.buffer_row_length == 0 {
                region.image_extent.width
            } else {
                region.buffer_row_length
            } as usize;
            let image_height = if region.buffer_image_height == 0 {
                region.image_extent.height
            } else {
                region.buffer_image_height
            } as usize;
            let row_bytes = region.image_extent.width as usize * texel;
            let (ox, oy, oz) = (
                region.image_offset.x as usize,
                region.image_offset.y as usize,
                region.image_offset.z as usize,
            );

            for z in 0..region.image_extent.depth.max(1) as usize {
                for y in 0..region.image_extent.height as usize {
                    let src_start = region.buffer_offset as usize + ((z * image_height + y) * row_texels) * texel;
                    let dst_start = (((z + oz) * height + (y + oy)) * width + ox) * texel;
                    let src_row = src_buffer.data.get(src_start..src_start + row_bytes);
                    let dst_row = image.data.get_mut(dst_start..dst_start + row_bytes);
                    match (src_row, dst_row) {
                        (Some(src_row), Some(dst_row)) => dst_row.copy_from_slice(src_row),
                        _ => {
                            errors.push(format!(
                                "`{}`: buffer to image copy row out of range for `{}`",
                                cmd_name, image.name
                            ));
                        }
                    }
                }
            }
        }

        for error in errors {
            self.report(error);
        }
    }

    pub fn submission_log(&mut self, family_index: u32, queue_index: u32, item: &QueueItem) {
        self.submissions.push(HeadlessSubmission {
            family_index,
            queue_index,
            command_buffers: item.command_buffers.clone(),
            waits: item.waits.clone(),
            signals: item.signals.clone(),
            fence: item.fence,
        });
    }
}
