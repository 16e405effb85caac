use std::{path::PathBuf, sync::Arc, time::Instant};

use anyhow::Context;
use ash::vk;
use truvis_asset::{BufferUpload, TextureUpload, TransferPriority};
use truvis_gfx::{
    GfxDevice, commands::submit_info::GfxSemaphoreSubmit, headless::HeadlessDevice, vulkan::VulkanDevice,
};
use truvis_render_interface::{config::RenderCoreConfig, handles::Handle};
use truvis_renderer::{CommandBufferRequest, QueueType, RenderContext, SubmitPhase};

/// 每隔多少帧做一次 vertex buffer 的回读
const SNAPSHOT_INTERVAL: u64 = 30;
const LOG_INTERVAL: u64 = 20;
const CHECKER_SIZE: u32 = 64;

#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    pos: [f32; 3],
    color: [f32; 3],
}

const TRIANGLE: [Vertex; 3] = [
    Vertex {
        pos: [-1.0, 1.0, 0.0],
        color: [1.0, 0.0, 0.0],
    },
    Vertex {
        pos: [1.0, 1.0, 0.0],
        color: [0.0, 1.0, 0.0],
    },
    Vertex {
        pos: [0.0, -1.0, 0.0],
        color: [0.0, 0.0, 1.0],
    },
];

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
struct FrameUniform {
    time_s: f32,
    frame_id: u32,
    _padding: [u32; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Headless,
    Vulkan,
}

/// 命令行参数
///
/// `headless [--config <path>] [--frames <n>] [--vulkan]`
#[derive(Debug, Clone)]
pub struct AppArgs {
    pub config: Option<PathBuf>,
    pub frames: u64,
    pub backend: Backend,
}

impl AppArgs {
    pub fn parse(args: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let mut parsed = Self {
            config: None,
            frames: 120,
            backend: Backend::Headless,
        };

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    parsed.config = Some(args.next().context("--config 缺少路径")?.into());
                }
                "--frames" => {
                    let frames = args.next().context("--frames 缺少帧数")?;
                    parsed.frames = frames.parse().with_context(|| format!("无效的帧数: {}", frames))?;
                }
                "--vulkan" => parsed.backend = Backend::Vulkan,
                other => anyhow::bail!("未知参数: {}", other),
            }
        }
        Ok(parsed)
    }
}

fn checkerboard(size: u32) -> Vec<u8> {
    (0..size * size)
        .flat_map(|idx| {
            let (x, y) = (idx % size, idx / size);
            if (x / 8 + y / 8) % 2 == 0 { [255, 255, 255, 255] } else { [32, 32, 32, 255] }
        })
        .collect()
}

pub struct HeadlessApp {
    context: RenderContext,

    frame_uniform: Handle,
    checkerboard: Option<Handle>,
    /// dynamic 的回读请求
    snapshot: Handle,
    /// 回读之前需要等待的上传
    snapshot_waits: Vec<GfxSemaphoreSubmit>,

    start: Instant,
}

// new & init
impl HeadlessApp {
    pub fn new(args: &AppArgs) -> anyhow::Result<Self> {
        let config = match &args.config {
            Some(path) => RenderCoreConfig::load(path)?,
            None => RenderCoreConfig::default(),
        };
        let device: Arc<dyn GfxDevice> = match args.backend {
            Backend::Headless => Arc::new(HeadlessDevice::new()),
            Backend::Vulkan => Arc::new(VulkanDevice::new("truvis-headless")?),
        };
        let mut context = RenderContext::new(device, config)?;

        let rm = context.resource_manager_mut();
        let vertices = rm.add_request(
            BufferUpload::from_slice(
                "triangle-vertices",
                &TRIANGLE,
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
            ),
            TransferPriority::High,
        )?;
        let readback = rm.add_request(
            BufferUpload::new("vertex-readback", vec![0; size_of_val(&TRIANGLE)], vk::BufferUsageFlags::STORAGE_BUFFER),
            TransferPriority::Standard,
        )?;
        let checkerboard = rm.add_request(
            TextureUpload::raw(
                "checkerboard",
                vk::Extent2D {
                    width: CHECKER_SIZE,
                    height: CHECKER_SIZE,
                },
                vk::Format::R8G8B8A8_UNORM,
                checkerboard(CHECKER_SIZE),
                vk::ImageUsageFlags::SAMPLED,
            ),
            TransferPriority::Standard,
        )?;
        let frame_uniform = rm.add_request(
            BufferUpload::from_slice("frame-uniform", &[FrameUniform::default()], vk::BufferUsageFlags::UNIFORM_BUFFER),
            TransferPriority::High,
        )?;

        for handle in [vertices, readback, checkerboard, frame_uniform] {
            rm.wait_for_ready(handle)?;
        }
        let vertex_buffer = rm.get_buffer(vertices)?;
        let readback_buffer = rm.get_buffer(readback)?;
        let snapshot_waits = [vertices, readback]
            .into_iter()
            .map(|handle| rm.gpu_wait(handle))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .collect();
        log::info!("initial uploads ready: {:?}", rm.stats());

        let cbm = context.command_buffer_manager_mut();
        cbm.register_command_buffer(CommandBufferRequest::new(
            "frame-begin",
            QueueType::Graphics,
            SubmitPhase::BeforeRenderPass,
            |_recorder, slot| {
                log::trace!("[{}] frame-begin", slot);
                Ok(())
            },
        ))?;
        for (sub_order, name) in ["opaque", "transparent"].into_iter().enumerate() {
            cbm.register_command_buffer(
                CommandBufferRequest::new(name, QueueType::Graphics, SubmitPhase::MainRenderPass, move |_recorder, slot| {
                    log::trace!("[{}] {}", slot, name);
                    Ok(())
                })
                .sub_order(sub_order as u32),
            )?;
        }
        cbm.register_command_buffer(CommandBufferRequest::new(
            "particles",
            QueueType::Compute,
            SubmitPhase::MainRenderPass,
            |_recorder, slot| {
                log::trace!("[{}] particles", slot);
                Ok(())
            },
        ))?;
        let snapshot = cbm.register_command_buffer(
            CommandBufferRequest::new("vertex-snapshot", QueueType::Transfer, SubmitPhase::EndOfFrame, move |recorder, _slot| {
                recorder.copy_buffer(
                    vertex_buffer.handle,
                    readback_buffer.handle,
                    &[vk::BufferCopy {
                        src_offset: 0,
                        dst_offset: 0,
                        size: vertex_buffer.size.min(readback_buffer.size),
                    }],
                );
                Ok(())
            })
            .dynamic(),
        )?;
        cbm.register_command_buffer(
            CommandBufferRequest::new("present", QueueType::Present, SubmitPhase::EndOfFrame, |_recorder, slot| {
                log::debug!("[{}] record present once", slot);
                Ok(())
            })
            .record_once(),
        )?;

        Ok(Self {
            context,
            frame_uniform,
            checkerboard: Some(checkerboard),
            snapshot,
            snapshot_waits,
            start: Instant::now(),
        })
    }

    pub fn destroy(self) {
        let cbm = self.context.command_buffer_manager();
        log::info!(
            "{} command buffers registered, {} groups failed in total",
            cbm.registered_count(),
            cbm.total_failures()
        );
        self.context.destroy();
    }
}

// update
impl HeadlessApp {
    pub fn run(&mut self, frames: u64) -> anyhow::Result<()> {
        for _ in 0..frames {
            let frame_id = self.context.frame_counter().frame_id();
            self.update_frame_uniform(frame_id)?;

            if frame_id % SNAPSHOT_INTERVAL == 0 {
                let cbm = self.context.command_buffer_manager_mut();
                for wait in &self.snapshot_waits {
                    cbm.add_wait_semaphore(self.snapshot, *wait)?;
                }
                cbm.submit_dynamic_buffer(self.snapshot)?;
            }
            // 中途释放一个 texture，之后由 resource manager 延迟销毁
            if frame_id == frames / 2 {
                if let Some(checkerboard) = self.checkerboard.take() {
                    self.context.resource_manager_mut().release(checkerboard)?;
                }
            }

            let stats = self.context.tick()?;
            if stats.frame_id % LOG_INTERVAL == 0 {
                log::info!(
                    "[F{}-{}] groups: {}, command buffers: {} submitted / {} recorded, resources: {:?}",
                    stats.frame_id,
                    stats.submit.frame_slot,
                    stats.submit.groups_submitted,
                    stats.submit.command_buffers_submitted,
                    stats.submit.command_buffers_recorded,
                    stats.resources
                );
            }
        }
        Ok(())
    }

    fn update_frame_uniform(&mut self, frame_id: u64) -> anyhow::Result<()> {
        let uniform = FrameUniform {
            time_s: self.start.elapsed().as_secs_f32(),
            frame_id: frame_id as u32,
            ..Default::default()
        };
        self.context.resource_manager_mut().update_request(
            self.frame_uniform,
            BufferUpload::from_slice("frame-uniform", &[uniform], vk::BufferUsageFlags::UNIFORM_BUFFER),
            TransferPriority::High,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> anyhow::Result<AppArgs> {
        AppArgs::parse(list.iter().map(|arg| arg.to_string()))
    }

    #[test]
    fn test_parse_args() {
        let parsed = args(&["--frames", "8", "--config", "render.toml"]).unwrap();
        assert_eq!(parsed.frames, 8);
        assert_eq!(parsed.config, Some(PathBuf::from("render.toml")));
        assert_eq!(parsed.backend, Backend::Headless);

        assert!(args(&["--frames", "many"]).is_err());
        assert!(args(&["--fullscreen"]).is_err());
    }

    #[test]
    fn test_run_headless_frames() {
        truvis_crate_tools::init_log::init_test_log();
        let parsed = args(&["--frames", "64"]).unwrap();
        let mut app = HeadlessApp::new(&parsed).unwrap();
        app.run(parsed.frames).unwrap();
        assert_eq!(app.context.frame_counter().frame_id(), 64);
        assert_eq!(app.context.command_buffer_manager().total_failures(), 0);
        app.destroy();
    }
}
