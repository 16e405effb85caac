use std::sync::{
    Arc, Condvar, Mutex, OnceLock, PoisonError,
    atomic::{AtomicU8, Ordering},
};

use ash::vk;
use truvis_render_interface::errors::ResourceCreationError;

use crate::transfer_request::GpuResource;

/// 一次上传的状态
///
/// 只会沿着 `Pending -> Submitted -> Complete` 前进，任意非终止状态都可以进入 `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferState {
    /// 在 worker 的队列中
    Pending = 0,
    /// 已经提交到 transfer queue
    Submitted = 1,
    Complete = 2,
    Failed = 3,
}

impl TransferState {
    #[inline]
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TransferState::Pending,
            1 => TransferState::Submitted,
            2 => TransferState::Complete,
            _ => TransferState::Failed,
        }
    }

    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Complete | TransferState::Failed)
    }
}

/// worker 线程和主线程之间共享的完成信号
///
/// 由 worker 写入，主线程读取。资源和错误都只会写入一次，
/// 状态在写入之后才会发布，因此看到 `Submitted` 之后一定能读到资源。
pub struct TransferSignal {
    state: AtomicU8,
    resource: OnceLock<GpuResource>,
    error: OnceLock<ResourceCreationError>,
    /// 上传完成时 signal 的 timeline semaphore 和值
    gpu_wait: OnceLock<(vk::Semaphore, u64)>,

    lock: Mutex<()>,
    cond: Condvar,
}

// new & init
impl TransferSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(TransferState::Pending as u8),
            resource: OnceLock::new(),
            error: OnceLock::new(),
            gpu_wait: OnceLock::new(),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        })
    }
}

// getters
impl TransferSignal {
    #[inline]
    pub fn state(&self) -> TransferState {
        TransferState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// 最终资源，在 `Submitted` 之后可用
    #[inline]
    pub fn resource(&self) -> Option<&GpuResource> {
        self.resource.get()
    }

    #[inline]
    pub fn error(&self) -> Option<&ResourceCreationError> {
        self.error.get()
    }

    #[inline]
    pub fn gpu_wait(&self) -> Option<(vk::Semaphore, u64)> {
        self.gpu_wait.get().copied()
    }
}

// worker 侧
impl TransferSignal {
    pub(crate) fn publish_submitted(&self, resource: GpuResource, semaphore: vk::Semaphore, value: u64) {
        let _ = self.resource.set(resource);
        let _ = self.gpu_wait.set((semaphore, value));
        self.publish(TransferState::Submitted);
    }

    pub(crate) fn publish_complete(&self) {
        self.publish(TransferState::Complete);
    }

    pub(crate) fn publish_failed(&self, error: ResourceCreationError) {
        let _ = self.error.set(error);
        self.publish(TransferState::Failed);
    }

    fn publish(&self, state: TransferState) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.state.store(state as u8, Ordering::Release);
        self.cond.notify_all();
    }
}

// 等待
impl TransferSignal {
    /// 阻塞直到进入终止状态
    pub fn wait(&self) -> TransferState {
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let state = self.state();
            if state.is_terminal() {
                return state;
            }
            guard = self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use truvis_gfx::device::GfxBuffer;

    use super::*;

    #[test]
    fn test_wait_wakes_on_complete() {
        let signal = TransferSignal::new();
        let buffer = GfxBuffer {
            handle: vk::Buffer::null(),
            size: 16,
            usage: vk::BufferUsageFlags::VERTEX_BUFFER,
        };

        let worker_signal = signal.clone();
        let worker = thread::spawn(move || {
            worker_signal.publish_submitted(GpuResource::Buffer(buffer), vk::Semaphore::null(), 7);
            worker_signal.publish_complete();
        });

        assert_eq!(signal.wait(), TransferState::Complete);
        worker.join().unwrap();
        assert_eq!(signal.resource(), Some(&GpuResource::Buffer(buffer)));
        assert_eq!(signal.gpu_wait(), Some((vk::Semaphore::null(), 7)));
    }

    #[test]
    fn test_failed_keeps_error() {
        let signal = TransferSignal::new();
        assert!(!signal.is_terminal());
        signal.publish_failed(ResourceCreationError::WorkerStopped { name: "mesh".to_string() });

        assert_eq!(signal.wait(), TransferState::Failed);
        assert!(signal.resource().is_none());
        assert!(matches!(signal.error(), Some(ResourceCreationError::WorkerStopped { .. })));
    }
}
