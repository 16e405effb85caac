use std::{collections::VecDeque, sync::Arc};

use ash::vk;
use truvis_gfx::{GfxDevice, commands::submit_info::GfxSemaphoreSubmit, device::GfxSemaphoreKind};
use truvis_render_interface::{errors::ResourceCreationError, handles::Handle, resource_store::StoreRecord};

use crate::{
    transfer_request::{GpuResource, TransferRecipe, TransferRequest},
    transfer_signal::{TransferSignal, TransferState},
    transfer_worker::{DispatchError, InterThreadRequest, TransferPriority, TransferWorker},
};

/// 对外可见的资源状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStatus {
    /// 等待发送给 worker，或者在 worker 的队列中
    Queued,
    /// 拷贝已经提交到 GPU
    Uploading,
    Ready,
    Failed,
}

pub(crate) struct PendingTransfer {
    pub request: TransferRequest,
    pub priority: TransferPriority,
}

/// buffer 和 texture 的记录
///
/// 同一个记录同时最多只有一次上传在进行中，之后的更新在 `pending` 中排队，
/// 保证按照提交的顺序写入。
pub(crate) struct TransferRecord {
    pub name: String,
    /// 固定使用的 worker 线程
    pub thread_index: usize,
    pub current: Option<Arc<TransferSignal>>,
    pub pending: VecDeque<PendingTransfer>,
    pub final_resource: Option<GpuResource>,
    /// 第一次上传将会创建的资源，`final_resource` 出现之前用于检查更新
    pub planned: Option<GpuResource>,
    pub last_gpu_wait: Option<(vk::Semaphore, u64)>,
    pub failure: Option<ResourceCreationError>,
}

// new & init
impl TransferRecord {
    pub fn new(name: impl Into<String>, thread_index: usize, planned: Option<GpuResource>) -> Self {
        Self {
            name: name.into(),
            thread_index,
            current: None,
            pending: VecDeque::new(),
            final_resource: None,
            planned,
            last_gpu_wait: None,
            failure: None,
        }
    }
}

// getters
impl TransferRecord {
    pub fn status(&self) -> ResourceStatus {
        if let Some(signal) = &self.current {
            return match signal.state() {
                TransferState::Pending => ResourceStatus::Queued,
                TransferState::Submitted => ResourceStatus::Uploading,
                TransferState::Complete if self.pending.is_empty() => ResourceStatus::Ready,
                TransferState::Complete => ResourceStatus::Queued,
                TransferState::Failed => ResourceStatus::Failed,
            };
        }
        if !self.pending.is_empty() {
            ResourceStatus::Queued
        } else if self.failure.is_some() {
            ResourceStatus::Failed
        } else if self.final_resource.is_some() {
            ResourceStatus::Ready
        } else {
            ResourceStatus::Queued
        }
    }

    /// ready 时的最终资源
    pub fn ready_resource(&self) -> Option<GpuResource> {
        if !self.is_ready() {
            return None;
        }
        self.current.as_ref().and_then(|signal| signal.resource().copied()).or(self.final_resource)
    }

    /// 最近一次上传完成时 signal 的 timeline semaphore
    pub fn gpu_wait(&self) -> Option<GfxSemaphoreSubmit> {
        self.current
            .as_ref()
            .and_then(|signal| signal.gpu_wait())
            .or(self.last_gpu_wait)
            .map(|(semaphore, value)| GfxSemaphoreSubmit::timeline(semaphore, vk::PipelineStageFlags2::ALL_COMMANDS, value))
    }

    /// 没有上传在进行中，也不会再有新的上传
    pub fn settled_failure(&self) -> Option<&ResourceCreationError> {
        if self.current.is_none() && self.pending.is_empty() { self.failure.as_ref() } else { None }
    }

    /// 更新需要写入的资源：已经创建的，或者第一次上传将要创建的
    pub fn update_target(&self) -> Option<GpuResource> {
        self.final_resource.or(self.planned)
    }

    /// 没有在 worker 或 GPU 上进行中的上传，可以安全销毁
    pub fn is_settled(&self) -> bool {
        self.current.as_ref().is_none_or(|signal| signal.is_terminal())
    }
}

// tools
impl TransferRecord {
    /// 将已经结束的上传的结果合并到记录中
    pub fn harvest(&mut self) {
        let Some(signal) = &self.current else {
            return;
        };
        match signal.state() {
            TransferState::Complete => {
                if let Some(resource) = signal.resource() {
                    self.final_resource = Some(*resource);
                }
                self.last_gpu_wait = signal.gpu_wait();
                self.failure = None;
                self.current = None;
            }
            TransferState::Failed => {
                self.failure = signal.error().cloned();
                self.current = None;
            }
            TransferState::Pending | TransferState::Submitted => {}
        }
    }

    /// 上一次上传结束后，将下一个排队的请求发送给 worker
    ///
    /// worker 的队列已满时请求留在 `pending` 中，下次再试
    pub fn pump(&mut self, handle: Handle, worker: &TransferWorker, consumer_families: &[u32]) {
        self.harvest();
        if self.current.is_some() {
            return;
        }

        while let Some(PendingTransfer { request, priority }) = self.pending.pop_front() {
            if let Some(existing) = &self.final_resource {
                if let Err(e) = request.check_update(handle, existing) {
                    log::error!("drop update of {} `{}`: {}", handle, self.name, e);
                    self.failure = Some(ResourceCreationError::UpdateRejected {
                        name: self.name.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            }

            let mut queue_families = consumer_families.to_vec();
            queue_families.extend(worker.family_index(self.thread_index));
            let signal = TransferSignal::new();
            let message = InterThreadRequest {
                id: worker.next_request_id(),
                request,
                existing: self.final_resource,
                queue_families,
                signal: signal.clone(),
            };

            match worker.dispatch(self.thread_index, priority, message) {
                Ok(()) => {
                    self.current = Some(signal);
                    return;
                }
                Err(DispatchError::Full(message)) => {
                    self.pending.push_front(PendingTransfer {
                        request: message.request,
                        priority,
                    });
                    return;
                }
                Err(DispatchError::Stopped(message)) => {
                    log::error!("transfer worker stopped, drop request #{} of {} `{}`", message.id, handle, self.name);
                    self.failure = Some(ResourceCreationError::WorkerStopped { name: self.name.clone() });
                }
            }
        }
    }
}

impl StoreRecord for TransferRecord {
    fn is_ready(&self) -> bool {
        if !self.pending.is_empty() {
            return false;
        }
        match &self.current {
            Some(signal) => signal.state() == TransferState::Complete,
            None => self.failure.is_none() && self.final_resource.is_some(),
        }
    }

    fn cleanup(&mut self, device: &dyn GfxDevice) {
        self.harvest();
        if self.current.is_some() {
            log::error!("cleanup `{}` while its upload is still in flight", self.name);
            return;
        }
        self.pending.clear();
        if let Some(resource) = self.final_resource.take() {
            resource.destroy(device);
        }
    }
}

pub(crate) struct SemaphoreRecord {
    pub name: String,
    pub semaphore: vk::Semaphore,
    pub kind: GfxSemaphoreKind,
}

impl StoreRecord for SemaphoreRecord {
    fn is_ready(&self) -> bool {
        true
    }

    fn cleanup(&mut self, device: &dyn GfxDevice) {
        log::debug!("destroy semaphore `{}` ({:?})", self.name, self.kind);
        device.destroy_semaphore(self.semaphore);
    }
}

/// 外部创建的 pipeline，由 manager 负责销毁
pub(crate) struct PipelineRecord {
    pub name: String,
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl StoreRecord for PipelineRecord {
    fn is_ready(&self) -> bool {
        true
    }

    fn cleanup(&mut self, device: &dyn GfxDevice) {
        log::debug!("destroy pipeline `{}`", self.name);
        device.destroy_pipeline(self.pipeline, self.layout);
    }
}

/// 已经释放 Handle，等待 GPU 不再使用后销毁的记录
pub(crate) enum DeferredRecord {
    Transfer(TransferRecord),
    Semaphore(SemaphoreRecord),
    Pipeline(PipelineRecord),
}

impl DeferredRecord {
    pub fn is_settled(&self) -> bool {
        match self {
            DeferredRecord::Transfer(record) => record.is_settled(),
            DeferredRecord::Semaphore(_) | DeferredRecord::Pipeline(_) => true,
        }
    }

    pub fn cleanup(&mut self, device: &dyn GfxDevice) {
        match self {
            DeferredRecord::Transfer(record) => record.cleanup(device),
            DeferredRecord::Semaphore(record) => record.cleanup(device),
            DeferredRecord::Pipeline(record) => record.cleanup(device),
        }
    }
}

pub(crate) struct DeferredRelease {
    pub handle: Handle,
    /// 释放时的 frame id
    pub released_at: u64,
    pub record: DeferredRecord,
}
