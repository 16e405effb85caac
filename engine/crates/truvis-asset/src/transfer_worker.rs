use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
};

use ash::vk;
use crossbeam_channel::{Receiver, Select, Sender, TryRecvError, TrySendError};
use truvis_gfx::{
    GfxDevice, GfxResult,
    commands::{queue::GfxQueue, recorder::GfxCommandRecorder, submit_info::GfxSubmitInfo},
    device::{GfxBuffer, GfxSemaphoreKind},
};
use truvis_render_interface::{
    config::TransferConfig,
    errors::{ResourceCreationError, RenderResult},
};

use crate::{
    transfer_request::{GpuResource, TransferRecipe, TransferRequest},
    transfer_signal::TransferSignal,
    upload_context::{InFlightUpload, UploadContextPool},
};

/// 请求的优先级，worker 总是先处理 High 队列
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferPriority {
    High,
    #[default]
    Standard,
}

/// 发送给 worker 线程的请求
pub struct InterThreadRequest {
    pub id: u64,
    pub request: TransferRequest,
    /// 写入已有的资源，而不是创建新的资源
    pub existing: Option<GpuResource>,
    /// 最终资源会被哪些 queue family 访问
    pub queue_families: Vec<u32>,
    pub signal: Arc<TransferSignal>,
}

pub enum DispatchError {
    /// 队列已满，请求原样返回
    Full(InterThreadRequest),
    /// worker 已经停止
    Stopped(InterThreadRequest),
}

struct WorkerThread {
    family_index: u32,
    high_tx: Option<Sender<InterThreadRequest>>,
    standard_tx: Option<Sender<InterThreadRequest>>,
    join: Option<thread::JoinHandle<()>>,
}

/// 后台上传线程池
///
/// ## 架构设计
/// - 每个线程独占一个 queue，以及自己的 command pool、fence 和 timeline semaphore
/// - 每个线程有 High 和 Standard 两个有界 channel，主线程使用 `try_send`，不会阻塞
/// - 线程循环：回收完成的上传 -> 取请求（High 优先）-> 录制并提交 -> 没有请求时等待
/// - 关闭时先停止接收，然后根据配置执行完或者丢弃队列中的请求，最后等待 GPU 完成
pub struct TransferWorker {
    device: Arc<dyn GfxDevice>,
    threads: Vec<WorkerThread>,
    should_run: Arc<AtomicBool>,
    next_request_id: AtomicU64,
}

// new & init
impl TransferWorker {
    /// 为每个 queue 启动一个线程，queue 的所有权交给线程
    pub fn new(device: Arc<dyn GfxDevice>, queues: Vec<GfxQueue>, config: &TransferConfig) -> RenderResult<Self> {
        let should_run = Arc::new(AtomicBool::new(true));
        let mut worker = Self {
            device: device.clone(),
            threads: Vec::with_capacity(queues.len()),
            should_run: should_run.clone(),
            next_request_id: AtomicU64::new(1),
        };

        for (thread_index, queue) in queues.into_iter().enumerate() {
            let family_index = queue.family_index();
            let name = format!("transfer-{}", thread_index);
            let (high_tx, high_rx) = crossbeam_channel::bounded(config.queue_capacity);
            let (standard_tx, standard_rx) = crossbeam_channel::bounded(config.queue_capacity);

            let timeline = match device.create_semaphore(
                GfxSemaphoreKind::Timeline { initial_value: 0 },
                &format!("{}-timeline", name),
            ) {
                Ok(timeline) => timeline,
                Err(e) => {
                    device.release_queue(queue);
                    worker.shutdown();
                    return Err(e.into());
                }
            };

            let ctx = WorkerLoop {
                name: name.clone(),
                device: device.clone(),
                queue,
                high_rx,
                standard_rx,
                should_run: should_run.clone(),
                contexts: UploadContextPool::new(name.clone(), family_index, config.contexts_per_thread),
                timeline,
                next_timeline_value: 1,
                config: config.clone(),
            };

            let join = thread::Builder::new().name(name.clone()).spawn(move || ctx.run()).map_err(|e| {
                ResourceCreationError::WorkerSpawn {
                    name: name.clone(),
                    reason: e.to_string(),
                }
            });
            let join = match join {
                Ok(join) => join,
                Err(e) => {
                    log::error!("{}", e);
                    worker.shutdown();
                    return Err(e.into());
                }
            };

            log::info!("transfer thread `{}` started on queue family {}", name, family_index);
            worker.threads.push(WorkerThread {
                family_index,
                high_tx: Some(high_tx),
                standard_tx: Some(standard_tx),
                join: Some(join),
            });
        }

        Ok(worker)
    }
}

// getters
impl TransferWorker {
    #[inline]
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// 第 `thread_index` 个线程使用的 queue family
    #[inline]
    pub fn family_index(&self, thread_index: usize) -> Option<u32> {
        self.threads.get(thread_index).map(|thread| thread.family_index)
    }

    /// 用于日志的请求编号
    #[inline]
    pub fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.should_run.load(Ordering::Acquire)
    }
}

// tools
impl TransferWorker {
    /// 非阻塞地将请求发送给指定的线程
    pub fn dispatch(
        &self,
        thread_index: usize,
        priority: TransferPriority,
        request: InterThreadRequest,
    ) -> Result<(), DispatchError> {
        let Some(thread) = self.threads.get(thread_index) else {
            return Err(DispatchError::Stopped(request));
        };
        let sender = match priority {
            TransferPriority::High => thread.high_tx.as_ref(),
            TransferPriority::Standard => thread.standard_tx.as_ref(),
        };
        let Some(sender) = sender else {
            return Err(DispatchError::Stopped(request));
        };

        sender.try_send(request).map_err(|e| match e {
            TrySendError::Full(request) => DispatchError::Full(request),
            TrySendError::Disconnected(request) => DispatchError::Stopped(request),
        })
    }

    /// 停止所有线程并等待退出，可以重复调用
    pub fn shutdown(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        let _span = truvis_crate_tools::profile_span!("TransferWorker::shutdown");
        log::info!("TransferWorker is shutting down, waiting for {} threads...", self.threads.len());

        self.should_run.store(false, Ordering::Release);
        // 必须先 drop sender，线程才能看到 channel 断开
        for thread in &mut self.threads {
            thread.high_tx = None;
            thread.standard_tx = None;
        }
        for mut thread in self.threads.drain(..) {
            let joined = thread.join.take().map(|join| join.join());
            if let Some(Err(_)) = joined {
                log::error!("failed to join transfer thread on queue family {}", thread.family_index);
            }
        }
        log::info!("all transfer threads stopped on `{}`", self.device.device_name());
    }
}

impl Drop for TransferWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 单个 worker 线程的状态
struct WorkerLoop {
    name: String,
    device: Arc<dyn GfxDevice>,
    queue: GfxQueue,
    high_rx: Receiver<InterThreadRequest>,
    standard_rx: Receiver<InterThreadRequest>,
    should_run: Arc<AtomicBool>,
    contexts: UploadContextPool,
    timeline: vk::Semaphore,
    next_timeline_value: u64,
    config: TransferConfig,
}

impl WorkerLoop {
    fn run(mut self) {
        while self.should_run.load(Ordering::Acquire) {
            self.contexts.reclaim(&*self.device);

            // 没有空闲的 context 时请求留在 channel 中
            if !self.contexts.has_capacity() {
                thread::sleep(self.config.idle_backoff());
                continue;
            }

            if let Some(request) = self.try_next() {
                self.execute(request);
                continue;
            }

            // 没有请求：有上传在执行时短暂等待以便回收，否则等待新请求
            let timeout = if self.contexts.in_flight_count() > 0 {
                self.config.idle_backoff()
            } else {
                self.config.idle_wait()
            };
            let mut select = Select::new();
            select.recv(&self.high_rx);
            select.recv(&self.standard_rx);
            let _ = select.ready_timeout(timeout);
        }

        self.finish();
    }

    /// High 优先
    fn try_next(&self) -> Option<InterThreadRequest> {
        self.high_rx.try_recv().ok().or_else(|| self.standard_rx.try_recv().ok())
    }

    /// channel 已经断开，处理剩余的请求并销毁所有对象
    fn finish(mut self) {
        let mut remaining = Vec::new();
        for rx in [&self.high_rx, &self.standard_rx] {
            loop {
                match rx.try_recv() {
                    Ok(request) => remaining.push(request),
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
                }
            }
        }

        if self.config.drain_on_shutdown {
            if !remaining.is_empty() {
                log::info!("[{}] draining {} queued requests", self.name, remaining.len());
            }
            for request in remaining {
                while !self.contexts.has_capacity() {
                    self.contexts.wait_all(&*self.device);
                }
                self.execute(request);
            }
        } else {
            for request in remaining {
                log::warn!("[{}] drop request #{} `{}`", self.name, request.id, request.request.name());
                request.signal.publish_failed(ResourceCreationError::WorkerStopped {
                    name: request.request.name().to_string(),
                });
            }
        }

        self.contexts.wait_all(&*self.device);

        let WorkerLoop {
            name,
            device,
            queue,
            contexts,
            timeline,
            ..
        } = self;
        contexts.destroy(&*device);
        device.destroy_semaphore(timeline);
        device.release_queue(queue);
        log::info!("[{}] stopped", name);
    }

    fn execute(&mut self, request: InterThreadRequest) {
        let _span = truvis_crate_tools::profile_span!("TransferWorker::execute");

        let ctx_index = match self.contexts.acquire(&*self.device) {
            Ok(Some(index)) => index,
            Ok(None) => {
                log::error!("[{}] no upload context for request #{}", self.name, request.id);
                self.fail(request, None);
                return;
            }
            Err(e) => {
                self.fail(request, Some(e));
                return;
            }
        };

        match self.record_and_submit(&request, ctx_index) {
            Ok((staging, target, value)) => {
                log::debug!("[{}] request #{} `{}` submitted", self.name, request.id, request.request.name());
                request.signal.publish_submitted(target, self.timeline, value);
                self.contexts.get_mut(ctx_index).in_flight = Some(InFlightUpload {
                    id: request.id,
                    name: request.request.name().to_string(),
                    staging,
                    signal: request.signal,
                });
            }
            Err(e) => {
                self.contexts.release(ctx_index);
                self.fail(request, Some(e));
            }
        }
    }

    fn fail(&self, request: InterThreadRequest, error: Option<truvis_gfx::GfxError>) {
        let name = request.request.name().to_string();
        let error = match error {
            Some(source) => ResourceCreationError::Gpu { name, source },
            None => ResourceCreationError::UploadContextExhausted { name },
        };
        log::error!("[{}] request #{} failed: {}", self.name, request.id, error);
        request.signal.publish_failed(error);
    }

    /// 创建资源、写入 stage buffer、录制并提交
    ///
    /// 失败时销毁这里创建的所有对象
    fn record_and_submit(
        &mut self,
        request: &InterThreadRequest,
        ctx_index: usize,
    ) -> GfxResult<(GfxBuffer, GpuResource, u64)> {
        let device = &*self.device;
        let recipe = &request.request;

        let staging = recipe.create_staging_buffer(device)?;
        let (target, owns_target) = match request.existing {
            Some(existing) => (existing, false),
            None => match recipe.create_final(device, &request.queue_families) {
                Ok(target) => (target, true),
                Err(e) => {
                    device.destroy_buffer(staging.handle);
                    return Err(e);
                }
            },
        };

        let value = self.next_timeline_value;
        let ctx = self.contexts.get(ctx_index);
        let submitted = (|| -> GfxResult<()> {
            recipe.write_data_to_stage(device, staging)?;
            ctx.begin(device)?;
            let recorder = GfxCommandRecorder::new(device, ctx.command_buffer, self.queue.family_index());
            recipe.copy_staging_to_final(&recorder, staging, &target);
            device.end_command_buffer(ctx.command_buffer)?;

            let submit_info = GfxSubmitInfo::new(&[ctx.command_buffer]).signal(
                self.timeline,
                vk::PipelineStageFlags2::ALL_COMMANDS,
                Some(value),
            );
            device.queue_submit(&self.queue, &[submit_info], Some(ctx.fence))
        })();

        match submitted {
            Ok(()) => {
                self.next_timeline_value += 1;
                Ok((staging, target, value))
            }
            Err(e) => {
                device.destroy_buffer(staging.handle);
                if owns_target {
                    target.destroy(device);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use truvis_gfx::headless::HeadlessDevice;

    use super::*;
    use crate::{
        transfer_request::BufferUpload,
        transfer_signal::TransferState,
    };

    fn buffer_request(id: u64, name: &str, data: Vec<u8>) -> InterThreadRequest {
        InterThreadRequest {
            id,
            request: BufferUpload::new(name, data, vk::BufferUsageFlags::STORAGE_BUFFER).into(),
            existing: None,
            queue_families: vec![0, 2],
            signal: TransferSignal::new(),
        }
    }

    fn worker(device: &Arc<HeadlessDevice>, config: &TransferConfig) -> TransferWorker {
        let queue = device.acquire_queue(2, 0).unwrap();
        TransferWorker::new(device.clone(), vec![queue], config).unwrap()
    }

    fn wait_state(signal: &TransferSignal, state: TransferState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while signal.state() != state {
            assert!(Instant::now() < deadline, "timeout waiting for {:?}", state);
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_upload_completes_and_frees_staging() {
        truvis_crate_tools::init_log::init_test_log();
        let device = Arc::new(HeadlessDevice::new());
        let mut worker = worker(&device, &TransferConfig::default());

        let request = buffer_request(1, "vertices", vec![1, 2, 3, 4]);
        let signal = request.signal.clone();
        assert!(worker.dispatch(0, TransferPriority::Standard, request).is_ok());

        assert_eq!(signal.wait(), TransferState::Complete);
        let Some(GpuResource::Buffer(buffer)) = signal.resource().copied() else {
            panic!("no buffer published");
        };
        assert_eq!(device.read_buffer(buffer.handle), Some(vec![1, 2, 3, 4]));

        worker.shutdown();
        // 只剩下最终资源
        assert_eq!(device.live_objects().buffers, 1);
        assert_eq!(device.live_objects().fences, 0);
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn test_pool_exhaustion_keeps_requests_queued() {
        let device = Arc::new(HeadlessDevice::new());
        device.pause_family(2);
        let config = TransferConfig {
            contexts_per_thread: 1,
            ..Default::default()
        };
        let mut worker = worker(&device, &config);

        let first = buffer_request(1, "first", vec![1; 8]);
        let second = buffer_request(2, "second", vec![2; 8]);
        let (first_signal, second_signal) = (first.signal.clone(), second.signal.clone());
        assert!(worker.dispatch(0, TransferPriority::Standard, first).is_ok());
        assert!(worker.dispatch(0, TransferPriority::Standard, second).is_ok());

        wait_state(&first_signal, TransferState::Submitted);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(second_signal.state(), TransferState::Pending);

        device.resume_family(2);
        assert_eq!(second_signal.wait(), TransferState::Complete);
        assert_eq!(first_signal.state(), TransferState::Complete);
        worker.shutdown();
    }

    #[test]
    fn test_high_priority_preempts_standard() {
        let device = Arc::new(HeadlessDevice::new());
        device.pause_family(2);
        let config = TransferConfig {
            contexts_per_thread: 1,
            ..Default::default()
        };
        let mut worker = worker(&device, &config);

        // 占用唯一的 context，之后的两个请求都留在 channel 中
        let blocker = buffer_request(1, "blocker", vec![0; 4]);
        let blocker_signal = blocker.signal.clone();
        assert!(worker.dispatch(0, TransferPriority::Standard, blocker).is_ok());
        wait_state(&blocker_signal, TransferState::Submitted);

        let standard = buffer_request(2, "standard", vec![1; 4]);
        let high = buffer_request(3, "high", vec![2; 4]);
        let (standard_signal, high_signal) = (standard.signal.clone(), high.signal.clone());
        assert!(worker.dispatch(0, TransferPriority::Standard, standard).is_ok());
        assert!(worker.dispatch(0, TransferPriority::High, high).is_ok());

        device.resume_family(2);
        assert_eq!(standard_signal.wait(), TransferState::Complete);
        assert_eq!(high_signal.wait(), TransferState::Complete);

        // 后发送的 High 请求先提交，拿到更小的 timeline 值
        let (_, high_value) = high_signal.gpu_wait().unwrap();
        let (_, standard_value) = standard_signal.gpu_wait().unwrap();
        assert_eq!(blocker_signal.gpu_wait().unwrap().1, 1);
        assert_eq!((high_value, standard_value), (2, 3));
        worker.shutdown();
    }

    #[test]
    fn test_no_upload_context_is_reported() {
        let device = Arc::new(HeadlessDevice::new());
        let queue = device.acquire_queue(2, 0).unwrap();
        let (_high_tx, high_rx) = crossbeam_channel::bounded(1);
        let (_standard_tx, standard_rx) = crossbeam_channel::bounded(1);
        let timeline = device.create_semaphore(GfxSemaphoreKind::Timeline { initial_value: 0 }, "timeline").unwrap();
        let mut ctx = WorkerLoop {
            name: "transfer-test".to_string(),
            device: device.clone(),
            queue,
            high_rx,
            standard_rx,
            should_run: Arc::new(AtomicBool::new(true)),
            // 没有任何 context 可用
            contexts: UploadContextPool::new("transfer-test", 2, 0),
            timeline,
            next_timeline_value: 1,
            config: TransferConfig::default(),
        };

        let request = buffer_request(1, "starved", vec![1; 4]);
        let signal = request.signal.clone();
        ctx.execute(request);

        assert_eq!(signal.state(), TransferState::Failed);
        assert!(matches!(
            signal.error(),
            Some(ResourceCreationError::UploadContextExhausted { name }) if name == "starved"
        ));
        ctx.finish();
        assert_eq!(device.live_objects().buffers, 0);
        assert!(device.acquire_queue(2, 0).is_ok());
    }

    #[test]
    fn test_full_channel_returns_request() {
        let device = Arc::new(HeadlessDevice::new());
        device.pause_family(2);
        let config = TransferConfig {
            queue_capacity: 1,
            contexts_per_thread: 1,
            ..Default::default()
        };
        let mut worker = worker(&device, &config);

        // 第一个占用 context，第二个留在 channel 中，第三个无法发送
        let first = buffer_request(1, "first", vec![1; 4]);
        let first_signal = first.signal.clone();
        assert!(worker.dispatch(0, TransferPriority::Standard, first).is_ok());
        wait_state(&first_signal, TransferState::Submitted);
        assert!(worker.dispatch(0, TransferPriority::Standard, buffer_request(2, "second", vec![2; 4])).is_ok());

        match worker.dispatch(0, TransferPriority::Standard, buffer_request(3, "third", vec![3; 4])) {
            Err(DispatchError::Full(request)) => assert_eq!(request.id, 3),
            _ => panic!("expected a full channel"),
        }
        // 另一个优先级的 channel 不受影响
        assert!(worker.dispatch(0, TransferPriority::High, buffer_request(4, "fourth", vec![4; 4])).is_ok());

        device.resume_family(2);
        worker.shutdown();
    }

    #[test]
    fn test_shutdown_without_drain_fails_queued() {
        let device = Arc::new(HeadlessDevice::new());
        device.pause_family(2);
        let config = TransferConfig {
            contexts_per_thread: 1,
            drain_on_shutdown: false,
            ..Default::default()
        };
        let mut worker = worker(&device, &config);

        let first = buffer_request(1, "first", vec![1; 4]);
        let queued = buffer_request(2, "queued", vec![2; 4]);
        let (first_signal, queued_signal) = (first.signal.clone(), queued.signal.clone());
        assert!(worker.dispatch(0, TransferPriority::Standard, first).is_ok());
        wait_state(&first_signal, TransferState::Submitted);
        assert!(worker.dispatch(0, TransferPriority::Standard, queued).is_ok());

        let resumer = {
            let device = device.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                device.resume_family(2);
            })
        };
        worker.shutdown();
        resumer.join().unwrap();

        // 已经提交的上传仍然会完成
        assert_eq!(first_signal.state(), TransferState::Complete);
        assert_eq!(queued_signal.state(), TransferState::Failed);
        assert!(matches!(queued_signal.error(), Some(ResourceCreationError::WorkerStopped { .. })));
        assert!(matches!(
            worker.dispatch(0, TransferPriority::High, buffer_request(3, "late", vec![1])),
            Err(DispatchError::Stopped(_))
        ));
    }

    #[test]
    fn test_allocation_failure_is_reported() {
        let device = Arc::new(HeadlessDevice::new());
        device.fail_allocation_named("broken");
        let mut worker = worker(&device, &TransferConfig::default());

        let request = buffer_request(1, "broken", vec![1; 4]);
        let signal = request.signal.clone();
        assert!(worker.dispatch(0, TransferPriority::High, request).is_ok());

        assert_eq!(signal.wait(), TransferState::Failed);
        assert!(matches!(signal.error(), Some(ResourceCreationError::Gpu { .. })));
        worker.shutdown();
        // stage buffer 也被销毁
        assert_eq!(device.live_objects().buffers, 0);
    }
}
