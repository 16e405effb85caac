use slotmap::SlotMap;
use truvis_gfx::GfxDevice;

use crate::{
    errors::ConfigurationError,
    handles::{Handle, RecordKey, ResourceCategory},
};

/// ResourceStore 中保存的记录
pub trait StoreRecord {
    /// 非阻塞地查询记录是否可用
    fn is_ready(&self) -> bool;

    /// 销毁记录持有的 GPU 对象
    fn cleanup(&mut self, device: &dyn GfxDevice);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    Inserted(Handle),
    /// 执行了 cleanup 并释放 slot
    Removed(Handle),
    /// 释放 slot，记录交给调用者
    Taken(Handle),
}

/// 观察 store 变化的回调，例如用于统计或调试
pub type StoreHook = Box<dyn FnMut(StoreEvent) + Send>;

/// 单一类别、固定容量的资源容器
///
/// 使用 SlotMap 存储，预先分配好容量；slot 释放后会被复用，并增加 version。
pub struct ResourceStore<R> {
    category: ResourceCategory,
    capacity: usize,
    slots: SlotMap<RecordKey, R>,
    hook: Option<StoreHook>,
}

// new & init
impl<R: StoreRecord> ResourceStore<R> {
    pub fn new(category: ResourceCategory, capacity: usize) -> Self {
        Self {
            category,
            capacity,
            slots: SlotMap::with_capacity_and_key(capacity),
            hook: None,
        }
    }

    pub fn set_hook(&mut self, hook: StoreHook) {
        self.hook = Some(hook);
    }
}

// getters
impl<R: StoreRecord> ResourceStore<R> {
    #[inline]
    pub fn category(&self) -> ResourceCategory {
        self.category
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

// tools
impl<R: StoreRecord> ResourceStore<R> {
    /// 分配一个 slot，记录不需要已经 ready
    pub fn insert(&mut self, record: R) -> Result<Handle, ConfigurationError> {
        if self.slots.len() >= self.capacity {
            return Err(ConfigurationError::CapacityExceeded {
                category: self.category,
                capacity: self.capacity,
            });
        }
        let handle = Handle::new(self.category, self.slots.insert(record));
        self.notify(StoreEvent::Inserted(handle));
        Ok(handle)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        handle.category() == self.category && self.slots.contains_key(handle.key())
    }

    pub fn get(&self, handle: Handle) -> Result<&R, ConfigurationError> {
        self.check_category(handle)?;
        self.slots.get(handle.key()).ok_or(ConfigurationError::HandleNotFound { handle })
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut R, ConfigurationError> {
        self.check_category(handle)?;
        self.slots.get_mut(handle.key()).ok_or(ConfigurationError::HandleNotFound { handle })
    }

    /// 非阻塞
    pub fn is_ready(&self, handle: Handle) -> Result<bool, ConfigurationError> {
        self.get(handle).map(|record| record.is_ready())
    }

    /// 执行记录的 cleanup 并释放 slot
    pub fn remove(&mut self, handle: Handle, device: &dyn GfxDevice) -> Result<(), ConfigurationError> {
        let mut record = self.detach(handle)?;
        record.cleanup(device);
        self.notify(StoreEvent::Removed(handle));
        Ok(())
    }

    /// 释放 slot，但不执行 cleanup，由调用者负责之后的销毁
    pub fn take(&mut self, handle: Handle) -> Result<R, ConfigurationError> {
        let record = self.detach(handle)?;
        self.notify(StoreEvent::Taken(handle));
        Ok(record)
    }

    /// 对所有存活的记录执行 cleanup，用于关闭时
    pub fn cleanup_all(&mut self, device: &dyn GfxDevice) {
        let _span = truvis_crate_tools::profile_span!("ResourceStore::cleanup_all");
        if !self.slots.is_empty() {
            log::info!("cleanup {} live {} records", self.slots.len(), self.category);
        }
        let category = self.category;
        for (key, mut record) in self.slots.drain() {
            record.cleanup(device);
            if let Some(hook) = self.hook.as_mut() {
                hook(StoreEvent::Removed(Handle::new(category, key)));
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &R)> {
        let category = self.category;
        self.slots.iter().map(move |(key, record)| (Handle::new(category, key), record))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &mut R)> {
        let category = self.category;
        self.slots.iter_mut().map(move |(key, record)| (Handle::new(category, key), record))
    }

    fn detach(&mut self, handle: Handle) -> Result<R, ConfigurationError> {
        self.check_category(handle)?;
        self.slots.remove(handle.key()).ok_or(ConfigurationError::HandleNotFound { handle })
    }

    fn check_category(&self, handle: Handle) -> Result<(), ConfigurationError> {
        if handle.category() != self.category {
            return Err(ConfigurationError::CategoryMismatch {
                handle,
                expected: self.category,
            });
        }
        Ok(())
    }

    fn notify(&mut self, event: StoreEvent) {
        if let Some(hook) = self.hook.as_mut() {
            hook(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use truvis_gfx::headless::HeadlessDevice;

    use super::*;

    struct CountingRecord {
        ready: bool,
        cleanups: Arc<AtomicUsize>,
    }

    impl StoreRecord for CountingRecord {
        fn is_ready(&self) -> bool {
            self.ready
        }

        fn cleanup(&mut self, _device: &dyn GfxDevice) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record(ready: bool, cleanups: &Arc<AtomicUsize>) -> CountingRecord {
        CountingRecord {
            ready,
            cleanups: cleanups.clone(),
        }
    }

    #[test]
    fn test_capacity_exceeded() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let mut store = ResourceStore::new(ResourceCategory::Buffer, 2);
        store.insert(record(false, &cleanups)).unwrap();
        store.insert(record(false, &cleanups)).unwrap();

        let err = store.insert(record(false, &cleanups)).unwrap_err();
        assert!(matches!(err, ConfigurationError::CapacityExceeded { capacity: 2, .. }));
    }

    #[test]
    fn test_slot_reuse_gives_unequal_handle() {
        let device = HeadlessDevice::new();
        let cleanups = Arc::new(AtomicUsize::new(0));
        let mut store = ResourceStore::new(ResourceCategory::Buffer, 1);

        let old = store.insert(record(true, &cleanups)).unwrap();
        store.remove(old, &device).unwrap();
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);

        let new = store.insert(record(false, &cleanups)).unwrap();
        assert_ne!(old, new);
        assert!(matches!(store.get(old), Err(ConfigurationError::HandleNotFound { .. })));
        assert!(!store.is_ready(new).unwrap());
    }

    #[test]
    fn test_category_mismatch() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let mut buffers = ResourceStore::new(ResourceCategory::Buffer, 4);
        let mut textures = ResourceStore::new(ResourceCategory::Texture, 4);
        let buffer = buffers.insert(record(true, &cleanups)).unwrap();
        textures.insert(record(true, &cleanups)).unwrap();

        assert!(matches!(textures.get(buffer), Err(ConfigurationError::CategoryMismatch { .. })));
        assert!(!textures.contains(buffer));
    }

    #[test]
    fn test_take_skips_cleanup_and_hook_sees_events() {
        let device = HeadlessDevice::new();
        let cleanups = Arc::new(AtomicUsize::new(0));
        let events = Arc::new(Mutex::new(vec![]));
        let mut store = ResourceStore::new(ResourceCategory::Texture, 4);
        let events_in_hook = events.clone();
        store.set_hook(Box::new(move |event| events_in_hook.lock().unwrap().push(event)));

        let a = store.insert(record(true, &cleanups)).unwrap();
        let b = store.insert(record(true, &cleanups)).unwrap();
        let taken = store.take(a).unwrap();
        assert!(taken.ready);
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);

        store.cleanup_all(&device);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert!(store.is_empty());

        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            vec![StoreEvent::Inserted(a), StoreEvent::Inserted(b), StoreEvent::Taken(a), StoreEvent::Removed(b)]
        );
    }
}
