use std::fmt;

slotmap::new_key_type! {
    /// ResourceStore 中 slot 的 key，包含 index 和 version
    pub struct RecordKey;
}

/// 资源的类别，一个类别对应一个 ResourceStore
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceCategory {
    Buffer,
    Texture,
    Semaphore,
    Pipeline,
    CommandBuffer,
}

impl fmt::Display for ResourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Buffer => "buffer",
            Self::Texture => "texture",
            Self::Semaphore => "semaphore",
            Self::Pipeline => "pipeline",
            Self::CommandBuffer => "command-buffer",
        };
        f.write_str(name)
    }
}

/// 资源的不透明引用
///
/// 只是一个查找用的 key，不拥有任何资源。slot 被释放并复用后 version 会增加，
/// 旧的 Handle 不会指向新的资源。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    category: ResourceCategory,
    key: RecordKey,
}

impl Handle {
    #[inline]
    pub(crate) fn new(category: ResourceCategory, key: RecordKey) -> Self {
        Self { category, key }
    }

    #[inline]
    pub fn category(&self) -> ResourceCategory {
        self.category
    }

    #[inline]
    pub fn key(&self) -> RecordKey {
        self.key
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = slotmap::Key::data(&self.key);
        write!(f, "{}#{:?}", self.category, data)
    }
}
