use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigurationError;

/// 渲染核心的配置，启动时加载一次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderCoreConfig {
    /// 同时在 GPU 上执行的帧数，即 per-frame 资源的数量
    pub frames_in_flight: usize,
    pub transfer: TransferConfig,
    pub capacities: StoreCapacities,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// 后台线程数量，每个线程独占一个 transfer queue
    pub threads: usize,
    /// 每个线程每个优先级队列的容量
    pub queue_capacity: usize,
    /// 每个线程最多同时在 GPU 上执行的上传数量
    pub contexts_per_thread: usize,
    /// 有上传在 GPU 上执行时的轮询间隔
    pub idle_backoff_us: u64,
    /// 完全空闲时的等待间隔
    pub idle_wait_ms: u64,
    /// 关闭时是否先执行完队列中的请求
    pub drain_on_shutdown: bool,
    /// wait_for_ready 在挂起之前自旋的次数
    pub wait_spin_limit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreCapacities {
    pub buffers: usize,
    pub textures: usize,
    pub semaphores: usize,
    pub pipelines: usize,
    pub command_buffers: usize,
}

impl Default for RenderCoreConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 3,
            transfer: TransferConfig::default(),
            capacities: StoreCapacities::default(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            queue_capacity: 256,
            contexts_per_thread: 4,
            idle_backoff_us: 500,
            idle_wait_ms: 50,
            drain_on_shutdown: true,
            wait_spin_limit: 64,
        }
    }
}

impl Default for StoreCapacities {
    fn default() -> Self {
        Self {
            buffers: 4096,
            textures: 1024,
            semaphores: 256,
            pipelines: 256,
            command_buffers: 128,
        }
    }
}

// new & init
impl RenderCoreConfig {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: RenderCoreConfig = toml::from_str(content).context("解析 TOML 配置失败")?;
        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 文件加载配置，缺省的字段使用默认值
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content =
            fs::read_to_string(path.as_ref()).with_context(|| format!("读取配置文件失败: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content).with_context(|| format!("加载配置失败: {:?}", path.as_ref()))
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |message: &str| Err(ConfigurationError::InvalidConfig(message.to_string()));

        if self.frames_in_flight == 0 {
            return invalid("frames_in_flight must be at least 1");
        }
        if self.transfer.threads == 0 {
            return invalid("transfer.threads must be at least 1");
        }
        if self.transfer.queue_capacity == 0 {
            return invalid("transfer.queue_capacity must be at least 1");
        }
        if self.transfer.contexts_per_thread == 0 {
            return invalid("transfer.contexts_per_thread must be at least 1");
        }
        let caps = &self.capacities;
        if [caps.buffers, caps.textures, caps.semaphores, caps.pipelines, caps.command_buffers].contains(&0) {
            return invalid("store capacities must be at least 1");
        }
        Ok(())
    }
}

// getters
impl TransferConfig {
    #[inline]
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_micros(self.idle_backoff_us)
    }

    #[inline]
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = RenderCoreConfig::from_toml_str(
            r#"
            frames_in_flight = 2

            [transfer]
            threads = 2
            drain_on_shutdown = false
            "#,
        )
        .unwrap();

        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.transfer.threads, 2);
        assert!(!config.transfer.drain_on_shutdown);
        assert_eq!(config.transfer.queue_capacity, TransferConfig::default().queue_capacity);
        assert_eq!(config.capacities, StoreCapacities::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(RenderCoreConfig::from_toml_str("frames_in_flight = 0").is_err());
        assert!(RenderCoreConfig::from_toml_str("[capacities]\nbuffers = 0").is_err());
        assert!(RenderCoreConfig::from_toml_str("frames_in_flight = \"three\"").is_err());
        assert!(RenderCoreConfig::default().validate().is_ok());
    }
}
