//! 内存注册缓存配置
//!
//! 进程级的缓存策略：最大条目数、最大可缓存字节数、区域合并开关
//! 与全局启用开关。配置可来自默认值、TOML 文本或环境变量，
//! 由 [`MrCacheEnv`] 在一把互斥锁下供所有域创建调用共享。

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

/// 默认的缓存分区系数
///
/// 未显式设置时，最大条目数与最大字节数分别取设备上限除以该值。
pub const EFA_DEF_NUM_MR_CACHE: usize = 36;

/// 提供者使用的环境变量前缀
pub const EFA_ENV_PREFIX: &str = "FI_EFA";

/// 配置错误类型
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// 无效的配置
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// 解析错误
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// 序列化错误
    #[error("Failed to serialize configuration: {0}")]
    Serialize(String),
}

/// 内存注册缓存配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MrCacheConfig {
    /// 全局启用开关
    pub enable: bool,
    /// 最大缓存条目数，0 表示尚未设置
    pub max_cached_count: usize,
    /// 最大可缓存字节数，0 表示尚未设置
    pub max_cached_size: usize,
    /// 是否合并重叠区域
    pub merge_regions: bool,
    /// 推导默认上限时使用的分区系数
    pub partition_factor: usize,
}

impl Default for MrCacheConfig {
    fn default() -> Self {
        Self {
            enable: true,
            max_cached_count: 0,
            max_cached_size: 0,
            merge_regions: true,
            partition_factor: EFA_DEF_NUM_MR_CACHE,
        }
    }
}

impl MrCacheConfig {
    /// 禁用缓存的配置
    pub fn disabled() -> Self {
        Self {
            enable: false,
            ..Self::default()
        }
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partition_factor == 0 {
            return Err(ConfigError::Invalid(
                "partition_factor must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// 从 TOML 字符串加载配置
    ///
    /// ```rust,ignore
    /// let config = MrCacheConfig::from_toml("enable = false")?;
    /// ```
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml)
            .map_err(|e| ConfigError::Parse(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 将配置序列化为 TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(format!("TOML serialize error: {}", e)))
    }

    /// 从环境变量加载配置
    ///
    /// 读取 `PREFIX_MR_CACHE_ENABLE`、`PREFIX_MR_MAX_CACHED_COUNT`、
    /// `PREFIX_MR_MAX_CACHED_SIZE` 与 `PREFIX_MR_CACHE_MERGE_REGIONS`，
    /// 未设置的变量保留默认值。
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(prefix, |key| std::env::var(key).ok())
    }

    /// 从任意键值来源加载配置
    pub fn from_lookup<F>(prefix: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let key = |name: &str| format!("{}_{}", prefix, name);

        if let Some(v) = lookup(&key("MR_CACHE_ENABLE")) {
            config.enable = parse_bool(&key("MR_CACHE_ENABLE"), &v)?;
        }
        if let Some(v) = lookup(&key("MR_MAX_CACHED_COUNT")) {
            config.max_cached_count = parse_usize(&key("MR_MAX_CACHED_COUNT"), &v)?;
        }
        if let Some(v) = lookup(&key("MR_MAX_CACHED_SIZE")) {
            config.max_cached_size = parse_usize(&key("MR_MAX_CACHED_SIZE"), &v)?;
        }
        if let Some(v) = lookup(&key("MR_CACHE_MERGE_REGIONS")) {
            config.merge_regions = parse_bool(&key("MR_CACHE_MERGE_REGIONS"), &v)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "y" => Ok(true),
        "0" | "false" | "no" | "off" | "n" => Ok(false),
        other => Err(ConfigError::Parse(format!(
            "{}: expected boolean, got {:?}",
            key, other
        ))),
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::Parse(format!("{}: {}", key, e)))
}

/// 进程级缓存环境
///
/// 所有域创建调用共享同一份配置；读取、推导默认值与关闭开关的整个
/// 序列都在同一把锁内完成。
#[derive(Debug, Default)]
pub struct MrCacheEnv {
    config: Mutex<MrCacheConfig>,
}

impl MrCacheEnv {
    pub fn new(config: MrCacheConfig) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }

    /// 获取配置锁
    pub fn lock(&self) -> MutexGuard<'_, MrCacheConfig> {
        self.config.lock()
    }

    /// 当前配置快照
    pub fn snapshot(&self) -> MrCacheConfig {
        self.config.lock().clone()
    }

    /// 缓存是否仍处于启用状态
    pub fn is_enabled(&self) -> bool {
        self.config.lock().enable
    }

    /// 显式覆盖最大条目数与最大字节数
    pub fn set_limits(&self, max_cached_count: usize, max_cached_size: usize) {
        let mut config = self.config.lock();
        config.max_cached_count = max_cached_count;
        config.max_cached_size = max_cached_size;
    }
}
