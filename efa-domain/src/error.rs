// 域生命周期错误类型定义

use crate::mr::config::ConfigError;
use crate::mr::monitor::MonitorError;
use efa_verbs::VerbsError;

pub const FI_ENOMEM: i32 = 12;
pub const FI_EBUSY: i32 = 16;
pub const FI_ENODEV: i32 = 19;
pub const FI_EINVAL: i32 = 22;
pub const FI_ENOSYS: i32 = 38;

/// 提供者错误类型
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FabricError {
    /// 名称缺失、属性不兼容等
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// 无法解析到设备
    #[error("No such device: {0}")]
    NoDevice(String),

    /// 内存不足
    #[error("Out of memory")]
    OutOfMemory,

    /// 未实现的操作
    #[error("Operation not supported: {0}")]
    NotSupported(&'static str),

    /// 仍有对象引用该资源
    #[error("Resource busy: {0}")]
    Busy(String),

    /// 设备层错误，原样传播
    #[error("Device error in {op}: {source}")]
    Device {
        op: &'static str,
        #[source]
        source: VerbsError,
    },

    /// 配置错误
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// 内存监视器错误
    #[error(transparent)]
    Monitor(#[from] MonitorError),
}

impl FabricError {
    /// 包装设备层错误
    pub fn device(op: &'static str, source: VerbsError) -> Self {
        FabricError::Device { op, source }
    }

    /// 负的错误码，与 libfabric 返回值约定一致
    pub fn errno(&self) -> i32 {
        match self {
            FabricError::InvalidArgument(_) | FabricError::Config(_) => -FI_EINVAL,
            FabricError::NoDevice(_) => -FI_ENODEV,
            FabricError::OutOfMemory => -FI_ENOMEM,
            FabricError::NotSupported(_) => -FI_ENOSYS,
            FabricError::Busy(_) => -FI_EBUSY,
            FabricError::Device { source, .. } => -source.raw_errno(),
            FabricError::Monitor(MonitorError::Os { errno, .. }) => -errno,
            FabricError::Monitor(_) => -FI_ENOSYS,
        }
    }
}

/// 提供者结果类型
pub type FabricResult<T> = Result<T, FabricError>;

#[cfg(test)]
mod tests {
    use super::*;
    use efa_verbs::errno;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FabricError::InvalidArgument("x".into()).errno(), -22);
        assert_eq!(FabricError::NoDevice("efa_9".into()).errno(), -19);
        assert_eq!(FabricError::OutOfMemory.errno(), -12);
        assert_eq!(FabricError::NotSupported("cntr_open").errno(), -38);
        assert_eq!(FabricError::Busy("domain".into()).errno(), -16);
        assert_eq!(
            FabricError::from(MonitorError::Unsupported("uffd".into())).errno(),
            -38
        );
    }

    #[test]
    fn test_device_error_is_verbatim() {
        let err = FabricError::device(
            "ibv_alloc_pd",
            VerbsError::errno("ibv_alloc_pd", errno::ENOMEM),
        );
        assert_eq!(err.errno(), -errno::ENOMEM);
        assert!(err.to_string().contains("ibv_alloc_pd"));
    }
}
