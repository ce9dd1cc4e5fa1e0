// 设备层错误类型定义

/// 设备层错误
///
/// 设备层调用失败时携带原始 errno，上层按原样向调用者传播。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerbsError {
    /// 底层调用返回的 errno
    #[error("{op} failed: errno {errno}")]
    Errno { op: &'static str, errno: i32 },

    /// 保护域或内存区域句柄无效
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// 参数无效
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl VerbsError {
    /// 以 errno 构造错误
    pub fn errno(op: &'static str, errno: i32) -> Self {
        VerbsError::Errno { op, errno }
    }

    /// 对应的正 errno 值
    pub fn raw_errno(&self) -> i32 {
        match self {
            VerbsError::Errno { errno, .. } => *errno,
            VerbsError::InvalidHandle(_) => errno::EBADF,
            VerbsError::InvalidParameter(_) => errno::EINVAL,
        }
    }
}

/// 设备层使用的 errno 常量
pub mod errno {
    pub const ENOMEM: i32 = 12;
    pub const EBADF: i32 = 9;
    pub const EBUSY: i32 = 16;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const EFAULT: i32 = 14;
}

/// 设备层结果类型
pub type VerbsResult<T> = Result<T, VerbsError>;
