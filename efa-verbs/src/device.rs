//! 设备层接口
//!
//! 定义提供者与底层 verbs 设备之间的边界：设备上下文枚举、
//! 保护域分配/释放以及内存注册原语。

use crate::error::VerbsResult;
use std::fmt;
use std::sync::Arc;

bitflags::bitflags! {
    /// 内存区域访问权限
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MrAccess: u32 {
        const LOCAL_WRITE = 1 << 0;
        const REMOTE_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
        const REMOTE_ATOMIC = 1 << 3;
    }
}

/// 设备上下文
///
/// 每个物理网络设备在进程内枚举一次；域只持有其共享引用，
/// 不负责销毁。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceContext {
    /// 设备名
    pub name: String,
    /// 设备序号
    pub index: u32,
    /// 单个内存区域的最大可注册字节数
    pub max_mr_size: u64,
    /// 最大内存区域数量
    pub max_mr: u64,
    /// 最大完成队列深度
    pub max_cqe: u32,
    /// 最大队列对数量
    pub max_qp: u32,
}

impl DeviceContext {
    /// 以默认设备能力创建上下文
    pub fn new(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index,
            max_mr_size: 1 << 32,
            max_mr: 1 << 18,
            max_cqe: 4096,
            max_qp: 256,
        }
    }

    /// 设置最大可注册字节数
    pub fn with_max_mr_size(mut self, max_mr_size: u64) -> Self {
        self.max_mr_size = max_mr_size;
        self
    }

    /// 设置最大内存区域数量
    pub fn with_max_mr(mut self, max_mr: u64) -> Self {
        self.max_mr = max_mr;
        self
    }
}

impl fmt::Display for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.index)
    }
}

/// 保护域句柄
///
/// 创建于某个设备上下文之上，必须且只能释放一次。
#[derive(Debug, PartialEq, Eq)]
pub struct ProtectionDomain {
    pdn: u32,
    context: Arc<DeviceContext>,
}

impl ProtectionDomain {
    /// 由设备层实现调用以构造句柄
    pub fn new(pdn: u32, context: Arc<DeviceContext>) -> Self {
        Self { pdn, context }
    }

    /// 保护域编号
    pub fn pdn(&self) -> u32 {
        self.pdn
    }

    /// 所属设备上下文
    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.context
    }
}

/// 内存注册描述符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemDesc {
    pub lkey: u32,
    pub rkey: u32,
    pub addr: u64,
    pub length: u64,
    pub pdn: u32,
}

/// 底层 verbs 设备
///
/// 所有调用都在调用线程上同步完成。
pub trait VerbsDevice: Send + Sync {
    /// 获取设备上下文列表
    ///
    /// 调用者必须用 [`VerbsDevice::free_context_list`] 归还列表，
    /// 一般通过 [`ContextList`] 自动完成。
    fn get_context_list(&self) -> VerbsResult<Vec<Arc<DeviceContext>>>;

    /// 归还设备上下文列表
    fn free_context_list(&self, list: Vec<Arc<DeviceContext>>);

    /// 分配保护域
    fn alloc_pd(&self, context: &Arc<DeviceContext>) -> VerbsResult<ProtectionDomain>;

    /// 释放保护域
    ///
    /// 失败时硬件资源可能仍被占用，调用者不得再次认为其已释放。
    fn dealloc_pd(&self, pd: &ProtectionDomain) -> VerbsResult<()>;

    /// 注册内存区域
    fn reg_mr(
        &self,
        pd: &ProtectionDomain,
        addr: u64,
        length: u64,
        access: MrAccess,
    ) -> VerbsResult<MemDesc>;

    /// 注销内存区域
    fn dereg_mr(&self, desc: &MemDesc) -> VerbsResult<()>;
}

/// 作用域内的设备上下文列表
///
/// 无论匹配成功与否，离开作用域时都会把列表归还给设备层；
/// 从中取出的上下文通过 `Arc` 保留，不依赖列表的生命周期。
pub struct ContextList<'a> {
    device: &'a dyn VerbsDevice,
    contexts: Option<Vec<Arc<DeviceContext>>>,
}

impl<'a> ContextList<'a> {
    /// 获取设备上下文列表
    pub fn acquire(device: &'a dyn VerbsDevice) -> VerbsResult<Self> {
        let contexts = device.get_context_list()?;
        log::trace!("Acquired device context list ({} entries)", contexts.len());
        Ok(Self {
            device,
            contexts: Some(contexts),
        })
    }

    /// 列表中的上下文
    pub fn contexts(&self) -> &[Arc<DeviceContext>] {
        self.contexts.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.contexts().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts().is_empty()
    }
}

impl Drop for ContextList<'_> {
    fn drop(&mut self) {
        if let Some(list) = self.contexts.take() {
            self.device.free_context_list(list);
            log::trace!("Released device context list");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_context_builder() {
        let ctx = DeviceContext::new("efa_0", 0)
            .with_max_mr_size(1 << 20)
            .with_max_mr(64);
        assert_eq!(ctx.name, "efa_0");
        assert_eq!(ctx.max_mr_size, 1 << 20);
        assert_eq!(ctx.max_mr, 64);
        assert_eq!(ctx.to_string(), "efa_0[0]");
    }

    #[test]
    fn test_protection_domain_accessors() {
        let ctx = Arc::new(DeviceContext::new("efa_1", 1));
        let pd = ProtectionDomain::new(7, ctx.clone());
        assert_eq!(pd.pdn(), 7);
        assert_eq!(pd.context().name, "efa_1");
    }

    #[test]
    fn test_mr_access_flags() {
        let access = MrAccess::LOCAL_WRITE | MrAccess::REMOTE_READ;
        assert!(access.contains(MrAccess::LOCAL_WRITE));
        assert!(!access.contains(MrAccess::REMOTE_WRITE));
    }
}
