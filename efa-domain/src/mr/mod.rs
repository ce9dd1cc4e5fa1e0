//! 内存注册
//!
//! 域在构建时绑定两种注册操作表之一：直接注册，或经过
//! [`cache::MrCache`] 复用已有注册。调用者通过统一的
//! [`MemoryRegion`] 接口使用，不感知当前绑定的是哪一种。

pub mod cache;
pub mod config;
pub mod monitor;
#[cfg(target_os = "linux")]
pub mod uffd;

use crate::domain::DomainLink;
use crate::error::{FabricError, FabricResult};
use cache::{EntryId, MrCache, MrCacheAttr, MrCacheStats, RegionHandler};
use config::MrCacheEnv;
use efa_verbs::{MemDesc, MrAccess, ProtectionDomain, VerbsDevice};
use monitor::MemoryMonitor;
use std::sync::Arc;

/// 设备支持的访问权限
pub const EFA_MR_ACCESS: MrAccess = MrAccess::LOCAL_WRITE;

/// 缓存条目回调：在域的保护域上注册/注销
pub struct EfaRegionHandler {
    device: Arc<dyn VerbsDevice>,
    pd: Arc<ProtectionDomain>,
}

impl EfaRegionHandler {
    pub fn new(device: Arc<dyn VerbsDevice>, pd: Arc<ProtectionDomain>) -> Self {
        Self { device, pd }
    }
}

impl RegionHandler for EfaRegionHandler {
    type Data = MemDesc;

    fn add_region(&self, addr: u64, len: u64) -> FabricResult<MemDesc> {
        self.device
            .reg_mr(&self.pd, addr, len, EFA_MR_ACCESS)
            .map_err(|e| FabricError::device("ibv_reg_mr", e))
    }

    fn delete_region(&self, addr: u64, len: u64, data: &MemDesc) {
        if let Err(e) = self.device.dereg_mr(data) {
            log::warn!(
                "Failed to deregister cached region [{:#x}, +{:#x}) lkey {:#x}: {}",
                addr,
                len,
                data.lkey,
                e
            );
        }
    }
}

/// EFA 域使用的缓存类型
pub type EfaMrCache = MrCache<EfaRegionHandler>;

/// 注册操作表种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MrOpsKind {
    Uncached,
    Cached,
}

/// 域绑定的注册操作表
pub enum MrOps {
    Uncached,
    Cached(Arc<EfaMrCache>),
}

impl MrOps {
    pub fn kind(&self) -> MrOpsKind {
        match self {
            MrOps::Uncached => MrOpsKind::Uncached,
            MrOps::Cached(_) => MrOpsKind::Cached,
        }
    }

    pub fn cache_stats(&self) -> Option<MrCacheStats> {
        match self {
            MrOps::Uncached => None,
            MrOps::Cached(cache) => Some(cache.stats()),
        }
    }
}

impl std::fmt::Debug for MrOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.kind())
    }
}

/// 为新域选择注册操作表
///
/// 进程级配置锁在整个“读取、推导默认值、初始化、必要时关闭开关”
/// 过程中持有。缓存初始化失败不会使域创建失败：开关被永久关闭，
/// 本域及之后的所有域都使用直接注册。
pub fn bind_mr_ops(
    env: &MrCacheEnv,
    monitor: &Arc<dyn MemoryMonitor>,
    mr_cnt: usize,
    max_mr_size: u64,
    handler: EfaRegionHandler,
) -> MrOps {
    let mut config = env.lock();
    if !config.enable {
        log::debug!("MR cache disabled, using uncached registration");
        return MrOps::Uncached;
    }

    let factor = config.partition_factor.max(1);
    if config.max_cached_count == 0 {
        config.max_cached_count = mr_cnt / factor;
        log::info!(
            "MR cache max count derived as {} (mr_cnt {} / {})",
            config.max_cached_count,
            mr_cnt,
            factor
        );
    }
    if config.max_cached_size == 0 {
        config.max_cached_size = usize::try_from(max_mr_size / factor as u64).unwrap_or(usize::MAX);
        log::info!(
            "MR cache max size derived as {} (max_mr_size {} / {})",
            config.max_cached_size,
            max_mr_size,
            factor
        );
    }

    let attr = MrCacheAttr {
        max_cnt: config.max_cached_count,
        max_size: config.max_cached_size,
        merge_regions: config.merge_regions,
    };
    match MrCache::init(monitor.clone(), attr, handler) {
        Ok(cache) => MrOps::Cached(cache),
        Err(e) => {
            log::warn!(
                "MR cache init failed ({}), disabling MR cache for this process",
                e
            );
            config.enable = false;
            MrOps::Uncached
        }
    }
}

enum Backing {
    Direct(Arc<dyn VerbsDevice>),
    Cached { cache: Arc<EfaMrCache>, entry: EntryId },
}

/// 已注册的内存区域
///
/// 存活期间持有域引用。显式 [`MemoryRegion::close`] 可获取注销结果，
/// 直接丢弃时尽力注销并记录失败。
pub struct MemoryRegion {
    addr: u64,
    len: u64,
    desc: MemDesc,
    backing: Option<Backing>,
    _domain: DomainLink,
}

impl MemoryRegion {
    pub(crate) fn register_direct(
        device: &Arc<dyn VerbsDevice>,
        pd: &ProtectionDomain,
        addr: u64,
        len: u64,
        domain: DomainLink,
    ) -> FabricResult<Self> {
        let desc = device
            .reg_mr(pd, addr, len, EFA_MR_ACCESS)
            .map_err(|e| FabricError::device("ibv_reg_mr", e))?;
        Ok(Self {
            addr,
            len,
            desc,
            backing: Some(Backing::Direct(device.clone())),
            _domain: domain,
        })
    }

    pub(crate) fn register_cached(
        cache: &Arc<EfaMrCache>,
        addr: u64,
        len: u64,
        domain: DomainLink,
    ) -> FabricResult<Self> {
        let entry = cache.search(addr, len)?;
        Ok(Self {
            addr,
            len,
            desc: entry.data,
            backing: Some(Backing::Cached {
                cache: cache.clone(),
                entry: entry.id,
            }),
            _domain: domain,
        })
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn lkey(&self) -> u32 {
        self.desc.lkey
    }

    pub fn rkey(&self) -> u32 {
        self.desc.rkey
    }

    /// 底层注册描述符；经缓存注册时可能覆盖更大的范围
    pub fn desc(&self) -> &MemDesc {
        &self.desc
    }

    pub fn is_cached(&self) -> bool {
        matches!(self.backing, Some(Backing::Cached { .. }))
    }

    /// 注销区域
    pub fn close(mut self) -> FabricResult<()> {
        self.release()
    }

    fn release(&mut self) -> FabricResult<()> {
        match self.backing.take() {
            Some(Backing::Direct(device)) => device
                .dereg_mr(&self.desc)
                .map_err(|e| FabricError::device("ibv_dereg_mr", e)),
            Some(Backing::Cached { cache, entry }) => {
                cache.release(entry);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("Failed to release MR lkey {:#x}: {}", self.desc.lkey, e);
        }
    }
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("addr", &self.addr)
            .field("len", &self.len)
            .field("lkey", &self.desc.lkey)
            .field("cached", &self.is_cached())
            .finish()
    }
}
