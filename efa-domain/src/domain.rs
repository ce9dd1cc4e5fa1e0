//! 域生命周期
//!
//! 构建顺序：属性校验、基础状态、描述符副本、设备解析、保护域、
//! 操作表绑定、发布、注册缓存。任何一步失败都按获取的逆序释放已
//! 获取的资源；注册缓存失败只会降级为直接注册，不会使构建失败。
//!
//! 关闭顺序：注册缓存、保护域、基础状态、描述符副本。保护域释放
//! 失败时立即返回错误，域原样交还调用者以便重试。
//!
//! 保护域、注册缓存与基础状态放在共享的 `DomainCore` 中，由域对象与其
//! 子对象、内存区域共同持有。域对象先于它们被丢弃时，拆除推迟到
//! 最后一个持有者离开。

use crate::error::{FabricError, FabricResult};
use crate::fabric::{DomainRef, Fabric, UtilDomain};
use crate::info::{FabricInfo, validate_domain_attrs, validate_endpoint_type};
use crate::mr::cache::MrCacheStats;
use crate::mr::{self, EfaRegionHandler, MemoryRegion, MrOps, MrOpsKind};
use crate::objects::{AddressVector, AvAttr, CompletionQueue, CqAttr, Endpoint};
use crate::{pd, resolver};
use efa_verbs::{DeviceContext, MrAccess, ProtectionDomain, VerbsDevice};
use std::fmt;
use std::sync::Arc;

/// 显式不支持的域操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnsupportedOp {
    ScalableEndpoint,
    Counter,
    PollSet,
    SharedTxContext,
    SharedRxContext,
    QueryAtomic,
    QueryCollective,
}

impl UnsupportedOp {
    pub const ALL: [UnsupportedOp; 7] = [
        UnsupportedOp::ScalableEndpoint,
        UnsupportedOp::Counter,
        UnsupportedOp::PollSet,
        UnsupportedOp::SharedTxContext,
        UnsupportedOp::SharedRxContext,
        UnsupportedOp::QueryAtomic,
        UnsupportedOp::QueryCollective,
    ];

    pub fn name(self) -> &'static str {
        match self {
            UnsupportedOp::ScalableEndpoint => "scalable_ep",
            UnsupportedOp::Counter => "cntr_open",
            UnsupportedOp::PollSet => "poll_open",
            UnsupportedOp::SharedTxContext => "stx_ctx",
            UnsupportedOp::SharedRxContext => "srx_ctx",
            UnsupportedOp::QueryAtomic => "query_atomic",
            UnsupportedOp::QueryCollective => "query_collective",
        }
    }
}

/// 域操作表中的条目
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainOp {
    AddressVector,
    CompletionQueue,
    Endpoint,
    Unsupported(UnsupportedOp),
}

impl DomainOp {
    pub fn is_supported(self) -> bool {
        !matches!(self, DomainOp::Unsupported(_))
    }
}

/// 通过操作表分派的子对象请求
#[derive(Debug, Clone)]
pub enum DomainRequest {
    AddressVector(AvAttr),
    CompletionQueue(CqAttr),
    Endpoint(FabricInfo),
    Unsupported(UnsupportedOp),
}

impl DomainRequest {
    pub fn op(&self) -> DomainOp {
        match self {
            DomainRequest::AddressVector(_) => DomainOp::AddressVector,
            DomainRequest::CompletionQueue(_) => DomainOp::CompletionQueue,
            DomainRequest::Endpoint(_) => DomainOp::Endpoint,
            DomainRequest::Unsupported(op) => DomainOp::Unsupported(*op),
        }
    }
}

/// 操作表分派得到的子对象
#[derive(Debug)]
pub enum DomainObject {
    AddressVector(AddressVector),
    CompletionQueue(CompletionQueue),
    Endpoint(Endpoint),
}

/// 域的共享部分
///
/// 最后一个持有者离开时按序释放注册缓存、保护域与基础状态。
struct DomainCore {
    name: String,
    device: Arc<dyn VerbsDevice>,
    base: Option<UtilDomain>,
    pd: Option<Arc<ProtectionDomain>>,
    mr_ops: MrOps,
}

impl DomainCore {
    fn ref_count(&self) -> usize {
        self.base.as_ref().map_or(0, UtilDomain::ref_count)
    }

    fn link(self: &Arc<Self>) -> FabricResult<DomainLink> {
        let base = self
            .base
            .as_ref()
            .ok_or_else(|| FabricError::InvalidArgument("domain is closing".to_string()))?;
        Ok(DomainLink {
            _ref: base.acquire_ref(),
            _core: self.clone(),
        })
    }

    /// 拆除；保护域释放失败时保留句柄与基础状态，可再次调用
    fn teardown(&mut self) -> FabricResult<()> {
        if let MrOps::Cached(cache) = std::mem::replace(&mut self.mr_ops, MrOps::Uncached) {
            cache.cleanup();
        }

        if let Some(pd) = self.pd.as_ref() {
            pd::dealloc_pd(self.device.as_ref(), pd)?;
            self.pd = None;
        }

        if let Some(base) = self.base.as_mut() {
            base.close()?;
            self.base = None;
        }

        log::info!("Closed domain {}", self.name);
        Ok(())
    }
}

impl Drop for DomainCore {
    fn drop(&mut self) {
        if self.base.is_some() || self.pd.is_some() {
            if let Err(e) = self.teardown() {
                log::warn!("Domain {} released without clean close: {}", self.name, e);
            }
        }
    }
}

/// 子对象与内存区域持有的域引用
///
/// 计入基础状态的引用数，并保持保护域与注册缓存存活。
pub struct DomainLink {
    // 先于 _core 释放：最终拆除要求引用数已归零
    _ref: DomainRef,
    _core: Arc<DomainCore>,
}

impl fmt::Debug for DomainLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainLink")
            .field("domain", &self._core.name)
            .finish()
    }
}

/// 域
pub struct Domain {
    fabric: Arc<Fabric>,
    info: Box<FabricInfo>,
    ctx: Arc<DeviceContext>,
    rdm: bool,
    core: Option<Arc<DomainCore>>,
}

/// 关闭失败
///
/// 持有未关闭完的域，调用者可在处理完原因后重试。
#[derive(Debug, thiserror::Error)]
#[error("Failed to close domain: {error}")]
pub struct DomainCloseError {
    #[source]
    error: FabricError,
    domain: Box<Domain>,
}

impl DomainCloseError {
    pub fn error(&self) -> &FabricError {
        &self.error
    }

    pub fn errno(&self) -> i32 {
        self.error.errno()
    }

    /// 取回未关闭的域
    pub fn into_domain(self) -> Domain {
        *self.domain
    }
}

/// 构建失败时撤销描述符副本与基础状态
fn rollback(err: FabricError, info: Box<FabricInfo>, mut base: UtilDomain) -> FabricError {
    log::debug!("Domain open failed ({}), rolling back", err);
    drop(info);
    if let Err(e) = base.close() {
        log::warn!("Failed to close domain base during rollback: {}", e);
    }
    err
}

impl Domain {
    /// 创建域
    pub fn open(fabric: &Arc<Fabric>, info: &FabricInfo, context: usize) -> FabricResult<Domain> {
        let provider = fabric.provider().clone();

        let name = info
            .domain_name()
            .ok_or_else(|| FabricError::InvalidArgument("domain name missing".to_string()))?;
        let prov_info = provider.get_efa_info(name).ok_or_else(|| {
            FabricError::InvalidArgument(format!("no matching configuration for domain {}", name))
        })?;
        validate_endpoint_type(prov_info, info)?;
        validate_domain_attrs(fabric.api_version(), &prov_info.domain_attr, info)?;

        let base = UtilDomain::init(fabric, info, context)?;
        let owned = Box::new(info.negotiate(prov_info));
        // 传输模式取自匹配到的通告配置，与域名后缀一致
        let rdm = prov_info.is_rdm();

        let device = provider.device().clone();
        let ctx = match resolver::open_device_by_name(device.as_ref(), owned.domain_name(), rdm) {
            Ok(ctx) => ctx,
            Err(e) => return Err(rollback(e, owned, base)),
        };
        let pd = match pd::alloc_pd(device.as_ref(), &ctx) {
            Ok(pd) => Arc::new(pd),
            Err(e) => {
                drop(ctx);
                return Err(rollback(e, owned, base));
            }
        };

        let handler = EfaRegionHandler::new(device.clone(), pd.clone());
        let mr_ops = mr::bind_mr_ops(
            provider.mr_cache_env(),
            provider.monitor(),
            owned.domain_attr.mr_cnt,
            ctx.max_mr_size,
            handler,
        );

        let core = DomainCore {
            name: name.to_string(),
            device,
            base: Some(base),
            pd: Some(pd),
            mr_ops,
        };
        log::info!(
            "Opened domain {} on {} ({}, MR {:?})",
            core.name,
            ctx,
            if rdm { "RDM" } else { "DGRAM" },
            core.mr_ops.kind()
        );

        Ok(Domain {
            fabric: fabric.clone(),
            info: owned,
            ctx,
            rdm,
            core: Some(Arc::new(core)),
        })
    }

    /// 关闭域
    ///
    /// 仍有子对象或内存区域时返回 `Busy`，不执行任何拆除步骤。
    pub fn close(mut self) -> Result<(), DomainCloseError> {
        let result = match self.core.take() {
            None => Ok(()),
            Some(core) if core.ref_count() > 0 => {
                let refs = core.ref_count();
                self.core = Some(core);
                Err(FabricError::Busy(format!(
                    "domain {} still has {} open object(s)",
                    self.name(),
                    refs
                )))
            }
            Some(core) => match Arc::try_unwrap(core) {
                Ok(mut owned) => {
                    let result = owned.teardown();
                    if result.is_err() {
                        self.core = Some(Arc::new(owned));
                    }
                    result
                }
                // 某个持有者正在释放，尚未放下共享部分
                Err(shared) => {
                    self.core = Some(shared);
                    Err(FabricError::Busy(format!(
                        "domain {} is still referenced",
                        self.name()
                    )))
                }
            },
        };

        result.map_err(|error| DomainCloseError {
            error,
            domain: Box::new(self),
        })
    }

    pub fn name(&self) -> &str {
        self.info.domain_name().unwrap_or_default()
    }

    /// 协商后的描述符副本
    pub fn info(&self) -> &FabricInfo {
        &self.info
    }

    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    pub fn device_context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    /// 保护域编号，关闭过程中已释放时为 `None`
    pub fn pd_number(&self) -> Option<u32> {
        self.core
            .as_ref()
            .and_then(|core| core.pd.as_ref())
            .map(|pd| pd.pdn())
    }

    pub fn is_rdm(&self) -> bool {
        self.rdm
    }

    pub fn context(&self) -> usize {
        self.core
            .as_ref()
            .and_then(|core| core.base.as_ref())
            .map_or(0, UtilDomain::context)
    }

    pub fn mr_ops_kind(&self) -> MrOpsKind {
        self.core
            .as_ref()
            .map_or(MrOpsKind::Uncached, |core| core.mr_ops.kind())
    }

    pub fn mr_cache_stats(&self) -> Option<MrCacheStats> {
        self.core.as_ref().and_then(|core| core.mr_ops.cache_stats())
    }

    /// 操作表
    pub fn capabilities() -> impl Iterator<Item = DomainOp> {
        [
            DomainOp::AddressVector,
            DomainOp::CompletionQueue,
            DomainOp::Endpoint,
        ]
        .into_iter()
        .chain(UnsupportedOp::ALL.into_iter().map(DomainOp::Unsupported))
    }

    fn core(&self) -> FabricResult<&Arc<DomainCore>> {
        self.core
            .as_ref()
            .ok_or_else(|| FabricError::InvalidArgument("domain is closing".to_string()))
    }

    /// 经操作表分派子对象请求
    pub fn open_object(&self, request: DomainRequest) -> FabricResult<DomainObject> {
        match request {
            DomainRequest::AddressVector(attr) => {
                self.av_open(attr).map(DomainObject::AddressVector)
            }
            DomainRequest::CompletionQueue(attr) => {
                self.cq_open(attr).map(DomainObject::CompletionQueue)
            }
            DomainRequest::Endpoint(info) => self.endpoint(&info).map(DomainObject::Endpoint),
            DomainRequest::Unsupported(op) => Err(FabricError::NotSupported(op.name())),
        }
    }

    pub fn av_open(&self, attr: AvAttr) -> FabricResult<AddressVector> {
        AddressVector::open(attr, self.core()?.link()?)
    }

    pub fn cq_open(&self, attr: CqAttr) -> FabricResult<CompletionQueue> {
        CompletionQueue::open(attr, self.ctx.max_cqe as usize, self.core()?.link()?)
    }

    pub fn endpoint(&self, info: &FabricInfo) -> FabricResult<Endpoint> {
        Endpoint::open(info, self.rdm, self.core()?.link()?)
    }

    /// 绑定事件对象：域不支持
    pub fn bind(&self, _flags: u64) -> FabricResult<()> {
        Err(FabricError::NotSupported("fi_bind"))
    }

    /// 控制操作：域不支持
    pub fn control(&self, _command: i32) -> FabricResult<()> {
        Err(FabricError::NotSupported("fi_control"))
    }

    /// 打开扩展操作集：域不支持
    pub fn ops_open(&self, _name: &str) -> FabricResult<()> {
        Err(FabricError::NotSupported("fi_ops_open"))
    }

    /// 注册内存区域
    ///
    /// 设备只支持本地写访问；根据绑定的操作表直接注册或经缓存复用。
    pub fn reg_mr(&self, addr: u64, len: u64, access: MrAccess) -> FabricResult<MemoryRegion> {
        if !mr::EFA_MR_ACCESS.contains(access) {
            return Err(FabricError::InvalidArgument(format!(
                "MR access {:?} not supported",
                access
            )));
        }
        if len == 0 || len > self.ctx.max_mr_size {
            return Err(FabricError::InvalidArgument(format!(
                "MR length {:#x} outside (0, {:#x}]",
                len, self.ctx.max_mr_size
            )));
        }
        let core = self.core()?;
        let link = core.link()?;

        match &core.mr_ops {
            MrOps::Cached(cache) => MemoryRegion::register_cached(cache, addr, len, link),
            MrOps::Uncached => {
                let pd = core.pd.as_ref().ok_or_else(|| {
                    FabricError::InvalidArgument("domain is closing".to_string())
                })?;
                MemoryRegion::register_direct(&core.device, pd, addr, len, link)
            }
        }
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("name", &self.name())
            .field("device", &self.ctx.name)
            .field("pd", &self.pd_number())
            .field("rdm", &self.rdm)
            .field("mr_ops", &self.mr_ops_kind())
            .finish()
    }
}
