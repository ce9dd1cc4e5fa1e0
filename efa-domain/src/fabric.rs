//! 提供者、fabric 与通用域基础状态
//!
//! [`Provider`] 持有进程级上下文：设备层句柄、通告配置表、内存注册
//! 缓存环境与内存监视器。每次域创建都经由其 fabric 读取这些状态。

use crate::error::{FabricError, FabricResult};
use crate::info::{self, EndpointType, FabricInfo, MrMode, Threading};
use crate::mr::config::{EFA_ENV_PREFIX, MrCacheConfig, MrCacheEnv};
use crate::mr::monitor::{MemoryMonitor, NotifierMonitor};
use efa_verbs::{ContextList, VerbsDevice};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// EFA 提供者
pub struct Provider {
    device: Arc<dyn VerbsDevice>,
    infos: Vec<FabricInfo>,
    mr_cache: MrCacheEnv,
    monitor: Arc<dyn MemoryMonitor>,
}

impl Provider {
    /// 枚举设备并生成通告配置表
    ///
    /// 没有设备时提供者仍可创建，只是不通告任何配置。
    pub fn new(
        device: Arc<dyn VerbsDevice>,
        cache_config: MrCacheConfig,
        monitor: Arc<dyn MemoryMonitor>,
    ) -> FabricResult<Arc<Self>> {
        let infos = {
            let list = ContextList::acquire(device.as_ref())
                .map_err(|e| FabricError::device("ibv_get_device_list", e))?;
            let mut infos = Vec::with_capacity(list.len() * 2);
            for ctx in list.contexts() {
                for ep_type in [EndpointType::Rdm, EndpointType::Dgram] {
                    if let Some(fi) = info::device_info(ctx, ep_type) {
                        infos.push(fi);
                    }
                }
            }
            infos
        };
        Self::with_infos(device, infos, cache_config, monitor)
    }

    /// 使用给定的通告配置表
    ///
    /// 配置表与设备当前的枚举结果可以不一致，例如设备在提供者初始化
    /// 之后被移除；此时按名称打开域会在设备解析阶段失败。
    pub fn with_infos(
        device: Arc<dyn VerbsDevice>,
        infos: Vec<FabricInfo>,
        cache_config: MrCacheConfig,
        monitor: Arc<dyn MemoryMonitor>,
    ) -> FabricResult<Arc<Self>> {
        cache_config.validate()?;
        log::info!(
            "EFA provider initialised: {} configuration(s), MR cache {}, monitor {}",
            infos.len(),
            if cache_config.enable { "enabled" } else { "disabled" },
            monitor.name()
        );

        Ok(Arc::new(Self {
            device,
            infos,
            mr_cache: MrCacheEnv::new(cache_config),
            monitor,
        }))
    }

    /// 从 `FI_EFA_*` 环境变量读取缓存配置，并选用主机默认的监视器
    pub fn from_env(device: Arc<dyn VerbsDevice>) -> FabricResult<Arc<Self>> {
        let config = MrCacheConfig::from_env(EFA_ENV_PREFIX)?;
        Self::new(device, config, default_monitor())
    }

    pub fn device(&self) -> &Arc<dyn VerbsDevice> {
        &self.device
    }

    /// 通告配置表
    pub fn infos(&self) -> &[FabricInfo] {
        &self.infos
    }

    /// 按域名查找通告配置
    pub fn get_efa_info(&self, domain_name: &str) -> Option<&FabricInfo> {
        info::find_matching_config(&self.infos, domain_name)
    }

    /// 进程级缓存环境
    pub fn mr_cache_env(&self) -> &MrCacheEnv {
        &self.mr_cache
    }

    pub fn monitor(&self) -> &Arc<dyn MemoryMonitor> {
        &self.monitor
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("infos", &self.infos.len())
            .field("mr_cache", &self.mr_cache)
            .field("monitor", &self.monitor.name())
            .finish()
    }
}

/// 主机默认的内存监视器
#[cfg(target_os = "linux")]
pub fn default_monitor() -> Arc<dyn MemoryMonitor> {
    Arc::new(crate::mr::uffd::UffdMonitor::new())
}

/// 主机默认的内存监视器
#[cfg(not(target_os = "linux"))]
pub fn default_monitor() -> Arc<dyn MemoryMonitor> {
    Arc::new(NotifierMonitor::new())
}

/// 仅由宿主程序通知的监视器
pub fn notifier_monitor() -> Arc<NotifierMonitor> {
    Arc::new(NotifierMonitor::new())
}

/// fabric 实例
///
/// 记录挂在其上的域数量；仍有域时不能关闭。
#[derive(Debug)]
pub struct Fabric {
    provider: Arc<Provider>,
    api_version: u32,
    domains: AtomicUsize,
    closed: AtomicBool,
}

impl Fabric {
    pub fn open(provider: Arc<Provider>, api_version: u32) -> Arc<Self> {
        log::debug!(
            "Opening fabric {} (API {}.{})",
            info::PROVIDER_NAME,
            api_version >> 16,
            api_version & 0xffff
        );
        Arc::new(Self {
            provider,
            api_version,
            domains: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn provider(&self) -> &Arc<Provider> {
        &self.provider
    }

    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    pub fn name(&self) -> &'static str {
        info::PROVIDER_NAME
    }

    /// 挂在该 fabric 上的域数量
    pub fn open_domains(&self) -> usize {
        self.domains.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 关闭 fabric
    pub fn close(&self) -> FabricResult<()> {
        let domains = self.open_domains();
        if domains > 0 {
            return Err(FabricError::Busy(format!(
                "fabric still has {} open domain(s)",
                domains
            )));
        }
        self.closed.store(true, Ordering::Release);
        log::debug!("Fabric {} closed", self.name());
        Ok(())
    }
}

/// 子对象对域的引用
///
/// 存活期间域的基础状态不能关闭。
#[derive(Debug)]
pub struct DomainRef {
    refs: Arc<AtomicUsize>,
}

impl DomainRef {
    fn new(refs: &Arc<AtomicUsize>) -> Self {
        refs.fetch_add(1, Ordering::AcqRel);
        Self { refs: refs.clone() }
    }
}

impl Drop for DomainRef {
    fn drop(&mut self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

/// 通用域基础状态
///
/// 绑定到 fabric，记录名称、线程模型与注册模式，并统计子对象引用。
#[derive(Debug)]
pub struct UtilDomain {
    fabric: Arc<Fabric>,
    name: String,
    threading: Threading,
    mr_mode: MrMode,
    context: usize,
    refs: Arc<AtomicUsize>,
    closed: bool,
}

impl UtilDomain {
    /// 初始化基础状态并挂到 fabric 上
    pub fn init(fabric: &Arc<Fabric>, info: &FabricInfo, context: usize) -> FabricResult<Self> {
        if fabric.is_closed() {
            return Err(FabricError::InvalidArgument(
                "fabric has been closed".to_string(),
            ));
        }
        let name = info
            .domain_name()
            .ok_or_else(|| FabricError::InvalidArgument("domain name missing".to_string()))?;

        fabric.domains.fetch_add(1, Ordering::AcqRel);
        log::debug!("Domain base {} attached to fabric", name);
        Ok(Self {
            fabric: fabric.clone(),
            name: name.to_string(),
            threading: info.domain_attr.threading,
            mr_mode: info.domain_attr.mr_mode,
            context,
            refs: Arc::new(AtomicUsize::new(0)),
            closed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threading(&self) -> Threading {
        self.threading
    }

    pub fn mr_mode(&self) -> MrMode {
        self.mr_mode
    }

    pub fn context(&self) -> usize {
        self.context
    }

    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    /// 当前子对象引用数
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// 登记一个子对象引用
    pub fn acquire_ref(&self) -> DomainRef {
        DomainRef::new(&self.refs)
    }

    /// 关闭基础状态
    ///
    /// 仍有子对象引用时返回 `Busy`，状态保持不变，可在释放引用后重试。
    pub fn close(&mut self) -> FabricResult<()> {
        if self.closed {
            return Ok(());
        }
        let refs = self.ref_count();
        if refs > 0 {
            return Err(FabricError::Busy(format!(
                "domain {} still has {} open object(s)",
                self.name, refs
            )));
        }
        self.fabric.domains.fetch_sub(1, Ordering::AcqRel);
        self.closed = true;
        log::debug!("Domain base {} detached from fabric", self.name);
        Ok(())
    }
}

impl Drop for UtilDomain {
    fn drop(&mut self) {
        if !self.closed {
            self.fabric.domains.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
