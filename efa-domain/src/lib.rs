//! # efa-domain - EFA 提供者域生命周期
//!
//! 把应用会话绑定到一个 EFA 设备：解析设备上下文、分配保护域、
//! 选择并管理内存注册缓存，并暴露域的子对象操作表。
//!
//! ## 主要组件
//!
//! - **设备解析**: [`resolver`] 把域名映射到枚举出的设备上下文
//! - **保护域**: [`pd`] 分配与释放硬件保护域
//! - **注册缓存**: [`mr`] 进程级缓存配置、缓存实例与内存监视器
//! - **域**: [`Domain`] 按序构建、失败回滚与按逆序关闭
//!
//! ## 示例
//!
//! ```rust,ignore
//! use efa_domain::{Domain, EndpointType, Fabric, FabricInfo, Provider};
//!
//! let provider = Provider::from_env(device)?;
//! let fabric = Fabric::open(provider, efa_domain::EFA_API_VERSION);
//! let domain = Domain::open(&fabric, &FabricInfo::request("efa_0-rdm", EndpointType::Rdm), 0)?;
//! domain.close().map_err(|e| e.error().clone())?;
//! ```

pub mod domain;
pub mod error;
pub mod fabric;
pub mod info;
pub mod mr;
pub mod objects;
pub mod pd;
pub mod resolver;

pub use domain::{
    Domain, DomainCloseError, DomainLink, DomainObject, DomainOp, DomainRequest,
    UnsupportedOp,
};
pub use error::{FabricError, FabricResult};
pub use fabric::{DomainRef, Fabric, Provider, UtilDomain, default_monitor, notifier_monitor};
pub use info::{
    AvType, Caps, DomainAttr, EFA_API_VERSION, EndpointAttr, EndpointType, FabricInfo, MrMode,
    Progress, ResourceMgmt, Threading, fi_version,
};
pub use mr::cache::{MrCacheAttr, MrCacheStats};
pub use mr::config::{EFA_DEF_NUM_MR_CACHE, MrCacheConfig, MrCacheEnv};
pub use mr::monitor::{MemoryMonitor, MonitorError, NotifierMonitor};
pub use mr::{MemoryRegion, MrOpsKind};
pub use objects::{AddressVector, AvAttr, CompletionQueue, CqAttr, Endpoint, FiAddr};
