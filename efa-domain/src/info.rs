//! 能力描述与属性协商
//!
//! 描述提供者通告的配置（每个设备两个：可靠数据报与数据报），
//! 以及调用者请求的域属性与通告配置之间的兼容性检查。

use crate::error::{FabricError, FabricResult};
use efa_verbs::DeviceContext;

/// 可靠数据报域名后缀
pub const RDM_DOMAIN_SUFFIX: &str = "-rdm";
/// 数据报域名后缀
pub const DGRAM_DOMAIN_SUFFIX: &str = "-dgrm";

/// 提供者名
pub const PROVIDER_NAME: &str = "efa";

/// 编码 API 版本
pub const fn fi_version(major: u32, minor: u32) -> u32 {
    (major << 16) | minor
}

/// 提供者支持的 API 版本
pub const EFA_API_VERSION: u32 = fi_version(1, 7);

bitflags::bitflags! {
    /// 能力位
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Caps: u64 {
        const MSG = 1 << 1;
        const RMA = 1 << 2;
        const TAGGED = 1 << 3;
        const ATOMIC = 1 << 4;
        const READ = 1 << 8;
        const WRITE = 1 << 9;
        const RECV = 1 << 10;
        const SEND = 1 << 11;
        const REMOTE_READ = 1 << 12;
        const REMOTE_WRITE = 1 << 13;
        const LOCAL_COMM = 1 << 18;
        const REMOTE_COMM = 1 << 19;
        const SOURCE = 1 << 57;
    }
}

bitflags::bitflags! {
    /// 内存注册模式位
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MrMode: u32 {
        const LOCAL = 1 << 2;
        const VIRT_ADDR = 1 << 4;
        const ALLOCATED = 1 << 5;
        const PROV_KEY = 1 << 6;
    }
}

/// 端点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Unspec,
    Msg,
    Dgram,
    Rdm,
}

impl EndpointType {
    /// 该端点类型对应的域名后缀
    pub fn domain_suffix(self) -> Option<&'static str> {
        match self {
            EndpointType::Rdm => Some(RDM_DOMAIN_SUFFIX),
            EndpointType::Dgram => Some(DGRAM_DOMAIN_SUFFIX),
            EndpointType::Unspec | EndpointType::Msg => None,
        }
    }
}

/// 线程模型（按 libfabric 枚举顺序比较）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Threading {
    Unspec,
    Safe,
    Fid,
    Domain,
    Completion,
}

/// 进度模型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Unspec,
    Auto,
    Manual,
}

/// 资源管理
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceMgmt {
    Unspec,
    Disabled,
    Enabled,
}

/// 地址向量类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvType {
    Unspec,
    Map,
    Table,
}

/// 域属性
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainAttr {
    pub name: Option<String>,
    pub threading: Threading,
    pub control_progress: Progress,
    pub data_progress: Progress,
    pub resource_mgmt: ResourceMgmt,
    pub av_type: AvType,
    pub mr_mode: MrMode,
    pub mr_key_size: usize,
    pub cq_data_size: usize,
    pub cq_cnt: usize,
    pub ep_cnt: usize,
    pub tx_ctx_cnt: usize,
    pub rx_ctx_cnt: usize,
    pub max_ep_tx_ctx: usize,
    pub max_ep_rx_ctx: usize,
    pub mr_iov_limit: usize,
    /// 可注册内存区域总数上限
    pub mr_cnt: usize,
}

impl Default for DomainAttr {
    fn default() -> Self {
        Self {
            name: None,
            threading: Threading::Unspec,
            control_progress: Progress::Unspec,
            data_progress: Progress::Unspec,
            resource_mgmt: ResourceMgmt::Unspec,
            av_type: AvType::Unspec,
            mr_mode: MrMode::empty(),
            mr_key_size: 0,
            cq_data_size: 0,
            cq_cnt: 0,
            ep_cnt: 0,
            tx_ctx_cnt: 0,
            rx_ctx_cnt: 0,
            max_ep_tx_ctx: 0,
            max_ep_rx_ctx: 0,
            mr_iov_limit: 0,
            mr_cnt: 0,
        }
    }
}

/// 端点属性
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAttr {
    pub ep_type: EndpointType,
    pub max_msg_size: usize,
}

impl Default for EndpointAttr {
    fn default() -> Self {
        Self {
            ep_type: EndpointType::Unspec,
            max_msg_size: 0,
        }
    }
}

/// 能力描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricInfo {
    pub caps: Caps,
    pub ep_attr: EndpointAttr,
    pub domain_attr: DomainAttr,
    pub fabric_name: String,
    pub prov_name: String,
}

impl FabricInfo {
    /// 请求指定域名和端点类型的描述，其余属性取未指定值
    pub fn request(domain_name: impl Into<String>, ep_type: EndpointType) -> Self {
        Self {
            caps: Caps::empty(),
            ep_attr: EndpointAttr {
                ep_type,
                ..EndpointAttr::default()
            },
            domain_attr: DomainAttr {
                name: Some(domain_name.into()),
                ..DomainAttr::default()
            },
            fabric_name: PROVIDER_NAME.to_string(),
            prov_name: PROVIDER_NAME.to_string(),
        }
    }

    /// 是否为可靠数据报配置
    pub fn is_rdm(&self) -> bool {
        self.ep_attr.ep_type == EndpointType::Rdm
    }

    /// 域名
    pub fn domain_name(&self) -> Option<&str> {
        self.domain_attr.name.as_deref()
    }

    /// 用通告配置补齐未指定的域属性
    ///
    /// 调用前应已通过 [`validate_domain_attrs`]。
    pub fn negotiate(&self, prov: &FabricInfo) -> FabricInfo {
        let user = &self.domain_attr;
        let prov_attr = &prov.domain_attr;
        let pick = |requested: usize, supported: usize| {
            if requested == 0 { supported } else { requested }
        };

        let mut info = self.clone();
        if info.caps.is_empty() {
            info.caps = prov.caps;
        }
        if info.ep_attr.ep_type == EndpointType::Unspec {
            info.ep_attr.ep_type = prov.ep_attr.ep_type;
        }
        if info.ep_attr.max_msg_size == 0 {
            info.ep_attr.max_msg_size = prov.ep_attr.max_msg_size;
        }
        info.domain_attr = DomainAttr {
            name: user.name.clone().or_else(|| prov_attr.name.clone()),
            threading: if user.threading == Threading::Unspec {
                prov_attr.threading
            } else {
                user.threading
            },
            control_progress: if user.control_progress == Progress::Unspec {
                prov_attr.control_progress
            } else {
                user.control_progress
            },
            data_progress: if user.data_progress == Progress::Unspec {
                prov_attr.data_progress
            } else {
                user.data_progress
            },
            resource_mgmt: if user.resource_mgmt == ResourceMgmt::Unspec {
                prov_attr.resource_mgmt
            } else {
                user.resource_mgmt
            },
            av_type: if user.av_type == AvType::Unspec {
                prov_attr.av_type
            } else {
                user.av_type
            },
            mr_mode: if user.mr_mode.is_empty() {
                prov_attr.mr_mode
            } else {
                user.mr_mode
            },
            mr_key_size: pick(user.mr_key_size, prov_attr.mr_key_size),
            cq_data_size: pick(user.cq_data_size, prov_attr.cq_data_size),
            cq_cnt: pick(user.cq_cnt, prov_attr.cq_cnt),
            ep_cnt: pick(user.ep_cnt, prov_attr.ep_cnt),
            tx_ctx_cnt: pick(user.tx_ctx_cnt, prov_attr.tx_ctx_cnt),
            rx_ctx_cnt: pick(user.rx_ctx_cnt, prov_attr.rx_ctx_cnt),
            max_ep_tx_ctx: pick(user.max_ep_tx_ctx, prov_attr.max_ep_tx_ctx),
            max_ep_rx_ctx: pick(user.max_ep_rx_ctx, prov_attr.max_ep_rx_ctx),
            mr_iov_limit: pick(user.mr_iov_limit, prov_attr.mr_iov_limit),
            mr_cnt: pick(user.mr_cnt, prov_attr.mr_cnt),
        };
        info
    }
}

/// 为单个设备生成一种端点类型的通告配置
pub fn device_info(ctx: &DeviceContext, ep_type: EndpointType) -> Option<FabricInfo> {
    let suffix = ep_type.domain_suffix()?;
    let caps = match ep_type {
        EndpointType::Rdm => {
            Caps::MSG
                | Caps::TAGGED
                | Caps::RMA
                | Caps::READ
                | Caps::RECV
                | Caps::SEND
                | Caps::REMOTE_READ
                | Caps::LOCAL_COMM
                | Caps::REMOTE_COMM
                | Caps::SOURCE
        }
        _ => Caps::MSG | Caps::RECV | Caps::SEND | Caps::SOURCE,
    };
    let max_ep = ctx.max_qp as usize;

    Some(FabricInfo {
        caps,
        ep_attr: EndpointAttr {
            ep_type,
            max_msg_size: ctx.max_mr_size.min(u32::MAX as u64) as usize,
        },
        domain_attr: DomainAttr {
            name: Some(format!("{}{}", ctx.name, suffix)),
            threading: Threading::Domain,
            control_progress: Progress::Auto,
            data_progress: Progress::Auto,
            resource_mgmt: ResourceMgmt::Enabled,
            av_type: AvType::Table,
            mr_mode: MrMode::LOCAL | MrMode::VIRT_ADDR | MrMode::ALLOCATED | MrMode::PROV_KEY,
            mr_key_size: 4,
            cq_data_size: 0,
            cq_cnt: max_ep,
            ep_cnt: max_ep,
            tx_ctx_cnt: max_ep,
            rx_ctx_cnt: max_ep,
            max_ep_tx_ctx: 1,
            max_ep_rx_ctx: 1,
            mr_iov_limit: 1,
            mr_cnt: ctx.max_mr as usize,
        },
        fabric_name: PROVIDER_NAME.to_string(),
        prov_name: PROVIDER_NAME.to_string(),
    })
}

/// 按域名查找通告配置
pub fn find_matching_config<'a>(infos: &'a [FabricInfo], name: &str) -> Option<&'a FabricInfo> {
    infos.iter().find(|fi| fi.domain_name() == Some(name))
}

fn check_limit(what: &str, requested: usize, supported: usize) -> FabricResult<()> {
    if requested > supported {
        return Err(FabricError::InvalidArgument(format!(
            "{} {} exceeds supported {}",
            what, requested, supported
        )));
    }
    Ok(())
}

/// 请求的端点类型必须与通告配置一致，未指定时沿用通告值
pub fn validate_endpoint_type(prov: &FabricInfo, requested: &FabricInfo) -> FabricResult<()> {
    let wanted = requested.ep_attr.ep_type;
    if wanted != EndpointType::Unspec && wanted != prov.ep_attr.ep_type {
        log::debug!(
            "Endpoint type {:?} does not match {:?} advertised for {}",
            wanted,
            prov.ep_attr.ep_type,
            prov.domain_name().unwrap_or_default()
        );
        return Err(FabricError::InvalidArgument(format!(
            "endpoint type {:?} not offered by domain {}",
            wanted,
            prov.domain_name().unwrap_or_default()
        )));
    }
    Ok(())
}

/// 检查请求的域属性与通告配置是否兼容
///
/// 未指定的属性视为兼容；数量类属性不得超过通告上限。
pub fn validate_domain_attrs(
    api_version: u32,
    prov_attr: &DomainAttr,
    requested: &FabricInfo,
) -> FabricResult<()> {
    if api_version > EFA_API_VERSION {
        return Err(FabricError::InvalidArgument(format!(
            "API version {}.{} newer than provider {}.{}",
            api_version >> 16,
            api_version & 0xffff,
            EFA_API_VERSION >> 16,
            EFA_API_VERSION & 0xffff
        )));
    }

    let user = &requested.domain_attr;

    if let Some(name) = user.name.as_deref() {
        if prov_attr.name.as_deref() != Some(name) {
            return Err(FabricError::InvalidArgument(format!(
                "domain name {} does not match provider domain",
                name
            )));
        }
    }

    if user.threading != Threading::Unspec && user.threading > prov_attr.threading {
        return Err(FabricError::InvalidArgument(format!(
            "threading model {:?} not supported",
            user.threading
        )));
    }

    for (what, progress) in [
        ("control progress", user.control_progress),
        ("data progress", user.data_progress),
    ] {
        if progress == Progress::Manual {
            return Err(FabricError::InvalidArgument(format!(
                "{} {:?} not supported",
                what, progress
            )));
        }
    }

    if user.resource_mgmt == ResourceMgmt::Disabled
        && prov_attr.resource_mgmt == ResourceMgmt::Enabled
    {
        return Err(FabricError::InvalidArgument(
            "resource management cannot be disabled".to_string(),
        ));
    }

    if user.av_type != AvType::Unspec && user.av_type != prov_attr.av_type {
        return Err(FabricError::InvalidArgument(format!(
            "AV type {:?} not supported",
            user.av_type
        )));
    }

    // 提供者要求的注册模式位必须全部由调用者接受
    if !user.mr_mode.is_empty() && !user.mr_mode.contains(prov_attr.mr_mode) {
        return Err(FabricError::InvalidArgument(format!(
            "MR mode {:?} missing required bits {:?}",
            user.mr_mode,
            prov_attr.mr_mode - user.mr_mode
        )));
    }

    if user.mr_key_size != 0 && user.mr_key_size != prov_attr.mr_key_size {
        return Err(FabricError::InvalidArgument(format!(
            "MR key size {} not supported",
            user.mr_key_size
        )));
    }

    check_limit("CQ data size", user.cq_data_size, prov_attr.cq_data_size)?;
    check_limit("CQ count", user.cq_cnt, prov_attr.cq_cnt)?;
    check_limit("endpoint count", user.ep_cnt, prov_attr.ep_cnt)?;
    check_limit("TX context count", user.tx_ctx_cnt, prov_attr.tx_ctx_cnt)?;
    check_limit("RX context count", user.rx_ctx_cnt, prov_attr.rx_ctx_cnt)?;
    check_limit("max EP TX contexts", user.max_ep_tx_ctx, prov_attr.max_ep_tx_ctx)?;
    check_limit("max EP RX contexts", user.max_ep_rx_ctx, prov_attr.max_ep_rx_ctx)?;
    check_limit("MR IOV limit", user.mr_iov_limit, prov_attr.mr_iov_limit)?;
    check_limit("MR count", user.mr_cnt, prov_attr.mr_cnt)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advertised() -> FabricInfo {
        device_info(&DeviceContext::new("efa_0", 0), EndpointType::Rdm).unwrap()
    }

    #[test]
    fn test_device_info_names() {
        let ctx = DeviceContext::new("efa_0", 0);
        let rdm = device_info(&ctx, EndpointType::Rdm).unwrap();
        let dgrm = device_info(&ctx, EndpointType::Dgram).unwrap();
        assert_eq!(rdm.domain_name(), Some("efa_0-rdm"));
        assert_eq!(dgrm.domain_name(), Some("efa_0-dgrm"));
        assert!(rdm.is_rdm());
        assert!(!dgrm.is_rdm());
        assert!(device_info(&ctx, EndpointType::Msg).is_none());
    }

    #[test]
    fn test_find_matching_config() {
        let infos = vec![advertised()];
        assert!(find_matching_config(&infos, "efa_0-rdm").is_some());
        assert!(find_matching_config(&infos, "efa_1-rdm").is_none());
    }

    #[test]
    fn test_validate_accepts_unspecified_request() {
        let prov = advertised();
        let req = FabricInfo::request("efa_0-rdm", EndpointType::Rdm);
        validate_domain_attrs(EFA_API_VERSION, &prov.domain_attr, &req).unwrap();
    }

    #[test]
    fn test_validate_rejects_excess_mr_cnt() {
        let prov = advertised();
        let mut req = FabricInfo::request("efa_0-rdm", EndpointType::Rdm);
        req.domain_attr.mr_cnt = prov.domain_attr.mr_cnt + 1;
        let err = validate_domain_attrs(EFA_API_VERSION, &prov.domain_attr, &req).unwrap_err();
        assert!(matches!(err, FabricError::InvalidArgument(_)));
    }

    #[test]
    fn test_validate_rejects_incomplete_mr_mode() {
        let prov = advertised();
        let mut req = FabricInfo::request("efa_0-rdm", EndpointType::Rdm);
        req.domain_attr.mr_mode = MrMode::LOCAL;
        assert!(validate_domain_attrs(EFA_API_VERSION, &prov.domain_attr, &req).is_err());
    }

    #[test]
    fn test_validate_rejects_manual_progress_and_newer_api() {
        let prov = advertised();
        let mut req = FabricInfo::request("efa_0-rdm", EndpointType::Rdm);
        req.domain_attr.data_progress = Progress::Manual;
        assert!(validate_domain_attrs(EFA_API_VERSION, &prov.domain_attr, &req).is_err());

        let req = FabricInfo::request("efa_0-rdm", EndpointType::Rdm);
        assert!(validate_domain_attrs(fi_version(2, 0), &prov.domain_attr, &req).is_err());
    }

    #[test]
    fn test_threading_order() {
        let prov = advertised();
        let mut req = FabricInfo::request("efa_0-rdm", EndpointType::Rdm);
        req.domain_attr.threading = Threading::Completion;
        assert!(validate_domain_attrs(EFA_API_VERSION, &prov.domain_attr, &req).is_err());
        req.domain_attr.threading = Threading::Safe;
        assert!(validate_domain_attrs(EFA_API_VERSION, &prov.domain_attr, &req).is_ok());
    }

    #[test]
    fn test_negotiate_fills_unspecified() {
        let prov = advertised();
        let mut req = FabricInfo::request("efa_0-rdm", EndpointType::Rdm);
        req.domain_attr.mr_cnt = 1000;
        let info = req.negotiate(&prov);
        assert_eq!(info.domain_attr.mr_cnt, 1000);
        assert_eq!(info.domain_attr.threading, prov.domain_attr.threading);
        assert_eq!(info.domain_attr.mr_mode, prov.domain_attr.mr_mode);
        assert_eq!(info.domain_attr.ep_cnt, prov.domain_attr.ep_cnt);
        assert_eq!(info.caps, prov.caps);
    }

    #[test]
    fn test_endpoint_type_must_match_advertised() {
        let prov = advertised();
        let req = FabricInfo::request("efa_0-rdm", EndpointType::Dgram);
        let err = validate_endpoint_type(&prov, &req).unwrap_err();
        assert!(matches!(err, FabricError::InvalidArgument(_)));

        let req = FabricInfo::request("efa_0-rdm", EndpointType::Unspec);
        validate_endpoint_type(&prov, &req).unwrap();
        assert!(req.negotiate(&prov).is_rdm());
    }
}
