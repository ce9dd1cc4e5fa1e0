//! 模拟设备层
//!
//! 在没有 EFA 硬件的主机上提供完整的 [`VerbsDevice`] 实现，
//! 记录每个资源的分配与释放，支持一次性故障注入，并保存
//! 有序的事件日志以便验证资源获取/释放顺序。

use crate::device::{DeviceContext, MemDesc, MrAccess, ProtectionDomain, VerbsDevice};
use crate::error::{VerbsError, VerbsResult, errno};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// 故障注入点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    ContextList,
    AllocPd,
    DeallocPd,
    RegMr,
    DeregMr,
}

/// 设备事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    ContextListAcquired,
    ContextListReleased,
    PdAllocated { pdn: u32, device: String },
    PdDeallocated { pdn: u32 },
    MrRegistered { lkey: u32, pdn: u32 },
    MrDeregistered { lkey: u32 },
    Fault { point: FaultPoint, errno: i32 },
}

/// 累计统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    pub pds_allocated: u64,
    pub pds_deallocated: u64,
    pub mrs_registered: u64,
    pub mrs_deregistered: u64,
    pub context_lists: u64,
}

#[derive(Default)]
struct SimState {
    contexts: Vec<Arc<DeviceContext>>,
    pds: HashMap<u32, Arc<DeviceContext>>,
    mrs: HashMap<u32, MemDesc>,
    open_lists: usize,
    next_pdn: u32,
    next_key: u32,
    faults: HashMap<FaultPoint, i32>,
    events: Vec<DeviceEvent>,
    stats: SimStats,
}

impl SimState {
    fn take_fault(&mut self, point: FaultPoint) -> Option<i32> {
        let errno = self.faults.remove(&point)?;
        self.events.push(DeviceEvent::Fault { point, errno });
        Some(errno)
    }
}

/// 模拟 verbs 设备
pub struct SimDevice {
    state: Mutex<SimState>,
}

impl SimDevice {
    /// 以给定设备上下文创建模拟设备
    pub fn new(contexts: Vec<DeviceContext>) -> Self {
        let state = SimState {
            contexts: contexts.into_iter().map(Arc::new).collect(),
            next_pdn: 1,
            next_key: 0x100,
            ..SimState::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    /// 以设备名列表创建模拟设备，设备能力取默认值
    pub fn with_devices(names: &[&str]) -> Self {
        Self::new(
            names
                .iter()
                .enumerate()
                .map(|(i, name)| DeviceContext::new(*name, i as u32))
                .collect(),
        )
    }

    /// 在下一次调用 `point` 时返回 `errno`
    pub fn inject_fault(&self, point: FaultPoint, errno: i32) {
        self.state.lock().faults.insert(point, errno);
    }

    /// 清除所有未触发的故障
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// 尚未释放的保护域数量
    pub fn outstanding_pds(&self) -> usize {
        self.state.lock().pds.len()
    }

    /// 尚未注销的内存区域数量
    pub fn outstanding_mrs(&self) -> usize {
        self.state.lock().mrs.len()
    }

    /// 尚未归还的上下文列表数量
    pub fn outstanding_context_lists(&self) -> usize {
        self.state.lock().open_lists
    }

    /// 事件日志快照
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    pub fn stats(&self) -> SimStats {
        self.state.lock().stats.clone()
    }
}

impl VerbsDevice for SimDevice {
    fn get_context_list(&self) -> VerbsResult<Vec<Arc<DeviceContext>>> {
        let mut state = self.state.lock();
        if let Some(errno) = state.take_fault(FaultPoint::ContextList) {
            return Err(VerbsError::errno("efa_device_get_context_list", errno));
        }
        state.open_lists += 1;
        state.stats.context_lists += 1;
        state.events.push(DeviceEvent::ContextListAcquired);
        Ok(state.contexts.clone())
    }

    fn free_context_list(&self, list: Vec<Arc<DeviceContext>>) {
        drop(list);
        let mut state = self.state.lock();
        state.open_lists = state.open_lists.saturating_sub(1);
        state.events.push(DeviceEvent::ContextListReleased);
    }

    fn alloc_pd(&self, context: &Arc<DeviceContext>) -> VerbsResult<ProtectionDomain> {
        let mut state = self.state.lock();
        if let Some(errno) = state.take_fault(FaultPoint::AllocPd) {
            return Err(VerbsError::errno("ibv_alloc_pd", errno));
        }
        if !state.contexts.iter().any(|c| Arc::ptr_eq(c, context)) {
            return Err(VerbsError::InvalidHandle(format!(
                "device context {} not owned by this device",
                context
            )));
        }

        let pdn = state.next_pdn;
        state.next_pdn += 1;
        state.pds.insert(pdn, context.clone());
        state.stats.pds_allocated += 1;
        state.events.push(DeviceEvent::PdAllocated {
            pdn,
            device: context.name.clone(),
        });
        Ok(ProtectionDomain::new(pdn, context.clone()))
    }

    fn dealloc_pd(&self, pd: &ProtectionDomain) -> VerbsResult<()> {
        let mut state = self.state.lock();
        if let Some(errno) = state.take_fault(FaultPoint::DeallocPd) {
            return Err(VerbsError::errno("ibv_dealloc_pd", errno));
        }
        if !state.pds.contains_key(&pd.pdn()) {
            return Err(VerbsError::InvalidHandle(format!("pd[{}]", pd.pdn())));
        }
        // 仍有内存区域引用该保护域时硬件拒绝释放
        if state.mrs.values().any(|mr| mr.pdn == pd.pdn()) {
            return Err(VerbsError::errno("ibv_dealloc_pd", errno::EBUSY));
        }

        state.pds.remove(&pd.pdn());
        state.stats.pds_deallocated += 1;
        state.events.push(DeviceEvent::PdDeallocated { pdn: pd.pdn() });
        Ok(())
    }

    fn reg_mr(
        &self,
        pd: &ProtectionDomain,
        addr: u64,
        length: u64,
        _access: MrAccess,
    ) -> VerbsResult<MemDesc> {
        let mut state = self.state.lock();
        if let Some(errno) = state.take_fault(FaultPoint::RegMr) {
            return Err(VerbsError::errno("ibv_reg_mr", errno));
        }
        let context = state
            .pds
            .get(&pd.pdn())
            .cloned()
            .ok_or_else(|| VerbsError::InvalidHandle(format!("pd[{}]", pd.pdn())))?;

        if length == 0 || length > context.max_mr_size {
            return Err(VerbsError::errno("ibv_reg_mr", errno::EINVAL));
        }
        if addr.checked_add(length).is_none() {
            return Err(VerbsError::errno("ibv_reg_mr", errno::EFAULT));
        }
        if state.mrs.len() as u64 >= context.max_mr {
            return Err(VerbsError::errno("ibv_reg_mr", errno::ENOMEM));
        }

        let key = state.next_key;
        state.next_key += 1;
        let desc = MemDesc {
            lkey: key,
            rkey: key,
            addr,
            length,
            pdn: pd.pdn(),
        };
        state.mrs.insert(key, desc);
        state.stats.mrs_registered += 1;
        state.events.push(DeviceEvent::MrRegistered {
            lkey: key,
            pdn: pd.pdn(),
        });
        Ok(desc)
    }

    fn dereg_mr(&self, desc: &MemDesc) -> VerbsResult<()> {
        let mut state = self.state.lock();
        if let Some(errno) = state.take_fault(FaultPoint::DeregMr) {
            return Err(VerbsError::errno("ibv_dereg_mr", errno));
        }
        if state.mrs.remove(&desc.lkey).is_none() {
            return Err(VerbsError::InvalidHandle(format!("mr lkey {:#x}", desc.lkey)));
        }
        state.stats.mrs_deregistered += 1;
        state
            .events
            .push(DeviceEvent::MrDeregistered { lkey: desc.lkey });
        Ok(())
    }
}
