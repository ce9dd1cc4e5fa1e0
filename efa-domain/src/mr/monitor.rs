//! 内存变更监视器
//!
//! 监视器在底层虚拟内存映射变化（unmap、remap 等）时通知已挂接的
//! 缓存，使对应的注册条目失效。

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// 挂接到监视器上的缓存标识
pub type MonitorId = u64;

/// 监视器错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    /// 主机不支持该监视机制
    #[error("Memory monitor unsupported: {0}")]
    Unsupported(String),

    /// 系统调用失败
    #[error("{op} failed: errno {errno}")]
    Os { op: &'static str, errno: i32 },

    /// 缓存未挂接
    #[error("Cache {0} is not attached to the monitor")]
    NotAttached(MonitorId),
}

pub type MonitorResult<T> = Result<T, MonitorError>;

/// 接收失效通知的一方
pub trait InvalidationTarget: Send + Sync {
    /// 使与 `[addr, addr + len)` 重叠的条目失效
    fn invalidate(&self, addr: u64, len: u64);
}

/// 内存变更监视器
pub trait MemoryMonitor: Send + Sync {
    fn name(&self) -> &'static str;

    /// 挂接缓存
    ///
    /// 主机不支持该机制时返回错误，缓存初始化随之失败。
    fn attach(&self, target: Weak<dyn InvalidationTarget>) -> MonitorResult<MonitorId>;

    /// 解除挂接，之后不再向该缓存投递通知
    fn detach(&self, id: MonitorId);

    /// 订阅地址范围
    fn subscribe(&self, id: MonitorId, addr: u64, len: u64) -> MonitorResult<()>;

    /// 取消订阅地址范围
    fn unsubscribe(&self, id: MonitorId, addr: u64, len: u64);
}

struct Subscriber {
    target: Weak<dyn InvalidationTarget>,
    ranges: Vec<(u64, u64)>,
}

/// 挂接缓存与订阅范围的登记表
#[derive(Default)]
pub(crate) struct MonitorRegistry {
    next_id: MonitorId,
    subscribers: HashMap<MonitorId, Subscriber>,
}

impl MonitorRegistry {
    pub(crate) fn attach(&mut self, target: Weak<dyn InvalidationTarget>) -> MonitorId {
        self.next_id += 1;
        let id = self.next_id;
        self.subscribers.insert(
            id,
            Subscriber {
                target,
                ranges: Vec::new(),
            },
        );
        id
    }

    pub(crate) fn detach(&mut self, id: MonitorId) -> Option<Vec<(u64, u64)>> {
        self.subscribers.remove(&id).map(|s| s.ranges)
    }

    pub(crate) fn subscribe(&mut self, id: MonitorId, addr: u64, len: u64) -> MonitorResult<()> {
        let sub = self
            .subscribers
            .get_mut(&id)
            .ok_or(MonitorError::NotAttached(id))?;
        sub.ranges.push((addr, len));
        Ok(())
    }

    pub(crate) fn unsubscribe(&mut self, id: MonitorId, addr: u64, len: u64) -> bool {
        if let Some(sub) = self.subscribers.get_mut(&id) {
            if let Some(pos) = sub.ranges.iter().position(|r| *r == (addr, len)) {
                sub.ranges.swap_remove(pos);
                return true;
            }
        }
        false
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// 找出订阅范围与 `[addr, addr + len)` 重叠的缓存
    pub(crate) fn targets_for(&self, addr: u64, len: u64) -> Vec<Arc<dyn InvalidationTarget>> {
        let end = addr.saturating_add(len);
        self.subscribers
            .values()
            .filter(|sub| {
                sub.ranges
                    .iter()
                    .any(|&(start, l)| start < end && addr < start.saturating_add(l))
            })
            .filter_map(|sub| sub.target.upgrade())
            .collect()
    }
}

/// 在失效目标上投递通知
///
/// 必须在释放登记表锁之后调用，避免与缓存锁形成环。
pub(crate) fn deliver(targets: Vec<Arc<dyn InvalidationTarget>>, addr: u64, len: u64) -> usize {
    let count = targets.len();
    for target in targets {
        target.invalidate(addr, len);
    }
    count
}

/// 进程内监视器
///
/// 由宿主程序在释放或重新映射内存时调用 [`NotifierMonitor::notify_unmap`]。
#[derive(Default)]
pub struct NotifierMonitor {
    registry: Mutex<MonitorRegistry>,
}

impl NotifierMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 报告 `[addr, addr + len)` 已解除映射，返回收到通知的缓存数
    pub fn notify_unmap(&self, addr: u64, len: u64) -> usize {
        let targets = self.registry.lock().targets_for(addr, len);
        log::trace!(
            "Memory monitor: unmap [{:#x}, +{:#x}) -> {} cache(s)",
            addr,
            len,
            targets.len()
        );
        deliver(targets, addr, len)
    }

    /// 当前挂接的缓存数
    pub fn attached(&self) -> usize {
        self.registry.lock().subscribers.len()
    }

    /// 当前订阅的范围总数
    pub fn subscriptions(&self) -> usize {
        self.registry
            .lock()
            .subscribers
            .values()
            .map(|s| s.ranges.len())
            .sum()
    }
}

impl MemoryMonitor for NotifierMonitor {
    fn name(&self) -> &'static str {
        "notifier"
    }

    fn attach(&self, target: Weak<dyn InvalidationTarget>) -> MonitorResult<MonitorId> {
        Ok(self.registry.lock().attach(target))
    }

    fn detach(&self, id: MonitorId) {
        self.registry.lock().detach(id);
    }

    fn subscribe(&self, id: MonitorId, addr: u64, len: u64) -> MonitorResult<()> {
        self.registry.lock().subscribe(id, addr, len)
    }

    fn unsubscribe(&self, id: MonitorId, addr: u64, len: u64) {
        self.registry.lock().unsubscribe(id, addr, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        hits: Mutex<Vec<(u64, u64)>>,
    }

    impl InvalidationTarget for Recorder {
        fn invalidate(&self, addr: u64, len: u64) {
            self.hits.lock().push((addr, len));
        }
    }

    fn attach_recorder(monitor: &NotifierMonitor) -> (Arc<Recorder>, MonitorId) {
        let recorder = Arc::new(Recorder::default());
        let target: Arc<dyn InvalidationTarget> = recorder.clone();
        let id = monitor.attach(Arc::downgrade(&target)).unwrap();
        (recorder, id)
    }

    #[test]
    fn test_notify_overlapping_subscription() {
        let monitor = NotifierMonitor::new();
        let (recorder, id) = attach_recorder(&monitor);
        monitor.subscribe(id, 0x1000, 0x1000).unwrap();

        assert_eq!(monitor.notify_unmap(0x1800, 0x100), 1);
        assert_eq!(monitor.notify_unmap(0x2000, 0x1000), 0);
        assert_eq!(*recorder.hits.lock(), vec![(0x1800, 0x100)]);
    }

    #[test]
    fn test_unsubscribe_and_detach() {
        let monitor = NotifierMonitor::new();
        let (recorder, id) = attach_recorder(&monitor);
        monitor.subscribe(id, 0x1000, 0x1000).unwrap();
        assert_eq!(monitor.subscriptions(), 1);

        monitor.unsubscribe(id, 0x1000, 0x1000);
        assert_eq!(monitor.subscriptions(), 0);
        assert_eq!(monitor.notify_unmap(0x1000, 0x1000), 0);

        monitor.detach(id);
        assert_eq!(monitor.attached(), 0);
        assert_eq!(
            monitor.subscribe(id, 0, 1),
            Err(MonitorError::NotAttached(id))
        );
        assert!(recorder.hits.lock().is_empty());
    }

    #[test]
    fn test_dropped_target_is_skipped() {
        let monitor = NotifierMonitor::new();
        let (recorder, id) = attach_recorder(&monitor);
        monitor.subscribe(id, 0, 0x1000).unwrap();
        drop(recorder);
        assert_eq!(monitor.notify_unmap(0, 0x1000), 0);
    }
}
