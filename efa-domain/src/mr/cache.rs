// 内存注册缓存
//
// 对重复或重叠的注册请求复用已注册区域，包括：
// - 覆盖查找与可选的重叠区域合并
// - 按条目数/字节数限额的 LRU 淘汰
// - 内存监视器驱动的失效
// - 关闭时的完整清理

use super::monitor::{InvalidationTarget, MemoryMonitor, MonitorId};
use crate::error::{FabricError, FabricResult};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Weak};

/// 缓存条目标识
pub type EntryId = u64;

/// 缓存准入/淘汰回调
///
/// 缓存在接纳新区域时调用 `add_region` 完成真正的注册，
/// 在淘汰或失效区域时调用 `delete_region` 注销。
pub trait RegionHandler: Send + Sync + 'static {
    /// 每个条目携带的注册记录
    type Data: Clone + Send + 'static;

    fn add_region(&self, addr: u64, len: u64) -> FabricResult<Self::Data>;

    fn delete_region(&self, addr: u64, len: u64, data: &Self::Data);
}

/// 缓存参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrCacheAttr {
    /// 最大缓存条目数
    pub max_cnt: usize,
    /// 最大缓存字节数
    pub max_size: usize,
    /// 是否合并重叠区域
    pub merge_regions: bool,
}

/// 缓存统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MrCacheStats {
    pub searches: u64,
    pub hits: u64,
    pub misses: u64,
    pub notifications: u64,
    pub flushes: u64,
    /// 因限额无法缓存而直接注册的次数
    pub uncached: u64,
    /// 当前缓存中的条目数
    pub cached_cnt: usize,
    /// 当前缓存中的字节数
    pub cached_size: usize,
    /// 当前仍被使用的条目数
    pub in_use: usize,
}

impl std::fmt::Display for MrCacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "searches={} hits={} misses={} notify={} flushes={} uncached={} cached={}/{}B in_use={}",
            self.searches,
            self.hits,
            self.misses,
            self.notifications,
            self.flushes,
            self.uncached,
            self.cached_cnt,
            self.cached_size,
            self.in_use
        )
    }
}

/// 交给调用者的条目视图
#[derive(Debug, Clone)]
pub struct CacheEntry<D> {
    pub id: EntryId,
    pub addr: u64,
    pub len: u64,
    pub data: D,
}

struct Entry<D> {
    addr: u64,
    len: u64,
    data: D,
    use_cnt: usize,
    /// 是否仍在查找树中
    cached: bool,
}

impl<D> Entry<D> {
    fn end(&self) -> u64 {
        self.addr + self.len
    }
}

struct CacheState<D> {
    entries: HashMap<EntryId, Entry<D>>,
    tree: BTreeSet<(u64, EntryId)>,
    lru: VecDeque<EntryId>,
    next_id: EntryId,
    cached_size: usize,
    stats: MrCacheStats,
    monitor_id: Option<MonitorId>,
    closed: bool,
}

impl<D> CacheState<D> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            tree: BTreeSet::new(),
            lru: VecDeque::new(),
            next_id: 1,
            cached_size: 0,
            stats: MrCacheStats::default(),
            monitor_id: None,
            closed: false,
        }
    }

    fn cached_cnt(&self) -> usize {
        self.tree.len()
    }

    /// 查找完整覆盖 `[addr, end)` 的条目
    fn find_covering(&self, addr: u64, end: u64) -> Option<EntryId> {
        self.tree
            .range(..=(addr, EntryId::MAX))
            .rev()
            .map(|&(_, id)| id)
            .find(|id| self.entries.get(id).is_some_and(|e| e.end() >= end))
    }

    /// 与 `[addr, end)` 重叠的条目
    fn overlapping(&self, addr: u64, end: u64) -> Vec<EntryId> {
        self.tree
            .range(..(end, 0))
            .map(|&(_, id)| id)
            .filter(|id| self.entries.get(id).is_some_and(|e| e.end() > addr))
            .collect()
    }

    fn remove_from_lru(&mut self, id: EntryId) {
        if let Some(pos) = self.lru.iter().position(|&x| x == id) {
            self.lru.remove(pos);
        }
    }
}

/// 内存注册缓存实例
pub struct MrCache<H: RegionHandler> {
    handler: H,
    attr: MrCacheAttr,
    monitor: Arc<dyn MemoryMonitor>,
    state: Mutex<CacheState<H::Data>>,
}

impl<H: RegionHandler> MrCache<H> {
    /// 创建缓存并挂接到内存监视器
    ///
    /// 监视器不可用时返回错误，不会留下任何已挂接状态。
    pub fn init(
        monitor: Arc<dyn MemoryMonitor>,
        attr: MrCacheAttr,
        handler: H,
    ) -> FabricResult<Arc<Self>> {
        let cache = Arc::new(Self {
            handler,
            attr,
            monitor,
            state: Mutex::new(CacheState::new()),
        });

        let weak: Weak<dyn InvalidationTarget> = Arc::downgrade(&cache) as Weak<Self>;
        let id = cache.monitor.attach(weak)?;
        cache.state.lock().monitor_id = Some(id);

        log::debug!(
            "MR cache initialised: max_cnt={} max_size={} merge={} monitor={}",
            attr.max_cnt,
            attr.max_size,
            attr.merge_regions,
            cache.monitor.name()
        );
        Ok(cache)
    }

    pub fn attr(&self) -> MrCacheAttr {
        self.attr
    }

    /// 每个条目注册记录的大小
    pub fn entry_data_size(&self) -> usize {
        std::mem::size_of::<H::Data>()
    }

    pub fn stats(&self) -> MrCacheStats {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.cached_cnt = state.cached_cnt();
        stats.cached_size = state.cached_size;
        stats.in_use = state.entries.values().filter(|e| e.use_cnt > 0).count();
        stats
    }

    /// 查找或注册覆盖 `[addr, addr + len)` 的区域
    ///
    /// 返回的条目已计入使用，必须用 [`MrCache::release`] 归还。
    pub fn search(&self, addr: u64, len: u64) -> FabricResult<CacheEntry<H::Data>> {
        let end = addr.checked_add(len).ok_or_else(|| {
            FabricError::InvalidArgument(format!("region {:#x}+{:#x} overflows", addr, len))
        })?;
        if len == 0 {
            return Err(FabricError::InvalidArgument(
                "zero-length region".to_string(),
            ));
        }

        let mut state = self.state.lock();
        if state.closed {
            return Err(FabricError::InvalidArgument(
                "MR cache has been cleaned up".to_string(),
            ));
        }
        state.stats.searches += 1;

        if let Some(id) = state.find_covering(addr, end) {
            state.stats.hits += 1;
            let idle = state.entries.get(&id).is_some_and(|e| e.use_cnt == 0);
            if idle {
                state.remove_from_lru(id);
            }
            let entry = state
                .entries
                .get_mut(&id)
                .ok_or_else(|| FabricError::InvalidArgument(format!("entry {} vanished", id)))?;
            entry.use_cnt += 1;
            return Ok(CacheEntry {
                id,
                addr: entry.addr,
                len: entry.len,
                data: entry.data.clone(),
            });
        }
        state.stats.misses += 1;

        let (mut start, mut stop) = (addr, end);
        if self.attr.merge_regions {
            loop {
                let overlaps = state.overlapping(start, stop);
                if overlaps.is_empty() {
                    break;
                }
                for id in overlaps {
                    if let Some(e) = state.entries.get(&id) {
                        start = start.min(e.addr);
                        stop = stop.max(e.end());
                    }
                    self.evict(&mut state, id);
                }
            }
        }
        let new_len = stop - start;

        // 单个区域超出限额时不淘汰任何条目，直接走非缓存注册
        let mut cacheable = self.attr.max_cnt > 0
            && usize::try_from(new_len).is_ok_and(|l| l <= self.attr.max_size);
        while cacheable
            && (state.cached_cnt() >= self.attr.max_cnt
                || state.cached_size.saturating_add(new_len as usize) > self.attr.max_size)
        {
            if !self.flush_lru(&mut state) {
                cacheable = false;
                break;
            }
        }

        let data = self.handler.add_region(start, new_len)?;
        let id = state.next_id;
        state.next_id += 1;

        if cacheable {
            if let Some(monitor_id) = state.monitor_id {
                if let Err(err) = self.monitor.subscribe(monitor_id, start, new_len) {
                    self.handler.delete_region(start, new_len, &data);
                    return Err(err.into());
                }
            }
            state.tree.insert((start, id));
            state.cached_size += new_len as usize;
        } else {
            state.stats.uncached += 1;
            log::trace!(
                "MR cache full, registering [{:#x}, +{:#x}) uncached",
                start,
                new_len
            );
        }

        state.entries.insert(
            id,
            Entry {
                addr: start,
                len: new_len,
                data: data.clone(),
                use_cnt: 1,
                cached: cacheable,
            },
        );
        Ok(CacheEntry {
            id,
            addr: start,
            len: new_len,
            data,
        })
    }

    /// 归还 `search` 得到的条目
    pub fn release(&self, id: EntryId) {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&id) else {
            log::debug!("MR cache: release of unknown entry {}", id);
            return;
        };
        entry.use_cnt = entry.use_cnt.saturating_sub(1);
        if entry.use_cnt > 0 {
            return;
        }

        if entry.cached {
            state.lru.push_back(id);
        } else if let Some(entry) = state.entries.remove(&id) {
            self.handler
                .delete_region(entry.addr, entry.len, &entry.data);
        }
    }

    /// 淘汰最久未使用的空闲条目
    pub fn flush(&self) -> bool {
        let mut state = self.state.lock();
        self.flush_lru(&mut state)
    }

    /// 清理缓存：注销所有条目并解除与监视器的挂接
    ///
    /// 之后缓存不再接受查找请求；仍在使用的条目会被强制注销。
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        self.cleanup_locked(&mut state);
    }

    fn cleanup_locked(&self, state: &mut CacheState<H::Data>) {
        if state.closed {
            return;
        }
        while self.flush_lru(state) {}

        let in_use: Vec<EntryId> = state.entries.keys().copied().collect();
        if !in_use.is_empty() {
            log::warn!(
                "MR cache cleanup: {} registration(s) still in use, deregistering",
                in_use.len()
            );
        }
        for id in in_use {
            if let Some(entry) = state.entries.remove(&id) {
                if entry.cached {
                    state.tree.remove(&(entry.addr, id));
                    state.cached_size -= entry.len as usize;
                    if let Some(monitor_id) = state.monitor_id {
                        self.monitor.unsubscribe(monitor_id, entry.addr, entry.len);
                    }
                }
                self.handler
                    .delete_region(entry.addr, entry.len, &entry.data);
            }
        }

        if let Some(monitor_id) = state.monitor_id.take() {
            self.monitor.detach(monitor_id);
        }
        state.closed = true;
        log::debug!("MR cache cleaned up: {}", state.stats);
    }

    fn flush_lru(&self, state: &mut CacheState<H::Data>) -> bool {
        let Some(id) = state.lru.pop_front() else {
            return false;
        };
        state.stats.flushes += 1;
        self.evict(state, id);
        true
    }

    /// 把条目移出查找树；空闲条目立即注销，使用中的条目在最终归还时注销
    fn evict(&self, state: &mut CacheState<H::Data>, id: EntryId) {
        let Some(entry) = state.entries.get_mut(&id) else {
            return;
        };
        if entry.cached {
            entry.cached = false;
            let (addr, len) = (entry.addr, entry.len);
            state.tree.remove(&(addr, id));
            state.cached_size -= len as usize;
            if let Some(monitor_id) = state.monitor_id {
                self.monitor.unsubscribe(monitor_id, addr, len);
            }
        }

        let idle = state.entries.get(&id).is_some_and(|e| e.use_cnt == 0);
        if idle {
            state.remove_from_lru(id);
            if let Some(entry) = state.entries.remove(&id) {
                self.handler
                    .delete_region(entry.addr, entry.len, &entry.data);
            }
        }
    }
}

impl<H: RegionHandler> InvalidationTarget for MrCache<H> {
    fn invalidate(&self, addr: u64, len: u64) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.stats.notifications += 1;
        let end = addr.saturating_add(len);
        for id in state.overlapping(addr, end) {
            self.evict(&mut state, id);
        }
    }
}

impl<H: RegionHandler> Drop for MrCache<H> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.closed {
            // 借用拆分：cleanup_locked 需要 &self
            let mut taken = std::mem::replace(state, CacheState::new());
            self.cleanup_locked(&mut taken);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mr::monitor::NotifierMonitor;

    #[derive(Default)]
    struct CountingHandler {
        live: Mutex<Vec<(u64, u64)>>,
        added: Mutex<u64>,
    }

    impl RegionHandler for Arc<CountingHandler> {
        type Data = (u64, u64);

        fn add_region(&self, addr: u64, len: u64) -> FabricResult<Self::Data> {
            *self.added.lock() += 1;
            self.live.lock().push((addr, len));
            Ok((addr, len))
        }

        fn delete_region(&self, _addr: u64, _len: u64, data: &Self::Data) {
            let mut live = self.live.lock();
            let pos = live.iter().position(|r| r == data).expect("double delete");
            live.swap_remove(pos);
        }
    }

    fn cache(
        max_cnt: usize,
        max_size: usize,
        merge: bool,
    ) -> (
        Arc<MrCache<Arc<CountingHandler>>>,
        Arc<CountingHandler>,
        Arc<NotifierMonitor>,
    ) {
        let handler = Arc::new(CountingHandler::default());
        let monitor = Arc::new(NotifierMonitor::new());
        let cache = MrCache::init(
            monitor.clone(),
            MrCacheAttr {
                max_cnt,
                max_size,
                merge_regions: merge,
            },
            handler.clone(),
        )
        .unwrap();
        (cache, handler, monitor)
    }

    #[test]
    fn test_hit_reuses_registration() {
        let (cache, handler, _monitor) = cache(8, 1 << 20, false);
        let a = cache.search(0x1000, 0x2000).unwrap();
        cache.release(a.id);
        let b = cache.search(0x1800, 0x100).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(*handler.added.lock(), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.in_use, 1);
        cache.release(b.id);
    }

    #[test]
    fn test_merge_overlapping_regions() {
        let (cache, handler, _monitor) = cache(8, 1 << 20, true);
        let a = cache.search(0x1000, 0x1000).unwrap();
        cache.release(a.id);
        let b = cache.search(0x1800, 0x1000).unwrap();
        assert_eq!((b.addr, b.len), (0x1000, 0x1800));
        assert_eq!(cache.stats().cached_cnt, 1);
        // 被合并的旧条目已注销
        assert_eq!(*handler.live.lock(), vec![(0x1000, 0x1800)]);
        cache.release(b.id);
    }

    #[test]
    fn test_lru_flush_on_count_limit() {
        let (cache, handler, _monitor) = cache(2, 1 << 20, false);
        for i in 0..3u64 {
            let e = cache.search(i * 0x10000, 0x1000).unwrap();
            cache.release(e.id);
        }
        let stats = cache.stats();
        assert_eq!(stats.cached_cnt, 2);
        assert_eq!(stats.flushes, 1);
        assert_eq!(handler.live.lock().len(), 2);
    }

    #[test]
    fn test_uncached_when_nothing_flushable() {
        let (cache, handler, _monitor) = cache(1, 1 << 20, false);
        let a = cache.search(0x1000, 0x1000).unwrap();
        let b = cache.search(0x10000, 0x1000).unwrap();
        assert_eq!(cache.stats().uncached, 1);
        assert_eq!(handler.live.lock().len(), 2);

        cache.release(b.id);
        assert_eq!(handler.live.lock().len(), 1);
        cache.release(a.id);
        assert_eq!(handler.live.lock().len(), 1);
    }

    #[test]
    fn test_oversized_request_keeps_lru_intact() {
        let (cache, handler, _monitor) = cache(8, 0x4000, false);
        for i in 0..3u64 {
            let e = cache.search(i * 0x10000, 0x1000).unwrap();
            cache.release(e.id);
        }

        let big = cache.search(0x100000, 0x8000).unwrap();
        let stats = cache.stats();
        assert_eq!(stats.flushes, 0);
        assert_eq!(stats.cached_cnt, 3);
        assert_eq!(stats.uncached, 1);
        assert_eq!(handler.live.lock().len(), 4);

        cache.release(big.id);
        assert_eq!(handler.live.lock().len(), 3);
    }

    #[test]
    fn test_invalidation_defers_in_use_entry() {
        let (cache, handler, monitor) = cache(8, 1 << 20, false);
        let a = cache.search(0x1000, 0x1000).unwrap();
        assert_eq!(monitor.notify_unmap(0x1000, 0x10), 1);
        assert_eq!(cache.stats().cached_cnt, 0);
        assert_eq!(handler.live.lock().len(), 1);

        cache.release(a.id);
        assert!(handler.live.lock().is_empty());
        assert_eq!(monitor.subscriptions(), 0);
    }

    #[test]
    fn test_cleanup_releases_everything() {
        let (cache, handler, monitor) = cache(8, 1 << 20, false);
        let a = cache.search(0x1000, 0x1000).unwrap();
        let b = cache.search(0x8000, 0x1000).unwrap();
        cache.release(b.id);

        cache.cleanup();
        assert!(handler.live.lock().is_empty());
        assert_eq!(monitor.attached(), 0);
        assert!(cache.search(0x1000, 0x10).is_err());

        // 清理后的归还是无害的
        cache.release(a.id);
    }

    #[test]
    fn test_zero_length_rejected() {
        let (cache, _handler, _monitor) = cache(8, 1 << 20, false);
        assert!(matches!(
            cache.search(0x1000, 0),
            Err(FabricError::InvalidArgument(_))
        ));
    }
}
