//! userfaultfd 内存监视器
//!
//! 通过 userfaultfd 的 UNMAP/REMOVE/REMAP 事件感知地址空间变化。
//! 挂接时才打开描述符并完成 API 握手；内核不支持或权限不足时挂接
//! 失败，这正是缓存降级为非缓存路径的典型触发条件。
//!
//! 内核在事件被读走之前会阻塞 munmap，订阅范围内未触碰页面的缺页
//! 也要等待用户态解决，因此挂接后由后台线程持续读取描述符：缺页
//! 以零页解决，地址空间变化转交给挂接的缓存。最后一次解除挂接时
//! 通知线程退出，描述符随线程一同关闭。

use super::monitor::{
    InvalidationTarget, MemoryMonitor, MonitorError, MonitorId, MonitorRegistry, MonitorResult,
    deliver,
};
use parking_lot::Mutex;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

const UFFD_API: u64 = 0xAA;
const UFFD_USER_MODE_ONLY: libc::c_int = 1;

const UFFD_FEATURE_EVENT_REMAP: u64 = 1 << 2;
const UFFD_FEATURE_EVENT_REMOVE: u64 = 1 << 3;
const UFFD_FEATURE_EVENT_UNMAP: u64 = 1 << 6;
const REQUIRED_FEATURES: u64 =
    UFFD_FEATURE_EVENT_UNMAP | UFFD_FEATURE_EVENT_REMOVE | UFFD_FEATURE_EVENT_REMAP;

const UFFDIO_REGISTER_MODE_MISSING: u64 = 1;

// _IOWR(0xAA, 0x3F, struct uffdio_api)
const UFFDIO_API: u64 = 0xC018_AA3F;
// _IOWR(0xAA, 0x00, struct uffdio_register)
const UFFDIO_REGISTER: u64 = 0xC020_AA00;
// _IOR(0xAA, 0x01, struct uffdio_range)
const UFFDIO_UNREGISTER: u64 = 0x8010_AA01;
// _IOR(0xAA, 0x02, struct uffdio_range)
const UFFDIO_WAKE: u64 = 0x8010_AA02;
// _IOWR(0xAA, 0x04, struct uffdio_zeropage)
const UFFDIO_ZEROPAGE: u64 = 0xC020_AA04;

const UFFD_EVENT_PAGEFAULT: u8 = 0x12;
const UFFD_EVENT_REMAP: u8 = 0x14;
const UFFD_EVENT_REMOVE: u8 = 0x15;
const UFFD_EVENT_UNMAP: u8 = 0x16;

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct UffdioApi {
    api: u64,
    features: u64,
    ioctls: u64,
}

#[repr(C)]
#[derive(Default)]
struct UffdioRange {
    start: u64,
    len: u64,
}

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct UffdioRegister {
    range: UffdioRange,
    mode: u64,
    ioctls: u64,
}

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct UffdioZeropage {
    range: UffdioRange,
    mode: u64,
    zeropage: i64,
}

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct UffdMsg {
    event: u8,
    reserved1: u8,
    reserved2: u16,
    reserved3: u32,
    arg: [u64; 3],
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn page_size() -> u64 {
    // SAFETY: sysconf 没有内存安全前提
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as u64 } else { 4096 }
}

/// 把范围扩展到页边界
fn page_align(addr: u64, len: u64) -> (u64, u64) {
    let page = page_size();
    let start = addr & !(page - 1);
    let end = addr.saturating_add(len).saturating_add(page - 1) & !(page - 1);
    (start, end - start)
}

fn uffd_syscall(flags: libc::c_int) -> Result<OwnedFd, i32> {
    // SAFETY: userfaultfd 系统调用只接收标志位
    let ret = unsafe { libc::syscall(libc::SYS_userfaultfd, flags) };
    if ret < 0 {
        return Err(last_errno());
    }
    // SAFETY: 描述符刚由内核返回，由 OwnedFd 独占
    Ok(unsafe { OwnedFd::from_raw_fd(ret as i32) })
}

fn open_uffd() -> MonitorResult<OwnedFd> {
    let flags = libc::O_CLOEXEC | libc::O_NONBLOCK;
    // 非特权进程只能监视用户态缺页
    let fd = match uffd_syscall(flags) {
        Err(libc::EPERM) => uffd_syscall(flags | UFFD_USER_MODE_ONLY).map_err(|_| libc::EPERM),
        other => other,
    };
    let fd = fd.map_err(|errno| match errno {
        libc::ENOSYS => MonitorError::Unsupported("userfaultfd syscall".to_string()),
        errno => MonitorError::Os {
            op: "userfaultfd",
            errno,
        },
    })?;

    let mut api = UffdioApi {
        api: UFFD_API,
        features: REQUIRED_FEATURES,
        ioctls: 0,
    };
    // SAFETY: api 的布局与 struct uffdio_api 一致
    let ret = unsafe {
        libc::ioctl(fd.as_raw_fd(), UFFDIO_API as _, &mut api as *mut UffdioApi)
    };
    if ret < 0 {
        return Err(MonitorError::Os {
            op: "UFFDIO_API",
            errno: last_errno(),
        });
    }
    if api.features & REQUIRED_FEATURES != REQUIRED_FEATURES {
        return Err(MonitorError::Unsupported(format!(
            "userfaultfd features {:#x}",
            api.features
        )));
    }
    Ok(fd)
}

fn open_eventfd() -> MonitorResult<OwnedFd> {
    // SAFETY: eventfd 只接收初值与标志位
    let ret = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if ret < 0 {
        return Err(MonitorError::Os {
            op: "eventfd",
            errno: last_errno(),
        });
    }
    // SAFETY: 同上，描述符归 OwnedFd 所有
    Ok(unsafe { OwnedFd::from_raw_fd(ret) })
}

/// 后台线程与监视器共享的描述符
struct UffdChannel {
    uffd: OwnedFd,
    wake: OwnedFd,
    stop: AtomicBool,
}

impl UffdChannel {
    fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        let one: u64 = 1;
        // SAFETY: 写入 8 字节计数到 eventfd
        let ret = unsafe {
            libc::write(
                self.wake.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            log::warn!("Failed to wake userfaultfd thread: errno {}", last_errno());
        }
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// 以零页解决缺页；页面已被填充时只唤醒等待者
    fn resolve_fault(&self, addr: u64) {
        let (start, len) = page_align(addr, 1);
        let mut zero = UffdioZeropage {
            range: UffdioRange { start, len },
            mode: 0,
            zeropage: 0,
        };
        // SAFETY: zero 的布局与 struct uffdio_zeropage 一致
        let ret = unsafe {
            libc::ioctl(
                self.uffd.as_raw_fd(),
                UFFDIO_ZEROPAGE as _,
                &mut zero as *mut UffdioZeropage,
            )
        };
        if ret == 0 {
            return;
        }
        let errno = last_errno();
        if errno != libc::EEXIST {
            log::warn!("UFFDIO_ZEROPAGE at {:#x} failed: errno {}", start, errno);
        }
        let mut range = UffdioRange { start, len };
        // SAFETY: range 的布局与 struct uffdio_range 一致
        let ret = unsafe {
            libc::ioctl(self.uffd.as_raw_fd(), UFFDIO_WAKE as _, &mut range as *mut UffdioRange)
        };
        if ret < 0 {
            log::warn!("UFFDIO_WAKE at {:#x} failed: errno {}", start, last_errno());
        }
    }

    /// 读出所有待处理消息，就地解决缺页，返回需要失效的范围
    fn read_events(&self) -> MonitorResult<(usize, Vec<(u64, u64)>)> {
        let mut ranges = Vec::new();
        let mut processed = 0;
        loop {
            let mut msg = UffdMsg::default();
            // SAFETY: msg 的布局与 struct uffd_msg 一致，长度匹配
            let n = unsafe {
                libc::read(
                    self.uffd.as_raw_fd(),
                    &mut msg as *mut UffdMsg as *mut libc::c_void,
                    std::mem::size_of::<UffdMsg>(),
                )
            };
            if n < 0 {
                match last_errno() {
                    libc::EAGAIN => break,
                    libc::EINTR => continue,
                    errno => return Err(MonitorError::Os { op: "read", errno }),
                }
            }
            if n as usize != std::mem::size_of::<UffdMsg>() {
                break;
            }

            processed += 1;
            match msg.event {
                UFFD_EVENT_PAGEFAULT => self.resolve_fault(msg.arg[1]),
                UFFD_EVENT_UNMAP | UFFD_EVENT_REMOVE => {
                    let (start, end) = (msg.arg[0], msg.arg[1]);
                    ranges.push((start, end.saturating_sub(start)));
                }
                UFFD_EVENT_REMAP => ranges.push((msg.arg[0], msg.arg[2])),
                other => log::debug!("userfaultfd: ignoring event {:#x}", other),
            }
        }
        Ok((processed, ranges))
    }
}

#[derive(Default)]
struct UffdState {
    channel: Option<Arc<UffdChannel>>,
    registry: MonitorRegistry,
}

#[derive(Default)]
struct UffdInner {
    state: Mutex<UffdState>,
}

impl UffdInner {
    /// 读取并分发一批事件；分发在释放锁之后进行
    fn drain(&self, channel: &UffdChannel) -> MonitorResult<usize> {
        let (processed, ranges) = channel.read_events()?;
        if ranges.is_empty() {
            return Ok(processed);
        }
        let invalidations: Vec<_> = {
            let state = self.state.lock();
            ranges
                .into_iter()
                .map(|(addr, len)| (state.registry.targets_for(addr, len), addr, len))
                .collect()
        };
        for (targets, addr, len) in invalidations {
            deliver(targets, addr, len);
        }
        Ok(processed)
    }
}

impl Drop for UffdInner {
    fn drop(&mut self) {
        if let Some(channel) = self.state.get_mut().channel.take() {
            channel.request_stop();
        }
    }
}

fn drain_loop(channel: Arc<UffdChannel>, inner: Weak<UffdInner>) {
    let mut fds = [
        libc::pollfd {
            fd: channel.uffd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: channel.wake.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    while !channel.stopping() {
        // SAFETY: fds 在调用期间有效，长度与计数一致
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if ret < 0 {
            let errno = last_errno();
            if errno == libc::EINTR {
                continue;
            }
            log::warn!("userfaultfd poll failed: errno {}", errno);
            break;
        }
        if channel.stopping() {
            break;
        }
        if fds[0].revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            log::warn!("userfaultfd descriptor reported {:#x}", fds[0].revents);
            break;
        }
        if fds[0].revents & libc::POLLIN == 0 {
            continue;
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if let Err(e) = inner.drain(&channel) {
            log::warn!("userfaultfd drain failed: {}", e);
            break;
        }
    }
    log::debug!("userfaultfd drain thread exiting");
}

/// userfaultfd 监视器
#[derive(Default)]
pub struct UffdMonitor {
    inner: Arc<UffdInner>,
}

impl UffdMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在当前线程处理所有待读取事件，返回处理的事件数
    ///
    /// 描述符为非阻塞模式，没有事件时立即返回。
    pub fn poll_events(&self) -> MonitorResult<usize> {
        let channel = self.inner.state.lock().channel.clone();
        match channel {
            Some(channel) => self.inner.drain(&channel),
            None => Ok(0),
        }
    }

    /// 后台线程是否在读取事件
    pub fn is_draining(&self) -> bool {
        self.inner.state.lock().channel.is_some()
    }

    fn start(&self) -> MonitorResult<Arc<UffdChannel>> {
        let channel = Arc::new(UffdChannel {
            uffd: open_uffd()?,
            wake: open_eventfd()?,
            stop: AtomicBool::new(false),
        });
        let thread_channel = channel.clone();
        let inner = Arc::downgrade(&self.inner);
        std::thread::Builder::new()
            .name("efa-uffd".to_string())
            .spawn(move || drain_loop(thread_channel, inner))
            .map_err(|e| MonitorError::Os {
                op: "spawn",
                errno: e.raw_os_error().unwrap_or(0),
            })?;
        log::info!("userfaultfd memory monitor started");
        Ok(channel)
    }

    fn register(fd: &OwnedFd, addr: u64, len: u64) -> MonitorResult<()> {
        let (start, len) = page_align(addr, len);
        let mut reg = UffdioRegister {
            range: UffdioRange { start, len },
            mode: UFFDIO_REGISTER_MODE_MISSING,
            ioctls: 0,
        };
        // SAFETY: reg 的布局与 struct uffdio_register 一致
        let ret = unsafe {
            libc::ioctl(fd.as_raw_fd(), UFFDIO_REGISTER as _, &mut reg as *mut UffdioRegister)
        };
        if ret < 0 {
            return Err(MonitorError::Os {
                op: "UFFDIO_REGISTER",
                errno: last_errno(),
            });
        }
        Ok(())
    }

    fn unregister(fd: &OwnedFd, addr: u64, len: u64) {
        let (start, len) = page_align(addr, len);
        let mut range = UffdioRange { start, len };
        // SAFETY: range 的布局与 struct uffdio_range 一致
        let ret = unsafe {
            libc::ioctl(fd.as_raw_fd(), UFFDIO_UNREGISTER as _, &mut range as *mut UffdioRange)
        };
        if ret < 0 {
            log::debug!(
                "UFFDIO_UNREGISTER [{:#x}, +{:#x}) failed: errno {}",
                start,
                len,
                last_errno()
            );
        }
    }
}

impl MemoryMonitor for UffdMonitor {
    fn name(&self) -> &'static str {
        "uffd"
    }

    fn attach(&self, target: Weak<dyn InvalidationTarget>) -> MonitorResult<MonitorId> {
        let mut state = self.inner.state.lock();
        if state.channel.is_none() {
            state.channel = Some(self.start()?);
        }
        Ok(state.registry.attach(target))
    }

    /// 最后一个缓存离开时通知后台线程退出，不等待其结束
    fn detach(&self, id: MonitorId) {
        let mut state = self.inner.state.lock();
        let ranges = state.registry.detach(id).unwrap_or_default();
        if let Some(channel) = state.channel.as_ref() {
            for (addr, len) in ranges {
                Self::unregister(&channel.uffd, addr, len);
            }
        }
        if state.registry.is_empty() {
            if let Some(channel) = state.channel.take() {
                channel.request_stop();
                log::info!("userfaultfd memory monitor stopped");
            }
        }
    }

    fn subscribe(&self, id: MonitorId, addr: u64, len: u64) -> MonitorResult<()> {
        let mut state = self.inner.state.lock();
        let channel = state
            .channel
            .as_ref()
            .ok_or(MonitorError::NotAttached(id))?;
        Self::register(&channel.uffd, addr, len)?;
        state.registry.subscribe(id, addr, len)
    }

    fn unsubscribe(&self, id: MonitorId, addr: u64, len: u64) {
        let mut state = self.inner.state.lock();
        if state.registry.unsubscribe(id, addr, len) {
            if let Some(channel) = state.channel.as_ref() {
                Self::unregister(&channel.uffd, addr, len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FabricResult;
    use crate::mr::cache::{MrCache, MrCacheAttr, RegionHandler};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    struct NoopHandler;

    impl RegionHandler for NoopHandler {
        type Data = ();

        fn add_region(&self, _addr: u64, _len: u64) -> FabricResult<()> {
            Ok(())
        }

        fn delete_region(&self, _addr: u64, _len: u64, _data: &()) {}
    }

    /// 在另一线程执行，超时视为被内核挂起
    fn finishes_within<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(f());
        });
        rx.recv_timeout(Duration::from_secs(3))
            .expect("operation blocked on userfaultfd")
    }

    #[test]
    fn test_layouts_match_kernel_abi() {
        assert_eq!(std::mem::size_of::<UffdioApi>(), 24);
        assert_eq!(std::mem::size_of::<UffdioRange>(), 16);
        assert_eq!(std::mem::size_of::<UffdioRegister>(), 32);
        assert_eq!(std::mem::size_of::<UffdioZeropage>(), 32);
        assert_eq!(std::mem::size_of::<UffdMsg>(), 32);
    }

    #[test]
    fn test_page_align() {
        let page = page_size();
        assert_eq!(page_align(page + 1, 1), (page, page));
        assert_eq!(page_align(0, page + 1), (0, 2 * page));
    }

    #[test]
    fn test_poll_without_attach_is_noop() {
        let monitor = UffdMonitor::new();
        assert_eq!(monitor.poll_events(), Ok(0));
    }

    #[test]
    fn test_subscribe_requires_attach() {
        let monitor = UffdMonitor::new();
        assert_eq!(
            monitor.subscribe(1, 0x1000, 0x1000),
            Err(MonitorError::NotAttached(1))
        );
    }

    #[test]
    fn test_faults_and_unmap_are_drained() {
        let _ = env_logger::builder().is_test(true).try_init();
        let monitor = Arc::new(UffdMonitor::new());
        let attr = MrCacheAttr {
            max_cnt: 8,
            max_size: 1 << 24,
            merge_regions: false,
        };
        let cache = match MrCache::init(monitor.clone(), attr, NoopHandler) {
            Ok(cache) => cache,
            Err(e) => {
                eprintln!("userfaultfd unavailable, skipping: {}", e);
                return;
            }
        };
        assert!(monitor.is_draining());

        let page = page_size() as usize;
        let len = 4 * page;
        // SAFETY: 匿名私有映射，测试结束前解除
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(addr, libc::MAP_FAILED);
        let base = addr as usize;

        let entry = cache.search(base as u64, len as u64).unwrap();
        cache.release(entry.id);
        assert_eq!(cache.stats().cached_cnt, 1);

        // 订阅范围内从未触碰的页面
        let value = finishes_within(move || {
            // SAFETY: 页面位于上面的映射内
            unsafe { std::ptr::read_volatile((base + page) as *const u8) }
        });
        assert_eq!(value, 0);

        // SAFETY: 解除上面建立的映射
        let ret = finishes_within(move || unsafe { libc::munmap(base as *mut libc::c_void, len) });
        assert_eq!(ret, 0);

        let deadline = Instant::now() + Duration::from_secs(3);
        while cache.stats().cached_cnt != 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        let stats = cache.stats();
        assert!(stats.notifications >= 1);
        assert_eq!(stats.cached_cnt, 0);

        cache.cleanup();
        assert!(!monitor.is_draining());
        assert_eq!(monitor.poll_events(), Ok(0));
    }
}
