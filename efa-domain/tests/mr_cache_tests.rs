//! 内存注册缓存集成测试
//!
//! 经由域的注册接口驱动缓存，观察模拟设备上的实际注册次数。

use std::sync::Arc;

use efa_domain::*;
use efa_verbs::{FaultPoint, MrAccess, SimDevice, errno};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn setup(config: MrCacheConfig) -> (Arc<SimDevice>, Arc<NotifierMonitor>, Arc<Fabric>, Domain) {
    init_logger();
    let sim = Arc::new(SimDevice::with_devices(&["efa_0"]));
    let monitor = notifier_monitor();
    let provider = Provider::new(sim.clone(), config, monitor.clone()).unwrap();
    let fabric = Fabric::open(provider, EFA_API_VERSION);
    let domain = Domain::open(
        &fabric,
        &FabricInfo::request("efa_0-rdm", EndpointType::Rdm),
        0,
    )
    .unwrap();
    (sim, monitor, fabric, domain)
}

const RW: MrAccess = MrAccess::LOCAL_WRITE;

#[test]
fn test_repeated_registration_hits_cache() {
    let (sim, _monitor, _fabric, domain) = setup(MrCacheConfig::default());

    let first = domain.reg_mr(0x10_0000, 0x2000, RW).unwrap();
    let lkey = first.lkey();
    first.close().unwrap();

    for _ in 0..5 {
        let mr = domain.reg_mr(0x10_0000, 0x2000, RW).unwrap();
        assert_eq!(mr.lkey(), lkey);
        mr.close().unwrap();
    }
    // 子范围同样命中
    let sub = domain.reg_mr(0x10_0800, 0x100, RW).unwrap();
    assert_eq!(sub.lkey(), lkey);
    assert_eq!(sub.addr(), 0x10_0800);
    assert_eq!(sub.desc().addr, 0x10_0000);
    sub.close().unwrap();

    assert_eq!(sim.stats().mrs_registered, 1);
    let stats = domain.mr_cache_stats().unwrap();
    assert_eq!(stats.hits, 6);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.cached_cnt, 1);
    assert_eq!(stats.in_use, 0);

    domain.close().unwrap();
    assert_eq!(sim.outstanding_mrs(), 0);
}

#[test]
fn test_concurrent_users_share_entry() {
    let (sim, _monitor, _fabric, domain) = setup(MrCacheConfig::default());

    let a = domain.reg_mr(0x4000, 0x1000, RW).unwrap();
    let b = domain.reg_mr(0x4000, 0x1000, RW).unwrap();
    assert_eq!(a.lkey(), b.lkey());
    assert_eq!(domain.mr_cache_stats().unwrap().in_use, 1);

    drop(a);
    assert_eq!(domain.mr_cache_stats().unwrap().in_use, 1);
    drop(b);
    assert_eq!(domain.mr_cache_stats().unwrap().in_use, 0);
    assert_eq!(sim.outstanding_mrs(), 1);
    domain.close().unwrap();
}

#[test]
fn test_overlapping_regions_merge() {
    let (sim, _monitor, _fabric, domain) = setup(MrCacheConfig::default());

    domain.reg_mr(0x1_0000, 0x1000, RW).unwrap().close().unwrap();
    let merged = domain.reg_mr(0x1_0800, 0x1000, RW).unwrap();
    assert_eq!(merged.desc().addr, 0x1_0000);
    assert_eq!(merged.desc().length, 0x1800);
    merged.close().unwrap();

    assert_eq!(sim.outstanding_mrs(), 1);
    assert_eq!(sim.stats().mrs_deregistered, 1);
    domain.close().unwrap();
}

#[test]
fn test_merge_disabled_keeps_separate_entries() {
    let (sim, _monitor, _fabric, domain) = setup(MrCacheConfig {
        merge_regions: false,
        ..MrCacheConfig::default()
    });

    domain.reg_mr(0x1_0000, 0x1000, RW).unwrap().close().unwrap();
    let second = domain.reg_mr(0x1_0800, 0x1000, RW).unwrap();
    assert_eq!(second.desc().addr, 0x1_0800);
    second.close().unwrap();

    assert_eq!(sim.outstanding_mrs(), 2);
    domain.close().unwrap();
    assert_eq!(sim.outstanding_mrs(), 0);
}

#[test]
fn test_count_limit_evicts_lru() {
    let (sim, _monitor, fabric, domain) = setup(MrCacheConfig {
        max_cached_count: 2,
        ..MrCacheConfig::default()
    });
    assert_eq!(fabric.provider().mr_cache_env().snapshot().max_cached_count, 2);

    let keys: Vec<u32> = (0..3u64)
        .map(|i| {
            let mr = domain.reg_mr(0x10_0000 * (i + 1), 0x1000, RW).unwrap();
            let lkey = mr.lkey();
            mr.close().unwrap();
            lkey
        })
        .collect();
    assert_eq!(sim.outstanding_mrs(), 2);
    assert_eq!(domain.mr_cache_stats().unwrap().flushes, 1);

    // 最早的条目已被淘汰，重新注册得到新的 key
    let again = domain.reg_mr(0x10_0000, 0x1000, RW).unwrap();
    assert!(!keys.contains(&again.lkey()));
    again.close().unwrap();
    domain.close().unwrap();
}

#[test]
fn test_size_limit_falls_back_to_uncached() {
    let (sim, _monitor, _fabric, domain) = setup(MrCacheConfig {
        max_cached_size: 0x1000,
        ..MrCacheConfig::default()
    });

    let big = domain.reg_mr(0x10_0000, 0x2000, RW).unwrap();
    assert_eq!(domain.mr_cache_stats().unwrap().uncached, 1);
    assert_eq!(domain.mr_cache_stats().unwrap().cached_cnt, 0);
    assert_eq!(sim.outstanding_mrs(), 1);
    big.close().unwrap();
    assert_eq!(sim.outstanding_mrs(), 0);
    domain.close().unwrap();
}

#[test]
fn test_unmap_notification_invalidates() {
    let (sim, monitor, _fabric, domain) = setup(MrCacheConfig::default());

    let mr = domain.reg_mr(0x20_0000, 0x1000, RW).unwrap();
    let old = mr.lkey();
    mr.close().unwrap();

    assert_eq!(monitor.notify_unmap(0x20_0000, 0x1000), 1);
    assert_eq!(sim.outstanding_mrs(), 0);
    assert_eq!(domain.mr_cache_stats().unwrap().notifications, 1);

    let mr = domain.reg_mr(0x20_0000, 0x1000, RW).unwrap();
    assert_ne!(mr.lkey(), old);
    mr.close().unwrap();
    domain.close().unwrap();
}

#[test]
fn test_invalidated_entry_in_use_is_deferred() {
    let (sim, monitor, _fabric, domain) = setup(MrCacheConfig::default());

    let mr = domain.reg_mr(0x20_0000, 0x1000, RW).unwrap();
    monitor.notify_unmap(0x20_0800, 0x10);
    assert_eq!(sim.outstanding_mrs(), 1);

    mr.close().unwrap();
    assert_eq!(sim.outstanding_mrs(), 0);
    domain.close().unwrap();
}

#[test]
fn test_registration_failure_propagates() {
    let (sim, _monitor, _fabric, domain) = setup(MrCacheConfig::default());
    sim.inject_fault(FaultPoint::RegMr, errno::ENOMEM);

    let err = domain.reg_mr(0x1000, 0x1000, RW).unwrap_err();
    assert_eq!(err.errno(), -errno::ENOMEM);
    let stats = domain.mr_cache_stats().unwrap();
    assert_eq!(stats.cached_cnt, 0);
    assert_eq!(stats.in_use, 0);

    // 失败后缓存仍可用
    domain.reg_mr(0x1000, 0x1000, RW).unwrap().close().unwrap();
    domain.close().unwrap();
    assert_eq!(sim.outstanding_mrs(), 0);
}

#[test]
fn test_uncached_dereg_failure_is_reported() {
    let (sim, _monitor, _fabric, domain) = setup(MrCacheConfig::disabled());

    let mr = domain.reg_mr(0x1000, 0x1000, RW).unwrap();
    sim.inject_fault(FaultPoint::DeregMr, errno::EINVAL);
    assert_eq!(mr.close().unwrap_err().errno(), -errno::EINVAL);
}

#[test]
fn test_domains_have_independent_caches() {
    init_logger();
    let sim = Arc::new(SimDevice::with_devices(&["efa_0", "efa_1"]));
    let monitor = notifier_monitor();
    let provider = Provider::new(sim.clone(), MrCacheConfig::default(), monitor.clone()).unwrap();
    let fabric = Fabric::open(provider, EFA_API_VERSION);

    let a = Domain::open(&fabric, &FabricInfo::request("efa_0-rdm", EndpointType::Rdm), 0)
        .unwrap();
    let b = Domain::open(&fabric, &FabricInfo::request("efa_1-rdm", EndpointType::Rdm), 0)
        .unwrap();
    assert_eq!(monitor.attached(), 2);

    let ma = a.reg_mr(0x1000, 0x1000, RW).unwrap();
    let mb = b.reg_mr(0x1000, 0x1000, RW).unwrap();
    assert_ne!(ma.lkey(), mb.lkey());
    assert_ne!(ma.desc().pdn, mb.desc().pdn);
    drop((ma, mb));

    // 同一次解除映射通知两个缓存
    assert_eq!(monitor.notify_unmap(0x1000, 0x1000), 2);
    assert_eq!(sim.outstanding_mrs(), 0);

    a.close().unwrap();
    b.close().unwrap();
    assert_eq!(monitor.attached(), 0);
}
