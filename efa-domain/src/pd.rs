// 保护域管理

use crate::error::{FabricError, FabricResult};
use efa_verbs::{DeviceContext, ProtectionDomain, VerbsDevice};
use std::sync::Arc;

/// 在设备上下文上分配保护域，设备层错误原样传播
pub fn alloc_pd(
    device: &dyn VerbsDevice,
    ctx: &Arc<DeviceContext>,
) -> FabricResult<ProtectionDomain> {
    let pd = device
        .alloc_pd(ctx)
        .map_err(|e| FabricError::device("efa_cmd_alloc_pd", e))?;
    log::info!("Allocated pd[{}] on {}.", pd.pdn(), ctx);
    Ok(pd)
}

/// 释放保护域
///
/// 失败时硬件资源可能仍被占用，调用者必须保留句柄而不是视其为已释放。
pub fn dealloc_pd(device: &dyn VerbsDevice, pd: &ProtectionDomain) -> FabricResult<()> {
    device.dealloc_pd(pd).map_err(|e| {
        log::warn!("Failed to deallocate pd[{}]: {}", pd.pdn(), e);
        FabricError::device("efa_cmd_dealloc_pd", e)
    })?;
    log::info!("Deallocated pd[{}].", pd.pdn());
    Ok(())
}
