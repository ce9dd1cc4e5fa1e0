//! 设备上下文解析
//!
//! 域名由设备名加端点后缀组成（`efa_0-rdm`、`efa_0-dgrm`）。解析时
//! 去掉后缀，把剩余前缀与枚举到的设备名逐个比较，取第一个匹配项。

use crate::error::{FabricError, FabricResult};
use crate::info::{DGRAM_DOMAIN_SUFFIX, RDM_DOMAIN_SUFFIX};
use efa_verbs::{ContextList, DeviceContext, VerbsDevice};
use std::sync::Arc;

/// 端点模式对应的域名后缀
pub fn domain_suffix(rdm: bool) -> &'static str {
    if rdm { RDM_DOMAIN_SUFFIX } else { DGRAM_DOMAIN_SUFFIX }
}

/// 去掉后缀后的设备名前缀长度
///
/// 名称不长于后缀时没有可比较的前缀，返回 `None`。
pub fn prefix_len(name: &str, rdm: bool) -> Option<usize> {
    name.len()
        .checked_sub(domain_suffix(rdm).len())
        .filter(|&n| n > 0)
}

/// 在上下文列表中找第一个设备名以 `name` 的前缀开头的设备
///
/// 只比较前缀长度内的字节，与后缀内容无关。
pub fn match_device<'a>(
    contexts: &'a [Arc<DeviceContext>],
    name: &str,
    rdm: bool,
) -> Option<&'a Arc<DeviceContext>> {
    let n = prefix_len(name, rdm)?;
    let prefix = &name.as_bytes()[..n];
    contexts
        .iter()
        .find(|ctx| ctx.name.as_bytes().get(..n) == Some(prefix))
}

/// 把域名解析为设备上下文
///
/// 枚举得到的列表在任何返回路径上都会归还给设备层；返回的上下文
/// 在列表归还后仍然有效。
pub fn open_device_by_name(
    device: &dyn VerbsDevice,
    name: Option<&str>,
    rdm: bool,
) -> FabricResult<Arc<DeviceContext>> {
    let name =
        name.ok_or_else(|| FabricError::InvalidArgument("domain name missing".to_string()))?;

    let list = ContextList::acquire(device)
        .map_err(|e| FabricError::device("efa_device_get_context_list", e))?;
    if list.is_empty() {
        return Err(FabricError::NoDevice("no EFA devices found".to_string()));
    }

    match match_device(list.contexts(), name, rdm) {
        Some(ctx) => {
            log::debug!("Domain {} resolved to device {}", name, ctx);
            Ok(ctx.clone())
        }
        None => Err(FabricError::NoDevice(format!(
            "no device matches domain {}",
            name
        ))),
    }
}
