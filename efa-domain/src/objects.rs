//! 域子对象：地址向量、完成队列与端点
//!
//! 这里只管理对象生命周期与属性检查，每个对象在存活期间持有一个
//! 域引用，阻止域的基础状态被关闭。

use crate::error::{FabricError, FabricResult};
use crate::domain::DomainLink;
use crate::info::{AvType, EndpointType, FabricInfo};

/// 地址向量属性
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvAttr {
    pub av_type: AvType,
    /// 预期地址数，0 表示不限
    pub count: usize,
}

impl Default for AvAttr {
    fn default() -> Self {
        Self {
            av_type: AvType::Table,
            count: 0,
        }
    }
}

/// 地址向量中的地址索引
pub type FiAddr = u64;

/// 地址向量（表模式）
#[derive(Debug)]
pub struct AddressVector {
    attr: AvAttr,
    entries: Vec<Option<Vec<u8>>>,
    used: usize,
    _domain: DomainLink,
}

impl AddressVector {
    pub(crate) fn open(attr: AvAttr, domain: DomainLink) -> FabricResult<Self> {
        match attr.av_type {
            AvType::Table | AvType::Unspec => {}
            other => {
                return Err(FabricError::InvalidArgument(format!(
                    "AV type {:?} not supported",
                    other
                )));
            }
        }
        Ok(Self {
            attr: AvAttr {
                av_type: AvType::Table,
                ..attr
            },
            entries: Vec::with_capacity(attr.count),
            used: 0,
            _domain: domain,
        })
    }

    pub fn attr(&self) -> AvAttr {
        self.attr
    }

    /// 插入地址，返回其索引
    pub fn insert(&mut self, addr: &[u8]) -> FabricResult<FiAddr> {
        if addr.is_empty() {
            return Err(FabricError::InvalidArgument("empty address".to_string()));
        }
        if self.attr.count != 0 && self.used >= self.attr.count {
            return Err(FabricError::OutOfMemory);
        }
        let slot = match self.entries.iter().position(Option::is_none) {
            Some(slot) => {
                self.entries[slot] = Some(addr.to_vec());
                slot
            }
            None => {
                self.entries.push(Some(addr.to_vec()));
                self.entries.len() - 1
            }
        };
        self.used += 1;
        Ok(slot as FiAddr)
    }

    pub fn lookup(&self, fi_addr: FiAddr) -> Option<&[u8]> {
        self.entries
            .get(fi_addr as usize)
            .and_then(|e| e.as_deref())
    }

    pub fn remove(&mut self, fi_addr: FiAddr) -> FabricResult<()> {
        let removed = self
            .entries
            .get_mut(fi_addr as usize)
            .and_then(Option::take);
        if removed.is_none() {
            return Err(FabricError::InvalidArgument(format!(
                "fi_addr {} not in AV",
                fi_addr
            )));
        }
        self.used -= 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn close(self) {}
}

/// 完成队列属性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CqAttr {
    /// 队列深度，0 表示取设备默认值
    pub size: usize,
}

/// 完成队列
#[derive(Debug)]
pub struct CompletionQueue {
    size: usize,
    _domain: DomainLink,
}

impl CompletionQueue {
    pub(crate) fn open(attr: CqAttr, max_cqe: usize, domain: DomainLink) -> FabricResult<Self> {
        if attr.size > max_cqe {
            return Err(FabricError::InvalidArgument(format!(
                "CQ size {} exceeds device limit {}",
                attr.size, max_cqe
            )));
        }
        let size = if attr.size == 0 { max_cqe } else { attr.size };
        Ok(Self {
            size,
            _domain: domain,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn close(self) {}
}

/// 端点
#[derive(Debug)]
pub struct Endpoint {
    ep_type: EndpointType,
    _domain: DomainLink,
}

impl Endpoint {
    /// 端点类型必须与域的传输模式一致
    pub(crate) fn open(info: &FabricInfo, rdm: bool, domain: DomainLink) -> FabricResult<Self> {
        let expected = if rdm {
            EndpointType::Rdm
        } else {
            EndpointType::Dgram
        };
        let ep_type = match info.ep_attr.ep_type {
            EndpointType::Unspec => expected,
            t if t == expected => t,
            other => {
                return Err(FabricError::InvalidArgument(format!(
                    "endpoint type {:?} does not match {:?} domain",
                    other, expected
                )));
            }
        };
        Ok(Self {
            ep_type,
            _domain: domain,
        })
    }

    pub fn ep_type(&self) -> EndpointType {
        self.ep_type
    }

    pub fn close(self) {}
}
