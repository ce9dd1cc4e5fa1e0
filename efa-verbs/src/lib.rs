//! EFA Verbs Device Layer
//!
//! 提供者与 verbs 设备之间的接口边界，以及用于测试和无硬件主机的
//! 模拟设备实现。

pub mod device;
pub mod error;
pub mod sim;

pub use device::{ContextList, DeviceContext, MemDesc, MrAccess, ProtectionDomain, VerbsDevice};
pub use error::{VerbsError, VerbsResult, errno};
pub use sim::{DeviceEvent, FaultPoint, SimDevice, SimStats};
