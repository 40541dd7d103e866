//! 事件模块
//!
//! 下载核心对外发布的事件流（进度、状态变更），由通知层消费后推送给客户端
//! - `types.rs`: 事件类型
//! - `throttle.rs`: 进度事件节流，避免事件风暴

mod throttle;
mod types;

pub use throttle::*;
pub use types::*;
