//! 聊天中继核心领域模型
//!
//! 包含会话范围（私聊 / 直播间）、消息信封、线协议帧以及协议边界上的校验规则。

pub mod envelope;
pub mod errors;
pub mod scope;
pub mod value_objects;
pub mod wire;

// 重新导出常用类型
pub use envelope::*;
pub use errors::*;
pub use scope::*;
pub use value_objects::*;
pub use wire::*;
