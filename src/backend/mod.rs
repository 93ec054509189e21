// Backend module - Vulkan compute abstraction layer
//
// Design: thin owning wrappers around ash handles
// Instance -> Device -> Buffer / Program, each borrowing its parent

pub mod buffer;
pub mod device;
pub mod error;
pub mod instance;
pub mod program;
pub mod shader;

pub use buffer::{BindableBuffer, Buffer, Mapping};
pub use device::Device;
pub use error::{or_exit, report, Check, Error, Result};
pub use instance::{Instance, InstanceDesc};
pub use program::Program;
