// =============================================================================
// VKCOMPUTE - single-shot Vulkan compute dispatch
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  Instance (backend connection, validation)                      │
// │    └── Device (compute queue, command pool + one cmd buffer)    │
// │          ├── Buffer (host-visible storage memory)               │
// │          └── Program (shader module + per-bind pipeline)        │
// └─────────────────────────────────────────────────────────────────┘
//
// DISPATCH FLOW:
// 1. Write inputs into mapped buffers
// 2. Bind buffers to the program (binding index = list position)
// 3. Record, submit, wait for the queue to go idle
// 4. Map outputs and read results
//
// =============================================================================

pub mod backend;
pub mod config;
pub mod jobs;
pub mod search;

pub use backend::{Buffer, Device, Instance, InstanceDesc, Program};
