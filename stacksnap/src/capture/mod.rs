//! Register and stack capture
//!
//! - `stack_buffer`: pre-allocated destination for the copy
//! - `register_context`: typed, per-architecture register set
//! - `stack_copier`: copy + pointer relocation, run while suspended
//! - `captured_stack`: bounds-checked reads of the copy, used after resume

pub mod captured_stack;
pub mod register_context;
pub mod stack_buffer;
pub mod stack_copier;

pub use captured_stack::CapturedStack;
pub use register_context::RegisterContext;
pub use stack_buffer::StackBuffer;
pub use stack_copier::{check_bounds, copy_stack, StackExtent};
