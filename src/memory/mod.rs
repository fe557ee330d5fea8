//! Memory budget tracking for analysis modules and buffers.

pub mod allocator;

pub use allocator::{
    AllocationKind, AllocationRequest, MemoryAllocator, MemoryStats, PressureLevel, Reservation,
};
