//! Device, resource and submission layer.
//!
//! This module owns the interfaces the engine records against: buffer
//! handles with explicit heap and lifetime categories, a recorded
//! command stream, a submission queue with monotonically increasing
//! completion tokens, the compiled-pipeline export surface, and a
//! frame-in-flight resource ring.
//!
//! The [`device::Device`] shipped here is a host-side reference
//! executor: it honors the exact size-query/build contract of a
//! hardware raytracing device and really builds and intersects
//! acceleration structures, so the engine runs headless and under
//! `cargo test`. A hardware backend replaces the executor, not these
//! interfaces.

pub(crate) mod bvh;
pub mod device;
pub mod pipeline;
pub mod queue;
pub mod resource;
pub mod ring;

pub use device::{
    Device, DispatchRaysDesc, InstanceDesc, Ray, RayHit, StructureBuildInputs, StructureSizes,
    TableRange, TableRangeAndStride, TriangleGeometryDesc, RECORD_ALIGNMENT, STRUCTURE_ALIGNMENT,
    TABLE_ALIGNMENT,
};
pub use pipeline::{PipelineProperties, ProgramIdentifier, PROGRAM_IDENTIFIER_SIZE};
pub use queue::{CommandQueue, CommandStream, ExecutionIndex};
pub use resource::{Buffer, GpuAddress, HeapKind, ScratchBuffer};
pub use ring::{FrameRing, FrameSlot};

/// Round `value` up to the next multiple of `alignment` (a power of two).
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}
