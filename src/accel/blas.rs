//! Bottom-level acceleration structure.

use crate::error::Result;
use crate::gpu::{
    Buffer, CommandStream, Device, GpuAddress, HeapKind, ScratchBuffer, StructureBuildInputs,
    TriangleGeometryDesc,
};

/// One triangle mesh entering a bottom-level build.
#[derive(Clone, Copy)]
pub struct BlasGeometry<'a> {
    pub vertex_buffer: &'a Buffer,
    pub vertex_count: u32,
    /// Distance between consecutive vertices; the position is the
    /// leading three floats of each.
    pub vertex_stride: u32,
    pub index_buffer: Option<&'a Buffer>,
    pub index_count: u32,
    /// Optional 3x4 row-major transform baked in at build time.
    pub transform_buffer: Option<&'a Buffer>,
    /// Opaque geometry skips any-hit resolution, shortening the
    /// closest-hit search.
    pub opaque: bool,
}

impl BlasGeometry<'_> {
    fn desc(&self) -> TriangleGeometryDesc {
        TriangleGeometryDesc {
            vertex_buffer: self.vertex_buffer.address(),
            vertex_count: self.vertex_count,
            vertex_stride: self.vertex_stride,
            index_buffer: self.index_buffer.map(|b| b.address()),
            index_count: self.index_count,
            transform_buffer: self.transform_buffer.map(|b| b.address()),
            opaque: self.opaque,
        }
    }
}

/// Opaque spatial index over one set of triangle meshes.
pub struct Blas {
    result: Buffer,
    // Discardable once the build submission has completed; we never
    // rebuild in place.
    scratch: Option<ScratchBuffer>,
    triangle_count: u32,
}

impl Blas {
    /// Record a bottom-level build into `stream`.
    ///
    /// The size query and the build command are derived from one
    /// shared inputs value, as the device contract requires. Zero
    /// usable geometry yields an empty, non-intersectable structure;
    /// the caller must guard against dispatching rays at an empty
    /// scene.
    #[tracing::instrument(skip_all, fields(geometry_count = geometries.len()))]
    pub fn build(
        device: &Device,
        stream: &mut CommandStream,
        geometries: &[BlasGeometry],
    ) -> Result<Blas> {
        let inputs = StructureBuildInputs::BottomLevel {
            geometries: geometries.iter().map(BlasGeometry::desc).collect(),
        };
        let triangle_count = geometries.iter().map(|g| g.desc().triangle_count()).sum();
        if triangle_count == 0 {
            log::warn!("bottom-level build with no usable geometry");
        }

        let sizes = device.structure_build_sizes(&inputs);
        log::debug!(
            "bottom-level sizes: result {} bytes, scratch {} bytes",
            sizes.result_size,
            sizes.scratch_size
        );

        let result = device.create_buffer("blas result", sizes.result_size, HeapKind::DeviceLocal)?;
        let scratch = device.create_scratch_buffer("blas scratch", sizes.scratch_size)?;

        stream.build_structure(inputs, result.address(), scratch.address());
        // Later commands in this or a following submission may now
        // reference the structure.
        stream.barrier(result.address());

        Ok(Blas {
            result,
            scratch: Some(scratch),
            triangle_count,
        })
    }

    /// Address the top-level builder references this structure by.
    pub fn address(&self) -> GpuAddress {
        self.result.address()
    }

    pub fn triangle_count(&self) -> u32 {
        self.triangle_count
    }

    /// Drop the scratch allocation. Only valid once the build
    /// submission is known to have completed.
    pub fn release_scratch(&mut self) {
        if let Some(scratch) = self.scratch.take() {
            log::trace!("released {} bytes of build scratch", scratch.size());
        }
    }
}
