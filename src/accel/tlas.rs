//! Top-level acceleration structure.

use glam::Mat4;

use crate::accel::Blas;
use crate::error::Result;
use crate::gpu::{
    align_up, Buffer, CommandStream, Device, GpuAddress, HeapKind, InstanceDesc, ScratchBuffer,
    StructureBuildInputs, STRUCTURE_ALIGNMENT,
};

/// One placed reference to a bottom-level structure.
pub struct TlasInstance<'a> {
    pub blas: &'a Blas,
    pub transform: Mat4,
    /// Visibility mask; default visible to all rays.
    pub mask: u8,
    /// Added to the hit-group index resolved at intersection time.
    /// Lets several hit-group variants share one bottom-level
    /// structure. Must agree with the dispatch table's hit-group
    /// record order, which is assembled by the scene, not here.
    pub hit_group_offset: u32,
}

impl<'a> TlasInstance<'a> {
    pub fn new(blas: &'a Blas) -> Self {
        Self {
            blas,
            transform: Mat4::IDENTITY,
            mask: 0xff,
            hit_group_offset: 0,
        }
    }
}

/// Entry point for ray traversal: instances of bottom-level
/// structures. Rebuilt whole whenever the instance list changes;
/// rebuilding is cheaper than refitting for this access pattern.
pub struct Tlas {
    result: Buffer,
    scratch: Option<ScratchBuffer>,
    // The executor reads descriptors during the build; kept alive with
    // the structure like the result buffer.
    instance_descs: Buffer,
    instance_count: u32,
}

impl Tlas {
    /// Record a top-level build into `stream`. Writes one fixed-layout
    /// descriptor per instance into an upload-visible buffer: the
    /// instance id is the list index, the transform is stored as its
    /// upper 3x4 in row-major order.
    #[tracing::instrument(skip_all, fields(instance_count = instances.len()))]
    pub fn build(
        device: &Device,
        stream: &mut CommandStream,
        instances: &[TlasInstance],
    ) -> Result<Tlas> {
        let instance_count = instances.len() as u32;
        let descs_size = align_up(
            (instances.len().max(1) * std::mem::size_of::<InstanceDesc>()) as u64,
            STRUCTURE_ALIGNMENT,
        );
        let instance_descs =
            device.create_buffer("tlas instance descs", descs_size, HeapKind::Upload)?;

        let mut descs = Vec::with_capacity(instances.len());
        for (index, instance) in instances.iter().enumerate() {
            descs.push(InstanceDesc {
                // Column-major matrix, row-major descriptor.
                transform: [
                    instance.transform.row(0).to_array(),
                    instance.transform.row(1).to_array(),
                    instance.transform.row(2).to_array(),
                ],
                instance_id_and_mask: InstanceDesc::pack_id_and_mask(index as u32, instance.mask),
                contribution_and_flags: InstanceDesc::pack_contribution_and_flags(
                    instance.hit_group_offset,
                    0,
                ),
                acceleration_structure: instance.blas.address().raw(),
            });
        }
        instance_descs.write(0, bytemuck::cast_slice(&descs))?;

        let inputs = StructureBuildInputs::TopLevel {
            instance_buffer: instance_descs.address(),
            instance_count,
        };
        let sizes = device.structure_build_sizes(&inputs);
        log::debug!(
            "top-level sizes: result {} bytes, scratch {} bytes",
            sizes.result_size,
            sizes.scratch_size
        );

        let result = device.create_buffer("tlas result", sizes.result_size, HeapKind::DeviceLocal)?;
        let scratch = device.create_scratch_buffer("tlas scratch", sizes.scratch_size)?;

        stream.build_structure(inputs, result.address(), scratch.address());
        stream.barrier(result.address());

        Ok(Tlas {
            result,
            scratch: Some(scratch),
            instance_descs,
            instance_count,
        })
    }

    /// Address ray dispatch traverses from.
    pub fn address(&self) -> GpuAddress {
        self.result.address()
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// Drop the scratch allocation. Only valid once the build
    /// submission is known to have completed.
    pub fn release_scratch(&mut self) {
        if let Some(scratch) = self.scratch.take() {
            log::trace!("released {} bytes of build scratch", scratch.size());
        }
    }

    /// Upload buffer holding the fixed-layout instance descriptors.
    pub fn instance_descriptor_buffer(&self) -> &Buffer {
        &self.instance_descs
    }

    #[cfg(test)]
    fn read_descs(&self) -> Vec<InstanceDesc> {
        let bytes = self
            .instance_descriptor_buffer()
            .read(
                0,
                self.instance_count as u64 * std::mem::size_of::<InstanceDesc>() as u64,
            )
            .unwrap();
        bytes
            .chunks_exact(std::mem::size_of::<InstanceDesc>())
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }
}
