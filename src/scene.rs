//! Scene geometry and structure assembly.
//!
//! The scene owns the uploaded mesh buffers and reconciles the two
//! orderings that must agree but are produced by different components:
//! top-level instance descriptors (whose instance id becomes the value
//! used at hit-group-index resolution) and the dispatch table's
//! hit-group record sequence. Both are derived from mesh registration
//! order here, at assembly time.

use crate::accel::{Blas, BlasGeometry, Tlas, TlasInstance};
use crate::error::Result;
use crate::gpu::{Buffer, CommandStream, Device, GpuAddress};
use crate::lights::EmissiveTriangle;

/// Hit-group records per mesh: one closest-hit group per ray type
/// (radiance, shadow), consecutive in the table.
pub const HIT_RECORDS_PER_MESH: u32 = 2;

/// One uploaded triangle mesh. Read-only input to structure building;
/// immutable after upload.
pub struct MeshGeometry {
    pub vertex_buffer: Buffer,
    pub vertex_count: u32,
    pub vertex_stride: u32,
    pub index_buffer: Option<Buffer>,
    pub index_count: u32,
    pub transform_buffer: Option<Buffer>,
    pub opaque: bool,
}

impl MeshGeometry {
    fn blas_geometry(&self) -> BlasGeometry<'_> {
        BlasGeometry {
            vertex_buffer: &self.vertex_buffer,
            vertex_count: self.vertex_count,
            vertex_stride: self.vertex_stride,
            index_buffer: self.index_buffer.as_ref(),
            index_count: self.index_count,
            transform_buffer: self.transform_buffer.as_ref(),
            opaque: self.opaque,
        }
    }
}

/// The active scene: meshes, their emissive-triangle list, and the
/// acceleration structures built over them. Exactly one scene is
/// active at a time.
pub struct Scene {
    meshes: Vec<MeshGeometry>,
    emissive: Vec<EmissiveTriangle>,
    blas: Vec<Blas>,
    tlas: Option<Tlas>,
}

impl Scene {
    pub fn new(meshes: Vec<MeshGeometry>, emissive: Vec<EmissiveTriangle>) -> Self {
        Self {
            meshes,
            emissive,
            blas: Vec::new(),
            tlas: None,
        }
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    pub fn meshes(&self) -> &[MeshGeometry] {
        &self.meshes
    }

    pub fn emissive_triangles(&self) -> &[EmissiveTriangle] {
        &self.emissive
    }

    /// Build one bottom-level structure per mesh and the top-level
    /// structure over them, in mesh registration order. Instance id is
    /// the mesh index; the hit-group contribution steps by
    /// [`HIT_RECORDS_PER_MESH`] so it lands on that mesh's record
    /// block in the dispatch table.
    #[tracing::instrument(skip_all, fields(mesh_count = self.meshes.len()))]
    pub fn build_structures(&mut self, device: &Device, stream: &mut CommandStream) -> Result<()> {
        if self.meshes.is_empty() {
            log::warn!("building structures for an empty scene; rays will miss everything");
        }

        let blas: Vec<Blas> = self
            .meshes
            .iter()
            .map(|mesh| Blas::build(device, stream, &[mesh.blas_geometry()]))
            .collect::<Result<_>>()?;

        let instances: Vec<TlasInstance> = blas
            .iter()
            .enumerate()
            .map(|(index, blas)| TlasInstance {
                blas,
                transform: glam::Mat4::IDENTITY,
                mask: 0xff,
                hit_group_offset: index as u32 * HIT_RECORDS_PER_MESH,
            })
            .collect();
        let tlas = Tlas::build(device, stream, &instances)?;

        self.blas = blas;
        self.tlas = Some(tlas);
        log::info!(
            "scene assembled: {} meshes, {} emissive triangles",
            self.meshes.len(),
            self.emissive.len()
        );
        Ok(())
    }

    /// Traversal entry point, once structures are built.
    pub fn tlas_address(&self) -> Option<GpuAddress> {
        self.tlas.as_ref().map(Tlas::address)
    }

    /// Drop all build scratch memory. Only valid once the build
    /// submission is known to have completed.
    pub fn release_scratch(&mut self) {
        for blas in &mut self.blas {
            blas.release_scratch();
        }
        if let Some(tlas) = &mut self.tlas {
            tlas.release_scratch();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{HeapKind, Ray};
    use glam::{vec3, Vec3};

    fn upload_mesh(device: &Device, vertices: &[[f32; 3]], opaque: bool) -> MeshGeometry {
        let buf = device
            .create_buffer("mesh vertices", (vertices.len() * 12) as u64, HeapKind::Upload)
            .unwrap();
        buf.write(0, bytemuck::cast_slice(vertices)).unwrap();
        MeshGeometry {
            vertex_buffer: buf,
            vertex_count: vertices.len() as u32,
            vertex_stride: 12,
            index_buffer: None,
            index_count: 0,
            transform_buffer: None,
            opaque,
        }
    }

    #[test]
    fn test_assembly_reconciles_orderings() {
        let device = Device::new();
        let queue = device.create_queue("direct");

        // Two meshes at distinct x positions.
        let near = upload_mesh(
            &device,
            &[[-1.0, -1.0, 0.0], [1.0, -1.0, 0.0], [0.0, 1.0, 0.0]],
            true,
        );
        let far = upload_mesh(
            &device,
            &[[9.0, -1.0, 0.0], [11.0, -1.0, 0.0], [10.0, 1.0, 0.0]],
            true,
        );

        let mut scene = Scene::new(vec![near, far], Vec::new());
        let mut stream = CommandStream::new("scene build");
        scene.build_structures(&device, &mut stream).unwrap();
        queue.submit(stream).unwrap();

        let tlas = scene.tlas_address().unwrap();

        // A hit on mesh 1 reports instance id 1 and the hit-group
        // offset of its record block.
        let hit = device
            .cast_ray(tlas, &Ray::new(vec3(10.0, -0.2, 5.0), Vec3::NEG_Z))
            .expect("ray through the second mesh must hit");
        assert_eq!(hit.instance_id, 1);
        assert_eq!(hit.hit_group_offset, HIT_RECORDS_PER_MESH);

        let hit = device
            .cast_ray(tlas, &Ray::new(vec3(0.0, -0.2, 5.0), Vec3::NEG_Z))
            .expect("ray through the first mesh must hit");
        assert_eq!(hit.instance_id, 0);
        assert_eq!(hit.hit_group_offset, 0);
    }

    #[test]
    fn test_empty_scene_builds_and_misses() {
        let device = Device::new();
        let queue = device.create_queue("direct");
        let mut scene = Scene::new(Vec::new(), Vec::new());
        let mut stream = CommandStream::new("scene build");
        scene.build_structures(&device, &mut stream).unwrap();
        queue.submit(stream).unwrap();

        let tlas = scene.tlas_address().unwrap();
        assert!(device
            .cast_ray(tlas, &Ray::new(Vec3::ZERO, Vec3::NEG_Z))
            .is_none());
    }

    #[test]
    fn test_release_scratch_after_completion() {
        let device = Device::new();
        let queue = device.create_queue("direct");
        let mesh = upload_mesh(
            &device,
            &[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            true,
        );
        let mut scene = Scene::new(vec![mesh], Vec::new());
        let mut stream = CommandStream::new("scene build");
        scene.build_structures(&device, &mut stream).unwrap();
        let token = queue.submit(stream).unwrap();
        queue.wait_until_finished(token);
        scene.release_scratch();
        assert!(scene.tlas_address().is_some());
    }
}
