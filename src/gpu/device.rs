//! Device handle: allocation, structure size queries, command
//! execution and host-side ray casts.
//!
//! The size-query/build contract matches a hardware raytracing device:
//! the caller queries [`Device::structure_build_sizes`] with the exact
//! inputs it will pass to the build command, allocates result and
//! scratch buffers of the reported sizes, and records the build into a
//! command stream. The executor validates that contract instead of
//! trusting it.

use std::collections::HashMap;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::gpu::bvh::{self, Aabb, Bvh};
use crate::gpu::queue::{Command, CommandQueue};
use crate::gpu::resource::{Buffer, BufferRegistry, BufferStorage, GpuAddress, HeapKind, ScratchBuffer};
use crate::gpu::align_up;

/// Required start alignment of each dispatch-table record group.
pub const TABLE_ALIGNMENT: u64 = 64;
/// Required size alignment of individual dispatch-table records.
pub const RECORD_ALIGNMENT: u64 = 32;
/// Alignment of acceleration-structure buffers and instance arrays.
pub const STRUCTURE_ALIGNMENT: u64 = 256;

const NODE_COST: u64 = 64;
const PRIMITIVE_COST: u64 = 48;
const STRUCTURE_HEADER: u64 = 128;

/// Triangle geometry input for a bottom-level build. Buffers are
/// referenced by address; position data is three packed f32 at the
/// start of each vertex-stride window.
#[derive(Debug, Clone, Copy)]
pub struct TriangleGeometryDesc {
    pub vertex_buffer: GpuAddress,
    pub vertex_count: u32,
    pub vertex_stride: u32,
    pub index_buffer: Option<GpuAddress>,
    pub index_count: u32,
    /// Optional 3x4 row-major transform applied at build time.
    pub transform_buffer: Option<GpuAddress>,
    pub opaque: bool,
}

impl TriangleGeometryDesc {
    pub fn triangle_count(&self) -> u32 {
        if self.index_buffer.is_some() {
            self.index_count / 3
        } else {
            self.vertex_count / 3
        }
    }
}

/// Inputs to an acceleration-structure build. The same value must feed
/// both the size query and the build command.
#[derive(Debug, Clone)]
pub enum StructureBuildInputs {
    BottomLevel { geometries: Vec<TriangleGeometryDesc> },
    TopLevel {
        instance_buffer: GpuAddress,
        instance_count: u32,
    },
}

/// Buffer sizes reported by the size query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructureSizes {
    pub result_size: u64,
    pub scratch_size: u64,
}

/// Per-instance descriptor consumed by top-level builds, written into
/// an upload-visible buffer. Fixed 64-byte layout: 3x4 row-major
/// transform, packed id/mask and contribution/flags words, and the
/// address of the referenced bottom-level structure.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceDesc {
    pub transform: [[f32; 4]; 3],
    pub instance_id_and_mask: u32,
    pub contribution_and_flags: u32,
    pub acceleration_structure: u64,
}

impl InstanceDesc {
    pub fn pack_id_and_mask(instance_id: u32, mask: u8) -> u32 {
        (instance_id & 0x00ff_ffff) | ((mask as u32) << 24)
    }

    pub fn pack_contribution_and_flags(hit_group_offset: u32, flags: u8) -> u32 {
        (hit_group_offset & 0x00ff_ffff) | ((flags as u32) << 24)
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id_and_mask & 0x00ff_ffff
    }

    pub fn mask(&self) -> u8 {
        (self.instance_id_and_mask >> 24) as u8
    }

    pub fn hit_group_offset(&self) -> u32 {
        self.contribution_and_flags & 0x00ff_ffff
    }
}

/// Address range of the ray-generation record.
#[derive(Debug, Clone, Copy)]
pub struct TableRange {
    pub start: GpuAddress,
    pub size: u64,
}

/// Address range and record stride of a miss or hit-group subtable.
#[derive(Debug, Clone, Copy)]
pub struct TableRangeAndStride {
    pub start: GpuAddress,
    pub size: u64,
    pub stride: u64,
}

/// Full ray-dispatch description recorded into a command stream.
#[derive(Debug, Clone)]
pub struct DispatchRaysDesc {
    pub ray_generation: TableRange,
    pub miss: TableRangeAndStride,
    pub hit_group: TableRangeAndStride,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// Ray for host-side intersection queries against a built top-level
/// structure.
#[derive(Debug, Clone, Copy)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
    pub t_min: f32,
    pub t_max: f32,
    /// Instances whose visibility mask shares no bit with this are
    /// skipped.
    pub cull_mask: u8,
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction,
            t_min: 1e-4,
            t_max: f32::INFINITY,
            cull_mask: 0xff,
        }
    }
}

/// Closest-hit result of a host-side ray cast.
#[derive(Debug, Clone, Copy)]
pub struct RayHit {
    pub t: f32,
    pub instance_id: u32,
    pub instance_index: u32,
    pub geometry_index: u32,
    pub primitive_index: u32,
    /// Hit-group contribution of the hit instance.
    pub hit_group_offset: u32,
    /// Barycentric weights of the second and third vertex.
    pub barycentrics: [f32; 2],
}

struct BuiltTriangle {
    v0: Vec3,
    v1: Vec3,
    v2: Vec3,
    geometry_index: u32,
    primitive_index: u32,
}

struct BottomStructure {
    bvh: Bvh,
    triangles: Vec<BuiltTriangle>,
}

struct ResolvedInstance {
    object_from_world: Mat4,
    instance_id: u32,
    mask: u8,
    hit_group_offset: u32,
    blas: u64,
}

struct TopStructure {
    instances: Vec<ResolvedInstance>,
}

enum BuiltStructure {
    Bottom(BottomStructure),
    Top(TopStructure),
}

pub(crate) struct DeviceShared {
    buffers: Arc<BufferRegistry>,
    next_address: Mutex<u64>,
    structures: Mutex<HashMap<u64, BuiltStructure>>,
    dispatches: Mutex<u64>,
}

/// Device handle. Cheap to clone; all clones share one address space
/// and structure store.
#[derive(Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Device {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(DeviceShared {
                buffers: Arc::new(Mutex::new(HashMap::new())),
                next_address: Mutex::new(0x0001_0000),
                structures: Mutex::new(HashMap::new()),
                dispatches: Mutex::new(0),
            }),
        }
    }

    /// Allocate a buffer. The returned handle is the single owner.
    pub fn create_buffer(&self, label: &str, size: u64, heap: HeapKind) -> Result<Buffer> {
        if size == 0 {
            return Err(Error::AllocationFailed {
                label: label.to_string(),
                size,
            });
        }
        let address = {
            let mut next = self.shared.next_address.lock();
            let address = *next;
            *next += align_up(size, STRUCTURE_ALIGNMENT);
            address
        };
        let storage = Arc::new(BufferStorage {
            label: label.to_string(),
            heap,
            data: parking_lot::RwLock::new(vec![0u8; size as usize]),
        });
        self.shared.buffers.lock().insert(address, storage.clone());
        Ok(Buffer::new(
            GpuAddress(address),
            size,
            storage,
            Arc::downgrade(&self.shared.buffers),
        ))
    }

    /// Allocate transient scratch memory for a structure build.
    pub fn create_scratch_buffer(&self, label: &str, size: u64) -> Result<ScratchBuffer> {
        Ok(ScratchBuffer(self.create_buffer(
            label,
            size,
            HeapKind::DeviceLocal,
        )?))
    }

    /// Create a submission queue on this device.
    pub fn create_queue(&self, label: &str) -> CommandQueue {
        CommandQueue::new(self.clone(), label)
    }

    /// Report result/scratch sizes for a structure build. Deterministic
    /// in the inputs; the build command validates its buffers against
    /// the sizes reported for the same inputs.
    pub fn structure_build_sizes(&self, inputs: &StructureBuildInputs) -> StructureSizes {
        match inputs {
            StructureBuildInputs::BottomLevel { geometries } => {
                let triangles: u64 = geometries
                    .iter()
                    .map(|g| g.triangle_count() as u64)
                    .sum::<u64>()
                    .max(1);
                StructureSizes {
                    result_size: align_up(
                        STRUCTURE_HEADER + 2 * triangles * NODE_COST + triangles * PRIMITIVE_COST,
                        STRUCTURE_ALIGNMENT,
                    ),
                    scratch_size: align_up(triangles * NODE_COST, STRUCTURE_ALIGNMENT),
                }
            }
            StructureBuildInputs::TopLevel { instance_count, .. } => {
                let instances = (*instance_count as u64).max(1);
                StructureSizes {
                    result_size: align_up(
                        STRUCTURE_HEADER + instances * NODE_COST,
                        STRUCTURE_ALIGNMENT,
                    ),
                    scratch_size: align_up(instances * NODE_COST / 2, STRUCTURE_ALIGNMENT),
                }
            }
        }
    }

    /// Number of ray dispatches executed so far.
    pub fn dispatch_count(&self) -> u64 {
        *self.shared.dispatches.lock()
    }

    /// Closest-hit query against a built top-level structure. Returns
    /// None for a miss, an unknown address, or an empty structure.
    pub fn cast_ray(&self, tlas: GpuAddress, ray: &Ray) -> Option<RayHit> {
        let structures = self.shared.structures.lock();
        let top = match structures.get(&tlas.0) {
            Some(BuiltStructure::Top(top)) => top,
            _ => return None,
        };

        let mut closest: Option<RayHit> = None;
        let mut t_max = ray.t_max;
        for (instance_index, instance) in top.instances.iter().enumerate() {
            if instance.mask & ray.cull_mask == 0 {
                continue;
            }
            let bottom = match structures.get(&instance.blas) {
                Some(BuiltStructure::Bottom(bottom)) => bottom,
                _ => continue,
            };
            let origin = instance.object_from_world.transform_point3(ray.origin);
            let direction = instance.object_from_world.transform_vector3(ray.direction);
            if let Some((t, u, v, tri)) =
                traverse_bottom(bottom, origin, direction, ray.t_min, t_max)
            {
                t_max = t;
                closest = Some(RayHit {
                    t,
                    instance_id: instance.instance_id,
                    instance_index: instance_index as u32,
                    geometry_index: tri.geometry_index,
                    primitive_index: tri.primitive_index,
                    hit_group_offset: instance.hit_group_offset,
                    barycentrics: [u, v],
                });
            }
        }
        closest
    }

    pub(crate) fn execute(&self, commands: &[Command]) -> Result<()> {
        for command in commands {
            match command {
                Command::BuildStructure {
                    inputs,
                    dest,
                    scratch,
                } => self.execute_build(inputs, *dest, *scratch)?,
                Command::Barrier { resource } => self.execute_barrier(*resource)?,
                Command::TraceRays { desc } => self.execute_trace(desc)?,
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(dest = dest.raw()))]
    fn execute_build(
        &self,
        inputs: &StructureBuildInputs,
        dest: GpuAddress,
        scratch: GpuAddress,
    ) -> Result<()> {
        let sizes = self.structure_build_sizes(inputs);
        self.check_build_buffer(dest, sizes.result_size, "result")?;
        self.check_build_buffer(scratch, sizes.scratch_size, "scratch")?;

        let structure = match inputs {
            StructureBuildInputs::BottomLevel { geometries } => {
                let triangles = self.gather_triangles(geometries)?;
                let bounds: Vec<Aabb> = triangles
                    .iter()
                    .map(|t| {
                        let mut b = Aabb::EMPTY;
                        b.grow_point(t.v0);
                        b.grow_point(t.v1);
                        b.grow_point(t.v2);
                        b
                    })
                    .collect();
                log::debug!(
                    "bottom-level build: {} geometries, {} triangles",
                    geometries.len(),
                    triangles.len()
                );
                BuiltStructure::Bottom(BottomStructure {
                    bvh: bvh::build(&bounds),
                    triangles,
                })
            }
            StructureBuildInputs::TopLevel {
                instance_buffer,
                instance_count,
            } => {
                let instances = self.resolve_instances(*instance_buffer, *instance_count)?;
                log::debug!("top-level build: {} instances", instances.len());
                BuiltStructure::Top(TopStructure { instances })
            }
        };

        self.shared.structures.lock().insert(dest.0, structure);
        Ok(())
    }

    fn execute_barrier(&self, resource: GpuAddress) -> Result<()> {
        if !self.shared.buffers.lock().contains_key(&resource.0) {
            return Err(Error::device(format!(
                "barrier on unknown resource {:#x}",
                resource.0
            )));
        }
        Ok(())
    }

    fn execute_trace(&self, desc: &DispatchRaysDesc) -> Result<()> {
        if desc.ray_generation.size == 0 {
            return Err(Error::device("dispatch with empty ray-generation record"));
        }
        if desc.width == 0 || desc.height == 0 || desc.depth == 0 {
            return Err(Error::device("dispatch with zero extent"));
        }
        self.check_table_range(desc.ray_generation.start, desc.ray_generation.size)?;
        for (range, stride) in [
            (&desc.miss, desc.miss.stride),
            (&desc.hit_group, desc.hit_group.stride),
        ] {
            if range.size == 0 {
                continue;
            }
            if stride == 0 || stride % RECORD_ALIGNMENT != 0 {
                return Err(Error::device(format!(
                    "dispatch subtable stride {stride} violates record alignment"
                )));
            }
            self.check_table_range(range.start, range.size)?;
        }
        *self.shared.dispatches.lock() += 1;
        Ok(())
    }

    fn check_build_buffer(&self, address: GpuAddress, required: u64, what: &str) -> Result<()> {
        let buffers = self.shared.buffers.lock();
        let storage = buffers.get(&address.0).ok_or_else(|| {
            Error::device(format!("build {what} buffer {:#x} is not live", address.0))
        })?;
        let size = storage.data.read().len() as u64;
        if size < required {
            return Err(Error::device(format!(
                "build {what} buffer holds {size} bytes, size query reported {required}"
            )));
        }
        Ok(())
    }

    /// Validate that an address range lies inside one live buffer.
    fn check_table_range(&self, start: GpuAddress, size: u64) -> Result<()> {
        let buffers = self.shared.buffers.lock();
        let contained = buffers.iter().any(|(base, storage)| {
            let len = storage.data.read().len() as u64;
            start.0 >= *base && start.0 + size <= *base + len
        });
        if !contained {
            return Err(Error::device(format!(
                "dispatch table range {:#x}+{} is not backed by a live buffer",
                start.0, size
            )));
        }
        Ok(())
    }

    fn gather_triangles(&self, geometries: &[TriangleGeometryDesc]) -> Result<Vec<BuiltTriangle>> {
        let mut triangles = Vec::new();
        for (geometry_index, geom) in geometries.iter().enumerate() {
            let positions = self.read_positions(geom)?;
            let push = |triangles: &mut Vec<BuiltTriangle>, prim: usize, v: [Vec3; 3]| {
                triangles.push(BuiltTriangle {
                    v0: v[0],
                    v1: v[1],
                    v2: v[2],
                    geometry_index: geometry_index as u32,
                    primitive_index: prim as u32,
                });
            };
            match geom.index_buffer {
                Some(index_buffer) => {
                    let indices = self.read_indices(index_buffer, geom.index_count)?;
                    for (prim, tri) in indices.chunks_exact(3).enumerate() {
                        let fetch = |i: u32| -> Result<Vec3> {
                            positions.get(i as usize).copied().ok_or_else(|| {
                                Error::InvalidGeometry(format!(
                                    "index {i} out of range ({} vertices)",
                                    positions.len()
                                ))
                            })
                        };
                        push(
                            &mut triangles,
                            prim,
                            [fetch(tri[0])?, fetch(tri[1])?, fetch(tri[2])?],
                        );
                    }
                }
                None => {
                    for (prim, tri) in positions.chunks_exact(3).enumerate() {
                        push(&mut triangles, prim, [tri[0], tri[1], tri[2]]);
                    }
                }
            }
        }
        Ok(triangles)
    }

    fn read_positions(&self, geom: &TriangleGeometryDesc) -> Result<Vec<Vec3>> {
        let bytes = self.read_buffer(
            geom.vertex_buffer,
            geom.vertex_count as u64 * geom.vertex_stride as u64,
            "vertex",
        )?;
        let stride = geom.vertex_stride as usize;
        if stride < 12 {
            return Err(Error::InvalidGeometry(format!(
                "vertex stride {stride} is smaller than a position"
            )));
        }
        let transform = match geom.transform_buffer {
            Some(address) => Some(self.read_transform(address)?),
            None => None,
        };
        let mut positions = Vec::with_capacity(geom.vertex_count as usize);
        for i in 0..geom.vertex_count as usize {
            let at = i * stride;
            let p: [f32; 3] = bytemuck::pod_read_unaligned(&bytes[at..at + 12]);
            let mut p = Vec3::from(p);
            if let Some(m) = &transform {
                p = m.transform_point3(p);
            }
            positions.push(p);
        }
        Ok(positions)
    }

    fn read_indices(&self, address: GpuAddress, count: u32) -> Result<Vec<u32>> {
        let bytes = self.read_buffer(address, count as u64 * 4, "index")?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    fn read_transform(&self, address: GpuAddress) -> Result<Mat4> {
        let bytes = self.read_buffer(address, 48, "transform")?;
        let rows: [f32; 12] = bytemuck::pod_read_unaligned(&bytes);
        Ok(mat4_from_rows_3x4(&[
            [rows[0], rows[1], rows[2], rows[3]],
            [rows[4], rows[5], rows[6], rows[7]],
            [rows[8], rows[9], rows[10], rows[11]],
        ]))
    }

    fn read_buffer(&self, address: GpuAddress, len: u64, what: &str) -> Result<Vec<u8>> {
        let buffers = self.shared.buffers.lock();
        let storage = buffers.get(&address.0).ok_or_else(|| {
            Error::InvalidGeometry(format!("{what} buffer {:#x} is not live", address.0))
        })?;
        let data = storage.data.read();
        if (data.len() as u64) < len {
            return Err(Error::InvalidGeometry(format!(
                "{what} buffer holds {} bytes, build reads {len}",
                data.len()
            )));
        }
        Ok(data[..len as usize].to_vec())
    }

    fn resolve_instances(
        &self,
        instance_buffer: GpuAddress,
        instance_count: u32,
    ) -> Result<Vec<ResolvedInstance>> {
        let bytes = self.read_buffer(
            instance_buffer,
            instance_count as u64 * std::mem::size_of::<InstanceDesc>() as u64,
            "instance",
        )?;
        let structures = self.shared.structures.lock();
        let mut instances = Vec::with_capacity(instance_count as usize);
        for chunk in bytes
            .chunks_exact(std::mem::size_of::<InstanceDesc>())
            .take(instance_count as usize)
        {
            let desc: InstanceDesc = bytemuck::pod_read_unaligned(chunk);
            if !matches!(
                structures.get(&desc.acceleration_structure),
                Some(BuiltStructure::Bottom(_))
            ) {
                return Err(Error::device(format!(
                    "instance references unbuilt structure {:#x}",
                    desc.acceleration_structure
                )));
            }
            let world_from_object = mat4_from_rows_3x4(&desc.transform);
            instances.push(ResolvedInstance {
                object_from_world: world_from_object.inverse(),
                instance_id: desc.instance_id(),
                mask: desc.mask(),
                hit_group_offset: desc.hit_group_offset(),
                blas: desc.acceleration_structure,
            });
        }
        Ok(instances)
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

fn mat4_from_rows_3x4(rows: &[[f32; 4]; 3]) -> Mat4 {
    Mat4::from_cols(
        Vec4::new(rows[0][0], rows[1][0], rows[2][0], 0.0),
        Vec4::new(rows[0][1], rows[1][1], rows[2][1], 0.0),
        Vec4::new(rows[0][2], rows[1][2], rows[2][2], 0.0),
        Vec4::new(rows[0][3], rows[1][3], rows[2][3], 1.0),
    )
}

fn traverse_bottom<'a>(
    bottom: &'a BottomStructure,
    origin: Vec3,
    direction: Vec3,
    t_min: f32,
    t_max: f32,
) -> Option<(f32, f32, f32, &'a BuiltTriangle)> {
    if bottom.triangles.is_empty() {
        return None;
    }
    let inv_dir = direction.recip();
    let mut best: Option<(f32, f32, f32, &BuiltTriangle)> = None;
    let mut best_t = t_max;
    let mut stack = vec![0u32];
    while let Some(node_idx) = stack.pop() {
        let node = &bottom.bvh.nodes[node_idx as usize];
        if !node.bounds.hit_by(origin, inv_dir, best_t) {
            continue;
        }
        if node.count == 0 {
            stack.push(node.left_or_first);
            stack.push(node.left_or_first + 1);
            continue;
        }
        for slot in node.left_or_first..node.left_or_first + node.count {
            let prim = bottom.bvh.primitive_order[slot as usize];
            let tri = &bottom.triangles[prim as usize];
            if let Some((t, u, v)) =
                bvh::intersect_triangle(origin, direction, tri.v0, tri.v1, tri.v2)
            {
                if t > t_min && t < best_t {
                    best_t = t;
                    best = Some((t, u, v, tri));
                }
            }
        }
    }
    best
}
