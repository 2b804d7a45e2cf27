//! Dispatch table (shader binding table) generation.
//!
//! The table is three ordered record groups: exactly one
//! ray-generation record, the miss records, and the hit-group records
//! (consecutive per-mesh blocks, in mesh registration order). Every
//! record is a compiled program identifier followed by 8-byte
//! parameter words; records within a group share one stride, the
//! maximum record size of the group rounded up to the device's record
//! alignment, and each group starts at table alignment.
//!
//! Generation is all-or-nothing: every program name is resolved before
//! any GPU memory is touched, so an unknown export can never leave a
//! partially-written table reachable.

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::gpu::{
    align_up, Buffer, CommandStream, Device, DispatchRaysDesc, HeapKind, PipelineProperties,
    ProgramIdentifier, TableRange, TableRangeAndStride, PROGRAM_IDENTIFIER_SIZE, RECORD_ALIGNMENT,
    TABLE_ALIGNMENT,
};

/// Bytes one parameter word occupies in a record.
const PARAMETER_WORD_SIZE: u64 = 8;

#[derive(Debug, Clone)]
struct Record {
    program: String,
    parameters: SmallVec<[u64; 4]>,
}

#[derive(Debug, Clone, Default)]
struct RecordGroup {
    records: Vec<Record>,
    max_parameters: usize,
}

impl RecordGroup {
    fn add(&mut self, program: impl Into<String>, parameters: &[u64]) {
        self.max_parameters = self.max_parameters.max(parameters.len());
        self.records.push(Record {
            program: program.into(),
            parameters: SmallVec::from_slice(parameters),
        });
    }

    /// Stride of every record in this group.
    fn stride(&self) -> u64 {
        record_size(self.max_parameters)
    }

    /// Group size, rounded up so the next group starts table-aligned.
    fn aligned_size(&self) -> u64 {
        align_up(self.stride() * self.records.len() as u64, TABLE_ALIGNMENT)
    }
}

/// Size of a record holding `parameter_count` words.
fn record_size(parameter_count: usize) -> u64 {
    align_up(
        PROGRAM_IDENTIFIER_SIZE as u64 + PARAMETER_WORD_SIZE * parameter_count as u64,
        RECORD_ALIGNMENT,
    )
}

/// Serialize one record: identifier bytes, then the raw parameter
/// words. `dest` is the record's full stride; the tail stays zero.
fn write_record(dest: &mut [u8], identifier: &ProgramIdentifier, parameters: &[u64]) {
    dest[..PROGRAM_IDENTIFIER_SIZE].copy_from_slice(identifier.as_bytes());
    let words: &mut [u8] = &mut dest[PROGRAM_IDENTIFIER_SIZE..];
    words[..parameters.len() * PARAMETER_WORD_SIZE as usize]
        .copy_from_slice(bytemuck::cast_slice(parameters));
}

/// Accumulates program records, then generates the table against a
/// compiled pipeline. Re-run in full whenever the pipeline is
/// recompiled or the scene's mesh list changes; there is no
/// incremental update.
#[derive(Debug, Clone, Default)]
pub struct DispatchTableBuilder {
    ray_gen: Option<Record>,
    miss: RecordGroup,
    hit_groups: RecordGroup,
}

impl DispatchTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the single ray-generation record.
    pub fn set_ray_gen_program(&mut self, program: impl Into<String>, parameters: &[u64]) {
        self.ray_gen = Some(Record {
            program: program.into(),
            parameters: SmallVec::from_slice(parameters),
        });
    }

    /// Append a miss record.
    pub fn add_miss_program(&mut self, program: impl Into<String>, parameters: &[u64]) {
        self.miss.add(program, parameters);
    }

    /// Append a hit-group record. Order must match mesh registration
    /// order; dispatch has no runtime detection of a mismatch.
    pub fn add_hit_group_program(&mut self, program: impl Into<String>, parameters: &[u64]) {
        self.hit_groups.add(program, parameters);
    }

    pub fn hit_group_count(&self) -> usize {
        self.hit_groups.records.len()
    }

    pub fn miss_count(&self) -> usize {
        self.miss.records.len()
    }

    /// Resolve every program against the pipeline and emit the table.
    ///
    /// Fails with [`Error::UnknownProgram`] if any name has no
    /// compiled export; nothing is allocated or written in that case.
    #[tracing::instrument(skip_all, fields(
        miss_count = self.miss.records.len(),
        hit_group_count = self.hit_groups.records.len(),
    ))]
    pub fn generate(
        &self,
        pipeline: &PipelineProperties,
        device: &Device,
    ) -> Result<DispatchTable> {
        let ray_gen = self.ray_gen.as_ref().ok_or(Error::MissingRayGen)?;

        let resolve = |record: &Record| -> Result<ProgramIdentifier> {
            pipeline
                .program_identifier(&record.program)
                .ok_or_else(|| Error::UnknownProgram(record.program.clone()))
        };

        // Resolve everything up front; generation aborts before any
        // table memory exists.
        let ray_gen_id = resolve(ray_gen)?;
        let miss_ids: Vec<ProgramIdentifier> =
            self.miss.records.iter().map(resolve).collect::<Result<_>>()?;
        let hit_ids: Vec<ProgramIdentifier> = self
            .hit_groups
            .records
            .iter()
            .map(resolve)
            .collect::<Result<_>>()?;

        let ray_gen_size = align_up(record_size(ray_gen.parameters.len()), TABLE_ALIGNMENT);
        let miss_stride = self.miss.stride();
        let miss_size = self.miss.aligned_size();
        let hit_stride = self.hit_groups.stride();
        let hit_size = self.hit_groups.aligned_size();
        let table_size = ray_gen_size + miss_size + hit_size;

        let mut staging = vec![0u8; table_size as usize];
        write_record(
            &mut staging[..ray_gen_size as usize],
            &ray_gen_id,
            &ray_gen.parameters,
        );
        let mut cursor = ray_gen_size as usize;
        for (record, id) in self.miss.records.iter().zip(&miss_ids) {
            write_record(
                &mut staging[cursor..cursor + miss_stride as usize],
                id,
                &record.parameters,
            );
            cursor += miss_stride as usize;
        }
        cursor = (ray_gen_size + miss_size) as usize;
        for (record, id) in self.hit_groups.records.iter().zip(&hit_ids) {
            write_record(
                &mut staging[cursor..cursor + hit_stride as usize],
                id,
                &record.parameters,
            );
            cursor += hit_stride as usize;
        }
        debug_assert!(cursor as u64 <= table_size);

        let buffer = device.create_buffer("dispatch table", table_size, HeapKind::Upload)?;
        buffer.write(0, &staging)?;

        let base = buffer.address();
        log::debug!(
            "dispatch table: {} bytes (ray-gen {}, miss {}x{}, hit {}x{})",
            table_size,
            ray_gen_size,
            self.miss.records.len(),
            miss_stride,
            self.hit_groups.records.len(),
            hit_stride,
        );

        Ok(DispatchTable {
            ray_generation: TableRange {
                start: base,
                size: ray_gen_size,
            },
            miss: TableRangeAndStride {
                start: base.offset(ray_gen_size),
                size: miss_stride * self.miss.records.len() as u64,
                stride: miss_stride,
            },
            hit_group: TableRangeAndStride {
                start: base.offset(ray_gen_size + miss_size),
                size: hit_stride * self.hit_groups.records.len() as u64,
                stride: hit_stride,
            },
            buffer,
        })
    }
}

/// Generated dispatch table: the backing upload buffer plus the three
/// ranges the ray-dispatch call consumes.
#[derive(Debug)]
pub struct DispatchTable {
    buffer: Buffer,
    ray_generation: TableRange,
    miss: TableRangeAndStride,
    hit_group: TableRangeAndStride,
}

impl DispatchTable {
    /// Record a ray dispatch over a `width` x `height` x `depth` grid.
    pub fn dispatch_rays(&self, stream: &mut CommandStream, width: u32, height: u32, depth: u32) {
        stream.trace_rays(DispatchRaysDesc {
            ray_generation: self.ray_generation,
            miss: self.miss,
            hit_group: self.hit_group,
            width,
            height,
            depth,
        });
    }

    pub fn ray_generation(&self) -> TableRange {
        self.ray_generation
    }

    pub fn miss(&self) -> TableRangeAndStride {
        self.miss
    }

    pub fn hit_group(&self) -> TableRangeAndStride {
        self.hit_group
    }

    /// Total size of the backing buffer in bytes.
    pub fn size(&self) -> u64 {
        self.buffer.size()
    }

    /// Raw table bytes (upload heap), for inspection.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        self.buffer.read(0, self.buffer.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline_with(names: &[&str]) -> PipelineProperties {
        let mut pipeline = PipelineProperties::new();
        for (i, name) in names.iter().enumerate() {
            pipeline.add_export(*name, ProgramIdentifier([i as u8 + 1; 32]));
        }
        pipeline
    }

    #[test]
    fn test_record_size_rounds_to_record_alignment() {
        assert_eq!(record_size(0), 32);
        assert_eq!(record_size(1), 64); // 32 + 8 -> 64
        assert_eq!(record_size(4), 64); // 32 + 32 -> 64
        assert_eq!(record_size(5), 96);
    }

    #[test]
    fn test_layout_is_byte_exact() {
        let device = Device::new();
        let pipeline = pipeline_with(&["RayGen", "Miss", "Hit"]);

        let mut builder = DispatchTableBuilder::new();
        builder.set_ray_gen_program("RayGen", &[0xaaaa]);
        builder.add_miss_program("Miss", &[]);
        // Parameter counts 1, 3, 0 -> stride from the maximum (3).
        builder.add_hit_group_program("Hit", &[1]);
        builder.add_hit_group_program("Hit", &[2, 3, 4]);
        builder.add_hit_group_program("Hit", &[]);

        let table = builder.generate(&pipeline, &device).unwrap();

        let expected_hit_stride = align_up(32 + 8 * 3, RECORD_ALIGNMENT);
        assert_eq!(table.hit_group().stride, expected_hit_stride);

        let ray_gen_size = align_up(align_up(32 + 8, RECORD_ALIGNMENT), TABLE_ALIGNMENT);
        let miss_size = align_up(32, TABLE_ALIGNMENT);
        let hit_size = align_up(expected_hit_stride * 3, TABLE_ALIGNMENT);
        assert_eq!(table.size(), ray_gen_size + miss_size + hit_size);

        assert_eq!(table.ray_generation().size, ray_gen_size);
        assert_eq!(
            table.miss().start.raw(),
            table.ray_generation().start.raw() + ray_gen_size
        );
        assert_eq!(
            table.hit_group().start.raw(),
            table.miss().start.raw() + miss_size
        );
        assert_eq!(table.miss().start.raw() % TABLE_ALIGNMENT, 0);
        assert_eq!(table.hit_group().start.raw() % TABLE_ALIGNMENT, 0);
    }

    #[test]
    fn test_record_bytes() {
        let device = Device::new();
        let pipeline = pipeline_with(&["RayGen", "Miss", "Hit"]);

        let mut builder = DispatchTableBuilder::new();
        builder.set_ray_gen_program("RayGen", &[]);
        builder.add_miss_program("Miss", &[]);
        builder.add_hit_group_program("Hit", &[0x1122_3344_5566_7788]);

        let table = builder.generate(&pipeline, &device).unwrap();
        let bytes = table.read_bytes().unwrap();

        // Ray-gen record: identifier then zero padding.
        assert_eq!(&bytes[..32], &[1u8; 32]);

        // Hit record: identifier then the parameter word, little endian.
        let hit_at = (table.hit_group().start.raw() - table.ray_generation().start.raw()) as usize;
        assert_eq!(&bytes[hit_at..hit_at + 32], &[3u8; 32]);
        assert_eq!(
            &bytes[hit_at + 32..hit_at + 40],
            &0x1122_3344_5566_7788u64.to_le_bytes()
        );
    }

    #[test]
    fn test_unknown_program_aborts_generation() {
        let device = Device::new();
        let pipeline = pipeline_with(&["RayGen"]);

        let mut builder = DispatchTableBuilder::new();
        builder.set_ray_gen_program("RayGen", &[]);
        builder.add_miss_program("MissingMiss", &[]);

        let err = builder.generate(&pipeline, &device).unwrap_err();
        assert!(matches!(err, Error::UnknownProgram(name) if name == "MissingMiss"));
    }

    #[test]
    fn test_missing_ray_gen_is_rejected() {
        let device = Device::new();
        let pipeline = pipeline_with(&["Miss"]);
        let mut builder = DispatchTableBuilder::new();
        builder.add_miss_program("Miss", &[]);
        assert!(matches!(
            builder.generate(&pipeline, &device),
            Err(Error::MissingRayGen)
        ));
    }
}
