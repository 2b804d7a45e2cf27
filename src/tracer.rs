//! Progressive iteration controller.
//!
//! Drives one full-frame sampling pass per call: detects camera and
//! parameter changes that invalidate the accumulated image, derives
//! this iteration's jitter and light-sampler seed from deterministic
//! sequences, fills the acquired frame slot's buffers, and records the
//! ray dispatch. A restart is not an error and not a cancellation:
//! in-flight iterations still complete and land in the accumulation
//! target; restart only reseeds state used by future iterations.

use bytemuck::{Pod, Zeroable};

use crate::binding_table::{DispatchTable, DispatchTableBuilder};
use crate::camera::Camera;
use crate::error::{Error, Result};
use crate::gpu::{
    Buffer, CommandQueue, CommandStream, Device, FrameRing, HeapKind, PipelineProperties,
};
use crate::lights::{LightSample, LightSampler, DEFAULT_POSITION_OFFSET};
use crate::math::{halton, Pcg32};
use crate::scene::{Scene, HIT_RECORDS_PER_MESH};

/// Program export names the shader-compilation collaborator must
/// provide.
pub const RAY_GEN_PROGRAM: &str = "RayGen";
pub const MISS_PROGRAM: &str = "Miss";
pub const SHADOW_MISS_PROGRAM: &str = "ShadowMiss";
pub const HIT_GROUP_PROGRAM: &str = "HitGroup";
pub const SHADOW_HIT_GROUP_PROGRAM: &str = "ShadowHitGroup";

// Halton prime-table indices for the per-iteration pixel jitter. Two
// bases make the pair low-discrepancy in 2D, not merely per axis.
const JITTER_BASE_X: usize = 0;
const JITTER_BASE_Y: usize = 1;

/// Bytes per accumulation texel (rgba32 float).
const OUTPUT_TEXEL_SIZE: u64 = 16;

/// Path-length filter parameters. Changing either one invalidates the
/// accumulated image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathLengthFilter {
    pub enabled: bool,
    pub max_length: u32,
}

impl Default for PathLengthFilter {
    fn default() -> Self {
        Self {
            enabled: false,
            max_length: 8,
        }
    }
}

/// Tunables of the progressive renderer.
#[derive(Debug, Clone)]
pub struct RenderSettings {
    /// Light samples generated per iteration.
    pub light_samples_per_iteration: u32,
    /// Per-frame resource copies; bounds iterations in flight.
    pub frames_in_flight: usize,
    /// Seed the deterministic generators restart from.
    pub restart_seed: u32,
    pub path_length_filter: PathLengthFilter,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            light_samples_per_iteration: 256,
            frames_in_flight: 3,
            restart_seed: 0x9e37_79b9,
            path_length_filter: PathLengthFilter::default(),
        }
    }
}

/// Per-iteration constants, laid out for direct GPU upload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FrameConstants {
    camera_position: [f32; 3],
    _pad0: f32,
    camera_u: [f32; 3],
    _pad1: f32,
    camera_v: [f32; 3],
    _pad2: f32,
    camera_w: [f32; 3],
    _pad3: f32,
    jitter: [f32; 2],
    iteration: u32,
    light_sample_count: u32,
    path_length_filter_enabled: u32,
    path_length_filter_max: u32,
    _pad4: [u32; 2],
}

struct FrameResources {
    constants: Buffer,
    light_samples: Buffer,
}

/// What one [`PathTracer::draw_iteration`] call submitted.
#[derive(Debug, Clone, Copy)]
pub struct IterationInfo {
    /// Index of the submitted iteration (pre-increment).
    pub iteration: u32,
    pub jitter: [f32; 2],
    pub light_seed: u32,
    /// Whether this call reset the accumulated state first.
    pub restarted: bool,
}

/// The progressive path tracer.
pub struct PathTracer {
    device: Device,
    queue: CommandQueue,
    pipeline: PipelineProperties,
    settings: RenderSettings,
    width: u32,
    height: u32,
    /// Accumulation target the ray-generation program writes into.
    output: Buffer,
    ring: FrameRing<FrameResources>,

    scene: Option<Scene>,
    light_sampler: Option<LightSampler>,
    dispatch_table: Option<DispatchTable>,

    iteration: u32,
    last_camera: Option<Camera>,
    light_seed_rng: Pcg32,
    light_staging: Vec<LightSample>,
    after_drain: Vec<Box<dyn FnOnce()>>,
}

impl PathTracer {
    pub fn new(
        device: &Device,
        pipeline: PipelineProperties,
        settings: RenderSettings,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let queue = device.create_queue("path tracer");
        let output = Self::create_output(device, width, height)?;
        let ring = Self::create_frame_ring(device, &settings)?;
        let restart_seed = settings.restart_seed;
        Ok(Self {
            device: device.clone(),
            queue,
            pipeline,
            settings,
            width,
            height,
            output,
            ring,
            scene: None,
            light_sampler: None,
            dispatch_table: None,
            iteration: 0,
            last_camera: None,
            light_seed_rng: Pcg32::new(restart_seed),
            light_staging: Vec::new(),
            after_drain: Vec::new(),
        })
    }

    fn create_output(device: &Device, width: u32, height: u32) -> Result<Buffer> {
        device.create_buffer(
            "accumulation output",
            u64::from(width.max(1)) * u64::from(height.max(1)) * OUTPUT_TEXEL_SIZE,
            HeapKind::DeviceLocal,
        )
    }

    fn create_frame_ring(
        device: &Device,
        settings: &RenderSettings,
    ) -> Result<FrameRing<FrameResources>> {
        FrameRing::new(settings.frames_in_flight, |index| {
            Ok(FrameResources {
                constants: device.create_buffer(
                    &format!("frame constants {index}"),
                    std::mem::size_of::<FrameConstants>() as u64,
                    HeapKind::Upload,
                )?,
                light_samples: device.create_buffer(
                    &format!("light samples {index}"),
                    u64::from(settings.light_samples_per_iteration)
                        * std::mem::size_of::<LightSample>() as u64,
                    HeapKind::Upload,
                )?,
            })
        })
    }

    /// Swap in a new scene: builds its acceleration structures, the
    /// light sampler over its emissive triangles, and a fresh dispatch
    /// table, then restarts sampling. Waits for the device to go idle
    /// first; no in-flight dispatch may reference the old structures.
    #[tracing::instrument(skip_all, fields(mesh_count = scene.mesh_count()))]
    pub fn set_scene(&mut self, mut scene: Scene) -> Result<()> {
        self.queue.wait_idle();

        let mut stream = CommandStream::new("scene structures");
        scene.build_structures(&self.device, &mut stream)?;
        let token = self.queue.submit(stream)?;
        self.queue.wait_until_finished(token);
        scene.release_scratch();

        let sampler = LightSampler::new(scene.emissive_triangles().to_vec());
        let table = self.generate_dispatch_table(&scene, &self.pipeline)?;

        self.scene = Some(scene);
        self.light_sampler = Some(sampler);
        self.dispatch_table = Some(table);
        self.restart_sampling();
        Ok(())
    }

    /// Dispatch-table layout for the active mesh list: one ray-gen
    /// record binding the accumulation output, the two miss programs,
    /// then [`HIT_RECORDS_PER_MESH`] records per mesh in registration
    /// order.
    fn generate_dispatch_table(
        &self,
        scene: &Scene,
        pipeline: &PipelineProperties,
    ) -> Result<DispatchTable> {
        let mut builder = DispatchTableBuilder::new();
        builder.set_ray_gen_program(RAY_GEN_PROGRAM, &[self.output.address().raw()]);
        builder.add_miss_program(MISS_PROGRAM, &[]);
        builder.add_miss_program(SHADOW_MISS_PROGRAM, &[]);
        for mesh in scene.meshes() {
            let vertex_buffer = mesh.vertex_buffer.address().raw();
            let index_buffer = mesh
                .index_buffer
                .as_ref()
                .map(|b| b.address().raw())
                .unwrap_or(0);
            builder.add_hit_group_program(HIT_GROUP_PROGRAM, &[vertex_buffer, index_buffer]);
            builder.add_hit_group_program(SHADOW_HIT_GROUP_PROGRAM, &[]);
        }
        debug_assert_eq!(
            builder.hit_group_count(),
            scene.mesh_count() * HIT_RECORDS_PER_MESH as usize,
        );
        builder.generate(pipeline, &self.device)
    }

    /// Replace the compiled pipeline after a shader hot reload.
    ///
    /// On success the dispatch table is regenerated and sampling
    /// restarts. If the new pipeline is missing an export, nothing
    /// changes: rendering keeps running on the previous pipeline and
    /// the error is returned for reporting.
    pub fn reload_pipeline(&mut self, pipeline: PipelineProperties) -> Result<()> {
        self.queue.wait_idle();
        let mut regenerated = None;
        if let Some(scene) = self.scene.as_ref() {
            match self.generate_dispatch_table(scene, &pipeline) {
                Ok(table) => regenerated = Some(table),
                Err(err) => {
                    log::warn!("pipeline reload failed, keeping previous pipeline: {err}");
                    return Err(err);
                }
            }
        }
        if regenerated.is_some() {
            self.dispatch_table = regenerated;
        }
        self.pipeline = pipeline;
        log::info!("pipeline reloaded");
        self.restart_sampling();
        Ok(())
    }

    /// Run one progressive iteration with `camera`.
    ///
    /// Any difference to the previous camera restarts sampling before
    /// the iteration is issued. Returns what was submitted; the
    /// iteration counter has advanced past it on return.
    pub fn draw_iteration(&mut self, camera: &Camera) -> Result<IterationInfo> {
        if self.dispatch_table.is_none() {
            return Err(Error::NoScene);
        }

        let restarted = self.last_camera != Some(*camera);
        if restarted {
            self.restart_sampling();
            self.last_camera = Some(*camera);
        }

        let iteration = self.iteration;
        let jitter = [
            halton(iteration, JITTER_BASE_X),
            halton(iteration, JITTER_BASE_Y),
        ];
        let light_seed = self.light_seed_rng.next_u32();

        // An empty light list must leave an all-zero sample buffer.
        let sample_count = self.settings.light_samples_per_iteration as usize;
        self.light_staging.clear();
        self.light_staging.resize(sample_count, LightSample::zeroed());
        if let Some(sampler) = &self.light_sampler {
            sampler.generate_samples(light_seed, &mut self.light_staging, DEFAULT_POSITION_OFFSET);
        }

        let aspect_ratio = self.width.max(1) as f32 / self.height.max(1) as f32;
        let (u, v, w) = camera.basis(aspect_ratio);
        let constants = FrameConstants {
            camera_position: camera.position.to_array(),
            _pad0: 0.0,
            camera_u: u.to_array(),
            _pad1: 0.0,
            camera_v: v.to_array(),
            _pad2: 0.0,
            camera_w: w.to_array(),
            _pad3: 0.0,
            jitter,
            iteration,
            light_sample_count: self.settings.light_samples_per_iteration,
            path_length_filter_enabled: self.settings.path_length_filter.enabled as u32,
            path_length_filter_max: self.settings.path_length_filter.max_length,
            _pad4: [0; 2],
        };

        let Some(table) = self.dispatch_table.as_ref() else {
            return Err(Error::NoScene);
        };
        let mut slot = self.ring.acquire(&self.queue);
        let resources = slot.value();
        resources
            .light_samples
            .write(0, bytemuck::cast_slice(&self.light_staging))?;
        resources.constants.write(0, bytemuck::bytes_of(&constants))?;

        let mut stream = CommandStream::new("iteration");
        table.dispatch_rays(&mut stream, self.width, self.height, 1);
        let token = self.queue.submit(stream)?;
        slot.mark_submitted(token);

        self.iteration += 1;

        if !self.after_drain.is_empty() {
            self.queue.wait_idle();
            for callback in self.after_drain.drain(..) {
                callback();
            }
        }

        Ok(IterationInfo {
            iteration,
            jitter,
            light_seed,
            restarted,
        })
    }

    /// Reset the iteration counter and reseed the light-seed
    /// generator, so the sample sequence replays exactly from the
    /// fixed starting point.
    ///
    /// Iterations already in flight still complete and write into the
    /// accumulation target; callers that need a hard cut must drain
    /// the queue before calling this.
    pub fn restart_sampling(&mut self) {
        self.iteration = 0;
        self.light_seed_rng = Pcg32::new(self.settings.restart_seed);
        log::debug!("sampling restarted");
    }

    /// Iterations accumulated since the last restart.
    pub fn iteration_count(&self) -> u32 {
        self.iteration
    }

    /// Enable or change the path-length filter. Any change restarts
    /// sampling.
    pub fn set_path_length_filter(&mut self, enabled: bool, max_length: u32) {
        let filter = PathLengthFilter {
            enabled,
            max_length,
        };
        if self.settings.path_length_filter != filter {
            self.settings.path_length_filter = filter;
            self.restart_sampling();
        }
    }

    /// Change the output resolution: recreates the accumulation
    /// target, rebinds it through a regenerated dispatch table, and
    /// restarts sampling.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if width == self.width && height == self.height {
            return Ok(());
        }
        self.queue.wait_idle();
        self.width = width;
        self.height = height;
        self.output = Self::create_output(&self.device, width, height)?;
        let mut regenerated = None;
        if let Some(scene) = self.scene.as_ref() {
            regenerated = Some(self.generate_dispatch_table(scene, &self.pipeline)?);
        }
        if regenerated.is_some() {
            self.dispatch_table = regenerated;
        }
        self.restart_sampling();
        Ok(())
    }

    /// Schedule `callback` to run right after the next iteration has
    /// fully drained the queue. Used by callers that must synchronize
    /// with a completed frame, e.g. frame capture.
    pub fn run_after_drain(&mut self, callback: impl FnOnce() + 'static) {
        self.after_drain.push(Box::new(callback));
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// The active scene, if one is set.
    pub fn scene(&self) -> Option<&Scene> {
        self.scene.as_ref()
    }

    /// The light sampler over the active scene's emissive triangles.
    pub fn light_sampler(&self) -> Option<&LightSampler> {
        self.light_sampler.as_ref()
    }

    /// The generated dispatch table for the active scene.
    pub fn dispatch_table(&self) -> Option<&DispatchTable> {
        self.dispatch_table.as_ref()
    }
}
