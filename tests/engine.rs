//! End-to-end scenarios: structure building and intersection,
//! dispatch-table generation, light sampling, and progressive
//! iteration control.

use bytemuck::Zeroable;
use glam::{vec3, Vec3};
use pathlight::gpu::{Device, HeapKind, PipelineProperties, ProgramIdentifier, Ray};
use pathlight::lights::{EmissiveTriangle, LightSample, LightSampler};
use pathlight::prelude::*;
use pathlight::scene::HIT_RECORDS_PER_MESH;
use pathlight::tracer::{
    HIT_GROUP_PROGRAM, MISS_PROGRAM, RAY_GEN_PROGRAM, SHADOW_HIT_GROUP_PROGRAM,
    SHADOW_MISS_PROGRAM,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn full_pipeline() -> PipelineProperties {
    let mut pipeline = PipelineProperties::new();
    for (i, name) in [
        RAY_GEN_PROGRAM,
        MISS_PROGRAM,
        SHADOW_MISS_PROGRAM,
        HIT_GROUP_PROGRAM,
        SHADOW_HIT_GROUP_PROGRAM,
    ]
    .iter()
    .enumerate()
    {
        pipeline.add_export(*name, ProgramIdentifier([i as u8 + 1; 32]));
    }
    pipeline
}

fn upload_mesh(device: &Device, vertices: &[[f32; 3]]) -> MeshGeometry {
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
        opaque: true,
    }
}

fn settings() -> RenderSettings {
    RenderSettings {
        light_samples_per_iteration: 32,
        frames_in_flight: 2,
        ..RenderSettings::default()
    }
}

#[test]
fn built_structures_intersect_known_geometry() {
    init_logging();
    let device = Device::new();
    let queue = device.create_queue("direct");

    let mesh = upload_mesh(
        &device,
        &[[-1.0, -1.0, -5.0], [1.0, -1.0, -5.0], [0.0, 1.0, -5.0]],
    );
    let mut scene = Scene::new(vec![mesh], Vec::new());
    let mut stream = CommandStream::new("build");
    scene.build_structures(&device, &mut stream).unwrap();
    queue.submit(stream).unwrap();

    let tlas = scene.tlas_address().unwrap();

    let hit = device
        .cast_ray(tlas, &Ray::new(vec3(0.0, -0.2, 0.0), Vec3::NEG_Z))
        .expect("ray through the triangle must hit");
    assert!((hit.t - 5.0).abs() < 1e-4);
    assert_eq!(hit.instance_id, 0);
    assert_eq!(hit.primitive_index, 0);

    let miss = device.cast_ray(tlas, &Ray::new(vec3(0.0, -0.2, 0.0), Vec3::Y));
    assert!(miss.is_none(), "ray missing all geometry must not hit");
}

#[test]
fn scenario_two_opaque_meshes_and_one_emissive_mesh() {
    init_logging();
    let device = Device::new();

    let opaque_a = upload_mesh(
        &device,
        &[[-1.0, -1.0, -5.0], [1.0, -1.0, -5.0], [0.0, 1.0, -5.0]],
    );
    let opaque_b = upload_mesh(
        &device,
        &[[9.0, -1.0, -5.0], [11.0, -1.0, -5.0], [10.0, 1.0, -5.0]],
    );

    // One emissive mesh of three triangles; its geometry enters the
    // structures and its triangles feed the light sampler.
    let emissive_vertices: Vec<[f32; 3]> = (0..3)
        .flat_map(|i| {
            let x = i as f32 * 2.0;
            [[x, 3.0, 0.0], [x + 1.0, 3.0, 0.0], [x, 3.0, 1.0]]
        })
        .collect();
    let emissive_mesh = upload_mesh(&device, &emissive_vertices);
    let emissive_triangles: Vec<EmissiveTriangle> = emissive_vertices
        .chunks_exact(3)
        .map(|tri| EmissiveTriangle {
            positions: [Vec3::from(tri[0]), Vec3::from(tri[1]), Vec3::from(tri[2])],
            normals: [Vec3::NEG_Y; 3],
            radiance: vec3(4.0, 4.0, 4.0),
        })
        .collect();

    let scene = Scene::new(
        vec![opaque_a, opaque_b, emissive_mesh],
        emissive_triangles,
    );

    let mut tracer = PathTracer::new(&device, full_pipeline(), settings(), 64, 64).unwrap();
    tracer.set_scene(scene).unwrap();

    // Dispatch table: one ray-gen record, at least one miss record,
    // and a per-mesh block of hit-group records in mesh order.
    let table = tracer.dispatch_table().unwrap();
    assert!(table.ray_generation().size > 0);
    let miss_records = table.miss().size / table.miss().stride;
    assert!(miss_records >= 1);
    let hit_records = table.hit_group().size / table.hit_group().stride;
    assert_eq!(hit_records, 3 * HIT_RECORDS_PER_MESH as u64);

    // Light sampler: one cumulative entry per emissive triangle.
    let sampler = tracer.light_sampler().unwrap();
    assert_eq!(sampler.cumulative_table().len(), 3);
    let last = *sampler.cumulative_table().last().unwrap();
    assert!((last - 1.0).abs() < 1e-6);

    // The assembled scene still intersects correctly.
    let tlas = tracer.scene().unwrap().tlas_address().unwrap();
    let hit = device
        .cast_ray(tlas, &Ray::new(vec3(10.0, -0.2, 0.0), Vec3::NEG_Z))
        .expect("ray through the second opaque mesh must hit");
    assert_eq!(hit.instance_id, 1);
    assert_eq!(hit.hit_group_offset, HIT_RECORDS_PER_MESH);
}

#[test]
fn unknown_program_fails_generation_without_a_table() {
    init_logging();
    let device = Device::new();

    let mut incomplete = PipelineProperties::new();
    incomplete.add_export(RAY_GEN_PROGRAM, ProgramIdentifier([1; 32]));
    incomplete.add_export(MISS_PROGRAM, ProgramIdentifier([2; 32]));

    let mut builder = DispatchTableBuilder::new();
    builder.set_ray_gen_program(RAY_GEN_PROGRAM, &[]);
    builder.add_miss_program(MISS_PROGRAM, &[]);
    builder.add_hit_group_program(HIT_GROUP_PROGRAM, &[0]);

    match builder.generate(&incomplete, &device) {
        Err(Error::UnknownProgram(name)) => assert_eq!(name, HIT_GROUP_PROGRAM),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("generation with a missing export must fail"),
    }

    // The same builder succeeds once the export exists; no partial
    // state survived the failed attempt.
    let mut complete = incomplete.clone();
    complete.add_export(HIT_GROUP_PROGRAM, ProgramIdentifier([3; 32]));
    let table = builder.generate(&complete, &device).unwrap();
    assert_eq!(table.hit_group().size / table.hit_group().stride, 1);
}

#[test]
fn ten_thousand_samples_stay_on_a_single_triangle() {
    init_logging();
    let p0 = vec3(2.0, 0.0, 1.0);
    let p1 = vec3(5.0, 0.5, 1.0);
    let p2 = vec3(3.0, 4.0, 2.0);
    let sampler = LightSampler::new(vec![EmissiveTriangle {
        positions: [p0, p1, p2],
        normals: [Vec3::Z; 3],
        radiance: Vec3::ONE,
    }]);

    assert_eq!(sampler.cumulative_table(), &[1.0]);

    let mut samples = vec![LightSample::zeroed(); 10_000];
    sampler.generate_samples(0, &mut samples, 0.0);

    for sample in &samples {
        let (a, b, c) = barycentrics(Vec3::from(sample.position), p0, p1, p2);
        assert!(a >= -1e-4 && b >= -1e-4 && c >= -1e-4, "({a}, {b}, {c})");
        assert!(a + b <= 1.0 + 1e-4 && a + c <= 1.0 + 1e-4 && b + c <= 1.0 + 1e-4);
    }
}

#[test]
fn identically_seeded_runs_are_bit_identical() {
    init_logging();
    let make_tracer = || {
        let device = Device::new();
        let mesh = upload_mesh(
            &device,
            &[[-1.0, -1.0, -5.0], [1.0, -1.0, -5.0], [0.0, 1.0, -5.0]],
        );
        let scene = Scene::new(
            vec![mesh],
            vec![EmissiveTriangle {
                positions: [vec3(0.0, 2.0, 0.0), vec3(1.0, 2.0, 0.0), vec3(0.0, 2.0, 1.0)],
                normals: [Vec3::NEG_Y; 3],
                radiance: Vec3::ONE,
            }],
        );
        let mut tracer = PathTracer::new(&device, full_pipeline(), settings(), 64, 64).unwrap();
        tracer.set_scene(scene).unwrap();
        tracer
    };

    let camera = Camera::default();
    let mut first = make_tracer();
    let mut second = make_tracer();
    for _ in 0..6 {
        let a = first.draw_iteration(&camera).unwrap();
        let b = second.draw_iteration(&camera).unwrap();
        assert_eq!(a.iteration, b.iteration);
        assert_eq!(a.jitter[0].to_bits(), b.jitter[0].to_bits());
        assert_eq!(a.jitter[1].to_bits(), b.jitter[1].to_bits());
        assert_eq!(a.light_seed, b.light_seed);
    }
}

#[test]
fn camera_move_replays_the_restart_sequence() {
    init_logging();
    let device = Device::new();
    let mesh = upload_mesh(
        &device,
        &[[-1.0, -1.0, -5.0], [1.0, -1.0, -5.0], [0.0, 1.0, -5.0]],
    );
    let mut tracer = PathTracer::new(&device, full_pipeline(), settings(), 64, 64).unwrap();
    tracer.set_scene(Scene::new(vec![mesh], Vec::new())).unwrap();

    let camera = Camera::default();
    let baseline = tracer.draw_iteration(&camera).unwrap();
    for _ in 0..4 {
        tracer.draw_iteration(&camera).unwrap();
    }
    assert_eq!(tracer.iteration_count(), 5);

    let moved = Camera {
        position: vec3(0.1, 0.0, 0.0),
        ..camera
    };
    let after_move = tracer.draw_iteration(&moved).unwrap();
    assert!(after_move.restarted);
    assert_eq!(after_move.iteration, 0);
    assert_eq!(after_move.jitter[0].to_bits(), baseline.jitter[0].to_bits());
    assert_eq!(after_move.jitter[1].to_bits(), baseline.jitter[1].to_bits());
    assert_eq!(after_move.light_seed, baseline.light_seed);
}

fn barycentrics(p: Vec3, a: Vec3, b: Vec3, c: Vec3) -> (f32, f32, f32) {
    let v0 = b - a;
    let v1 = c - a;
    let v2 = p - a;
    let d00 = v0.dot(v0);
    let d01 = v0.dot(v1);
    let d11 = v1.dot(v1);
    let d20 = v2.dot(v0);
    let d21 = v2.dot(v1);
    let denom = d00 * d11 - d01 * d01;
    let v = (d11 * d20 - d01 * d21) / denom;
    let w = (d00 * d21 - d01 * d20) / denom;
    (1.0 - v - w, v, w)
}
