//! Importance sampling of emissive triangles.
//!
//! Construction flattens the scene's emissive geometry into a
//! normalized cumulative-area table; sampling draws low-discrepancy
//! scalars, picks the triangle whose cumulative range contains the
//! first draw, and maps the other two onto an area-uniform barycentric
//! point. Sampling is area-proportional; the luminance-weighted total
//! flux is computed for diagnostics only and never feeds the table.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::math::halton;

/// Offset applied along the sample normal so shadow rays do not
/// immediately re-intersect the emitting triangle.
pub const DEFAULT_POSITION_OFFSET: f32 = 1e-5;

// Halton bases (prime-table indices): one stream for the triangle
// draw, two more for the barycentric draws, so consecutive iterations
// decorrelate.
const TRIANGLE_BASE: usize = 1;
const BARYCENTRIC_BASE_0: usize = 3;
const BARYCENTRIC_BASE_1: usize = 4;

/// Rec. 709 luminance weights.
const LUMINANCE: Vec3 = Vec3::new(0.2126, 0.7152, 0.0722);

/// One emissive triangle, flattened out of the scene geometry.
#[derive(Debug, Clone, Copy)]
pub struct EmissiveTriangle {
    pub positions: [Vec3; 3],
    pub normals: [Vec3; 3],
    /// Constant emitted radiance over the triangle.
    pub radiance: Vec3,
}

impl EmissiveTriangle {
    /// Half the cross-product magnitude of two edges.
    pub fn area(&self) -> f32 {
        let e1 = self.positions[1] - self.positions[0];
        let e2 = self.positions[2] - self.positions[0];
        0.5 * e1.cross(e2).length()
    }
}

/// Generated light sample, laid out for direct GPU upload.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LightSample {
    pub position: [f32; 3],
    _pad0: f32,
    pub normal: [f32; 3],
    _pad1: f32,
    /// Emitted radiance pre-weighted by total emissive area. Division
    /// by the sample count is deferred to the consumer, which knows
    /// how many samples it actually evaluates.
    pub radiance: [f32; 3],
    _pad2: f32,
}

/// Cumulative-area sampler over the scene's emissive triangles.
/// Rebuilt whenever the light-emitting geometry set changes; read-only
/// afterwards.
pub struct LightSampler {
    triangles: Vec<EmissiveTriangle>,
    /// Normalized summed area; final entry is 1.
    cumulative_area: Vec<f32>,
    total_area: f32,
    total_flux: f32,
}

impl LightSampler {
    pub fn new(triangles: Vec<EmissiveTriangle>) -> Self {
        let mut cumulative_area = Vec::with_capacity(triangles.len());
        let mut total_area = 0.0f32;
        let mut total_flux = 0.0f32;

        for triangle in &triangles {
            let area = triangle.area();
            // Pi is the cosine-lobe integral over the hemisphere.
            total_flux += LUMINANCE.dot(triangle.radiance) * area * std::f32::consts::PI;
            total_area += area;
            cumulative_area.push(total_area);
        }
        for v in &mut cumulative_area {
            *v /= total_area;
        }

        log::debug!(
            "light sampler: {} triangles, total area {total_area}, total flux {total_flux}",
            triangles.len()
        );

        Self {
            triangles,
            cumulative_area,
            total_area,
            total_flux,
        }
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    pub fn total_area(&self) -> f32 {
        self.total_area
    }

    /// Luminance-weighted flux of all emitters. Diagnostic only;
    /// sampling stays area-proportional.
    pub fn total_flux(&self) -> f32 {
        self.total_flux
    }

    /// The normalized cumulative-area table.
    pub fn cumulative_table(&self) -> &[f32] {
        &self.cumulative_area
    }

    /// Fill `destination` with randomized light samples for one
    /// iteration. With no emissive triangles this is a no-op and the
    /// buffer is left untouched; callers treat an untouched buffer as
    /// "no direct light sampling available".
    pub fn generate_samples(
        &self,
        seed: u32,
        destination: &mut [LightSample],
        position_offset: f32,
    ) {
        if self.triangles.is_empty() {
            return;
        }

        // Radiance is weighted by total area only; the consumer does
        // not know the evaluated sample count here.
        let sample_weight = self.total_area;
        let count = destination.len() as u32;

        for (i, sample) in destination.iter_mut().enumerate() {
            let halton_index = (i as u32).wrapping_add(seed.wrapping_mul(count));

            // First entry >= the draw (lower-bound tie break).
            let draw = halton(halton_index, TRIANGLE_BASE);
            let triangle_index = self
                .cumulative_area
                .partition_point(|&v| v < draw)
                .min(self.triangles.len() - 1);
            let triangle = &self.triangles[triangle_index];

            // Area-uniform barycentric point via the square-root
            // transform.
            let xi0 = halton(halton_index, BARYCENTRIC_BASE_0).sqrt();
            let xi1 = halton(halton_index, BARYCENTRIC_BASE_1);
            let alpha = 1.0 - xi0;
            let beta = xi0 * (1.0 - xi1);

            let [p0, p1, p2] = triangle.positions;
            let [n0, n1, n2] = triangle.normals;
            let position = p0 + alpha * (p1 - p0) + beta * (p2 - p0);
            let normal = (n0 + alpha * (n1 - n0) + beta * (n2 - n0)).normalize();

            *sample = LightSample {
                position: (position + normal * position_offset).to_array(),
                _pad0: 0.0,
                normal: normal.to_array(),
                _pad1: 0.0,
                radiance: (triangle.radiance * sample_weight).to_array(),
                _pad2: 0.0,
            };
        }
    }
}
