//! Acceleration-structure builders.
//!
//! Both levels follow the same two-step contract: query the device for
//! result/scratch sizes with the exact inputs that will be submitted,
//! allocate, record the build command plus a completion barrier.
//! Structures are static: built once, rebuilt from scratch when the
//! scene changes, never refitted.

pub mod blas;
pub mod tlas;

pub use blas::{Blas, BlasGeometry};
pub use tlas::{Tlas, TlasInstance};
