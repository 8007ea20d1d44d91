//! `meshcal-spatial` – geometry kernel and canonical frame.
//!
//! Pure, stateless functions that relate floor-plan pixels, tracking-session
//! coordinates and the shared canonical frame.
//!
//! # Modules
//!
//! - [`transform`] – [`RigidTransform`][transform::RigidTransform] and the
//!   two-point alignment that recovers a rotation about the vertical axis,
//!   a translation and an optional uniform scale from two correspondences.
//! - [`barycentric`] – 2-D barycentric weights and their lift onto three
//!   measured 3-D points; survey fill-point generation.
//! - [`planar`] – floor-plan predicates used to validate triangle meshes
//!   (collinearity, point-in-triangle, segment crossing, interior overlap).
//! - [`canonical`] – [`CanonicalFrame`][canonical::CanonicalFrame]: the
//!   plan-centred metric frame every session is projected into.

pub mod barycentric;
pub mod canonical;
pub mod planar;
pub mod transform;

pub use barycentric::{barycentric_2d, lift_barycentric};
pub use canonical::{CanonicalFrame, Correspondence};
pub use transform::{RigidTransform, ScaleMode, align_two_points, apply_rigid_transform, rigid_align_2point};
