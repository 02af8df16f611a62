//! The seam towards the physics.
//!
//! The engine drives these callbacks from its task graph; implementations
//! get contiguous particle slices for cache-friendly sweeps and must not
//! touch any scheduler state. Pair callbacks additionally receive the
//! shift to add to the second slice's positions when the pair wraps
//! around a periodic boundary.

use crate::space::{CPart, Part};

pub trait SphKernels: Sync {
    fn density_self(&self, parts: &mut [Part], cparts: &[CPart]);

    fn density_pair(
        &self,
        parts_i: &mut [Part],
        cparts_i: &[CPart],
        parts_j: &mut [Part],
        cparts_j: &[CPart],
        shift: [f64; 3],
    );

    fn force_self(&self, parts: &mut [Part], cparts: &[CPart]);

    fn force_pair(
        &self,
        parts_i: &mut [Part],
        cparts_i: &[CPart],
        parts_j: &mut [Part],
        cparts_j: &[CPart],
        shift: [f64; 3],
    );

    /// Per-particle work between the density and force phases. Invoked
    /// exactly once per particle; a no-op by default.
    fn ghost(&self, _parts: &mut [Part]) {}
}

/// Drives the task graph without doing any physics. Useful for exercising
/// the scheduler alone.
pub struct NoopKernels;

impl SphKernels for NoopKernels {
    fn density_self(&self, _parts: &mut [Part], _cparts: &[CPart]) {}

    fn density_pair(
        &self,
        _parts_i: &mut [Part],
        _cparts_i: &[CPart],
        _parts_j: &mut [Part],
        _cparts_j: &[CPart],
        _shift: [f64; 3],
    ) {
    }

    fn force_self(&self, _parts: &mut [Part], _cparts: &[CPart]) {}

    fn force_pair(
        &self,
        _parts_i: &mut [Part],
        _cparts_i: &[CPart],
        _parts_j: &mut [Part],
        _cparts_j: &[CPart],
        _shift: [f64; 3],
    ) {
    }
}
