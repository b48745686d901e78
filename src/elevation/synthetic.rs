//! Deterministic synthetic elevation, used when the real provider fails.
//!
//! Not a physical model — just a smooth, seeded function of `(lat, lon)`
//! so a re-sampled point always yields the same fallback value and the
//! scan can keep going without stalling on missing/bad data.

/// Deterministic pseudo-elevation in meters for `(lat, lon)`.
pub fn synthetic_elevation(lat: f64, lon: f64) -> f64 {
    let seed = fnv1a(lat, lon);
    let normalized = (seed as f64) / (u64::MAX as f64);

    let base = 200.0 + 150.0 * (lat.to_radians() * 3.0).sin() * (lon.to_radians() * 2.0).cos();
    let jitter = (normalized - 0.5) * 40.0;
    base + jitter
}

/// FNV-1a over the bit patterns of `lat` and `lon`, for a stable,
/// allocation-free seed that is sensitive to small coordinate changes.
fn fnv1a(lat: f64, lon: f64) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    let mut hash = OFFSET;
    for byte in lat.to_bits().to_le_bytes().into_iter().chain(lon.to_bits().to_le_bytes()) {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_point_yields_same_value() {
        assert_eq!(synthetic_elevation(45.5, 9.5), synthetic_elevation(45.5, 9.5));
    }

    #[test]
    fn different_points_usually_differ() {
        assert_ne!(synthetic_elevation(45.5, 9.5), synthetic_elevation(45.6, 9.5));
    }

    #[test]
    fn values_are_finite() {
        assert!(synthetic_elevation(0.0, 0.0).is_finite());
        assert!(synthetic_elevation(-89.9, 179.9).is_finite());
    }
}
