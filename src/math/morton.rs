//! Morton encoding (Z-order curve) for spatial sorting of instances

/// Spread bits of a 21-bit integer into every third bit of a 64-bit integer
fn spread_bits(x: u32) -> u64 {
    let mut x = x as u64 & 0x1fffff; // 21 bits max
    x = (x | (x << 32)) & 0x1f00000000ffff;
    x = (x | (x << 16)) & 0x1f0000ff0000ff;
    x = (x | (x << 8)) & 0x100f00f00f00f00f;
    x = (x | (x << 4)) & 0x10c30c30c30c30c3;
    x = (x | (x << 2)) & 0x1249249249249249;
    x
}

/// Encode 3D coordinates into Morton code (Z-order curve)
/// Each coordinate can be up to 21 bits (0..2097151)
pub fn encode_morton_3d(x: u32, y: u32, z: u32) -> u64 {
    spread_bits(x) | (spread_bits(y) << 1) | (spread_bits(z) << 2)
}

/// Quantize a normalized position (components in 0..=1) to a Morton key.
/// Positions outside the range are clamped, so a few stray points cannot
/// break the sort.
pub fn morton_key_normalized(x: f32, y: f32, z: f32) -> u64 {
    const SCALE: f32 = 2097151.0;
    let q = |v: f32| (v.clamp(0.0, 1.0) * SCALE) as u32;
    encode_morton_3d(q(x), q(y), q(z))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleave() {
        assert_eq!(encode_morton_3d(0, 0, 0), 0);
        assert_eq!(encode_morton_3d(1, 0, 0), 1);
        assert_eq!(encode_morton_3d(0, 1, 0), 2);
        assert_eq!(encode_morton_3d(0, 0, 1), 4);
        assert_eq!(encode_morton_3d(1, 1, 1), 7);
    }

    #[test]
    fn test_monotonic_along_axis() {
        let a = encode_morton_3d(10, 0, 0);
        let b = encode_morton_3d(11, 0, 0);
        assert!(b > a);
    }

    #[test]
    fn test_normalized_clamps() {
        // out-of-range values clamp instead of wrapping
        assert_eq!(morton_key_normalized(-1.0, 0.0, 0.0), 0);
        assert_eq!(
            morton_key_normalized(2.0, 0.0, 0.0),
            morton_key_normalized(1.0, 0.0, 0.0)
        );
    }
}
