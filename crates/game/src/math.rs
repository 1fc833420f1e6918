use std::f32::consts::{PI, TAU};

/// Wrap an angle into `[-PI, PI]`.
pub fn angle_range(angle: f32) -> f32 {
    let mut a = angle % TAU;
    if a > PI {
        a -= TAU;
    } else if a < -PI {
        a += TAU;
    }
    a
}

/// Representation of `to` that is within half a turn of `from`, so that a
/// plain lerp between the two takes the short way around.
pub fn closest_angle(from: f32, to: f32) -> f32 {
    let mut t = to;
    while t - from > PI {
        t -= TAU;
    }
    while t - from < -PI {
        t += TAU;
    }
    t
}

pub fn lerp(t: f32, a: f32, b: f32) -> f32 {
    a + (b - a) * t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_angle_range_wraps() {
        assert!((angle_range(TAU + 0.5) - 0.5).abs() < 1e-6);
        assert!((angle_range(-TAU - 0.5) + 0.5).abs() < 1e-6);
        assert!((angle_range(0.25) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_closest_angle_short_way() {
        // crossing the -PI/PI seam should not take the long way
        let from = PI - 0.1;
        let to = -PI + 0.1;
        let adjusted = closest_angle(from, to);
        assert!((adjusted - from).abs() < 0.5);
    }

    #[test]
    fn test_lerp_endpoints() {
        assert_eq!(lerp(0.0, 2.0, 6.0), 2.0);
        assert_eq!(lerp(1.0, 2.0, 6.0), 6.0);
        assert_eq!(lerp(0.5, 2.0, 6.0), 4.0);
    }
}
