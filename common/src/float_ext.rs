pub trait FloatExt {
    fn approximately_eq(self, other: Self) -> bool;

    fn approximately_eq_within(self, other: Self, tolerance: Self) -> bool;
}

impl FloatExt for f32 {
    fn approximately_eq(self, other: Self) -> bool {
        self.approximately_eq_within(other, crate::EPSILON as f32)
    }

    fn approximately_eq_within(self, other: Self, tolerance: Self) -> bool {
        if self.is_nan() || other.is_nan() {
            return self.is_nan() && other.is_nan();
        }
        (self - other).abs() < tolerance
    }
}

impl FloatExt for f64 {
    fn approximately_eq(self, other: Self) -> bool {
        self.approximately_eq_within(other, crate::EPSILON)
    }

    fn approximately_eq_within(self, other: Self, tolerance: Self) -> bool {
        if self.is_nan() || other.is_nan() {
            return self.is_nan() && other.is_nan();
        }
        (self - other).abs() < tolerance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f32_approximately_eq() {
        assert!(1.0_f32.approximately_eq(1.0));
        assert!((0.1_f32 + 0.2_f32).approximately_eq(0.3));
        assert!(!1.0_f32.approximately_eq(1.001));
    }

    #[test]
    fn f64_within_tolerance() {
        assert!(10.0_f64.approximately_eq_within(10.04, 0.05));
        assert!(!10.0_f64.approximately_eq_within(10.06, 0.05));
    }

    #[test]
    fn nan_only_matches_nan() {
        assert!(f64::NAN.approximately_eq(f64::NAN));
        assert!(!f64::NAN.approximately_eq(0.0));
        assert!(!0.0_f64.approximately_eq(f64::NAN));
    }
}
