/// SANE fixed-point word: 16 integer bits, 16 fraction bits.
///
/// This is the only place where device words are scaled to or from floats.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Fixed(pub i32);

const SCALE: f64 = (1 << 16) as f64;

impl Fixed {
    pub const MIN: Fixed = Fixed(i32::MIN);
    pub const MAX: Fixed = Fixed(i32::MAX);

    /// `SANE_FIX`.
    pub fn from_f64(value: f64) -> Self {
        let scaled = value * SCALE;
        Fixed(scaled.clamp(i32::MIN as f64, i32::MAX as f64) as i32)
    }

    /// `SANE_UNFIX`.
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / SCALE
    }

    pub fn raw(self) -> i32 {
        self.0
    }
}

impl From<f64> for Fixed {
    fn from(value: f64) -> Self {
        Fixed::from_f64(value)
    }
}

impl From<Fixed> for f64 {
    fn from(value: Fixed) -> Self {
        value.to_f64()
    }
}

impl std::fmt::Display for Fixed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_by_two_to_the_sixteen() {
        assert_eq!(Fixed::from_f64(1.0).raw(), 65536);
        assert_eq!(Fixed::from_f64(-0.5).raw(), -32768);
        assert_eq!(Fixed(3 << 16).to_f64(), 3.0);
    }

    #[test]
    fn conversion_keeps_representable_values() {
        for value in [0.0, 12.5, 215.9, -42.17, 1200.0] {
            let back = Fixed::from_f64(value).to_f64();
            assert!((back - value).abs() < 1.0 / 65536.0, "{value} -> {back}");
        }
    }

    #[test]
    fn saturates_out_of_range() {
        assert_eq!(Fixed::from_f64(1e12), Fixed::MAX);
        assert_eq!(Fixed::from_f64(-1e12), Fixed::MIN);
    }
}
