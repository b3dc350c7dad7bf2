//! Gamma curves and their textual forms.
//!
//! A curve is written either as its comma separated points or as a
//! `brightness:contrast:gamma` triplet (brightness and contrast in -100..=100,
//! gamma in percent with 100 being linear) from which the points are computed.

use crate::error::OptionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GammaParams {
    pub brightness: i32,
    pub contrast: i32,
    pub gamma: i32,
}

impl Default for GammaParams {
    fn default() -> Self {
        Self {
            brightness: 0,
            contrast: 0,
            gamma: 100,
        }
    }
}

impl GammaParams {
    pub fn curve(&self, len: usize, max: i32) -> Vec<i32> {
        let max = max as f64;
        let half = max / 2.0;
        let exponent = 100.0 / self.gamma.clamp(1, 999) as f64;
        let contrast = 200.0 / (100.0 - self.contrast.clamp(-100, 99) as f64) - 1.0;
        let brightness = self.brightness.clamp(-100, 100) as f64 / 100.0 * max;
        let last = len.saturating_sub(1).max(1) as f64;

        (0..len)
            .map(|i| {
                let x = (i as f64 / last).powf(exponent) * max;
                let x = contrast * (x - half) + half + brightness;
                x.round().clamp(0.0, max) as i32
            })
            .collect()
    }
}

pub fn parse_curve(text: &str, len: usize, max: i32) -> Result<Vec<i32>, OptionError> {
    let parse_err = || OptionError::Parse(text.to_owned());

    if text.contains(':') {
        let parts = text
            .split(':')
            .map(|part| part.trim().parse::<i32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| parse_err())?;

        let [brightness, contrast, gamma] = parts[..] else {
            return Err(parse_err());
        };

        return Ok(GammaParams {
            brightness,
            contrast,
            gamma,
        }
        .curve(len, max));
    }

    let points = text
        .split(',')
        .map(|point| point.trim().parse::<i32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| parse_err())?;

    if points.len() != len {
        return Err(parse_err());
    }

    Ok(points.into_iter().map(|point| point.clamp(0, max)).collect())
}

pub fn format_curve(points: &[i32]) -> String {
    points
        .iter()
        .map(|point| point.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_triplet_is_identity() {
        let curve = parse_curve("0:0:100", 256, 255).unwrap();
        assert_eq!(curve, (0..256).collect::<Vec<_>>());
    }

    #[test]
    fn brightness_lifts_the_curve() {
        let curve = GammaParams {
            brightness: 50,
            ..Default::default()
        }
        .curve(16, 255);

        assert!(curve[0] > 0);
        assert_eq!(curve[15], 255);
    }

    #[test]
    fn gamma_bends_the_middle() {
        let bright = GammaParams {
            gamma: 200,
            ..Default::default()
        }
        .curve(3, 100);
        assert_eq!(bright[0], 0);
        assert!(bright[1] > 50);
        assert_eq!(bright[2], 100);
    }

    #[test]
    fn point_lists_must_match_the_length() {
        assert_eq!(parse_curve("1, 2,3", 3, 255), Ok(vec![1, 2, 3]));
        assert_eq!(parse_curve("1,300", 2, 255), Ok(vec![1, 255]));
        assert!(matches!(parse_curve("1,2", 3, 255), Err(OptionError::Parse(_))));
        assert!(matches!(parse_curve("1:2", 3, 255), Err(OptionError::Parse(_))));
        assert!(matches!(parse_curve("a,b,c", 3, 255), Err(OptionError::Parse(_))));
    }

    #[test]
    fn format_is_comma_separated() {
        assert_eq!(format_curve(&[0, 128, 255]), "0,128,255");
    }
}
