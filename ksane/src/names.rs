//! Well-known SANE option names.

pub const SCAN_MODE: &str = "mode";
pub const BIT_DEPTH: &str = "depth";
pub const SCAN_RESOLUTION: &str = "resolution";
pub const SCAN_X_RESOLUTION: &str = "x-resolution";
pub const SCAN_Y_RESOLUTION: &str = "y-resolution";
pub const PREVIEW: &str = "preview";
pub const SCAN_SOURCE: &str = "source";
pub const FILM_TYPE: &str = "film-type";
pub const WAIT_FOR_BUTTON: &str = "wait-for-button";

pub const SCAN_TL_X: &str = "tl-x";
pub const SCAN_TL_Y: &str = "tl-y";
pub const SCAN_BR_X: &str = "br-x";
pub const SCAN_BR_Y: &str = "br-y";

pub const GAMMA_VECTOR: &str = "gamma-table";
pub const GAMMA_VECTOR_R: &str = "red-gamma-table";
pub const GAMMA_VECTOR_G: &str = "green-gamma-table";
pub const GAMMA_VECTOR_B: &str = "blue-gamma-table";

pub const SCAN_MODE_COLOR: &str = "Color";

/// Session-level pseudo option for colour inversion.
pub const INVERT_COLORS: &str = "KSane::InvertColors";

pub fn is_gamma_vector(name: &str) -> bool {
    matches!(
        name,
        GAMMA_VECTOR | GAMMA_VECTOR_R | GAMMA_VECTOR_G | GAMMA_VECTOR_B
    )
}
