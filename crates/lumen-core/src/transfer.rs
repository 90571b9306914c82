//! Tone-mapping transfer functions applied around network inference.
//!
//! The forward curve compresses pixel values into [0, 1] before they enter
//! the network; the inverse restores them afterwards. Autoexposure is
//! folded into the input scale so kernels always see normalized data.

/// Maximum luminance the HDR curve is normalized against (largest finite
/// half-precision value).
pub const HDR_Y_MAX: f32 = 65504.0;

// Fitted constants of the perceptually uniform HDR curve.
const PU_A: f32 = 1.412_837_65e3;
const PU_B: f32 = 1.645_931_72;
const PU_C: f32 = 4.313_849_81e-1;
const PU_D: f32 = -2.941_396_09e-3;
const PU_E: f32 = 1.926_532_54e-1;
const PU_F: f32 = 6.260_260_94e-3;
const PU_G: f32 = 9.986_201_52e-1;
const PU_Y0: f32 = 1.579_457_60e-6;
const PU_Y1: f32 = 3.220_876_31e-2;
const PU_X0: f32 = 2.231_517_11e-3;
const PU_X1: f32 = 3.709_747_49e-1;

fn pu_forward(y: f32) -> f32 {
    if y <= PU_Y0 {
        PU_A * y
    } else if y <= PU_Y1 {
        PU_B * y.powf(PU_C) + PU_D
    } else {
        PU_E * (y + PU_F).ln() + PU_G
    }
}

fn pu_inverse(x: f32) -> f32 {
    if x <= PU_X0 {
        x / PU_A
    } else if x <= PU_X1 {
        ((x - PU_D) / PU_B).powf(1.0 / PU_C)
    } else {
        ((x - PU_G) / PU_E).exp() - PU_F
    }
}

fn srgb_forward(y: f32) -> f32 {
    if y <= 0.003_130_8 {
        12.92 * y
    } else {
        1.055 * y.powf(1.0 / 2.4) - 0.055
    }
}

fn srgb_inverse(x: f32) -> f32 {
    if x <= 0.040_45 {
        x / 12.92
    } else {
        ((x + 0.055) / 1.055).powf(2.4)
    }
}

/// Shape of the tone curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferCurve {
    /// Identity; for images already in a normalized working space.
    Linear,
    /// IEC 61966-2-1 piecewise sRGB encode/decode.
    Srgb,
    /// Perceptually uniform HDR curve, normalized so `forward(HDR_Y_MAX) == 1`.
    Pu,
}

/// A monotone tone curve plus the input scale carrying autoexposure.
#[derive(Debug, Clone, Copy)]
pub struct TransferFunction {
    curve: TransferCurve,
    input_scale: f32,
    output_scale: f32,
    norm_scale: f32,
}

impl TransferFunction {
    pub fn new(curve: TransferCurve) -> Self {
        let norm_scale = match curve {
            TransferCurve::Pu => 1.0 / pu_forward(HDR_Y_MAX),
            _ => 1.0,
        };
        Self {
            curve,
            input_scale: 1.0,
            output_scale: 1.0,
            norm_scale,
        }
    }

    /// Fold an autoexposure factor into the curve. The inverse direction
    /// divides by the same factor.
    pub fn set_input_scale(&mut self, input_scale: f32) {
        debug_assert!(input_scale > 0.0);
        self.input_scale = input_scale;
        self.output_scale = 1.0 / input_scale;
    }

    pub fn input_scale(&self) -> f32 {
        self.input_scale
    }

    pub fn output_scale(&self) -> f32 {
        self.output_scale
    }

    /// Forward curve: scene value to normalized network value.
    pub fn forward(&self, y: f32) -> f32 {
        match self.curve {
            TransferCurve::Linear => y,
            TransferCurve::Srgb => srgb_forward(y),
            TransferCurve::Pu => pu_forward(y) * self.norm_scale,
        }
    }

    /// Inverse curve: normalized network value back to scene value.
    pub fn inverse(&self, x: f32) -> f32 {
        match self.curve {
            TransferCurve::Linear => x,
            TransferCurve::Srgb => srgb_inverse(x),
            TransferCurve::Pu => pu_inverse(x / self.norm_scale),
        }
    }

    /// Componentwise forward of a color triple.
    pub fn forward3(&self, v: [f32; 3]) -> [f32; 3] {
        [self.forward(v[0]), self.forward(v[1]), self.forward(v[2])]
    }

    /// Componentwise inverse of a color triple.
    pub fn inverse3(&self, v: [f32; 3]) -> [f32; 3] {
        [self.inverse(v[0]), self.inverse(v[1]), self.inverse(v[2])]
    }
}
