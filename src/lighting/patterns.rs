//! RGB pattern evaluation.
//!
//! The render engine consumes patterns through the single pure function
//! [`render`]: given a profile, a phase state, an LED count and the device
//! brightness slider it produces one `R,G,B` frame. All animation state
//! lives in [`PhaseState`] so a profile change can drop it wholesale.

use std::time::Instant;

use serde::{Deserialize, Serialize};

// =============================================================================
// Colors and profiles
// =============================================================================

/// One LED color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RgbColor {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl RgbColor {
    pub const fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }

    /// Scale by a 0..=1 factor, rounding to the nearest step.
    pub fn scaled(&self, factor: f32) -> Self {
        let factor = factor.clamp(0.0, 1.0);
        Self {
            red: (self.red as f32 * factor).round() as u8,
            green: (self.green as f32 * factor).round() as u8,
            blue: (self.blue as f32 * factor).round() as u8,
        }
    }
}

/// A stored RGB profile.
///
/// `speed` runs 0.1..=10, `smoothness` 1..=100. The temperature bounds are
/// only read by the temperature-gradient pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RgbProfile {
    pub start_color: RgbColor,
    pub end_color: RgbColor,
    /// Profile-level brightness multiplier, 0..=1.
    pub color_brightness: f32,
    pub speed: f32,
    pub smoothness: u8,
    pub min_temp: f32,
    pub max_temp: f32,
}

impl Default for RgbProfile {
    fn default() -> Self {
        Self {
            start_color: RgbColor::new(0, 255, 255),
            end_color: RgbColor::new(0, 0, 255),
            color_brightness: 1.0,
            speed: 4.0,
            smoothness: 40,
            min_temp: 20.0,
            max_temp: 60.0,
        }
    }
}

/// Pattern math selected by the profile name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    Off,
    Static,
    Rainbow,
    Colorshift,
    Colorpulse,
    /// Gradient between the profile colors driven by a temperature reading.
    TemperatureGradient,
}

impl Pattern {
    /// Map a profile name to its pattern math. Unknown names render static,
    /// which keeps a mistyped profile visibly lit rather than dark.
    pub fn from_name(name: &str) -> Self {
        match name {
            "off" => Self::Off,
            "rainbow" => Self::Rainbow,
            "colorshift" => Self::Colorshift,
            "colorpulse" => Self::Colorpulse,
            "cpu-temperature" | "gpu-temperature" | "liquid-temperature" => {
                Self::TemperatureGradient
            }
            _ => Self::Static,
        }
    }

    /// Static patterns produce one frame and no animation loop.
    pub fn is_static(&self) -> bool {
        matches!(self, Self::Off | Self::Static)
    }
}

// =============================================================================
// Phase state
// =============================================================================

/// Per-sub-device animation state. Owned by the render engine and rebuilt
/// on every profile change.
#[derive(Debug, Clone)]
pub struct PhaseState {
    pub counter: u64,
    pub started: Instant,
}

impl Default for PhaseState {
    fn default() -> Self {
        Self {
            counter: 0,
            started: Instant::now(),
        }
    }
}

impl PhaseState {
    pub fn tick(&mut self) {
        self.counter = self.counter.wrapping_add(1);
    }
}

// =============================================================================
// Rendering
// =============================================================================

/// Render one frame for one sub-device.
///
/// Returns `3 * led_count` bytes in `R,G,B` order. `slider` is the device
/// brightness 0..=100; the profile's own color brightness multiplies it.
pub fn render(
    pattern: Pattern,
    profile: &RgbProfile,
    phase: &PhaseState,
    led_count: usize,
    slider: u8,
    temperature: Option<f32>,
) -> Vec<u8> {
    let brightness = profile.color_brightness.clamp(0.0, 1.0) * (slider.min(100) as f32 / 100.0);
    let mut frame = Vec::with_capacity(led_count * 3);

    match pattern {
        Pattern::Off => {
            frame.resize(led_count * 3, 0);
        }
        Pattern::Static => {
            let color = profile.start_color.scaled(brightness);
            for _ in 0..led_count {
                frame.extend_from_slice(&[color.red, color.green, color.blue]);
            }
        }
        Pattern::Rainbow => {
            let elapsed = phase.started.elapsed().as_secs_f32();
            let base = elapsed * profile.speed.clamp(0.1, 10.0) * 36.0;
            for led in 0..led_count {
                let hue = (base + led as f32 * (360.0 / led_count.max(1) as f32)) % 360.0;
                let color = hue_to_rgb(hue).scaled(brightness);
                frame.extend_from_slice(&[color.red, color.green, color.blue]);
            }
        }
        Pattern::Colorshift => {
            let position = triangle_wave(phase.counter, profile.smoothness.clamp(1, 100) as u64);
            let color = lerp_color(profile.start_color, profile.end_color, position)
                .scaled(brightness);
            for _ in 0..led_count {
                frame.extend_from_slice(&[color.red, color.green, color.blue]);
            }
        }
        Pattern::Colorpulse => {
            let pulse = triangle_wave(phase.counter, profile.smoothness.clamp(1, 100) as u64);
            let color = profile.start_color.scaled(brightness * pulse);
            for _ in 0..led_count {
                frame.extend_from_slice(&[color.red, color.green, color.blue]);
            }
        }
        Pattern::TemperatureGradient => {
            let span = (profile.max_temp - profile.min_temp).max(1.0);
            let position = temperature
                .map(|t| ((t - profile.min_temp) / span).clamp(0.0, 1.0))
                .unwrap_or(0.0);
            let color = lerp_color(profile.start_color, profile.end_color, position)
                .scaled(brightness);
            for _ in 0..led_count {
                frame.extend_from_slice(&[color.red, color.green, color.blue]);
            }
        }
    }

    frame
}

/// Triangle wave 0→1→0 over `2 * period` ticks.
fn triangle_wave(counter: u64, period: u64) -> f32 {
    let period = period.max(1);
    let phase = counter % (2 * period);
    if phase < period {
        phase as f32 / period as f32
    } else {
        (2 * period - phase) as f32 / period as f32
    }
}

fn lerp_color(start: RgbColor, end: RgbColor, position: f32) -> RgbColor {
    let position = position.clamp(0.0, 1.0);
    let lerp = |a: u8, b: u8| (a as f32 + (b as f32 - a as f32) * position).round() as u8;
    RgbColor {
        red: lerp(start.red, end.red),
        green: lerp(start.green, end.green),
        blue: lerp(start.blue, end.blue),
    }
}

/// Map a hue in degrees to a fully saturated color.
fn hue_to_rgb(hue: f32) -> RgbColor {
    let hue = hue.rem_euclid(360.0);
    let x = 1.0 - ((hue / 60.0) % 2.0 - 1.0).abs();
    let (r, g, b) = match hue as u32 {
        0..=59 => (1.0, x, 0.0),
        60..=119 => (x, 1.0, 0.0),
        120..=179 => (0.0, 1.0, x),
        180..=239 => (0.0, x, 1.0),
        240..=299 => (x, 0.0, 1.0),
        _ => (1.0, 0.0, x),
    };
    RgbColor {
        red: (r * 255.0).round() as u8,
        green: (g * 255.0).round() as u8,
        blue: (b * 255.0).round() as u8,
    }
}
