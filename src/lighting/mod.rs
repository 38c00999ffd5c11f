//! Lighting subsystem: pattern math and the per-driver render engine.

pub mod engine;
pub mod patterns;

pub use engine::{ChannelPlan, FrameSink, RenderEngine, RenderPlan};
pub use patterns::{Pattern, PhaseState, RgbColor, RgbProfile};

/// Split an interleaved `R,G,B` frame into the three per-channel arrays
/// that Lighting Node and LT100 uploads expect.
pub fn deinterleave(frame: &[u8]) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let leds = frame.len() / 3;
    let mut red = Vec::with_capacity(leds);
    let mut green = Vec::with_capacity(leds);
    let mut blue = Vec::with_capacity(leds);
    for triplet in frame.chunks_exact(3) {
        red.push(triplet[0]);
        green.push(triplet[1]);
        blue.push(triplet[2]);
    }
    (red, green, blue)
}
