//! Lighting render engine.
//!
//! One render task per driver, running in one of three modes: reset (one
//! all-zero frame), static (one computed frame, no loop) or animated (a
//! ticker thread assembling frames at the class cadence). Any profile,
//! brightness or layout change goes through [`RenderEngine::restart`],
//! which signals the current task over its single-shot exit channel, waits
//! until the exit is observed, then re-runs the mode decision. Concurrent
//! restarts are serialized by the engine gate.

use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Result;
use crate::lighting::patterns::{render, Pattern, PhaseState, RgbProfile};

// =============================================================================
// Sink and plan
// =============================================================================

/// Where assembled frames go. Implemented by each driver over its endpoint
/// I/O; hubs with per-channel uploads de-interleave inside their sink.
pub trait FrameSink: Send + Sync {
    fn write_frame(&self, frame: &[u8]) -> Result<()>;

    /// Reading for temperature-driven patterns, if this device has one.
    fn temperature(&self) -> Option<f32> {
        None
    }
}

/// One LED-bearing sub-device in render order.
#[derive(Debug, Clone)]
pub struct ChannelPlan {
    pub channel_id: u8,
    pub led_count: usize,
    pub profile_name: String,
    pub profile: RgbProfile,
}

/// Everything one render pass needs, snapshotted from the device profile.
/// Channels are listed in the prescribed order: external strands first,
/// internal channels second.
#[derive(Debug, Clone)]
pub struct RenderPlan {
    pub channels: Vec<ChannelPlan>,
    pub brightness: u8,
    pub interval: Duration,
}

impl RenderPlan {
    pub fn led_total(&self) -> usize {
        self.channels.iter().map(|c| c.led_count).sum()
    }

    /// True when no channel needs an animation loop.
    fn is_static(&self) -> bool {
        self.channels
            .iter()
            .all(|c| Pattern::from_name(&c.profile_name).is_static())
    }
}

fn assemble(plan: &RenderPlan, phases: &mut HashMap<u8, PhaseState>, temp: Option<f32>) -> Vec<u8> {
    let mut frame = Vec::with_capacity(plan.led_total() * 3);
    for channel in &plan.channels {
        let phase = phases.entry(channel.channel_id).or_default();
        let pattern = Pattern::from_name(&channel.profile_name);
        frame.extend(render(
            pattern,
            &channel.profile,
            phase,
            channel.led_count,
            plan.brightness,
            temp,
        ));
        phase.tick();
    }
    frame
}

// =============================================================================
// Engine
// =============================================================================

struct RenderTask {
    exit: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

/// Owns the render task handle and serializes restarts.
pub struct RenderEngine {
    task: Mutex<Option<RenderTask>>,
    gate: Mutex<()>,
}

impl Default for RenderEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderEngine {
    pub fn new() -> Self {
        Self {
            task: Mutex::new(None),
            gate: Mutex::new(()),
        }
    }

    /// Atomically replace the running render task with one matching `plan`.
    ///
    /// Sends the all-zero reset frame, then either emits a single static
    /// frame or spawns the animation ticker. Phase state never survives a
    /// restart.
    pub fn restart(&self, plan: RenderPlan, sink: Arc<dyn FrameSink>) -> Result<()> {
        let _gate = self.gate.lock().unwrap();
        self.halt_current();

        let led_total = plan.led_total();
        if led_total == 0 {
            return Ok(());
        }

        sink.write_frame(&vec![0u8; led_total * 3])?;

        if plan.is_static() {
            let mut phases = HashMap::new();
            let frame = assemble(&plan, &mut phases, sink.temperature());
            sink.write_frame(&frame)?;
            debug!(leds = led_total, "render engine: static frame");
            return Ok(());
        }

        let (exit_tx, exit_rx) = mpsc::channel();
        let join = thread::Builder::new()
            .name("lighting-render".into())
            .spawn(move || {
                let mut phases: HashMap<u8, PhaseState> = HashMap::new();
                loop {
                    match exit_rx.recv_timeout(plan.interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let frame = assemble(&plan, &mut phases, sink.temperature());
                            if let Err(e) = sink.write_frame(&frame) {
                                warn!(error = %e, "render frame dropped");
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;

        debug!(leds = led_total, "render engine: animation started");
        *self.task.lock().unwrap() = Some(RenderTask {
            exit: exit_tx,
            join,
        });
        Ok(())
    }

    /// Stop the render task and leave the LEDs dark.
    pub fn shutdown(&self, sink: &dyn FrameSink, led_total: usize) {
        let _gate = self.gate.lock().unwrap();
        self.halt_current();
        if led_total > 0 {
            if let Err(e) = sink.write_frame(&vec![0u8; led_total * 3]) {
                warn!(error = %e, "reset frame dropped on shutdown");
            }
        }
    }

    /// Stop the render task without touching the device. Used on the dirty
    /// teardown path and before resume re-initialization.
    pub fn halt(&self) {
        let _gate = self.gate.lock().unwrap();
        self.halt_current();
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().unwrap().is_some()
    }

    /// Signal the current task and wait until its exit is observed.
    fn halt_current(&self) {
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.exit.send(());
            let _ = task.join.join();
        }
    }
}
