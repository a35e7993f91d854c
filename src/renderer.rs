//! Renderer facade consumed by the render-poll worker. The real GPU/YUV
//! surface is an external collaborator (spec §1); this module defines the
//! trait boundary plus two stand-ins for running and testing the pipeline
//! without a real display surface.

use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::decoder::Frame;

pub trait Renderer: Send {
    fn start(&mut self) -> bool;
    fn stop(&mut self);
    fn is_running(&self) -> bool;
    fn update_frame(&mut self, frame: &Frame);
    fn set_video_size(&mut self, width: u32, height: u32);
}

/// Records frames it receives, for assertions in tests. Reports
/// `is_running() == true` from `start()` until `stop()` is called.
pub struct NullRenderer {
    running: AtomicBool,
    received: Mutex<Vec<Frame>>,
    video_size: Mutex<(u32, u32)>,
}

impl Default for NullRenderer {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(false),
            received: Mutex::new(Vec::new()),
            video_size: Mutex::new((0, 0)),
        }
    }
}

impl NullRenderer {
    pub fn frames_received(&self) -> Vec<Frame> {
        self.received.lock().unwrap().clone()
    }

    pub fn video_size(&self) -> (u32, u32) {
        *self.video_size.lock().unwrap()
    }
}

impl Renderer for NullRenderer {
    fn start(&mut self) -> bool {
        self.running.store(true, Ordering::SeqCst);
        true
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn update_frame(&mut self, frame: &Frame) {
        self.received.lock().unwrap().push(frame.clone());
    }

    fn set_video_size(&mut self, width: u32, height: u32) {
        *self.video_size.lock().unwrap() = (width, height);
    }
}

/// Logs frame sizes and resolution changes at `debug` instead of drawing
/// anything. Used by the CLI's `run` subcommand when no real GPU surface is
/// wired up.
#[derive(Default)]
pub struct LoggingRenderer {
    running: bool,
}

impl Renderer for LoggingRenderer {
    fn start(&mut self) -> bool {
        self.running = true;
        debug!("renderer started");
        true
    }

    fn stop(&mut self) {
        self.running = false;
        debug!("renderer stopped");
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn update_frame(&mut self, frame: &Frame) {
        debug!(
            "frame: {} bytes, {}x{}",
            frame.data.len(),
            frame.width,
            frame.height
        );
    }

    fn set_video_size(&mut self, width: u32, height: u32) {
        debug!("video size changed to {}x{}", width, height);
    }
}
