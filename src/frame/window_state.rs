// Window size shared between the window event handler and the frame loop.
//
// The event handler is the only writer, the frame loop the only reader of
// the resize flag. Size is stored before the flag is raised so a reader that
// observes the flag also observes the size that caused it.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

#[derive(Debug)]
pub struct WindowState {
    width: AtomicU32,
    height: AtomicU32,
    resized: AtomicBool,
}

impl WindowState {
    /// Starts with the resize flag raised so the first frame creates the
    /// render targets.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: AtomicU32::new(width),
            height: AtomicU32::new(height),
            resized: AtomicBool::new(true),
        }
    }

    /// Called from the window callback when the client area changes.
    pub fn notify_resize(&self, width: u32, height: u32) {
        self.width.store(width, Ordering::Relaxed);
        self.height.store(height, Ordering::Relaxed);
        self.resized.store(true, Ordering::Release);
    }

    /// Ask for render target recreation at the current size.
    pub fn request_resize(&self) {
        self.resized.store(true, Ordering::Release);
    }

    /// Clear the flag and return the size to recreate at, if it was raised.
    pub fn take_resize(&self) -> Option<(u32, u32)> {
        if self.resized.swap(false, Ordering::AcqRel) {
            Some(self.size())
        } else {
            None
        }
    }

    #[cfg(test)]
    pub fn is_resize_pending(&self) -> bool {
        self.resized.load(Ordering::Acquire)
    }

    pub fn size(&self) -> (u32, u32) {
        (
            self.width.load(Ordering::Relaxed),
            self.height.load(Ordering::Relaxed),
        )
    }

    pub fn is_minimized(&self) -> bool {
        let (width, height) = self.size();
        width == 0 || height == 0
    }
}

/// Height over width, the factor the vertex stage uses to keep the
/// triangle's proportions. Zero-width windows never reach rendering.
pub fn aspect_ratio(width: u32, height: u32) -> f32 {
    height as f32 / width as f32
}
