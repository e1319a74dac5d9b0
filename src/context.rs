// EngineContext - per-run state threaded through the frame loop
//
// Owns the time base, the close and minimized flags and the frame counters.

use std::time::{Duration, Instant};

use crate::window::WindowEvent;

pub struct EngineContext {
    title: String,
    show_fps: bool,
    started: Instant,
    last_frame: Instant,
    last_fps_update: Instant,
    fps_frames: u32,
    frames: u64,
    close_requested: bool,
    minimized: bool,
}

impl EngineContext {
    pub fn new(title: impl Into<String>, show_fps: bool) -> Self {
        Self::starting_at(title, show_fps, Instant::now())
    }

    pub fn starting_at(title: impl Into<String>, show_fps: bool, now: Instant) -> Self {
        Self {
            title: title.into(),
            show_fps,
            started: now,
            last_frame: now,
            last_fps_update: now,
            fps_frames: 0,
            frames: 0,
            close_requested: false,
            minimized: false,
        }
    }

    pub fn handle_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::CloseRequested => self.request_close(),
            WindowEvent::Resized(extent) => {
                log::debug!("Window resized to {}x{}", extent.width, extent.height);

                // The surface keeps its creation size; a zero area means minimized
                let minimized = extent.width == 0 || extent.height == 0;
                if minimized != self.minimized {
                    if minimized {
                        log::info!("Window minimized, pausing rendering");
                    } else {
                        log::info!("Window restored, resuming rendering");
                    }
                }
                self.minimized = minimized;
            }
        }
    }

    /// Nothing is recorded or submitted while minimized
    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    /// Stop after the frame in progress
    pub fn request_close(&mut self) {
        if !self.close_requested {
            log::info!("Shutting down after frame {}", self.frames);
        }
        self.close_requested = true;
    }

    pub fn should_close(&self) -> bool {
        self.close_requested
    }

    /// Frames completed so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn elapsed(&self) -> Duration {
        self.last_frame.duration_since(self.started)
    }

    /// Account for a finished frame. Returns a new window title about once
    /// a second when the FPS display is enabled.
    pub fn end_frame(&mut self, now: Instant) -> Option<String> {
        let frame_time = now.saturating_duration_since(self.last_frame);
        self.last_frame = now;
        self.frames += 1;
        self.fps_frames += 1;

        log::trace!("Frame {} took {:.2}ms", self.frames, frame_time.as_secs_f32() * 1000.0);

        if !self.show_fps {
            return None;
        }

        let elapsed = now.saturating_duration_since(self.last_fps_update).as_secs_f32();
        if elapsed < 1.0 {
            return None;
        }

        let fps = self.fps_frames as f32 / elapsed;
        self.fps_frames = 0;
        self.last_fps_update = now;
        Some(format!(
            "{} - {:.0} FPS ({:.2}ms)",
            self.title,
            fps,
            frame_time.as_secs_f32() * 1000.0
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Extent;

    #[test]
    fn close_event_sets_flag_and_resize_does_not() {
        let mut ctx = EngineContext::new("test", false);
        ctx.handle_event(&WindowEvent::Resized(Extent {
            width: 10,
            height: 10,
        }));
        assert!(!ctx.should_close());

        ctx.handle_event(&WindowEvent::CloseRequested);
        assert!(ctx.should_close());
    }

    #[test]
    fn zero_sized_resize_minimizes_until_restored() {
        let mut ctx = EngineContext::new("test", false);
        assert!(!ctx.is_minimized());

        ctx.handle_event(&WindowEvent::Resized(Extent {
            width: 0,
            height: 0,
        }));
        assert!(ctx.is_minimized());
        assert!(!ctx.should_close());

        ctx.handle_event(&WindowEvent::Resized(Extent {
            width: 800,
            height: 0,
        }));
        assert!(ctx.is_minimized());

        ctx.handle_event(&WindowEvent::Resized(Extent {
            width: 800,
            height: 600,
        }));
        assert!(!ctx.is_minimized());
    }

    #[test]
    fn title_updates_about_once_per_second() {
        let start = Instant::now();
        let mut ctx = EngineContext::starting_at("Fractal", true, start);

        for i in 1..=9 {
            assert_eq!(ctx.end_frame(start + Duration::from_millis(100 * i)), None);
        }
        let title = ctx.end_frame(start + Duration::from_secs(1)).unwrap();
        assert_eq!(title, "Fractal - 10 FPS (100.00ms)");
        assert_eq!(ctx.frames(), 10);
        assert_eq!(ctx.elapsed(), Duration::from_secs(1));
    }

    #[test]
    fn no_title_without_fps_display() {
        let start = Instant::now();
        let mut ctx = EngineContext::starting_at("Fractal", false, start);
        assert_eq!(ctx.end_frame(start + Duration::from_secs(2)), None);
        assert_eq!(ctx.frames(), 1);
    }
}
