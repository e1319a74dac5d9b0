// Window - OS window and message pump
//
// The frame loop drives the event loop itself: every iteration pumps
// pending OS messages without blocking and receives them as plain
// `WindowEvent`s. Close button and ESC both request shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent as WinitEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::window::{Window, WindowAttributes, WindowId};

use crate::backend::Extent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEvent {
    /// User asked to quit; delivered once
    CloseRequested,
    Resized(Extent),
}

/// Source of window events for the frame loop
pub trait EventSource {
    /// Drain everything that arrived since the last call, without blocking
    fn poll_events(&mut self) -> Vec<WindowEvent>;

    fn set_title(&mut self, _title: &str) {}
}

// =============================================================================
// SCRIPTED SOURCE
// =============================================================================

/// Event source for headless runs: delivers events on given polls (1-based)
#[derive(Debug, Default)]
pub struct ScriptedEvents {
    script: Vec<(u64, WindowEvent)>,
    polls: u64,
}

impl ScriptedEvents {
    /// Never sends a close event
    pub fn endless() -> Self {
        Self::default()
    }

    /// Sends `CloseRequested` from the `poll`-th call
    pub fn close_on(poll: u64) -> Self {
        Self::endless().with_event(poll, WindowEvent::CloseRequested)
    }

    pub fn with_event(mut self, poll: u64, event: WindowEvent) -> Self {
        self.script.push((poll, event));
        self
    }

    #[cfg(test)]
    pub fn polls(&self) -> u64 {
        self.polls
    }
}

impl EventSource for ScriptedEvents {
    fn poll_events(&mut self) -> Vec<WindowEvent> {
        self.polls += 1;
        self.script
            .iter()
            .filter(|(poll, _)| *poll == self.polls)
            .map(|(_, event)| *event)
            .collect()
    }

    // No window to show it in
    fn set_title(&mut self, title: &str) {
        log::info!("{}", title);
    }
}

// =============================================================================
// WINIT WINDOW
// =============================================================================

struct Pump {
    attributes: Option<WindowAttributes>,
    window: Option<Arc<Window>>,
    create_error: Option<winit::error::OsError>,
    events: Vec<WindowEvent>,
}

impl ApplicationHandler for Pump {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        let Some(attributes) = self.attributes.take() else {
            return;
        };

        match event_loop.create_window(attributes) {
            Ok(window) => self.window = Some(Arc::new(window)),
            Err(e) => self.create_error = Some(e),
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WinitEvent) {
        match event {
            WinitEvent::CloseRequested => {
                log::info!("Close requested");
                self.events.push(WindowEvent::CloseRequested);
            }
            WinitEvent::Resized(size) => {
                self.events.push(WindowEvent::Resized(Extent {
                    width: size.width,
                    height: size.height,
                }));
            }
            WinitEvent::KeyboardInput { event, .. } => {
                if event.state.is_pressed() && event.physical_key == PhysicalKey::Code(KeyCode::Escape) {
                    log::info!("ESC pressed, exiting...");
                    self.events.push(WindowEvent::CloseRequested);
                }
            }
            _ => {}
        }
    }
}

/// Fixed-size OS window whose messages are pumped by the frame loop
pub struct WinitWindow {
    event_loop: EventLoop<()>,
    pump: Pump,
    window: Arc<Window>,
    closed: bool,
}

impl WinitWindow {
    pub fn create(title: &str, extent: Extent) -> Result<Self> {
        let mut event_loop = EventLoop::new().context("Failed to create event loop")?;
        let mut pump = Pump {
            attributes: Some(
                WindowAttributes::default()
                    .with_title(title)
                    .with_inner_size(winit::dpi::PhysicalSize::new(extent.width, extent.height))
                    .with_resizable(false),
            ),
            window: None,
            create_error: None,
            events: Vec::new(),
        };

        // The window can only be created from inside the event loop
        for _ in 0..100 {
            if let PumpStatus::Exit(code) =
                event_loop.pump_app_events(Some(Duration::from_millis(10)), &mut pump)
            {
                anyhow::bail!("Event loop exited with code {} before the window opened", code);
            }
            if let Some(e) = pump.create_error.take() {
                return Err(anyhow::Error::new(e).context("Failed to create window"));
            }
            if pump.window.is_some() {
                break;
            }
        }

        let window = pump
            .window
            .clone()
            .context("Window was not created by the event loop")?;
        log::info!("Window: {}x{}", extent.width, extent.height);

        Ok(Self {
            event_loop,
            pump,
            window,
            closed: false,
        })
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }
}

impl EventSource for WinitWindow {
    fn poll_events(&mut self) -> Vec<WindowEvent> {
        let status = self
            .event_loop
            .pump_app_events(Some(Duration::ZERO), &mut self.pump);

        let mut events = std::mem::take(&mut self.pump.events);
        if matches!(status, PumpStatus::Exit(_)) {
            events.push(WindowEvent::CloseRequested);
        }

        // Only the first close reaches the loop
        events.retain(|event| match event {
            WindowEvent::CloseRequested if self.closed => false,
            WindowEvent::CloseRequested => {
                self.closed = true;
                true
            }
            _ => true,
        });
        events
    }

    fn set_title(&mut self, title: &str) {
        self.window.set_title(title);
    }
}
