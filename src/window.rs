// =============================================================================
// WINDOW - one OS window plus its graphics context
// =============================================================================
//
// winit drives the OS side. Instead of handing control to `run_app`, the
// event loop is pumped from our own loop, so the program keeps the shape
//
//   while window.is_open() { clear; draw; display; poll_events }
//
// Window events are translated into our own `Event`s and queued; draining
// the queue is what moves the window from Open to Closed.

use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{Window, WindowAttributes, WindowButtons, WindowId},
};

use crate::backend::{ContextSettings, GraphicsContext};

/// Fixed window attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSettings {
    pub width: u32,
    pub height: u32,
    pub title: String,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            title: "Buffer_Free_Rendering".to_string(),
        }
    }
}

impl WindowSettings {
    /// Fixed-size window with only a close button
    fn attributes(&self) -> WindowAttributes {
        Window::default_attributes()
            .with_title(&self.title)
            .with_inner_size(PhysicalSize::new(self.width, self.height))
            .with_resizable(false)
            .with_enabled_buttons(WindowButtons::CLOSE)
    }
}

/// Input the program reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Closed,
}

impl Event {
    /// Translate a winit event; everything but closing is ignored
    pub fn from_window_event(event: &WindowEvent) -> Option<Self> {
        match event {
            WindowEvent::CloseRequested | WindowEvent::Destroyed => Some(Event::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Open,
    /// Terminal
    Closed,
}

/// Pending events plus the open/closed state they drive
#[derive(Debug)]
pub struct EventQueue {
    pending: VecDeque<Event>,
    state: WindowState,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            state: WindowState::Open,
        }
    }
}

impl EventQueue {
    pub fn push(&mut self, event: Event) {
        self.pending.push_back(event);
    }

    pub fn is_open(&self) -> bool {
        self.state == WindowState::Open
    }

    /// Lazily drain the pending events
    pub fn drain(&mut self) -> PollEvents<'_> {
        PollEvents { queue: self }
    }

    fn apply(&mut self, event: Event) {
        match event {
            Event::Closed => self.state = WindowState::Closed,
        }
    }
}

/// Events pending when the poll happened; yielding `Closed` closes the window
pub struct PollEvents<'a> {
    queue: &'a mut EventQueue,
}

impl Iterator for PollEvents<'_> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        let event = self.queue.pending.pop_front()?;
        self.queue.apply(event);
        Some(event)
    }
}

/// winit callbacks: creates the window on resume and queues events
struct WindowHandler {
    attributes: WindowAttributes,
    window: Option<Arc<Window>>,
    creation_error: Option<anyhow::Error>,
    events: EventQueue,
}

impl ApplicationHandler for WindowHandler {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        match event_loop.create_window(self.attributes.clone()) {
            Ok(window) => {
                log::info!("Window created: {:?}", window.inner_size());
                self.window = Some(Arc::new(window));
            }
            Err(e) => {
                self.creation_error = Some(anyhow::anyhow!("Failed to create window: {}", e));
            }
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        if let Some(event) = Event::from_window_event(&event) {
            log::debug!("Queued {:?}", event);
            self.events.push(event);
        }
    }
}

/// A window and the graphics context rendering into it
///
/// Field order matters for Drop: the context goes before the window it
/// presents to, and both before the event loop.
pub struct RenderWindow {
    context: GraphicsContext,
    handler: WindowHandler,
    event_loop: EventLoop<()>,
}

impl RenderWindow {
    /// Open a window and create a context satisfying `context_settings`
    ///
    /// Fails if the window can't be created or no GPU satisfies the request.
    pub fn open(
        settings: &WindowSettings,
        context_settings: &ContextSettings,
        validation: bool,
    ) -> Result<Self> {
        log::info!(
            "Opening window: {}x{} \"{}\"",
            settings.width,
            settings.height,
            settings.title
        );

        let mut event_loop = EventLoop::new().context("Failed to create event loop")?;
        event_loop.set_control_flow(ControlFlow::Poll);

        let mut handler = WindowHandler {
            attributes: settings.attributes(),
            window: None,
            creation_error: None,
            events: EventQueue::default(),
        };

        // The window can only be created from inside the loop, on resume
        let window = loop {
            if let PumpStatus::Exit(code) =
                event_loop.pump_app_events(Some(Duration::ZERO), &mut handler)
            {
                anyhow::bail!("Event loop exited with code {} before the window opened", code);
            }
            if let Some(e) = handler.creation_error.take() {
                return Err(e);
            }
            if let Some(window) = handler.window.clone() {
                break window;
            }
        };

        let context = GraphicsContext::new(window, context_settings, validation)?;

        Ok(Self {
            context,
            handler,
            event_loop,
        })
    }

    /// True until a close event has been processed
    pub fn is_open(&self) -> bool {
        self.handler.events.is_open()
    }

    /// Pump the OS event queue and drain what arrived
    ///
    /// Doesn't block. With nothing new, the sequence is empty and the state
    /// is unchanged.
    pub fn poll_events(&mut self) -> PollEvents<'_> {
        if let PumpStatus::Exit(code) = self
            .event_loop
            .pump_app_events(Some(Duration::ZERO), &mut self.handler)
        {
            log::debug!("Event loop exited with code {}", code);
            self.handler.events.push(Event::Closed);
        }
        self.handler.events.drain()
    }

    /// Clear color, depth and stencil of the back buffer
    pub fn clear(&mut self, color: [f32; 4]) -> Result<()> {
        self.context.clear(color)
    }

    /// Draw a triangle strip of `vertex_count` vertices with the current program
    pub fn draw(&mut self, vertex_count: u32) -> Result<()> {
        self.context.draw(vertex_count)
    }

    /// Present the back buffer
    pub fn display(&mut self) -> Result<()> {
        self.context.display()
    }

    pub fn context_mut(&mut self) -> &mut GraphicsContext {
        &mut self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_window_matches_the_demo() {
        let settings = WindowSettings::default();
        assert_eq!((settings.width, settings.height), (800, 600));
        assert_eq!(settings.title, "Buffer_Free_Rendering");

        let context = ContextSettings::default();
        assert_eq!(context.depth_bits, 24);
        assert_eq!(context.stencil_bits, 8);
        assert_eq!(context.antialiasing_level, 2);
    }

    #[test]
    fn only_close_requests_become_events() {
        assert_eq!(
            Event::from_window_event(&WindowEvent::CloseRequested),
            Some(Event::Closed)
        );
        assert_eq!(Event::from_window_event(&WindowEvent::Focused(true)), None);
        assert_eq!(
            Event::from_window_event(&WindowEvent::Resized(PhysicalSize::new(10, 10))),
            None
        );
    }

    #[test]
    fn polling_nothing_changes_nothing() {
        let mut queue = EventQueue::default();
        for _ in 0..3 {
            assert_eq!(queue.drain().count(), 0);
            assert!(queue.is_open());
        }
    }

    #[test]
    fn close_event_closes_within_one_poll() {
        let mut queue = EventQueue::default();
        queue.push(Event::Closed);
        assert!(queue.is_open());

        let events: Vec<_> = queue.drain().collect();
        assert_eq!(events, vec![Event::Closed]);
        assert!(!queue.is_open());
    }

    #[test]
    fn closed_is_terminal() {
        let mut queue = EventQueue::default();
        queue.push(Event::Closed);
        queue.drain().for_each(drop);

        assert_eq!(queue.drain().count(), 0);
        assert_eq!(queue.state, WindowState::Closed);

        queue.push(Event::Closed);
        queue.drain().for_each(drop);
        assert_eq!(queue.state, WindowState::Closed);
    }

    #[test]
    fn draining_is_lazy() {
        let mut queue = EventQueue::default();
        queue.push(Event::Closed);

        // Not pulled yet, so not processed yet
        let events = queue.drain();
        drop(events);
        assert!(queue.is_open());

        assert_eq!(queue.drain().next(), Some(Event::Closed));
        assert!(!queue.is_open());
    }
}
