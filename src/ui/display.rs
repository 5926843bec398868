//! Status panel composition.
//!
//! The coordinator composes a [`Screen`] every tick and hands it to the
//! [`StatusPanel`] seam. The pixel protocol for the fitted monochrome
//! display is external; [`TextPanel`] renders the same screen as text for
//! tests, `--loopback` runs, and diagnostics.

use std::sync::{Arc, Mutex};

use crate::coordinator::SystemState;
use crate::parameter::Parameter;
use crate::runlog::RunId;

/// Everything the panel shows at once.
#[derive(Debug, Clone, PartialEq)]
pub struct Screen {
    pub state: SystemState,
    pub selected: Parameter,
    pub value: f64,
    pub run_id: Option<RunId>,
    /// Human-readable reason line, shown in the Error and Finished states.
    pub notice: Option<String>,
}

impl Screen {
    /// Compact three-line rendering used by [`TextPanel`].
    pub fn render_text(&self) -> String {
        let mut out = format!("[{}]\n", self.state);
        match self.run_id {
            Some(run_id) => out.push_str(&format!("run {}\n", run_id)),
            None => out.push_str(&format!(
                "{} = {:.2} {}\n",
                self.selected.label(),
                self.value,
                self.selected.unit()
            )),
        }
        if let Some(notice) = &self.notice {
            out.push_str(notice);
            out.push('\n');
        }
        out
    }
}

/// Render seam for the physical display driver.
pub trait StatusPanel: Send {
    fn render(&mut self, screen: &Screen) -> std::io::Result<()>;
}

/// Text renderer retaining the last frame; the production pixel driver
/// replaces this behind the same trait.
pub struct TextPanel {
    frame: Arc<Mutex<Option<String>>>,
}

impl Default for TextPanel {
    fn default() -> Self {
        Self::new()
    }
}

impl TextPanel {
    pub fn new() -> Self {
        Self {
            frame: Arc::new(Mutex::new(None)),
        }
    }

    /// Shared cell holding the last rendered frame.
    pub fn frame_cell(&self) -> Arc<Mutex<Option<String>>> {
        self.frame.clone()
    }
}

impl StatusPanel for TextPanel {
    fn render(&mut self, screen: &Screen) -> std::io::Result<()> {
        let text = screen.render_text();
        let mut frame = self.frame.lock().expect("panel frame poisoned");
        if frame.as_deref() != Some(text.as_str()) {
            tracing::debug!(frame = %text.replace('\n', " / "), "panel updated");
            *frame = Some(text);
        }
        Ok(())
    }
}
