//! In-process stand-in for the live application.
//!
//! UI elements become clickable once the application's logical clock passes
//! their configured threshold, so frozen or accelerated time flow is
//! observable from scripts exactly as it would be in the real application.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::TargetConfig;
use crate::target::{InputEvent, TargetApp};

#[derive(Debug, Default)]
struct SimState {
    clock: Duration,
    elements: HashMap<String, Duration>,
    held_keys: BTreeSet<String>,
    events: Vec<InputEvent>,
}

/// Target application with configurable elements and a logical clock.
#[derive(Debug, Default)]
pub struct SimulatedTarget {
    modules: Vec<String>,
    state: Mutex<SimState>,
}

impl SimulatedTarget {
    /// Create an empty target providing the given host modules.
    #[must_use]
    pub fn new(modules: Vec<String>) -> Self {
        Self {
            modules,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Build a target from the `[target]` configuration section.
    #[must_use]
    pub fn from_config(config: &TargetConfig) -> Self {
        let target = Self::new(config.modules.clone());
        for element in &config.elements {
            // Unrepresentable thresholds never become clickable.
            let after = Duration::try_from_secs_f64(element.clickable_after_seconds)
                .unwrap_or(Duration::MAX);
            target.add_element(&element.name, after);
        }
        target
    }

    /// Register an element that becomes clickable after `after` of logical time.
    pub fn add_element(&self, name: &str, after: Duration) {
        self.state.lock().elements.insert(name.to_owned(), after);
    }

    /// Logical time the application has advanced through.
    #[must_use]
    pub fn clock(&self) -> Duration {
        self.state.lock().clock
    }

    /// Keys currently held down.
    #[must_use]
    pub fn held_keys(&self) -> Vec<String> {
        self.state.lock().held_keys.iter().cloned().collect()
    }

    /// Every input event received so far, in order.
    #[must_use]
    pub fn events(&self) -> Vec<InputEvent> {
        self.state.lock().events.clone()
    }
}

impl TargetApp for SimulatedTarget {
    fn send_input(&self, event: &InputEvent) -> std::result::Result<(), String> {
        let mut state = self.state.lock();
        match event {
            InputEvent::KeyDown { key } => {
                state.held_keys.insert(key.clone());
            }
            InputEvent::KeyUp { key } => {
                state.held_keys.remove(key);
            }
            InputEvent::Click { element } => {
                let clickable = state
                    .elements
                    .get(element)
                    .is_some_and(|after| state.clock >= *after);
                if !clickable {
                    return Err(format!("element '{element}' is not clickable"));
                }
            }
        }
        debug!(?event, "input delivered");
        state.events.push(event.clone());
        Ok(())
    }

    fn is_clickable(&self, element: &str) -> bool {
        let state = self.state.lock();
        state
            .elements
            .get(element)
            .is_some_and(|after| state.clock >= *after)
    }

    fn modules(&self) -> Vec<String> {
        self.modules.clone()
    }

    fn advance(&self, logical: Duration) {
        let mut state = self.state.lock();
        state.clock = state.clock.saturating_add(logical);
    }
}
