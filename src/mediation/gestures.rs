use std::collections::HashMap;

use log::debug;

use super::messages::{Classified, ControllerValueMode, Direction, KeyKind, LogicalKeyCode};
use crate::injection::KeyEventKind;

/// Neutral band of an endless encoder: values in `low..=high` carry no direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelativeBand {
    pub low: u8,
    pub high: u8,
}

impl Default for RelativeBand {
    fn default() -> Self {
        RelativeBand { low: 63, high: 65 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Toggle {
    #[default]
    Neutral,
    Increasing,
    Decreasing,
}

impl RelativeBand {
    pub fn toggle_for(&self, value: u8) -> Toggle {
        if value == 0 || value < self.low {
            Toggle::Decreasing
        } else if value > self.high {
            Toggle::Increasing
        } else {
            Toggle::Neutral
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GestureState {
    pub last_value: Option<u8>,
    pub active: Option<LogicalKeyCode>,
    pub toggle: Toggle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Family {
    Note,
    Controller,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyTransition {
    pub kind: KeyEventKind,
    pub code: LogicalKeyCode,
}

impl KeyTransition {
    fn down(code: LogicalKeyCode) -> Self {
        KeyTransition {
            kind: KeyEventKind::KeyDown,
            code,
        }
    }

    fn up(code: LogicalKeyCode) -> Self {
        KeyTransition {
            kind: KeyEventKind::KeyUp,
            code,
        }
    }
}

/// Per-note and per-controller memory that turns a message stream into
/// balanced key-down / key-up pairs.
#[derive(Debug)]
pub struct GestureTracker {
    controller_mode: ControllerValueMode,
    band: RelativeBand,
    states: HashMap<(Family, u8), GestureState>,
}

impl GestureTracker {
    pub fn new(controller_mode: ControllerValueMode, band: RelativeBand) -> Self {
        GestureTracker {
            controller_mode,
            band,
            states: HashMap::new(),
        }
    }

    pub fn note_state(&self, index: u8) -> Option<&GestureState> {
        self.states.get(&(Family::Note, index))
    }

    pub fn controller_state(&self, index: u8) -> Option<&GestureState> {
        self.states.get(&(Family::Controller, index))
    }

    pub fn track(&mut self, classified: &Classified) -> Vec<KeyTransition> {
        let code = classified.code;
        match code.kind {
            KeyKind::NoteOn => self.note_on(code),
            KeyKind::NoteOff => self.note_off(code.index),
            KeyKind::Controller => {
                let value = classified.message.data2();
                match self.controller_mode {
                    ControllerValueMode::Relative => self.relative_controller(code, value),
                    ControllerValueMode::Absolute => self.absolute_controller(code, value),
                }
            }
        }
    }

    /// Relative controller whose bindings are taps: one `key` per message,
    /// the direction taken from the previous value rather than the neutral band.
    pub fn track_relative_taps(&mut self, classified: &Classified) -> Vec<KeyTransition> {
        let code = classified.code;
        let value = classified.message.data2();
        let state = self.states.entry((Family::Controller, code.index)).or_default();
        let previous = state.last_value.replace(value);

        let mut out = Vec::with_capacity(2);
        if let Some(held) = state.active.take() {
            state.toggle = Toggle::Neutral;
            out.push(KeyTransition::up(held));
        }
        let Some(previous) = previous else {
            return out;
        };
        let direction = if value == 0 || value < previous {
            Direction::Down
        } else {
            Direction::Up
        };
        out.push(KeyTransition {
            kind: KeyEventKind::Key,
            code: code.with_direction(direction),
        });
        out
    }

    /// Releases every held code, e.g. before handing the device over to learning.
    pub fn release_all(&mut self) -> Vec<KeyTransition> {
        let mut released: Vec<KeyTransition> = self
            .states
            .values_mut()
            .filter_map(|state| {
                state.toggle = Toggle::Neutral;
                state.active.take().map(KeyTransition::up)
            })
            .collect();
        released.sort_by_key(|t| t.code);
        released
    }

    fn note_on(&mut self, code: LogicalKeyCode) -> Vec<KeyTransition> {
        let state = self.states.entry((Family::Note, code.index)).or_default();
        let mut out = Vec::with_capacity(2);
        match state.active {
            Some(held) if held == code => return out,
            Some(held) => out.push(KeyTransition::up(held)),
            None => {}
        }
        state.active = Some(code);
        out.push(KeyTransition::down(code));
        out
    }

    fn note_off(&mut self, index: u8) -> Vec<KeyTransition> {
        match self
            .states
            .get_mut(&(Family::Note, index))
            .and_then(|state| state.active.take())
        {
            Some(held) => vec![KeyTransition::up(held)],
            None => {
                debug!("Note-off {} without a tracked press", index);
                Vec::new()
            }
        }
    }

    fn relative_controller(&mut self, code: LogicalKeyCode, value: u8) -> Vec<KeyTransition> {
        let toggle = self.band.toggle_for(value);
        let state = self.states.entry((Family::Controller, code.index)).or_default();
        let first = state.last_value.is_none();
        state.last_value = Some(value);
        if first {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(2);
        let direction = match toggle {
            Toggle::Decreasing => Direction::Down,
            Toggle::Increasing => Direction::Up,
            Toggle::Neutral => {
                if let Some(held) = state.active.take() {
                    out.push(KeyTransition::up(held));
                }
                state.toggle = Toggle::Neutral;
                return out;
            }
        };

        if state.toggle == toggle && state.active.is_some() {
            return out;
        }
        if let Some(held) = state.active.take() {
            out.push(KeyTransition::up(held));
        }
        let pressed = code.with_direction(direction);
        state.active = Some(pressed);
        state.toggle = toggle;
        out.push(KeyTransition::down(pressed));
        out
    }

    fn absolute_controller(&mut self, code: LogicalKeyCode, value: u8) -> Vec<KeyTransition> {
        let state = self.states.entry((Family::Controller, code.index)).or_default();
        state.last_value = Some(value);
        let mut out = Vec::with_capacity(2);
        match state.active {
            Some(held) if held == code => return out,
            Some(held) => out.push(KeyTransition::up(held)),
            None => {}
        }
        state.active = Some(code);
        out.push(KeyTransition::down(code));
        out
    }
}
