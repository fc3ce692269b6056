use std::fmt;

use serde::{Deserialize, Serialize};

use crate::decoder::ProtocolMessage;

/// Velocity tier of a note pressed harder than the middle threshold.
pub const MIDDLE_TIER: u8 = 0x2;
/// Velocity tier of a note pressed harder than the strong threshold.
pub const STRONG_TIER: u8 = 0x3;
/// Number of discrete positions a controller maps to in absolute mode.
pub const ABSOLUTE_BUCKETS: u8 = 10;

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum ControllerValueMode {
    Absolute,
    Relative,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyKind {
    NoteOff,
    NoteOn,
    Controller,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    Down,
    Up,
}

/// One bindable gesture: a note (optionally at a velocity tier), or a
/// controller turned in one direction / parked in one position bucket.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogicalKeyCode {
    pub kind: KeyKind,
    pub index: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
}

impl LogicalKeyCode {
    pub fn note_on(index: u8, tier: Option<u8>) -> Self {
        LogicalKeyCode {
            kind: KeyKind::NoteOn,
            index,
            tier,
            direction: None,
        }
    }

    pub fn note_off(index: u8) -> Self {
        LogicalKeyCode {
            kind: KeyKind::NoteOff,
            index,
            tier: None,
            direction: None,
        }
    }

    pub fn controller(index: u8) -> Self {
        LogicalKeyCode {
            kind: KeyKind::Controller,
            index,
            tier: None,
            direction: None,
        }
    }

    pub fn with_tier(self, tier: u8) -> Self {
        LogicalKeyCode {
            tier: Some(tier & 0x0F),
            ..self
        }
    }

    pub fn with_direction(self, direction: Direction) -> Self {
        LogicalKeyCode {
            direction: Some(direction),
            ..self
        }
    }
}

impl fmt::Display for LogicalKeyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            KeyKind::NoteOff => write!(f, "Note-off {}", self.index),
            KeyKind::NoteOn => match self.tier {
                Some(MIDDLE_TIER) => write!(f, "Note-on(middle) {}", self.index),
                Some(STRONG_TIER) => write!(f, "Note-on(strong) {}", self.index),
                Some(t) => write!(f, "Note-on({}) {}", t, self.index),
                None => write!(f, "Note-on {}", self.index),
            },
            KeyKind::Controller => {
                write!(f, "CC {}", self.index)?;
                match self.direction {
                    Some(Direction::Up) => write!(f, "+")?,
                    Some(Direction::Down) => write!(f, "-")?,
                    None => {}
                }
                if let Some(t) = self.tier {
                    write!(f, " {}/{}", t, ABSOLUTE_BUCKETS)?;
                }
                Ok(())
            }
        }
    }
}

/// Tuning constants of the classifier. The defaults are empirical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifierSettings {
    pub controller_mode: ControllerValueMode,
    /// Velocities above this are at least the middle tier.
    pub note_middle: u8,
    /// Width of the band above `note_middle` that still counts as middle.
    pub note_strong_band: u8,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        ClassifierSettings {
            controller_mode: ControllerValueMode::Relative,
            note_middle: 64,
            note_strong_band: 63,
        }
    }
}

impl ClassifierSettings {
    fn strong_threshold(&self) -> u16 {
        self.note_middle as u16 + self.note_strong_band as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classified {
    pub code: LogicalKeyCode,
    pub message: ProtocolMessage,
}

/// Maps a 7-bit controller position onto buckets `1..=ABSOLUTE_BUCKETS`.
pub fn absolute_bucket(value: u8) -> u8 {
    let steps = (ABSOLUTE_BUCKETS - 1) as u16;
    // round(value * steps / 127), with no ties possible in 0..=127
    let scaled = (value.min(127) as u16 * steps * 2 + 127) / 254;
    scaled as u8 + 1
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Classifier {
    settings: ClassifierSettings,
}

impl Classifier {
    pub fn new(settings: ClassifierSettings) -> Self {
        Classifier { settings }
    }

    pub fn settings(&self) -> &ClassifierSettings {
        &self.settings
    }

    pub fn classify(&self, msg: &ProtocolMessage) -> Option<Classified> {
        let code = match msg.command() {
            0x8 => LogicalKeyCode::note_off(msg.data1()),
            0x9 => {
                let velocity = msg.data2();
                if velocity == 0 {
                    LogicalKeyCode::note_off(msg.data1())
                } else {
                    LogicalKeyCode::note_on(msg.data1(), self.velocity_tier(velocity))
                }
            }
            0xB => {
                let code = LogicalKeyCode::controller(msg.data1());
                match self.settings.controller_mode {
                    ControllerValueMode::Absolute => code.with_tier(absolute_bucket(msg.data2())),
                    ControllerValueMode::Relative => code,
                }
            }
            _ => return None,
        };
        Some(Classified {
            code,
            message: *msg,
        })
    }

    fn velocity_tier(&self, velocity: u8) -> Option<u8> {
        if velocity as u16 > self.settings.strong_threshold() {
            Some(STRONG_TIER)
        } else if velocity > self.settings.note_middle {
            Some(MIDDLE_TIER)
        } else {
            None
        }
    }
}
