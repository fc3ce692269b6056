use std::path::PathBuf;

use clap::Parser;

use crate::mediation::{messages::ClassifierSettings, ControllerValueMode};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[arg(long = "loglevel",default_value_t=String::from("info"))]
    pub log_level: String,

    /// Flag to enable headless (no GUI) mode
    #[arg(long = "headless")]
    pub headless_mode: bool,

    /// Absolute mode: map each controller position to one of ten keys,
    /// useful to assign many keys to one pot
    #[arg(long = "abs", env = "MIDI2KEYS_ABSOLUTE")]
    pub absolute_mode_enabled: bool,

    /// Start in learning mode (register new gestures instead of sending keys)
    #[arg(long = "learn")]
    pub learning_mode: bool,

    /// Log key events instead of injecting them
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Raw MIDI device node to read from, e.g. /dev/midi1
    #[arg(long = "device", conflicts_with = "midi_port")]
    pub device: Option<PathBuf>,

    /// Index of a MIDI input port to read from instead of a device node
    #[arg(long = "midi.port")]
    pub midi_port: Option<usize>,

    /// Note velocities above this trigger the "middle" tier
    #[arg(long = "velocity.middle", default_value_t = 64)]
    pub velocity_middle: u8,

    /// Velocities above middle + this band trigger the "strong" tier
    #[arg(long = "velocity.strong-band", default_value_t = 63)]
    pub velocity_strong_band: u8,

    /// Path to the bindings file
    #[arg(default_value = "configs.json")]
    pub config: PathBuf,
}

impl Cli {
    pub fn controller_mode(&self) -> ControllerValueMode {
        if self.absolute_mode_enabled {
            ControllerValueMode::Absolute
        } else {
            ControllerValueMode::Relative
        }
    }

    pub fn classifier_settings(&self) -> ClassifierSettings {
        ClassifierSettings {
            controller_mode: self.controller_mode(),
            note_middle: self.velocity_middle,
            note_strong_band: self.velocity_strong_band,
        }
    }
}
