use egui::{Color32, Key, Modifiers, RichText};
use log::warn;

use crate::mediation::{
    mappings::{Binding, BindingTable, ModifierMask},
    messages::{Direction, KeyKind, LogicalKeyCode},
    ControllerValueMode, MediationDataModel, MONITOR_LOG_LENGTH,
};

#[derive(Default)]
pub struct EditorState {
    pub selected: Option<LogicalKeyCode>,
    pub save_requested: bool,
    pub device_error: Option<String>,
    /// Mirrors `MidiReader::is_running` for the status line.
    pub reader_running: bool,
    /// Adds Super to every captured binding. egui only reports the
    /// Super/Windows key as `mac_cmd` on macOS, so elsewhere it has to be
    /// latched by hand.
    pub super_latch: bool,
}

impl From<Modifiers> for ModifierMask {
    fn from(m: Modifiers) -> Self {
        ModifierMask {
            ctrl: m.ctrl,
            alt: m.alt,
            shift: m.shift,
            super_key: m.mac_cmd,
        }
    }
}

/// X keysym name for an egui key.
fn keysym(key: Key) -> String {
    match key {
        Key::ArrowDown => "Down".into(),
        Key::ArrowUp => "Up".into(),
        Key::ArrowLeft => "Left".into(),
        Key::ArrowRight => "Right".into(),
        Key::Enter => "Return".into(),
        Key::Space => "space".into(),
        Key::PageUp => "Page_Up".into(),
        Key::PageDown => "Page_Down".into(),
        other => {
            let name = other.name();
            if name.chars().count() == 1 {
                name.to_lowercase()
            } else {
                name.to_owned()
            }
        }
    }
}

/// Applies one key pressed while a row is selected. Backspace clears the
/// row. Note-off rows only accept a key once they are switched to tap.
/// Returns `false` when the key was refused.
pub fn apply_captured_key(
    bindings: &mut BindingTable,
    code: LogicalKeyCode,
    key: Key,
    modifiers: Modifiers,
    super_latch: bool,
) -> bool {
    if key == Key::Backspace {
        bindings.clear(&code);
        return true;
    }
    let tap = bindings.is_tap(&code);
    if code.kind == KeyKind::NoteOff && !tap {
        return false;
    }
    let mut mask = ModifierMask::from(modifiers);
    mask.super_key |= super_latch;
    let binding = Binding::new(mask, &keysym(key));
    bindings.assign(code, if tap { binding.tapped() } else { binding });
    true
}

/// Follows learned gestures and turns key presses into bindings for the selected row.
pub fn capture_binding_keys(
    model: &mut MediationDataModel,
    editor: &mut EditorState,
    ctx: &egui::Context,
) {
    if let Some(code) = model.last_learned.take() {
        editor.selected = Some(match (code.kind, model.controller_mode()) {
            (KeyKind::Controller, ControllerValueMode::Relative) => {
                code.with_direction(Direction::Down)
            }
            _ => code,
        });
    }

    if !model.learning_mode() {
        return;
    }
    let Some(selected) = editor.selected else {
        return;
    };

    let pressed: Vec<(Key, Modifiers)> = ctx.input(|i| {
        i.events
            .iter()
            .filter_map(|event| match event {
                egui::Event::Key {
                    key,
                    pressed: true,
                    modifiers,
                    ..
                } => Some((*key, *modifiers)),
                _ => None,
            })
            .collect()
    });
    for (key, modifiers) in pressed {
        if !apply_captured_key(&mut model.bindings, selected, key, modifiers, editor.super_latch) {
            warn!("{} only fires as a tap; tick its Tap box first", selected);
        }
    }
}

pub fn render_gui(model: &mut MediationDataModel, editor: &mut EditorState, ui: &mut egui::Ui) {
    ui.heading("MIDI Device");
    if model.device_running && editor.reader_running {
        ui.label(RichText::new("Running").color(Color32::GREEN));
    } else {
        ui.label(RichText::new("Device no longer running").color(Color32::RED));
        if let Some(e) = &editor.device_error {
            ui.label(e);
        }
    }
    ui.label(format!("Controller mode: {:?}", model.controller_mode()));
    ui.separator();

    ui.horizontal(|ui| {
        let mut learning = model.learning_mode();
        if ui.checkbox(&mut learning, "Learning mode").changed() {
            model.set_learning_mode(learning);
        }
        ui.checkbox(&mut editor.super_latch, "Super");
        if ui.button("Save configs").clicked() {
            editor.save_requested = true;
        }
    });
    if model.learning_mode() {
        ui.label("Move a control, select its row, then press the key to bind (Backspace clears)");
    }

    ui.heading(format!("Bindings ({})", model.bindings.len()));
    let mut tap_toggles = Vec::new();
    egui::ScrollArea::vertical()
        .id_source("bindings")
        .max_height(320.0)
        .show(ui, |ui| {
            egui::Grid::new("bindings_grid")
                .striped(true)
                .num_columns(4)
                .show(ui, |ui| {
                    for (code, binding) in model.bindings.iter() {
                        let is_selected = editor.selected == Some(*code);
                        if ui.selectable_label(is_selected, code.to_string()).clicked() {
                            editor.selected = Some(*code);
                        }
                        let prefix = binding.modifiers.prefix();
                        ui.label(if prefix.is_empty() { "-".to_owned() } else { prefix });
                        ui.label(binding.symbol.as_deref().unwrap_or("<<Undefined>>"));
                        let mut tap = binding.tap;
                        if ui.checkbox(&mut tap, "Tap").changed() {
                            tap_toggles.push((*code, tap));
                        }
                        ui.end_row();
                    }
                });
        });
    for (code, tap) in tap_toggles {
        model.bindings.set_tap(code, tap);
    }
    ui.separator();

    ui.columns(2, |columns| {
        columns[0].heading(format!("Last {} MIDI messages", MONITOR_LOG_LENGTH));
        if model.midi_message_log.is_empty() {
            columns[0].label("Nothing received yet");
        }
        for item in model.midi_message_log.iter().rev() {
            columns[0].label(item);
        }

        columns[1].heading(format!("Last {} key events", MONITOR_LOG_LENGTH));
        for item in model.key_event_log.iter().rev() {
            columns[1].label(item);
        }
    });
}
