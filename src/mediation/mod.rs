use std::sync::mpsc::{Receiver, TryRecvError};

use circular_buffer::CircularBuffer;
use log::{debug, info};

use crate::{
    decoder::ProtocolMessage,
    injection::{KeyEventKind, KeySink},
    midi_interface::{DeviceError, ReaderEvent},
};

pub mod gestures;
pub mod mappings;
pub mod messages;

use self::{
    gestures::{GestureTracker, KeyTransition, RelativeBand},
    mappings::BindingTable,
    messages::{Classified, Classifier, ClassifierSettings, KeyKind, LogicalKeyCode},
};

pub use self::messages::ControllerValueMode;

pub const MONITOR_LOG_LENGTH: usize = 16;

pub struct MediationDataModel {
    pub midi_message_log: CircularBuffer<MONITOR_LOG_LENGTH, String>,
    pub key_event_log: CircularBuffer<MONITOR_LOG_LENGTH, String>,
    pub midi_rx: Receiver<ReaderEvent>,
    pub bindings: BindingTable,
    pub device_running: bool,
    /// Most recent code registered while learning, for the editor to select.
    pub last_learned: Option<LogicalKeyCode>,
    learning_mode: bool,
    classifier: Classifier,
    tracker: GestureTracker,
    sink: Box<dyn KeySink>,
}

impl MediationDataModel {
    pub fn new(
        midi_rx: Receiver<ReaderEvent>,
        sink: Box<dyn KeySink>,
        bindings: BindingTable,
        settings: ClassifierSettings,
    ) -> Self {
        MediationDataModel {
            midi_message_log: CircularBuffer::new(),
            key_event_log: CircularBuffer::new(),
            midi_rx,
            bindings,
            device_running: true,
            last_learned: None,
            learning_mode: false,
            classifier: Classifier::new(settings),
            tracker: GestureTracker::new(settings.controller_mode, RelativeBand::default()),
            sink,
        }
    }

    pub fn controller_mode(&self) -> ControllerValueMode {
        self.classifier.settings().controller_mode
    }

    pub fn learning_mode(&self) -> bool {
        self.learning_mode
    }

    pub fn set_learning_mode(&mut self, enabled: bool) {
        if enabled == self.learning_mode {
            return;
        }
        if enabled {
            self.release_all();
        }
        info!("Learning mode {}", if enabled { "on" } else { "off" });
        self.learning_mode = enabled;
    }

    /// Sends key-up for everything still held.
    pub fn release_all(&mut self) {
        for transition in self.tracker.release_all() {
            self.emit(transition.kind, &transition.code);
        }
    }

    /// Drains whatever the reader has queued. Never blocks.
    pub fn process_pending(&mut self) -> Result<usize, DeviceError> {
        let mut handled = 0;
        loop {
            match self.midi_rx.try_recv() {
                Ok(ReaderEvent::Message(msg)) => {
                    self.handle_incoming_midi(&msg);
                    handled += 1;
                }
                Ok(ReaderEvent::Lost(e)) => {
                    self.device_running = false;
                    return Err(e);
                }
                Err(TryRecvError::Empty) => return Ok(handled),
                Err(TryRecvError::Disconnected) => {
                    self.device_running = false;
                    return Err(DeviceError::ReaderGone);
                }
            }
        }
    }

    pub fn handle_incoming_midi(&mut self, msg: &ProtocolMessage) {
        self.midi_message_log.push_back(format!("{:?}", msg));

        let Some(classified) = self.classifier.classify(msg) else {
            debug!("unhandled midi message: {:?}", msg);
            return;
        };
        debug!("Key: {} ({:?})", classified.code, msg);

        if self.learning_mode {
            self.learn(&classified);
        } else {
            self.dispatch(&classified);
        }
    }

    fn learn(&mut self, classified: &Classified) {
        let code = classified.code;
        let candidates = match (code.kind, self.controller_mode()) {
            (KeyKind::Controller, ControllerValueMode::Relative) => vec![
                code.with_direction(messages::Direction::Up),
                code.with_direction(messages::Direction::Down),
            ],
            _ => vec![code],
        };
        for candidate in candidates {
            if self.bindings.register(candidate) {
                info!("Learned new gesture: {}", candidate);
            }
        }
        self.last_learned = Some(code);
    }

    /// A relative controller switches to per-message taps when either of
    /// its direction bindings is marked as a tap.
    fn controller_taps(&self, code: &LogicalKeyCode) -> bool {
        code.kind == KeyKind::Controller
            && self.controller_mode() == ControllerValueMode::Relative
            && [messages::Direction::Up, messages::Direction::Down]
                .iter()
                .any(|d| self.bindings.is_tap(&code.with_direction(*d)))
    }

    fn dispatch(&mut self, classified: &Classified) {
        let code = classified.code;
        let transitions: Vec<KeyTransition> = if self.controller_taps(&code) {
            self.tracker.track_relative_taps(classified)
        } else {
            self.tracker.track(classified)
        };
        let released = code.kind == KeyKind::NoteOff && !transitions.is_empty();
        for transition in transitions {
            self.emit(transition.kind, &transition.code);
        }
        // A tap-bound note-off fires once per tracked release.
        if released && self.bindings.is_tap(&code) {
            self.emit(KeyEventKind::Key, &code);
        }
    }

    fn emit(&mut self, kind: KeyEventKind, code: &LogicalKeyCode) {
        let Some(binding) = self.bindings.get(code) else {
            return;
        };
        let Some(composite) = binding.composite() else {
            return;
        };
        let kind = match (kind, binding.tap) {
            (KeyEventKind::KeyDown, true) => KeyEventKind::Key,
            (KeyEventKind::KeyUp, true) => return,
            (kind, _) => kind,
        };
        self.key_event_log
            .push_back(format!("{} {} ({})", kind.verb(), composite, code));
        self.sink.synthesize(kind, &composite);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        cell::RefCell,
        rc::Rc,
        sync::mpsc::{self, Sender},
    };

    use crate::decoder::ByteDecoder;
    use crate::mediation::{
        mappings::{Binding, ModifierMask},
        messages::{Direction, MIDDLE_TIER},
    };

    type Emitted = Rc<RefCell<Vec<(KeyEventKind, String)>>>;

    struct RecordingSink(Emitted);

    impl KeySink for RecordingSink {
        fn synthesize(&mut self, kind: KeyEventKind, composite: &str) {
            self.0.borrow_mut().push((kind, composite.to_owned()));
        }
    }

    fn model(
        mode: ControllerValueMode,
        bindings: BindingTable,
    ) -> (MediationDataModel, Sender<ReaderEvent>, Emitted) {
        let (tx, rx) = mpsc::channel();
        let emitted = Emitted::default();
        let model = MediationDataModel::new(
            rx,
            Box::new(RecordingSink(emitted.clone())),
            bindings,
            ClassifierSettings {
                controller_mode: mode,
                ..Default::default()
            },
        );
        (model, tx, emitted)
    }

    fn feed(model: &mut MediationDataModel, bytes: &[u8]) {
        let msg = ProtocolMessage::new(bytes[0], &bytes[1..]).unwrap();
        model.handle_incoming_midi(&msg);
    }

    fn plain(symbol: &str) -> Binding {
        Binding::new(ModifierMask::default(), symbol)
    }

    #[test]
    fn test_note_scenario() {
        let mut bindings = BindingTable::new();
        bindings.assign(LogicalKeyCode::note_on(0x40, Some(MIDDLE_TIER)), plain("a"));
        let (mut model, _tx, emitted) = model(ControllerValueMode::Relative, bindings);

        feed(&mut model, &[0x90, 0x40, 0x50]);
        assert_eq!(*emitted.borrow(), vec![(KeyEventKind::KeyDown, "a".to_owned())]);

        feed(&mut model, &[0x80, 0x40, 0x00]);
        assert_eq!(emitted.borrow()[1], (KeyEventKind::KeyUp, "a".to_owned()));
        assert_eq!(emitted.borrow().len(), 2);
        assert!(model.tracker.note_state(0x40).unwrap().active.is_none());
    }

    #[test]
    fn test_unbound_and_undefined_are_dropped() {
        let mut bindings = BindingTable::new();
        bindings.register(LogicalKeyCode::note_on(10, None));
        let (mut model, _tx, emitted) = model(ControllerValueMode::Relative, bindings);

        feed(&mut model, &[0x90, 10, 5]);
        feed(&mut model, &[0x90, 11, 5]);
        feed(&mut model, &[0xE0, 0, 64]);
        assert!(emitted.borrow().is_empty());
        assert_eq!(model.midi_message_log.len(), 3);
    }

    #[test]
    fn test_modifiers_are_prefixed() {
        let mut bindings = BindingTable::new();
        bindings.assign(
            LogicalKeyCode::controller(1).with_direction(Direction::Up),
            Binding::new(
                ModifierMask {
                    ctrl: true,
                    alt: true,
                    ..Default::default()
                },
                "Right",
            ),
        );
        let (mut model, _tx, emitted) = model(ControllerValueMode::Relative, bindings);

        feed(&mut model, &[0xB0, 1, 64]);
        feed(&mut model, &[0xB0, 1, 70]);
        feed(&mut model, &[0xB0, 1, 71]);
        feed(&mut model, &[0xB0, 1, 64]);
        assert_eq!(
            *emitted.borrow(),
            vec![
                (KeyEventKind::KeyDown, "ctrl+alt+Right".to_owned()),
                (KeyEventKind::KeyUp, "ctrl+alt+Right".to_owned()),
            ]
        );
    }

    #[test]
    fn test_absolute_release_skips_undefined() {
        let cc = LogicalKeyCode::controller(7);
        let mut bindings = BindingTable::new();
        bindings.register(cc.with_tier(1));
        bindings.assign(cc.with_tier(10), plain("9"));
        let (mut model, _tx, emitted) = model(ControllerValueMode::Absolute, bindings);

        feed(&mut model, &[0xB0, 7, 0]);
        feed(&mut model, &[0xB0, 7, 127]);
        feed(&mut model, &[0xB0, 7, 127]);
        feed(&mut model, &[0xB0, 7, 0]);
        assert_eq!(
            *emitted.borrow(),
            vec![
                (KeyEventKind::KeyDown, "9".to_owned()),
                (KeyEventKind::KeyUp, "9".to_owned()),
            ]
        );
    }

    #[test]
    fn test_note_off_binding_needs_tap_flag() {
        let mut bindings = BindingTable::new();
        bindings.assign(LogicalKeyCode::note_on(60, None), plain("a"));
        bindings.assign(LogicalKeyCode::note_off(60), plain("Escape"));
        let (mut model, _tx, emitted) = model(ControllerValueMode::Relative, bindings);

        feed(&mut model, &[0x90, 60, 10]);
        feed(&mut model, &[0x90, 60, 0]);
        assert_eq!(
            *emitted.borrow(),
            vec![
                (KeyEventKind::KeyDown, "a".to_owned()),
                (KeyEventKind::KeyUp, "a".to_owned()),
            ]
        );
    }

    #[test]
    fn test_tapped_note_off_fires_on_tracked_release() {
        let mut bindings = BindingTable::new();
        bindings.assign(LogicalKeyCode::note_on(60, None), plain("a"));
        bindings.assign(LogicalKeyCode::note_off(60), plain("Escape").tapped());
        let (mut model, _tx, emitted) = model(ControllerValueMode::Relative, bindings);

        feed(&mut model, &[0x90, 60, 10]);
        feed(&mut model, &[0x80, 60, 0]);
        assert_eq!(
            *emitted.borrow(),
            vec![
                (KeyEventKind::KeyDown, "a".to_owned()),
                (KeyEventKind::KeyUp, "a".to_owned()),
                (KeyEventKind::Key, "Escape".to_owned()),
            ]
        );
    }

    #[test]
    fn test_note_off_without_press_stays_silent() {
        let mut bindings = BindingTable::new();
        bindings.assign(LogicalKeyCode::note_off(60), plain("Escape").tapped());
        let (mut model, _tx, emitted) = model(ControllerValueMode::Relative, bindings);

        feed(&mut model, &[0x80, 60, 0]);
        assert!(emitted.borrow().is_empty());
    }

    #[test]
    fn test_tapped_note_on_sends_single_key() {
        let mut bindings = BindingTable::new();
        bindings.assign(LogicalKeyCode::note_on(60, None), plain("space").tapped());
        let (mut model, _tx, emitted) = model(ControllerValueMode::Relative, bindings);

        feed(&mut model, &[0x90, 60, 10]);
        feed(&mut model, &[0x80, 60, 0]);
        model.set_learning_mode(true);
        assert_eq!(*emitted.borrow(), vec![(KeyEventKind::Key, "space".to_owned())]);
    }

    #[test]
    fn test_tapped_controller_taps_every_message() {
        let cc = LogicalKeyCode::controller(9);
        let mut bindings = BindingTable::new();
        bindings.assign(cc.with_direction(Direction::Up), plain("Right").tapped());
        bindings.assign(cc.with_direction(Direction::Down), plain("Left"));
        let (mut model, _tx, emitted) = model(ControllerValueMode::Relative, bindings);

        feed(&mut model, &[0xB0, 9, 30]);
        feed(&mut model, &[0xB0, 9, 31]);
        feed(&mut model, &[0xB0, 9, 32]);
        feed(&mut model, &[0xB0, 9, 20]);
        assert_eq!(
            *emitted.borrow(),
            vec![
                (KeyEventKind::Key, "Right".to_owned()),
                (KeyEventKind::Key, "Right".to_owned()),
                (KeyEventKind::Key, "Left".to_owned()),
            ]
        );
    }

    #[test]
    fn test_raw_bytes_end_to_end() {
        let mut bindings = BindingTable::new();
        bindings.assign(LogicalKeyCode::note_on(0x40, Some(MIDDLE_TIER)), plain("a"));
        let (mut model, _tx, emitted) = model(ControllerValueMode::Relative, bindings);

        let mut decoder = ByteDecoder::new();
        for byte in [0x90, 0x40, 0x50] {
            if let Some(msg) = decoder.feed(byte) {
                model.handle_incoming_midi(&msg);
            }
        }
        assert_eq!(*emitted.borrow(), vec![(KeyEventKind::KeyDown, "a".to_owned())]);

        for byte in [0x80, 0x40, 0x00] {
            if let Some(msg) = decoder.feed(byte) {
                model.handle_incoming_midi(&msg);
            }
        }
        assert_eq!(emitted.borrow()[1], (KeyEventKind::KeyUp, "a".to_owned()));
        assert!(model.tracker.note_state(0x40).unwrap().active.is_none());
    }

    #[test]
    fn test_learning_registers_without_emitting() {
        let (mut model, _tx, emitted) = model(ControllerValueMode::Relative, BindingTable::new());
        model.set_learning_mode(true);

        feed(&mut model, &[0x90, 0x40, 0x50]);
        feed(&mut model, &[0x90, 0x40, 0x50]);
        feed(&mut model, &[0x80, 0x40, 0x00]);
        feed(&mut model, &[0xB0, 3, 10]);

        assert!(emitted.borrow().is_empty());
        assert_eq!(model.bindings.len(), 4);
        assert!(model
            .bindings
            .get(&LogicalKeyCode::controller(3).with_direction(Direction::Down))
            .is_some());
        assert_eq!(model.last_learned, Some(LogicalKeyCode::controller(3)));
        assert!(model.tracker.note_state(0x40).is_none());
    }

    #[test]
    fn test_learned_code_round_trip() {
        let (mut model, _tx, emitted) = model(ControllerValueMode::Absolute, BindingTable::new());
        model.set_learning_mode(true);
        feed(&mut model, &[0xB0, 20, 64]);
        let learned = model.last_learned.unwrap();
        model.bindings.assign(learned, plain("F6"));
        model.set_learning_mode(false);

        feed(&mut model, &[0xB0, 20, 64]);
        assert_eq!(*emitted.borrow(), vec![(KeyEventKind::KeyDown, "F6".to_owned())]);
    }

    #[test]
    fn test_entering_learning_releases_held_keys() {
        let mut bindings = BindingTable::new();
        bindings.assign(LogicalKeyCode::note_on(60, None), plain("a"));
        let (mut model, _tx, emitted) = model(ControllerValueMode::Relative, bindings);

        feed(&mut model, &[0x90, 60, 10]);
        model.set_learning_mode(true);
        model.set_learning_mode(false);
        feed(&mut model, &[0x80, 60, 0]);
        assert_eq!(
            *emitted.borrow(),
            vec![
                (KeyEventKind::KeyDown, "a".to_owned()),
                (KeyEventKind::KeyUp, "a".to_owned()),
            ]
        );
    }

    #[test]
    fn test_process_pending_in_order() {
        let mut bindings = BindingTable::new();
        bindings.assign(LogicalKeyCode::note_on(1, None), plain("x"));
        let (mut model, tx, emitted) = model(ControllerValueMode::Relative, bindings);

        assert_eq!(model.process_pending().unwrap(), 0);
        for bytes in [[0x90, 1, 10], [0x80, 1, 0]] {
            let msg = ProtocolMessage::new(bytes[0], &bytes[1..]).unwrap();
            tx.send(ReaderEvent::Message(msg)).unwrap();
        }
        assert_eq!(model.process_pending().unwrap(), 2);
        assert_eq!(emitted.borrow()[0].0, KeyEventKind::KeyDown);
        assert_eq!(emitted.borrow()[1].0, KeyEventKind::KeyUp);
    }

    #[test]
    fn test_device_loss_is_reported() {
        let (mut model, tx, _emitted) = model(ControllerValueMode::Relative, BindingTable::new());
        tx.send(ReaderEvent::Lost(DeviceError::Ended)).unwrap();
        assert!(matches!(model.process_pending(), Err(DeviceError::Ended)));
        assert!(!model.device_running);

        drop(tx);
        assert!(matches!(
            model.process_pending(),
            Err(DeviceError::ReaderGone)
        ));
    }
}
