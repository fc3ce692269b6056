use std::{
    io,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context};
use clap::Parser;
use eframe::egui;
use env_logger::Env;
use gui::{capture_binding_keys, render_gui, EditorState};
use injection::{DryRunSink, KeySink, XdotoolSink};
use log::{debug, error, info, warn};
use mediation::{
    mappings::{load_bindings_or_empty, save_bindings},
    MediationDataModel,
};
use midi_interface::{
    list_midi_ports, DeviceError, DeviceFile, MidiPort, MidiReader, NoInterrupt, ReaderEvent,
    StreamSource,
};
use settings::Cli;

mod decoder;
mod gui;
mod injection;
mod mediation;
mod midi_interface;
mod settings;

const READER_STOP_TIMEOUT: Duration = Duration::from_secs(1);

fn start_reader(cli: &Cli, tx: mpsc::Sender<ReaderEvent>) -> anyhow::Result<MidiReader> {
    if let Some(path) = &cli.device {
        let (source, interrupt) = DeviceFile::open(path)?;
        Ok(MidiReader::start(source, Box::new(interrupt), tx))
    } else if let Some(port) = cli.midi_port {
        let (source, interrupt) = MidiPort::open(port)?;
        Ok(MidiReader::start(source, Box::new(interrupt), tx))
    } else {
        warn!("No --device or --midi.port given; reading MIDI bytes from stdin");
        Ok(MidiReader::start(
            StreamSource::new(io::stdin()),
            Box::new(NoInterrupt),
            tx,
        ))
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(Env::default().default_filter_or(&cli.log_level))
        .filter_module("egui_glow", log::LevelFilter::Warn)
        .filter_module("egui_winit", log::LevelFilter::Warn)
        .filter_module("eframe", log::LevelFilter::Warn)
        .init();

    if cli.device.is_none() {
        if let Err(e) = list_midi_ports() {
            warn!("Could not list MIDI ports: {}", e);
        }
    }

    let (bindings, broken_config) = load_bindings_or_empty(&cli.config);
    let start_learning = cli.learning_mode || broken_config || bindings.is_empty();

    let sink: Box<dyn KeySink> = if cli.dry_run {
        Box::new(DryRunSink)
    } else {
        Box::new(XdotoolSink::new())
    };

    let (midi_tx, midi_rx) = mpsc::channel();
    let reader = start_reader(&cli, midi_tx)?;

    let mut model = MediationDataModel::new(midi_rx, sink, bindings, cli.classifier_settings());
    model.set_learning_mode(start_learning);
    info!(
        "Controller mode {:?}, {} bindings loaded",
        model.controller_mode(),
        model.bindings.len()
    );

    if cli.headless_mode {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);
        ctrlc::set_handler(move || stop_clone.store(true, Ordering::Relaxed))
            .context("failed to install Ctrl-C handler")?;

        info!("Running in headless mode; Ctrl+C to quit");
        let result = loop {
            if stop.load(Ordering::Relaxed) {
                info!("Interrupted; releasing held keys");
                break Ok(());
            }
            if let Err(e) = model.process_pending() {
                break Err(e);
            }
            if !reader.is_running() {
                // Pick up whatever the reader sent before it ended.
                let drained = model.process_pending();
                break Err(drained.err().unwrap_or(DeviceError::ReaderGone));
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        model.release_all();
        reader.stop(READER_STOP_TIMEOUT);
        if model.learning_mode() {
            save_bindings(&cli.config, &model.bindings)?;
        }
        result.map_err(|e| anyhow!("MIDI device no longer running: {}", e))
    } else {
        info!("Running graphics mode; close the window to quit");
        let app = Midi2KeysApp {
            model,
            editor: EditorState::default(),
            reader: Some(reader),
            config_path: cli.config.clone(),
        };
        let options = eframe::NativeOptions::default();
        eframe::run_native(
            "midi2keys",
            options,
            Box::new(|_cc| Box::<Midi2KeysApp>::new(app)),
        )
        .map_err(|e| anyhow!("Failed to launch GUI: {}", e))?;
        info!("GUI ended; exit now...");
        Ok(())
    }
}

struct Midi2KeysApp {
    model: MediationDataModel,
    editor: EditorState,
    reader: Option<MidiReader>,
    config_path: PathBuf,
}

impl eframe::App for Midi2KeysApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        ctx.request_repaint_after(Duration::from_millis(1));
        self.editor.reader_running = self.reader.as_ref().is_some_and(MidiReader::is_running);

        if self.model.device_running {
            match self.model.process_pending() {
                Ok(0) => {}
                Ok(n) => debug!("GUI handled {} MIDI messages", n),
                Err(e) => {
                    error!("MIDI device no longer running: {}", e);
                    self.editor.device_error = Some(e.to_string());
                    self.model.release_all();
                }
            }
        }

        capture_binding_keys(&mut self.model, &mut self.editor, ctx);

        if self.editor.save_requested {
            self.editor.save_requested = false;
            if let Err(e) = save_bindings(&self.config_path, &self.model.bindings) {
                error!("{:#}", e);
            }
        }

        egui::CentralPanel::default().show(ctx, |ui| {
            render_gui(&mut self.model, &mut self.editor, ui);
        });
    }

    fn on_exit(&mut self, _gl: Option<&eframe::glow::Context>) {
        debug!("User wants to close the app");
        self.model.release_all();
        if let Some(reader) = self.reader.take() {
            reader.stop(READER_STOP_TIMEOUT);
        }
    }
}
