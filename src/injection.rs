use std::process::{Child, Command};

use log::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEventKind {
    KeyDown,
    KeyUp,
    /// Press and release in one go
    Key,
}

impl KeyEventKind {
    pub fn verb(&self) -> &'static str {
        match self {
            KeyEventKind::KeyDown => "keydown",
            KeyEventKind::KeyUp => "keyup",
            KeyEventKind::Key => "key",
        }
    }
}

/// Where synthesized key events go. Fire-and-forget: no delivery confirmation.
pub trait KeySink {
    fn synthesize(&mut self, kind: KeyEventKind, composite: &str);
}

/// Injects events into the X session by running `xdotool`.
///
/// One invocation at a time: each call waits for the previous child to
/// exit, so a key-up can never overtake its key-down.
pub struct XdotoolSink {
    program: String,
    leading_args: Vec<String>,
    previous: Option<Child>,
}

impl XdotoolSink {
    pub fn new() -> Self {
        XdotoolSink::with_command("xdotool", &[])
    }

    /// Runs `program leading_args.. <verb> <composite>` for each event.
    pub fn with_command(program: &str, leading_args: &[&str]) -> Self {
        XdotoolSink {
            program: program.to_owned(),
            leading_args: leading_args.iter().map(|a| a.to_string()).collect(),
            previous: None,
        }
    }

    fn wait_previous(&mut self) {
        if let Some(mut child) = self.previous.take() {
            match child.wait() {
                Ok(status) if !status.success() => warn!("{} exited with {}", self.program, status),
                Ok(_) => {}
                Err(e) => error!("failed to wait for {}: {}", self.program, e),
            }
        }
    }
}

impl Default for XdotoolSink {
    fn default() -> Self {
        XdotoolSink::new()
    }
}

impl KeySink for XdotoolSink {
    fn synthesize(&mut self, kind: KeyEventKind, composite: &str) {
        self.wait_previous();
        match Command::new(&self.program)
            .args(&self.leading_args)
            .arg(kind.verb())
            .arg(composite)
            .spawn()
        {
            Ok(child) => {
                debug!("{} {} {}", self.program, kind.verb(), composite);
                self.previous = Some(child);
            }
            Err(e) => error!("failed to run {}: {}", self.program, e),
        }
    }
}

impl Drop for XdotoolSink {
    fn drop(&mut self) {
        self.wait_previous();
    }
}

/// Only logs what would have been injected.
pub struct DryRunSink;

impl KeySink for DryRunSink {
    fn synthesize(&mut self, kind: KeyEventKind, composite: &str) {
        info!("(dry run) {} {}", kind.verb(), composite);
    }
}
