use std::{
    io::{self, BufReader, Read},
    path::Path,
    process::{Child, ChildStdout, Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use log::{debug, error, info, warn};
use midir::{Ignore, MidiInput, MidiInputConnection};
use thiserror::Error;

use crate::decoder::{ByteDecoder, ProtocolMessage};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device stream ended")]
    Ended,
    #[error("device read failed: {0}")]
    Io(#[from] io::Error),
    #[error("MIDI reader thread has gone away")]
    ReaderGone,
}

/// What the reader thread hands to the foreground.
#[derive(Debug)]
pub enum ReaderEvent {
    Message(ProtocolMessage),
    Lost(DeviceError),
}

/// Blocking, one byte at a time.
pub trait ByteSource: Send {
    fn read_byte(&mut self) -> Result<u8, DeviceError>;
}

/// Forcibly unblocks a pending [`ByteSource::read_byte`] from another thread.
pub trait Interrupt {
    fn interrupt(&mut self);
}

/// For sources whose reads end on their own.
pub struct NoInterrupt;

impl Interrupt for NoInterrupt {
    fn interrupt(&mut self) {}
}

/// Any reader, e.g. stdin or an in-memory buffer.
pub struct StreamSource<R> {
    reader: R,
}

impl<R: Read + Send> StreamSource<R> {
    pub fn new(reader: R) -> Self {
        StreamSource { reader }
    }
}

impl<R: Read + Send> ByteSource for StreamSource<R> {
    fn read_byte(&mut self) -> Result<u8, DeviceError> {
        let mut buf = [0u8; 1];
        match self.reader.read_exact(&mut buf) {
            Ok(()) => Ok(buf[0]),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(DeviceError::Ended),
            Err(e) => Err(DeviceError::Io(e)),
        }
    }
}

/// Raw MIDI device node (e.g. `/dev/midi1`), read through a `cat` child so
/// that a blocked read can be ended by killing the child.
pub struct DeviceFile {
    stdout: BufReader<ChildStdout>,
    child: Arc<Mutex<Child>>,
}

pub struct KillChild {
    child: Arc<Mutex<Child>>,
}

impl DeviceFile {
    pub fn open(path: &Path) -> anyhow::Result<(Self, KillChild)> {
        std::fs::metadata(path)
            .map_err(|e| anyhow!("cannot access MIDI device {}: {}", path.display(), e))?;
        let mut child = Command::new("cat")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("no stdout on device reader"))?;
        let child = Arc::new(Mutex::new(child));
        info!("MIDI device open, reading input from '{}'.", path.display());
        Ok((
            DeviceFile {
                stdout: BufReader::new(stdout),
                child: child.clone(),
            },
            KillChild { child },
        ))
    }
}

fn kill(child: &Mutex<Child>) {
    if let Ok(mut child) = child.lock() {
        if let Ok(None) = child.try_wait() {
            let _ = child.kill();
        }
        let _ = child.wait();
    }
}

impl ByteSource for DeviceFile {
    fn read_byte(&mut self) -> Result<u8, DeviceError> {
        let mut buf = [0u8; 1];
        match self.stdout.read_exact(&mut buf) {
            Ok(()) => Ok(buf[0]),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(DeviceError::Ended),
            Err(e) => Err(DeviceError::Io(e)),
        }
    }
}

impl Drop for DeviceFile {
    fn drop(&mut self) {
        kill(&self.child);
    }
}

impl Interrupt for KillChild {
    fn interrupt(&mut self) {
        debug!("killing device reader process");
        kill(&self.child);
    }
}

/// A midir input port; the callback forwards raw bytes into a channel.
pub struct MidiPort {
    bytes: Receiver<u8>,
}

pub struct ClosePort {
    connection: Option<MidiInputConnection<()>>,
}

impl MidiPort {
    pub fn open(port_index: usize) -> anyhow::Result<(Self, ClosePort)> {
        let mut midi_input = MidiInput::new("midi2keys reading input")?;
        midi_input.ignore(Ignore::None);

        let ports = midi_input.ports();
        let port = ports
            .get(port_index)
            .ok_or_else(|| anyhow!("invalid MIDI port index {}", port_index))?;
        let port_name = midi_input.port_name(port)?;

        let (tx, rx) = mpsc::channel();
        let connection = midi_input
            .connect(
                port,
                "midi2keys-read-input",
                move |_stamp, midi_bytes, _| {
                    for b in midi_bytes {
                        if tx.send(*b).is_err() {
                            break;
                        }
                    }
                },
                (),
            )
            .map_err(|e| anyhow!("failed to open MIDI port {}: {}", port_index, e))?;

        info!("MIDI connection open, reading input from '{}'.", port_name);
        Ok((
            MidiPort { bytes: rx },
            ClosePort {
                connection: Some(connection),
            },
        ))
    }
}

impl ByteSource for MidiPort {
    fn read_byte(&mut self) -> Result<u8, DeviceError> {
        self.bytes.recv().map_err(|_| DeviceError::Ended)
    }
}

impl Interrupt for ClosePort {
    fn interrupt(&mut self) {
        if let Some(connection) = self.connection.take() {
            debug!("closing MIDI port connection");
            connection.close();
        }
    }
}

impl Drop for ClosePort {
    fn drop(&mut self) {
        self.interrupt();
    }
}

pub fn list_midi_ports() -> anyhow::Result<()> {
    let mut midi_input = MidiInput::new("midi2keys listing ports")?;
    midi_input.ignore(Ignore::None);

    for (i, p) in midi_input.ports().iter().enumerate() {
        println!("{}: {}", i, midi_input.port_name(p)?);
    }
    Ok(())
}

/// Background reader: blocking byte reads, decoding, and hand-off over a channel.
pub struct MidiReader {
    handle: JoinHandle<()>,
    running: Arc<AtomicBool>,
    interrupt: Box<dyn Interrupt>,
}

impl MidiReader {
    pub fn start<S: ByteSource + 'static>(
        source: S,
        interrupt: Box<dyn Interrupt>,
        tx: Sender<ReaderEvent>,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let handle = midi_listener_thread(source, tx, running.clone());
        MidiReader {
            handle,
            running,
            interrupt,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.handle.is_finished()
    }

    /// Stops reading and waits up to `timeout` for the thread to finish.
    /// Returns `false` if the thread had to be left behind.
    pub fn stop(mut self, timeout: Duration) -> bool {
        info!("Stop MIDI reader request");
        self.running.store(false, Ordering::SeqCst);
        self.interrupt.interrupt();

        let deadline = Instant::now() + timeout;
        while !self.handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("MIDI reader did not stop within {:?}; moving on", timeout);
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        if self.handle.join().is_err() {
            error!("MIDI reader thread panicked");
        }
        debug!("MIDI reader closed");
        true
    }
}

fn midi_listener_thread<S: ByteSource + 'static>(
    mut source: S,
    tx: Sender<ReaderEvent>,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut decoder = ByteDecoder::new();
        while running.load(Ordering::SeqCst) {
            match source.read_byte() {
                Ok(byte) => {
                    if let Some(msg) = decoder.feed(byte) {
                        if tx.send(ReaderEvent::Message(msg)).is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    if running.swap(false, Ordering::SeqCst) {
                        error!("MIDI device lost: {}", e);
                        let _ = tx.send(ReaderEvent::Lost(e));
                    }
                    break;
                }
            }
        }
        debug!("MIDI reader thread exiting");
    })
}
