use std::fmt;

use log::warn;
use thiserror::Error;

/// A complete channel message: one status byte followed by its data bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ProtocolMessage {
    status: u8,
    data: [u8; 2],
    len: usize,
}

impl ProtocolMessage {
    pub fn new(status: u8, data: &[u8]) -> Option<Self> {
        if status < 0x80 || data.len() > 2 {
            return None;
        }
        let mut buf = [0u8; 2];
        buf[..data.len()].copy_from_slice(data);
        Some(ProtocolMessage {
            status,
            data: buf,
            len: data.len(),
        })
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    /// High nibble of the status byte, i.e. the message family.
    pub fn command(&self) -> u8 {
        self.status >> 4
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn data1(&self) -> u8 {
        self.data[0]
    }

    pub fn data2(&self) -> u8 {
        self.data[1]
    }
}

impl fmt::Debug for ProtocolMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.status)?;
        for b in self.data() {
            write!(f, " {:#04x}", b)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("data byte {0:#04x} without a live status byte")]
    OrphanData(u8),
}

/// Number of data bytes that follow a given status byte, if the family is modelled.
pub fn expected_data_len(status: u8) -> Option<usize> {
    match status >> 4 {
        0x8 | 0x9 | 0xA | 0xB | 0xE => Some(2),
        0xC | 0xD => Some(1),
        _ => None,
    }
}

/// Reassembles single bytes into [`ProtocolMessage`]s.
///
/// Running status is not supported: once a message has been emitted the
/// decoder waits for a fresh status byte, and any data byte arriving in the
/// meantime is a decode error.
#[derive(Debug, Default)]
pub struct ByteDecoder {
    status: Option<u8>,
    buffer: Vec<u8>,
    expected_length: Option<usize>,
    errors: usize,
}

impl ByteDecoder {
    pub fn new() -> Self {
        ByteDecoder {
            buffer: Vec::with_capacity(2),
            ..Default::default()
        }
    }

    pub fn feed(&mut self, byte: u8) -> Option<ProtocolMessage> {
        match self.try_feed(byte) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("MIDI message not understood: {} (buffer {:?})", e, self.buffer);
                self.errors += 1;
                self.buffer.clear();
                self.expected_length = None;
                None
            }
        }
    }

    fn try_feed(&mut self, byte: u8) -> Result<Option<ProtocolMessage>, DecodeError> {
        if byte >= 0x80 {
            self.status = Some(byte);
            self.buffer.clear();
            self.expected_length = expected_data_len(byte);
            return Ok(None);
        }

        let (status, expected) = match (self.status, self.expected_length) {
            (Some(status), Some(expected)) => (status, expected),
            _ => return Err(DecodeError::OrphanData(byte)),
        };

        self.buffer.push(byte);
        if self.buffer.len() < expected {
            return Ok(None);
        }

        let msg = ProtocolMessage::new(status, &self.buffer);
        self.buffer.clear();
        self.expected_length = None;
        Ok(msg)
    }

    /// Count of bytes discarded as undecodable so far.
    pub fn decode_errors(&self) -> usize {
        self.errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use midi_msg::{Channel, ChannelVoiceMsg, MidiMsg};
    use proptest::prelude::*;

    fn decode_all(decoder: &mut ByteDecoder, bytes: &[u8]) -> Vec<ProtocolMessage> {
        bytes.iter().filter_map(|b| decoder.feed(*b)).collect()
    }

    #[test]
    fn test_note_on_frame() {
        let mut decoder = ByteDecoder::new();
        let msgs = decode_all(&mut decoder, &[0x90, 0x40, 0x50]);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].status(), 0x90);
        assert_eq!(msgs[0].data(), &[0x40, 0x50]);
        assert_eq!(decoder.decode_errors(), 0);
    }

    #[test]
    fn test_frames_from_reference_encoder() {
        let on = MidiMsg::ChannelVoice {
            channel: Channel::Ch3,
            msg: ChannelVoiceMsg::NoteOn {
                note: 60,
                velocity: 100,
            },
        };
        let off = MidiMsg::ChannelVoice {
            channel: Channel::Ch3,
            msg: ChannelVoiceMsg::NoteOff {
                note: 60,
                velocity: 0,
            },
        };
        let mut bytes = on.to_midi();
        bytes.extend(off.to_midi());

        let mut decoder = ByteDecoder::new();
        let msgs = decode_all(&mut decoder, &bytes);
        assert_eq!(
            msgs,
            vec![
                ProtocolMessage::new(0x92, &[60, 100]).unwrap(),
                ProtocolMessage::new(0x82, &[60, 0]).unwrap(),
            ]
        );
    }

    #[test]
    fn test_one_byte_messages() {
        let mut decoder = ByteDecoder::new();
        let msgs = decode_all(&mut decoder, &[0xC0, 0x05, 0xD1, 0x7F]);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].data(), &[0x05]);
        assert_eq!(msgs[1].status(), 0xD1);
    }

    #[test]
    fn test_stray_data_before_status() {
        let mut decoder = ByteDecoder::new();
        let msgs = decode_all(&mut decoder, &[0x12, 0x34, 0xB0, 0x07, 0x40]);
        assert_eq!(msgs, vec![ProtocolMessage::new(0xB0, &[0x07, 0x40]).unwrap()]);
        assert_eq!(decoder.decode_errors(), 2);
    }

    #[test]
    fn test_running_status_is_rejected() {
        let mut decoder = ByteDecoder::new();
        let msgs = decode_all(&mut decoder, &[0x90, 0x40, 0x50, 0x41, 0x50, 0x80, 0x40, 0x00]);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].status(), 0x80);
        assert_eq!(decoder.decode_errors(), 2);
    }

    #[test]
    fn test_truncated_frame_is_restarted_by_status() {
        let mut decoder = ByteDecoder::new();
        let msgs = decode_all(&mut decoder, &[0x90, 0x40, 0xB0, 0x01, 0x02]);
        assert_eq!(msgs, vec![ProtocolMessage::new(0xB0, &[0x01, 0x02]).unwrap()]);
        assert_eq!(decoder.decode_errors(), 0);
    }

    #[test]
    fn test_system_messages_are_not_modelled() {
        let mut decoder = ByteDecoder::new();
        let msgs = decode_all(&mut decoder, &[0xF0, 0x7E, 0x7F, 0xF7, 0x90, 0x3C, 0x10]);
        assert_eq!(msgs, vec![ProtocolMessage::new(0x90, &[0x3C, 0x10]).unwrap()]);
    }

    fn frame() -> impl Strategy<Value = Vec<u8>> {
        prop_oneof![
            (0x80u8..0xC0, 0u8..0x80, 0u8..0x80).prop_map(|(s, a, b)| vec![s, a, b]),
            (0xE0u8..0xF0, 0u8..0x80, 0u8..0x80).prop_map(|(s, a, b)| vec![s, a, b]),
            (0xC0u8..0xE0, 0u8..0x80).prop_map(|(s, a)| vec![s, a]),
        ]
    }

    proptest! {
        #[test]
        fn prop_frames_decode_exactly(
            stray in proptest::collection::vec(0u8..0x80, 0..4),
            frames in proptest::collection::vec(frame(), 0..32),
        ) {
            let mut bytes = stray.clone();
            for f in &frames {
                bytes.extend_from_slice(f);
            }

            let mut decoder = ByteDecoder::new();
            let msgs = decode_all(&mut decoder, &bytes);

            let expected: Vec<ProtocolMessage> = frames
                .iter()
                .map(|f| ProtocolMessage::new(f[0], &f[1..]).unwrap())
                .collect();
            prop_assert_eq!(msgs, expected);
            prop_assert_eq!(decoder.decode_errors(), stray.len());
        }
    }
}
