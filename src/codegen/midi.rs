//! Storage formats for MIDI slots. Generated code and the export ABI depend
//! on these layouts byte for byte.

pub const MIDI_QUEUE_CAPACITY: usize = 16;
pub const MIDI_EVENT_SIZE: u32 = 8;
pub const MIDI_EVENTS_OFFSET: u32 = 4;
pub const MIDI_QUEUE_SIZE: u32 = MIDI_EVENTS_OFFSET + MIDI_EVENT_SIZE * MIDI_QUEUE_CAPACITY as u32;

pub const MIDI_STATUS_OFFSET: i32 = 0;
pub const MIDI_CHANNEL_OFFSET: i32 = 1;
pub const MIDI_NOTE_OFFSET: i32 = 2;
pub const MIDI_PARAM_OFFSET: i32 = 3;

/// Event type, stored as the high nibble of a MIDI status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MidiStatus {
    NoteOff = 0x8,
    NoteOn = 0x9,
    PolyphonicAftertouch = 0xA,
    ControlChange = 0xB,
    ChannelAftertouch = 0xD,
    PitchWheel = 0xE,
}

impl MidiStatus {
    /// The status byte with a zero channel nibble.
    pub fn byte(self) -> u8 {
        (self as u8) << 4
    }

    pub fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0x8 => Some(MidiStatus::NoteOff),
            0x9 => Some(MidiStatus::NoteOn),
            0xA => Some(MidiStatus::PolyphonicAftertouch),
            0xB => Some(MidiStatus::ControlChange),
            0xD => Some(MidiStatus::ChannelAftertouch),
            0xE => Some(MidiStatus::PitchWheel),
            _ => None,
        }
    }
}

/// One channel message. `status` is a MIDI status byte: the event type sits
/// in the high nibble, the channel is kept in its own field.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MidiEvent {
    pub status: u8,
    pub channel: u8,
    pub note: u8,
    pub param: u8,
    pub time: u32,
}

impl MidiEvent {
    pub fn new(status: MidiStatus, channel: u8, note: u8, param: u8) -> Self {
        Self {
            status: status.byte(),
            channel,
            note,
            param,
            time: 0,
        }
    }

    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self::new(MidiStatus::NoteOn, channel, note, velocity)
    }

    pub fn note_off(channel: u8, note: u8) -> Self {
        Self::new(MidiStatus::NoteOff, channel, note, 0)
    }

    /// Parses a raw channel message (status byte plus two data bytes).
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let (&status, rest) = bytes.split_first()?;
        let kind = MidiStatus::from_nibble(status >> 4)?;
        Some(Self::new(
            kind,
            status & 0x0F,
            rest.first().copied().unwrap_or(0),
            rest.get(1).copied().unwrap_or(0),
        ))
    }

    pub fn kind(&self) -> Option<MidiStatus> {
        MidiStatus::from_nibble(self.status >> 4)
    }

    /// The event as passed through the export ABI: the little endian bytes
    /// of the struct packed into a `u64`.
    pub fn to_bits(self) -> u64 {
        u64::from(self.status)
            | u64::from(self.channel) << 8
            | u64::from(self.note) << 16
            | u64::from(self.param) << 24
            | u64::from(self.time) << 32
    }

    pub fn from_bits(bits: u64) -> Self {
        Self {
            status: bits as u8,
            channel: (bits >> 8) as u8,
            note: (bits >> 16) as u8,
            param: (bits >> 24) as u8,
            time: (bits >> 32) as u32,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MidiQueue {
    pub count: u32,
    pub events: [MidiEvent; MIDI_QUEUE_CAPACITY],
}

impl MidiQueue {
    /// Returns false and drops the event when the queue is full.
    pub fn push(&mut self, event: MidiEvent) -> bool {
        let count = self.count as usize;
        if count >= MIDI_QUEUE_CAPACITY {
            return false;
        }
        self.events[count] = event;
        self.count += 1;
        true
    }

    pub fn clear(&mut self) {
        self.count = 0;
    }

    pub fn events(&self) -> &[MidiEvent] {
        &self.events[..(self.count as usize).min(MIDI_QUEUE_CAPACITY)]
    }
}

const _: () = assert!(std::mem::size_of::<MidiEvent>() == MIDI_EVENT_SIZE as usize);
const _: () = assert!(std::mem::size_of::<MidiQueue>() == MIDI_QUEUE_SIZE as usize);
const _: () = assert!(std::mem::align_of::<MidiQueue>() == 4);
