//! # Musical Tuning Module
//!
//! Equal-temperament note table (A4 = 440 Hz, C0 to B8) and the offset
//! arithmetic used to describe how far a frequency sits from its nearest note.

use once_cell::sync::Lazy;

/// A single equal-tempered note.
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    /// Note name with octave (e.g. "A4", "C#3")
    pub name: String,
    /// Frequency in Hz
    pub frequency: f64,
}

const NOTE_NAMES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];

/// MIDI number of the lowest note in the table (C0).
const FIRST_MIDI: i32 = 12;
/// MIDI number of the highest note in the table (B8).
const LAST_MIDI: i32 = 119;

/// Statically computed notes from C0 to B8.
static NOTES: Lazy<Vec<Note>> = Lazy::new(|| {
    (FIRST_MIDI..=LAST_MIDI)
        .map(|midi| {
            // f = 440 * 2^((n - 69) / 12), n being the MIDI number
            let frequency = 440.0 * 2.0_f64.powf((midi - 69) as f64 / 12.0);
            let octave = midi / 12 - 1;
            let name = format!("{}{}", NOTE_NAMES[(midi % 12) as usize], octave);
            Note { name, frequency }
        })
        .collect()
});

/// Where a measured frequency sits relative to its nearest note.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteOffset {
    pub note: &'static Note,
    /// Measured minus note frequency, in Hz.
    pub frequency: f64,
    /// Offset as a percentage of the gap to the neighbouring note on the same side.
    pub percentage: f64,
    pub cents: f64,
}

/// Finds the note nearest to `freq`, clamped to the ends of the table.
pub fn find_nearest_note(freq: f64) -> &'static Note {
    let idx = nearest_index(freq);
    &NOTES[idx]
}

fn nearest_index(freq: f64) -> usize {
    if !(freq.is_finite() && freq > 0.0) {
        return 0;
    }
    let midi = (69.0 + 12.0 * (freq / 440.0).log2()).round() as i64;
    (midi.clamp(FIRST_MIDI as i64, LAST_MIDI as i64) - FIRST_MIDI as i64) as usize
}

/// Describes `freq` as an offset from its nearest note.
pub fn offset_from_nearest(freq: f64) -> NoteOffset {
    let idx = nearest_index(freq);
    let note = &NOTES[idx];
    let offset = freq - note.frequency;

    let neighbour = if offset >= 0.0 {
        NOTES.get(idx + 1).map(|n| n.frequency).unwrap_or(note.frequency * 2.0_f64.powf(1.0 / 12.0))
    } else if idx > 0 {
        NOTES[idx - 1].frequency
    } else {
        note.frequency / 2.0_f64.powf(1.0 / 12.0)
    };
    let gap = (neighbour - note.frequency).abs();

    NoteOffset {
        note,
        frequency: offset,
        percentage: if gap > 0.0 { offset / gap * 100.0 } else { 0.0 },
        cents: calculate_cents_deviation(freq, note.frequency),
    }
}

/// Deviation from a target frequency in cents (positive = sharp, negative = flat).
///
/// 100 cents make a semitone, 1200 an octave.
pub fn calculate_cents_deviation(freq: f64, target_freq: f64) -> f64 {
    1200.0 * (freq / target_freq).log2()
}
