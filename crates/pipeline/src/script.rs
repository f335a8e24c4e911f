//! Speech scripts
//!
//! A script is the text a backend will speak plus the timing hints the
//! animation drivers need. Catalog clips carry measured pause offsets; free
//! text uses `|` as a pause marker and estimates offsets from its length.

use avatar_core::{CatalogEntry, Segment};

pub const PAUSE_MARKER: char = '|';

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpeechScript {
    /// Text handed to the speech backend, markers removed
    pub text: String,
    /// Milliseconds from start at which the mouth should close
    pub pauses: Vec<u64>,
    pub segments: Vec<Segment>,
}

impl SpeechScript {
    /// Build a script from free text
    ///
    /// Each `|` becomes a pause at `chars(preceding segments) * ms_per_char`.
    pub fn from_text(raw: &str, ms_per_char: u64) -> Self {
        let parts: Vec<&str> = raw
            .split(PAUSE_MARKER)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();

        let mut segments = Vec::with_capacity(parts.len());
        let mut pauses = Vec::with_capacity(parts.len().saturating_sub(1));
        let mut offset = 0u64;

        for (i, part) in parts.iter().enumerate() {
            segments.push(Segment::new(*part, offset));
            offset += part.chars().count() as u64 * ms_per_char;
            if i + 1 < parts.len() {
                pauses.push(offset);
            }
        }

        Self {
            text: parts.join(" "),
            pauses,
            segments,
        }
    }

    /// Script for a catalog clip, using its recorded timings
    pub fn from_entry(entry: &CatalogEntry) -> Self {
        Self {
            text: entry.display_text.clone(),
            pauses: entry.pause_offsets.clone(),
            segments: entry.segments.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markers_become_pauses() {
        let script = SpeechScript::from_text("Hola | ¿qué tal?", 70);
        assert_eq!(script.text, "Hola ¿qué tal?");
        // "Hola" is 4 chars
        assert_eq!(script.pauses, vec![280]);
        assert_eq!(
            script.segments,
            vec![Segment::new("Hola", 0), Segment::new("¿qué tal?", 280)]
        );
    }

    #[test]
    fn test_offsets_accumulate() {
        let script = SpeechScript::from_text("ab|cde|f", 100);
        assert_eq!(script.pauses, vec![200, 500]);
        assert_eq!(script.segments[2].start_offset_ms, 500);
    }

    #[test]
    fn test_plain_text_has_no_pauses() {
        let script = SpeechScript::from_text("Sin pausas", 70);
        assert_eq!(script.text, "Sin pausas");
        assert!(script.pauses.is_empty());
        assert_eq!(script.segments.len(), 1);
    }

    #[test]
    fn test_empty_parts_are_dropped() {
        let script = SpeechScript::from_text(" | uno || dos | ", 10);
        assert_eq!(script.text, "uno dos");
        assert_eq!(script.pauses, vec![30]);

        assert!(SpeechScript::from_text(" | ", 70).is_empty());
    }

    #[test]
    fn test_from_entry_keeps_recorded_timing() {
        let entry = CatalogEntry {
            id: "intro_1".into(),
            display_text: "Hola".into(),
            audio_uri: Some("/audio/intro_1.mp3".into()),
            segments: vec![Segment::new("Hola", 0)],
            pause_offsets: vec![771, 2240],
        };
        let script = SpeechScript::from_entry(&entry);
        assert_eq!(script.pauses, vec![771, 2240]);
        assert_eq!(script.text, "Hola");
    }
}
