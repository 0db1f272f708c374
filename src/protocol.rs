//! Wire protocol for the slider deck.
//!
//! Covers both transports: the line-oriented serial report format and the
//! fixed 32-byte HID report format.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

use crate::events::{ButtonEvent, SliderMoveEvent};
use crate::noise::{significantly_different, NoiseReductionLevel};

/// Full-line grammar for one serial report: pipe-separated tokens, each an
/// optional class prefix (`s` slider, `b` button, none = legacy slider)
/// followed by up to four digits, terminated by CRLF. Anything else on the
/// wire is noise.
static LINE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\w?\d{1,4}(\|\w?\d{1,4})*\r\n$").expect("valid line pattern"));

/// Largest raw reading a 10-bit ADC can produce.
const MAX_RAW_VALUE: u32 = 1023;

/// Stored-value sentinels guaranteeing the next real reading emits.
const SLIDER_SENTINEL: f32 = -1.0;
const BUTTON_SENTINEL: i32 = -1;

/// Normalize a raw 10-bit reading to a two-decimal volume scalar in `[0, 1]`.
pub fn normalize(raw: u32) -> f32 {
    let dirty = raw as f32 / MAX_RAW_VALUE as f32;
    ((dirty * 100.0).round() / 100.0).clamp(0.0, 1.0)
}

/// Settings that shape how parsed values are interpreted.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParserSettings {
    pub invert_sliders: bool,
    pub noise_reduction: NoiseReductionLevel,
}

/// Events produced by one parsed line.
#[derive(Debug, Default, PartialEq)]
pub struct LineEvents {
    pub sliders: Vec<SliderMoveEvent>,
    pub buttons: Vec<ButtonEvent>,
}

/// Stateful parser for the line-oriented serial protocol.
///
/// Tracks the last emitted value per index so it can suppress jitter, and
/// re-derives the index space whenever the deck reports a different number
/// of controls - after which every index re-emits on the next line.
pub struct LineParser {
    settings: ParserSettings,
    slider_values: Vec<f32>,
    button_values: Vec<i32>,
}

impl LineParser {
    pub fn new(settings: ParserSettings) -> Self {
        Self {
            settings,
            slider_values: Vec::new(),
            button_values: Vec::new(),
        }
    }

    /// Update interpretation settings without touching stored values.
    pub fn set_settings(&mut self, settings: ParserSettings) {
        self.settings = settings;
    }

    /// Forget all known values so the next line re-emits every index.
    pub fn force_refresh(&mut self) {
        self.slider_values.clear();
        self.button_values.clear();
    }

    /// Parse one raw line as delivered by the reader, CRLF included.
    ///
    /// Lines that fail the grammar are expected background noise from the
    /// wire and produce nothing, not even a state change.
    pub fn parse_line(&mut self, line: &str) -> LineEvents {
        let mut events = LineEvents::default();

        if !LINE_PATTERN.is_match(line) {
            return events;
        }

        let trimmed = line.trim_end_matches("\r\n");

        let mut slider_tokens: Vec<&str> = Vec::new();
        let mut button_tokens: Vec<&str> = Vec::new();
        for token in trimmed.split('|') {
            if let Some(rest) = token.strip_prefix('s') {
                slider_tokens.push(rest);
            } else if let Some(rest) = token.strip_prefix('b') {
                button_tokens.push(rest);
            } else {
                // Legacy decks report bare slider values with no prefix.
                slider_tokens.push(token);
            }
        }

        if slider_tokens.len() != self.slider_values.len() {
            info!(amount = slider_tokens.len(), "Detected sliders");
            self.slider_values = vec![SLIDER_SENTINEL; slider_tokens.len()];
        }
        if button_tokens.len() != self.button_values.len() {
            info!(amount = button_tokens.len(), "Detected buttons");
            self.button_values = vec![BUTTON_SENTINEL; button_tokens.len()];
        }

        for (idx, token) in slider_tokens.iter().enumerate() {
            let raw: u32 = token.parse().unwrap_or(0);

            // A torn read after a baud-rate resync tends to garble the
            // first token into something out of range; drop the whole line.
            if idx == 0 && raw > MAX_RAW_VALUE {
                debug!(line = %trimmed, "Got malformed line from serial, ignoring");
                return LineEvents::default();
            }

            let mut value = normalize(raw);
            if self.settings.invert_sliders {
                value = 1.0 - value;
            }

            if significantly_different(self.slider_values[idx], value, self.settings.noise_reduction)
            {
                self.slider_values[idx] = value;
                events.sliders.push(SliderMoveEvent { slider: idx, value });
            }
        }

        for (idx, token) in button_tokens.iter().enumerate() {
            let value: i32 = token.parse().unwrap_or(0);
            if self.button_values[idx] != value {
                self.button_values[idx] = value;
                events.buttons.push(ButtonEvent { button: idx, value });
            }
        }

        events
    }
}

// --- HID report format ---

/// Fixed length of every HID report in both directions.
pub const HID_FRAME_LEN: usize = 32;
/// Byte 0 of every deck-originated command frame.
pub const HID_COMMAND_MARKER: u8 = 0xFD;
/// Byte 1 of a keep-alive frame.
pub const HID_HEARTBEAT: u8 = 0xDD;
/// Volume step applied per increment/decrement frame.
pub const HID_VOLUME_STEP: f32 = 0.05;

/// Decoded deck-originated HID frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HidCommand {
    /// Keep-alive, nothing to do.
    Heartbeat,
    /// Relative volume step for one slider.
    Step { slider: usize, down: bool },
}

/// Decode one input report. Frames without the command marker are not for
/// us and decode to `None`.
pub fn decode_hid_frame(frame: &[u8]) -> Option<HidCommand> {
    if frame.len() < 3 || frame[0] != HID_COMMAND_MARKER {
        return None;
    }
    if frame[1] == HID_HEARTBEAT {
        return Some(HidCommand::Heartbeat);
    }

    Some(HidCommand::Step {
        slider: frame[1] as usize,
        down: frame[2] == 0,
    })
}

/// Apply one step to a current volume.
///
/// Mirrors the deck's ladder: take a full step when it fits inside `[0, 1]`,
/// otherwise snap to the boundary.
pub fn apply_hid_step(current: f32, down: bool) -> f32 {
    if down {
        if current - HID_VOLUME_STEP >= 0.0 {
            current - HID_VOLUME_STEP
        } else {
            0.0
        }
    } else if current + HID_VOLUME_STEP <= 1.0 {
        current + HID_VOLUME_STEP
    } else {
        1.0
    }
}

/// Encode the device-bound status frame reporting one slider's volume.
///
/// Layout: `0x03, 0xFF, slider, percent` where percent is the volume as
/// `0..=10000` (two implied decimals) in big-endian, padded to frame length.
pub fn encode_status_frame(slider: u8, value: f32) -> [u8; HID_FRAME_LEN] {
    let percent = (value.clamp(0.0, 1.0) * 10_000.0).round() as u16;

    let mut frame = [0u8; HID_FRAME_LEN];
    frame[0] = 0x03;
    frame[1] = 0xFF;
    frame[2] = slider;
    frame[3] = (percent >> 8) as u8;
    frame[4] = (percent & 0xFF) as u8;
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn parser() -> LineParser {
        LineParser::new(ParserSettings::default())
    }

    #[test]
    fn first_line_emits_every_index() {
        let mut parser = parser();
        let events = parser.parse_line("s512|b1\r\n");

        assert_eq!(events.sliders.len(), 1);
        assert_eq!(events.sliders[0].slider, 0);
        assert!((events.sliders[0].value - 0.5).abs() < f32::EPSILON);
        assert_eq!(events.buttons, vec![ButtonEvent { button: 0, value: 1 }]);
    }

    #[test]
    fn garbage_produces_nothing() {
        let mut parser = parser();
        assert_eq!(parser.parse_line("garbage\r\n"), LineEvents::default());
        // No state mutated: the next valid line still first-emits.
        let events = parser.parse_line("s0\r\n");
        assert_eq!(events.sliders.len(), 1);
    }

    #[test]
    fn missing_crlf_is_rejected() {
        let mut parser = parser();
        assert_eq!(parser.parse_line("s512|b1"), LineEvents::default());
        assert_eq!(parser.parse_line("s512|b1\n"), LineEvents::default());
    }

    #[test]
    fn legacy_bare_values_are_sliders() {
        let mut parser = parser();
        let events = parser.parse_line("1023|0\r\n");

        assert_eq!(
            events.sliders,
            vec![
                SliderMoveEvent {
                    slider: 0,
                    value: 1.0
                },
                SliderMoveEvent {
                    slider: 1,
                    value: 0.0
                },
            ]
        );
        assert!(events.buttons.is_empty());
    }

    #[test]
    fn corrupted_first_token_discards_the_line() {
        let mut parser = parser();
        let events = parser.parse_line("4558|925|41\r\n");
        assert_eq!(events, LineEvents::default());
    }

    #[test]
    fn small_jitter_is_debounced() {
        let mut parser = parser();
        // 100/1023 -> 0.10, 101/1023 -> 0.10: same after rounding, and in
        // any case below the default threshold.
        assert_eq!(parser.parse_line("s100\r\n").sliders.len(), 1);
        assert!(parser.parse_line("s101\r\n").sliders.is_empty());
    }

    #[test]
    fn fine_tier_emits_what_coarse_suppresses() {
        let mut coarse = LineParser::new(ParserSettings {
            invert_sliders: false,
            noise_reduction: NoiseReductionLevel::High,
        });
        let mut fine = LineParser::new(ParserSettings {
            invert_sliders: false,
            noise_reduction: NoiseReductionLevel::Low,
        });

        // 0.10 -> 0.12: below the coarse threshold, above the fine one.
        for parser in [&mut coarse, &mut fine] {
            assert_eq!(parser.parse_line("s102\r\n").sliders.len(), 1);
        }
        assert!(coarse.parse_line("s123\r\n").sliders.is_empty());
        assert_eq!(fine.parse_line("s123\r\n").sliders.len(), 1);
    }

    #[test]
    fn count_change_resets_and_re_emits() {
        let mut parser = parser();
        assert_eq!(parser.parse_line("s512|s512\r\n").sliders.len(), 2);
        // Same values again: nothing to say.
        assert!(parser.parse_line("s512|s512\r\n").sliders.is_empty());
        // A third slider appears: the whole index space re-emits.
        assert_eq!(parser.parse_line("s512|s512|s512\r\n").sliders.len(), 3);
    }

    #[test]
    fn force_refresh_re_emits_unchanged_values() {
        let mut parser = parser();
        assert_eq!(parser.parse_line("s512|b1\r\n").sliders.len(), 1);
        assert!(parser.parse_line("s512|b1\r\n").sliders.is_empty());

        parser.force_refresh();
        let events = parser.parse_line("s512|b1\r\n");
        assert_eq!(events.sliders.len(), 1);
        assert_eq!(events.buttons.len(), 1);
    }

    #[test]
    fn inversion_flips_values() {
        let mut parser = LineParser::new(ParserSettings {
            invert_sliders: true,
            noise_reduction: NoiseReductionLevel::Default,
        });
        let events = parser.parse_line("0|1023\r\n");
        assert_eq!(
            events.sliders,
            vec![
                SliderMoveEvent {
                    slider: 0,
                    value: 1.0
                },
                SliderMoveEvent {
                    slider: 1,
                    value: 0.0
                },
            ]
        );
    }

    #[test]
    fn button_changes_always_emit() {
        let mut parser = parser();
        assert_eq!(parser.parse_line("b0\r\n").buttons.len(), 1);
        assert!(parser.parse_line("b0\r\n").buttons.is_empty());
        assert_eq!(
            parser.parse_line("b1\r\n").buttons,
            vec![ButtonEvent { button: 0, value: 1 }]
        );
    }

    #[test]
    fn normalize_hits_the_endpoints() {
        assert_eq!(normalize(0), 0.0);
        assert_eq!(normalize(1023), 1.0);
        assert_eq!(normalize(512), 0.5);
    }

    proptest! {
        #[test]
        fn normalize_is_monotonic(raw in 0u32..MAX_RAW_VALUE) {
            prop_assert!(normalize(raw) <= normalize(raw + 1));
        }

        #[test]
        fn normalize_stays_in_range(raw in 0u32..=MAX_RAW_VALUE) {
            let value = normalize(raw);
            prop_assert!((0.0..=1.0).contains(&value));
        }

        #[test]
        fn inversion_is_involutive(value in 0.0f32..=1.0) {
            let twice = 1.0 - (1.0 - value);
            prop_assert!((twice - value).abs() < 1e-6);
        }

        #[test]
        fn valid_lines_never_panic(tokens in proptest::collection::vec("[sb]?[0-9]{1,4}", 1..8)) {
            let line = format!("{}\r\n", tokens.join("|"));
            let mut parser = parser();
            let _ = parser.parse_line(&line);
        }

        #[test]
        fn hid_steps_stay_in_range(start in 0.0f32..=1.0, downs in proptest::collection::vec(any::<bool>(), 1..64)) {
            let mut value = start;
            for down in downs {
                value = apply_hid_step(value, down);
                prop_assert!((0.0..=1.0).contains(&value));
            }
        }
    }

    #[test]
    fn hid_step_clamps_at_the_edges() {
        assert_eq!(apply_hid_step(0.02, true), 0.0);
        assert_eq!(apply_hid_step(0.99, false), 1.0);
        assert_eq!(apply_hid_step(0.5, false), 0.55);
        assert_eq!(apply_hid_step(0.5, true), 0.45);
    }

    #[test]
    fn hid_decode_classifies_frames() {
        let mut frame = [0u8; HID_FRAME_LEN];
        frame[0] = HID_COMMAND_MARKER;
        frame[1] = HID_HEARTBEAT;
        assert_eq!(decode_hid_frame(&frame), Some(HidCommand::Heartbeat));

        frame[1] = 3;
        frame[2] = 0;
        assert_eq!(
            decode_hid_frame(&frame),
            Some(HidCommand::Step {
                slider: 3,
                down: true
            })
        );

        frame[2] = 7;
        assert_eq!(
            decode_hid_frame(&frame),
            Some(HidCommand::Step {
                slider: 3,
                down: false
            })
        );

        // Not a command frame at all.
        frame[0] = 0x01;
        assert_eq!(decode_hid_frame(&frame), None);
    }

    #[test]
    fn status_frame_layout() {
        let frame = encode_status_frame(2, 0.75);
        assert_eq!(frame[0], 0x03);
        assert_eq!(frame[1], 0xFF);
        assert_eq!(frame[2], 2);
        assert_eq!(u16::from_be_bytes([frame[3], frame[4]]), 7500);
        assert!(frame[5..].iter().all(|&b| b == 0));
    }
}
