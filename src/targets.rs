//! Target mapping: which audio sessions each physical control addresses.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::sessions::Session;

/// Reserved target addressing the system master output.
pub const MASTER_TARGET: &str = "master";
/// Reserved target addressing the system capture (input) endpoint.
pub const INPUT_TARGET: &str = "mic";

/// One mapping entry: a single target name or an ordered list of them.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TargetEntry {
    Single(String),
    Multiple(Vec<String>),
}

/// Ordered mapping from a slider/button index to its target names.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct TargetMapping(BTreeMap<usize, TargetEntry>);

impl TargetMapping {
    /// The default deck layout: slider 0 drives the master output.
    pub fn master_only() -> Self {
        let mut mapping = BTreeMap::new();
        mapping.insert(0, TargetEntry::Single(MASTER_TARGET.to_string()));
        Self(mapping)
    }

    pub fn set(&mut self, index: usize, targets: Vec<String>) {
        self.0.insert(index, TargetEntry::Multiple(targets));
    }

    /// Ordered target names for one index; empty when unmapped.
    pub fn targets_for(&self, index: usize) -> Vec<String> {
        match self.0.get(&index) {
            Some(TargetEntry::Single(name)) => vec![name.clone()],
            Some(TargetEntry::Multiple(names)) => names.clone(),
            None => Vec::new(),
        }
    }

    /// Iterate mapped indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, Vec<String>)> + '_ {
        self.0.keys().map(|&index| (index, self.targets_for(index)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Resolve the sessions a target list addresses within one directory
/// snapshot.
///
/// Matching here is a case-insensitive comparison on the session's display
/// name, with the reserved tokens picking the master endpoints. A volume
/// applier with richer needs (substring matching, aggregation across
/// duplicates) can layer its own policy on top of the raw session list.
pub fn resolve_sessions<'a>(sessions: &'a [Session], targets: &[String]) -> Vec<&'a Session> {
    let mut matched = Vec::new();
    for target in targets {
        let wanted = target.to_lowercase();
        for session in sessions {
            let hit = match session {
                Session::Master { output, .. } => {
                    (*output && wanted == MASTER_TARGET) || (!*output && wanted == INPUT_TARGET)
                }
                Session::Application { name, .. } | Session::Device { name, .. } => {
                    name.to_lowercase() == wanted
                }
            };
            if hit {
                matched.push(session);
            }
        }
    }
    matched
}

/// Read-side volume contract consumed by the HID path.
///
/// Given a control index and its configured targets, implementations return
/// one representative current volume in `[0, 1]`. When nothing matches the
/// targets the answer is 0.0 - a defined neutral, never an error. How
/// multiple matching sessions are aggregated into the one scalar is the
/// implementation's call.
pub trait VolumeSource: Send + Sync {
    fn slider_volume(&self, slider: usize, targets: &[String]) -> f32;
}

/// Neutral volume source used until a real applier is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullVolumeSource;

impl VolumeSource for NullVolumeSource {
    fn slider_volume(&self, _slider: usize, _targets: &[String]) -> f32 {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sessions() -> Vec<Session> {
        vec![
            Session::Master {
                output: true,
                index: 0,
                channels: 2,
            },
            Session::Master {
                output: false,
                index: 1,
                channels: 1,
            },
            Session::Application {
                name: "Firefox".to_string(),
                index: 7,
                channels: 2,
            },
            Session::Application {
                name: "spotify".to_string(),
                index: 9,
                channels: 2,
            },
        ]
    }

    #[test]
    fn master_token_matches_the_output_master() {
        let sessions = sessions();
        let matched = resolve_sessions(&sessions, &["master".to_string()]);

        assert_eq!(matched.len(), 1);
        assert!(matches!(matched[0], Session::Master { output: true, .. }));
    }

    #[test]
    fn mic_token_matches_the_input_master() {
        let sessions = sessions();
        let matched = resolve_sessions(&sessions, &["mic".to_string()]);

        assert_eq!(matched.len(), 1);
        assert!(matches!(matched[0], Session::Master { output: false, .. }));
    }

    #[test]
    fn application_names_match_case_insensitively() {
        let sessions = sessions();
        let matched = resolve_sessions(&sessions, &["firefox".to_string()]);

        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].display_name(), "Firefox");
    }

    #[test]
    fn target_order_drives_result_order() {
        let sessions = sessions();
        let targets = vec!["spotify".to_string(), "master".to_string()];
        let matched = resolve_sessions(&sessions, &targets);

        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].display_name(), "spotify");
        assert!(matches!(matched[1], Session::Master { .. }));
    }

    #[test]
    fn zero_matches_resolve_to_empty() {
        let sessions = sessions();
        assert!(resolve_sessions(&sessions, &["mumble".to_string()]).is_empty());
        assert!(resolve_sessions(&sessions, &[]).is_empty());
    }

    #[test]
    fn null_volume_source_is_neutral() {
        let source = NullVolumeSource;
        assert_eq!(source.slider_volume(3, &["master".to_string()]), 0.0);
    }

    #[test]
    fn mapping_iterates_in_index_order() {
        let mut mapping = TargetMapping::default();
        mapping.set(4, vec!["b".to_string()]);
        mapping.set(1, vec!["a".to_string()]);

        let order: Vec<usize> = mapping.iter().map(|(index, _)| index).collect();
        assert_eq!(order, vec![1, 4]);
    }
}
