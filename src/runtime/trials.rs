//! Cue-sequence-to-trial-length decomposition.
//!
//! The renderer reports the virtual track as a flat sequence of integer cue
//! codes. Behavioral metrics need trial boundaries — the cumulative distance
//! at which each trial ends — which are recovered by greedy longest-match
//! against the known per-cue-combination trial templates of the experiment
//! configuration. A sequence that cannot be fully decomposed is an error:
//! partially matched sequences are never silently truncated.

use crate::config::TrialTemplate;
use crate::error::{AppResult, VrError};

/// Decomposes a flat cue sequence into cumulative trial-end distances.
///
/// At every position the longest template matching the remaining sequence is
/// consumed. Returns one cumulative distance (in centimeters) per recovered
/// trial, in track order.
pub fn decompose_trials(cues: &[u8], templates: &[TrialTemplate]) -> AppResult<Vec<f64>> {
    if templates.is_empty() {
        return Err(VrError::CueDecomposition(
            "no trial templates configured".into(),
        ));
    }

    // Longest templates first so each match is the greedy longest one.
    let mut ordered: Vec<&TrialTemplate> = templates.iter().collect();
    ordered.sort_by(|a, b| b.cues.len().cmp(&a.cues.len()));

    let mut boundaries = Vec::new();
    let mut cumulative_cm = 0.0;
    let mut position = 0;
    while position < cues.len() {
        let remaining = &cues[position..];
        let matched = ordered
            .iter()
            .find(|template| remaining.starts_with(&template.cues));
        match matched {
            Some(template) => {
                cumulative_cm += template.length_cm;
                boundaries.push(cumulative_cm);
                position += template.cues.len();
            }
            None => {
                return Err(VrError::CueDecomposition(format!(
                    "no template matches the cue sequence at offset {position} \
                     (next cues: {:?})",
                    &remaining[..remaining.len().min(8)]
                )));
            }
        }
    }
    Ok(boundaries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn templates() -> Vec<TrialTemplate> {
        vec![
            TrialTemplate {
                cues: vec![1, 1, 2],
                length_cm: 10.0,
            },
            TrialTemplate {
                cues: vec![3, 1, 2],
                length_cm: 15.0,
            },
        ]
    }

    #[test]
    fn test_reference_sequence_decomposes() {
        let boundaries = decompose_trials(&[1, 1, 2, 3, 1, 2], &templates()).expect("decomposes");
        assert_eq!(boundaries, vec![10.0, 25.0]);
    }

    #[test]
    fn test_unmatched_sequence_is_an_error() {
        let result = decompose_trials(&[1, 2, 2], &templates());
        assert!(matches!(result, Err(VrError::CueDecomposition(_))));
    }

    #[test]
    fn test_partial_tail_is_never_truncated() {
        // The head matches but the tail cannot; the whole sequence fails.
        let result = decompose_trials(&[1, 1, 2, 9], &templates());
        assert!(matches!(result, Err(VrError::CueDecomposition(_))));
    }

    #[test]
    fn test_longest_template_wins() {
        let templates = vec![
            TrialTemplate {
                cues: vec![1],
                length_cm: 1.0,
            },
            TrialTemplate {
                cues: vec![1, 1],
                length_cm: 5.0,
            },
        ];
        let boundaries = decompose_trials(&[1, 1, 1], &templates).expect("decomposes");
        // Greedy longest-match: [1,1] then [1].
        assert_eq!(boundaries, vec![5.0, 6.0]);
    }

    #[test]
    fn test_empty_sequence_yields_no_trials() {
        let boundaries = decompose_trials(&[], &templates()).expect("empty is fine");
        assert!(boundaries.is_empty());
    }
}
