//! Move detection.
//!
//! Pairs locally-deleted paths with locally-created paths by content
//! similarity so a rename travels as a rename, keeping the file
//! document's id and history, instead of as a delete plus create.
//!
//! The heuristic is scored, not exact: thresholds decide whether a pair
//! applies automatically, prompts the user, or stays a delete + create.

use std::collections::HashSet;

use crate::config::MoveThresholds;
use crate::tree::FileContent;

/// Full-similarity cutoff; larger contents are sampled by windows.
const FULL_COMPARE_MAX: usize = 4 * 1024;

/// Sample window length for large contents.
const WINDOW_LEN: usize = 1024;

/// How a scored pair should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDecision {
    /// Confident: apply as a move.
    Auto,
    /// Plausible: ask the user; default to no when non-interactive.
    Prompt,
}

/// One endpoint of a potential move, content already loaded.
#[derive(Debug, Clone)]
pub struct MoveSide {
    pub key: String,
    pub content: FileContent,
}

/// A paired move above the prompt threshold.
#[derive(Debug, Clone)]
pub struct DetectedMove {
    pub from: String,
    pub to: String,
    pub score: f64,
    pub decision: MoveDecision,
}

/// Similarity score in `[0, 1]` between two contents.
///
/// Hash-equal contents score 1.0. Small contents get a full normalized
/// edit distance; large contents are sampled at three windows (first,
/// middle, last) whose similarities are averaged.
pub fn similarity(a: &FileContent, b: &FileContent) -> f64 {
    if a.hash() == b.hash() {
        return 1.0;
    }

    let textual = a.is_text() && b.is_text();
    if a.len() <= FULL_COMPARE_MAX && b.len() <= FULL_COMPARE_MAX {
        return chunk_similarity(a.as_bytes(), b.as_bytes(), textual);
    }

    let windows_a = sample_windows(a.as_bytes());
    let windows_b = sample_windows(b.as_bytes());
    let total: f64 = windows_a
        .iter()
        .zip(windows_b.iter())
        .map(|(wa, wb)| chunk_similarity(wa, wb, textual))
        .sum();
    total / windows_a.len() as f64
}

/// First, middle, and last windows of `bytes`.
fn sample_windows(bytes: &[u8]) -> [&[u8]; 3] {
    let len = bytes.len();
    if len <= WINDOW_LEN {
        return [bytes, bytes, bytes];
    }
    let mid_start = (len - WINDOW_LEN) / 2;
    [
        &bytes[..WINDOW_LEN],
        &bytes[mid_start..mid_start + WINDOW_LEN],
        &bytes[len - WINDOW_LEN..],
    ]
}

/// `1 - lev(a, b) / max(|a|, |b|)` over the chunk, hex-encoding binary
/// data so the edit distance runs on text either way.
fn chunk_similarity(a: &[u8], b: &[u8], textual: bool) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if textual {
        let a = String::from_utf8_lossy(a);
        let b = String::from_utf8_lossy(b);
        strsim::normalized_levenshtein(&a, &b)
    } else {
        strsim::normalized_levenshtein(&hex::encode(a), &hex::encode(b))
    }
}

/// Sizes differing by more than half of the larger side cannot be the
/// same file moved.
fn sizes_compatible(a: usize, b: usize) -> bool {
    let max = a.max(b);
    if max == 0 {
        return true;
    }
    let diff = a.abs_diff(b);
    diff * 2 <= max
}

/// Pair deletions with creations.
///
/// Candidates are ranked by descending score, ties broken by the edit
/// distance between the two paths, then by destination path order.
/// Pairing is greedy: a pair is accepted only while both endpoints are
/// unconsumed. Pairs below the prompt threshold are not moves.
pub fn detect_moves(
    deleted: &[MoveSide],
    created: &[MoveSide],
    thresholds: &MoveThresholds,
) -> Vec<DetectedMove> {
    struct Candidate {
        from_idx: usize,
        to_idx: usize,
        score: f64,
        path_distance: usize,
    }

    let mut candidates = Vec::new();
    for (from_idx, from) in deleted.iter().enumerate() {
        for (to_idx, to) in created.iter().enumerate() {
            if !sizes_compatible(from.content.len(), to.content.len()) {
                continue;
            }
            let score = similarity(&from.content, &to.content);
            if score < thresholds.prompt {
                continue;
            }
            candidates.push(Candidate {
                from_idx,
                to_idx,
                score,
                path_distance: strsim::levenshtein(&from.key, &to.key),
            });
        }
    }

    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.path_distance.cmp(&b.path_distance))
            .then(created[a.to_idx].key.cmp(&created[b.to_idx].key))
    });

    let mut used_from: HashSet<usize> = HashSet::new();
    let mut used_to: HashSet<usize> = HashSet::new();
    let mut moves = Vec::new();

    for c in candidates {
        if used_from.contains(&c.from_idx) || used_to.contains(&c.to_idx) {
            continue;
        }
        used_from.insert(c.from_idx);
        used_to.insert(c.to_idx);
        moves.push(DetectedMove {
            from: deleted[c.from_idx].key.clone(),
            to: created[c.to_idx].key.clone(),
            score: c.score,
            decision: if c.score >= thresholds.auto {
                MoveDecision::Auto
            } else {
                MoveDecision::Prompt
            },
        });
    }

    moves
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(key: &str, content: &str) -> MoveSide {
        MoveSide {
            key: key.to_string(),
            content: FileContent::Text(content.to_string()),
        }
    }

    fn thresholds() -> MoveThresholds {
        MoveThresholds::default()
    }

    #[test]
    fn test_identical_content_scores_one() {
        let a = FileContent::Text("same".into());
        let b = FileContent::Text("same".into());
        assert_eq!(similarity(&a, &b), 1.0);
    }

    #[test]
    fn test_binary_similarity_uses_hex() {
        let a = FileContent::Binary(vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let b = FileContent::Binary(vec![1, 2, 3, 4, 5, 6, 7, 9]);
        let score = similarity(&a, &b);
        assert!(score > 0.8, "near-identical bytes should score high: {score}");
    }

    #[test]
    fn test_large_content_sampled_by_windows() {
        let base: String = "abcdefgh".repeat(1024);
        let mut edited = base.clone();
        edited.replace_range(10..14, "XXXX");

        let a = FileContent::Text(base);
        let b = FileContent::Text(edited);
        let score = similarity(&a, &b);
        assert!(score > 0.9, "one small edit in 8 KiB: {score}");
    }

    #[test]
    fn test_size_filter() {
        assert!(sizes_compatible(100, 140));
        assert!(sizes_compatible(0, 0));
        assert!(!sizes_compatible(100, 300));
        assert!(!sizes_compatible(10, 0));
    }

    #[test]
    fn test_exact_rename_detected_as_auto() {
        let moves = detect_moves(
            &[text("old/name.txt", "the same content")],
            &[text("new/name.txt", "the same content")],
            &thresholds(),
        );
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].from, "old/name.txt");
        assert_eq!(moves[0].to, "new/name.txt");
        assert_eq!(moves[0].decision, MoveDecision::Auto);
    }

    #[test]
    fn test_unrelated_content_not_paired() {
        let moves = detect_moves(
            &[text("a.txt", "completely different words here")],
            &[text("b.txt", "zzzz qqqq xxxx yyyy 1234 5678")],
            &thresholds(),
        );
        assert!(moves.is_empty());
    }

    #[test]
    fn test_edited_rename_prompts() {
        let original = "line one\nline two\nline three\nline four\n";
        let edited = "line 1!\nline 2!\nline 3!\nline four\n";
        let moves = detect_moves(
            &[text("notes.txt", original)],
            &[text("renamed.txt", edited)],
            &thresholds(),
        );
        assert_eq!(moves.len(), 1);
        let score = moves[0].score;
        assert!(score >= 0.5 && score < 0.8, "borderline edit: {score}");
        assert_eq!(moves[0].decision, MoveDecision::Prompt);
    }

    #[test]
    fn test_greedy_pairing_consumes_endpoints() {
        // Two deletions, one matching creation: best pair wins, the
        // other deletion stays a deletion.
        let moves = detect_moves(
            &[
                text("a.txt", "shared content body"),
                text("b.txt", "shared content body"),
            ],
            &[text("moved/a.txt", "shared content body")],
            &thresholds(),
        );
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].from, "a.txt", "tie broken by path distance");
    }

    #[test]
    fn test_tie_broken_by_destination_order() {
        // Same score and same path distance: lexicographic destination
        let moves = detect_moves(
            &[text("x.txt", "payload")],
            &[text("b.txt", "payload"), text("a.txt", "payload")],
            &thresholds(),
        );
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].to, "a.txt");
    }

    #[test]
    fn test_empty_inputs() {
        assert!(detect_moves(&[], &[], &thresholds()).is_empty());
        assert!(detect_moves(&[text("a", "x")], &[], &thresholds()).is_empty());
    }
}
