//! Unit tests for move-detection heuristics

use pushwork::config::MoveThresholds;
use pushwork::moves::{detect_moves, similarity, DetectedMove, MoveDecision, MoveSide};
use pushwork::tree::FileContent;

/// Helper to build a text side for testing
fn text_side(key: &str, content: &str) -> MoveSide {
    MoveSide {
        key: key.to_string(),
        content: FileContent::Text(content.to_string()),
    }
}

/// Helper to build a binary side for testing
fn binary_side(key: &str, content: Vec<u8>) -> MoveSide {
    MoveSide { key: key.to_string(), content: FileContent::Binary(content) }
}

fn run(deleted: Vec<MoveSide>, created: Vec<MoveSide>) -> Vec<DetectedMove> {
    detect_moves(&deleted, &created, &MoveThresholds::default())
}

#[test]
fn test_simple_move_detection() {
    let moves = run(
        vec![text_side("old_name.txt", "file content")],
        vec![text_side("new_name.txt", "file content")],
    );

    assert_eq!(moves.len(), 1, "Should detect one move");
    assert_eq!(moves[0].from, "old_name.txt");
    assert_eq!(moves[0].to, "new_name.txt");
    assert_eq!(moves[0].decision, MoveDecision::Auto);
    assert_eq!(moves[0].score, 1.0);
}

#[test]
fn test_no_move_when_content_differs() {
    let moves = run(
        vec![text_side("file_old.txt", "the old content of one file")],
        vec![text_side("file.txt", "totally unrelated new words!!")],
    );

    assert!(moves.is_empty(), "Unrelated content should not pair");
}

#[test]
fn test_move_across_directories() {
    let moves = run(
        vec![text_side("old_location/document.pdf", "PDF content")],
        vec![text_side("subdir/document.pdf", "PDF content")],
    );

    assert_eq!(moves.len(), 1, "Should detect move across directories");
}

#[test]
fn test_multiple_moves() {
    let moves = run(
        vec![
            text_side("doc1_old.txt", "content one, distinct"),
            text_side("doc2_old.txt", "content two, another"),
            text_side("doc3_old.txt", "content three, a third"),
        ],
        vec![
            text_side("doc1_new.txt", "content one, distinct"),
            text_side("doc2_new.txt", "content two, another"),
            text_side("doc3_new.txt", "content three, a third"),
        ],
    );

    assert_eq!(moves.len(), 3, "Should pair all three moves");
    for mv in &moves {
        assert_eq!(mv.from.replace("_old", ""), mv.to.replace("_new", ""));
    }
}

#[test]
fn test_ambiguous_duplicates_use_path_distance() {
    // Two deletions with identical content, one creation: the pairing
    // must pick the closer path and leave the other a plain deletion.
    let moves = run(
        vec![
            text_side("assets/logo.png.txt", "same bytes either way"),
            text_side("zz/unrelated_name.txt", "same bytes either way"),
        ],
        vec![text_side("assets/img/logo.png.txt", "same bytes either way")],
    );

    assert_eq!(moves.len(), 1);
    assert_eq!(moves[0].from, "assets/logo.png.txt");
}

#[test]
fn test_size_gate_rejects_growth_beyond_half() {
    let small = "1234567890";
    let large = "1234567890".repeat(4);
    let moves = run(
        vec![text_side("small.txt", small)],
        vec![text_side("large.txt", &large)],
    );

    assert!(moves.is_empty(), "4x growth can never be a move");
}

#[test]
fn test_empty_files_pair() {
    let moves = run(
        vec![text_side("empty_old.txt", "")],
        vec![text_side("empty_new.txt", "")],
    );

    assert_eq!(moves.len(), 1, "Empty files hash-match");
    assert_eq!(moves[0].decision, MoveDecision::Auto);
}

#[test]
fn test_binary_move_detection() {
    let payload: Vec<u8> = (0u8..=255).cycle().take(2048).collect();
    let moves = run(
        vec![binary_side("blob_old.bin", payload.clone())],
        vec![binary_side("blob_new.bin", payload)],
    );

    assert_eq!(moves.len(), 1, "Identical binaries pair");
    assert_eq!(moves[0].score, 1.0);
}

#[test]
fn test_large_file_windowed_similarity() {
    // 64 KiB with a single small edit near the front
    let base: String = "0123456789abcdef".repeat(4096);
    let mut edited = base.clone();
    edited.replace_range(100..104, "EDIT");

    let score = similarity(
        &FileContent::Text(base),
        &FileContent::Text(edited),
    );
    assert!(score > 0.9, "one edit in 64 KiB: {score}");
}

#[test]
fn test_borderline_edit_prompts_not_auto() {
    let original = "alpha beta gamma delta epsilon zeta";
    let heavily_edited = "alpha BETA! gamma DELTA! epsiXXX zeta";
    let moves = run(
        vec![text_side("a.txt", original)],
        vec![text_side("b.txt", heavily_edited)],
    );

    if let Some(mv) = moves.first() {
        assert!(
            mv.decision == MoveDecision::Prompt || mv.score >= 0.8,
            "borderline pairs must not silently auto-apply: {}",
            mv.score
        );
    }
}

#[test]
fn test_unicode_paths() {
    let moves = run(
        vec![text_side("文档_old.txt", "content")],
        vec![text_side("文档_new.txt", "content")],
    );

    assert_eq!(moves.len(), 1, "Should handle unicode path keys");
}

#[test]
fn test_empty_inputs_yield_no_moves() {
    assert!(run(vec![], vec![]).is_empty());
    assert!(run(vec![text_side("a.txt", "x")], vec![]).is_empty());
    assert!(run(vec![], vec![text_side("b.txt", "y")]).is_empty());
}
