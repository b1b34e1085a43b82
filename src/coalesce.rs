//! Reduction of upstream text deltas to monotonic increments.
//!
//! Upstreams interleave true increments with duplicates (the same delta
//! re-sent under another event type) and cumulative snapshots ("all text so
//! far"). Clients append whatever arrives, so each incoming payload is
//! reduced against a rolling window of already-emitted text and only the
//! unseen suffix goes out.

/// Sliding window kept per stream; large enough for any realistic overlap.
pub const EMITTED_WINDOW_BYTES: usize = 256 * 1024;

/// Returns the portion of `incoming` that has not been emitted yet.
///
/// Cases, checked in order: exact duplicate (empty result), snapshot
/// (`incoming` extends `emitted`), partial overlap (longest suffix of
/// `emitted` matching a prefix of `incoming`), and disjoint (`incoming`
/// verbatim).
pub fn incremental_suffix<'a>(emitted: &str, incoming: &'a str) -> &'a str {
    if incoming.is_empty() || emitted.is_empty() {
        return incoming;
    }
    if emitted.ends_with(incoming) {
        return "";
    }
    if let Some(rest) = incoming.strip_prefix(emitted) {
        return rest;
    }
    let max = emitted.len().min(incoming.len());
    for k in (1..=max).rev() {
        if !emitted.is_char_boundary(emitted.len() - k) || !incoming.is_char_boundary(k) {
            continue;
        }
        if emitted.as_bytes()[emitted.len() - k..] == incoming.as_bytes()[..k] {
            return &incoming[k..];
        }
    }
    incoming
}

/// Appends newly emitted text and left-truncates the window to its bound,
/// keeping the cut on a char boundary.
pub fn push_emitted(emitted: &mut String, chunk: &str) {
    emitted.push_str(chunk);
    if emitted.len() > EMITTED_WINDOW_BYTES {
        let mut cut = emitted.len() - EMITTED_WINDOW_BYTES;
        while !emitted.is_char_boundary(cut) {
            cut += 1;
        }
        emitted.drain(..cut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_duplicate_emits_nothing() {
        assert_eq!(incremental_suffix("Expl", "Expl"), "");
        assert_eq!(incremental_suffix("hello world", "world"), "");
    }

    #[test]
    fn snapshot_emits_only_the_extension() {
        assert_eq!(incremental_suffix("Expl", "Exploring"), "oring");
    }

    #[test]
    fn overlap_emits_past_the_longest_match() {
        assert_eq!(incremental_suffix("Exploring", "ing Terminal"), " Terminal");
        assert_eq!(incremental_suffix("abcabc", "abcx"), "x");
    }

    #[test]
    fn disjoint_emits_verbatim() {
        assert_eq!(incremental_suffix("hello", "world"), "world");
    }

    #[test]
    fn empty_inputs() {
        assert_eq!(incremental_suffix("", "fresh"), "fresh");
        assert_eq!(incremental_suffix("seen", ""), "");
    }

    #[test]
    fn multibyte_overlaps_stay_on_char_boundaries() {
        assert_eq!(incremental_suffix("héllo", "éllo wörld"), " wörld");
        assert_eq!(incremental_suffix("日本", "日本語"), "語");
    }

    #[test]
    fn window_is_bounded() {
        let mut emitted = String::new();
        push_emitted(&mut emitted, &"a".repeat(EMITTED_WINDOW_BYTES));
        push_emitted(&mut emitted, &"b".repeat(64 * 1024));
        assert_eq!(emitted.len(), EMITTED_WINDOW_BYTES);
        assert!(emitted.ends_with('b'));
    }

    #[test]
    fn overlap_detection_survives_truncation() {
        let mut emitted = String::new();
        push_emitted(&mut emitted, &"x".repeat(EMITTED_WINDOW_BYTES));
        push_emitted(&mut emitted, "the tail");
        assert_eq!(incremental_suffix(&emitted, "tail continues"), " continues");
    }

    #[test]
    fn feeding_the_same_delta_twice_is_idempotent() {
        let mut emitted = String::new();
        let first = incremental_suffix(&emitted, "token").to_string();
        push_emitted(&mut emitted, &first);
        let second = incremental_suffix(&emitted, "token");
        assert_eq!(first, "token");
        assert_eq!(second, "");
    }
}
