//! Subtitle post-processing: turn srt/vtt payloads into plain text when a
//! caller asked for a text result. Applying the conversion to already-plain
//! text is a no-op, so the pass is safe to run twice.

/// Strip subtitle scaffolding (WEBVTT header, cue index numbers, timestamp
/// lines, NOTE blocks) and collapse what remains into paragraph text.
pub fn subtitles_to_text(input: &str) -> String {
    let raw_lines: Vec<&str> = input.lines().map(str::trim).collect();
    let mut lines = Vec::new();
    let mut in_note = false;

    for (i, &line) in raw_lines.iter().enumerate() {
        if line.is_empty() {
            in_note = false;
            continue;
        }
        if in_note {
            continue;
        }
        if line.eq_ignore_ascii_case("webvtt") || line.to_ascii_lowercase().starts_with("webvtt ") {
            continue;
        }
        if line.starts_with("NOTE") {
            in_note = true;
            continue;
        }
        if is_timestamp_line(line) {
            continue;
        }
        // A digits-only line is a cue counter only when a timing line follows;
        // a spoken "42" stays in the transcript.
        if is_cue_index(line)
            && raw_lines
                .get(i + 1)
                .is_some_and(|next| is_timestamp_line(next))
        {
            continue;
        }
        lines.push(strip_cue_tags(line));
    }

    lines.join("\n")
}

/// A bare cue counter: digits only.
fn is_cue_index(line: &str) -> bool {
    !line.is_empty() && line.bytes().all(|b| b.is_ascii_digit())
}

/// A timing line: "00:00:01,000 --> 00:00:04,000" (srt) or
/// "00:01.000 --> 00:04.000 align:start" (vtt).
fn is_timestamp_line(line: &str) -> bool {
    line.contains("-->")
}

/// Drop inline vtt voice/class tags like `<v Speaker>` or `<c.loud>`.
fn strip_cue_tags(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_tag = false;
    for ch in line.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out.trim().to_string()
}
