//! Splitting a `.v` script into the sentences sent with `Add`.

/// One sentence and its byte range in the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    pub text: String,
    pub start: usize,
    pub end: usize,
}

/// Split `source` into sentences.
///
/// A sentence ends at a `.` followed by whitespace or end of input, outside
/// comments (which nest) and string literals. Bullets (`-`, `+`, `*` and
/// repetitions) and braces at the start of a sentence are sentences of their
/// own. Trailing text without a terminator is dropped.
pub fn split_sentences(source: &str) -> Vec<Sentence> {
    let bytes = source.as_bytes();
    let mut sentences = Vec::new();
    let mut pos = 0;

    loop {
        pos = skip_blank(bytes, pos);
        if pos >= bytes.len() {
            break;
        }
        let start = pos;
        let end = match bullet_end(bytes, pos) {
            Some(end) => end,
            None => match sentence_end(bytes, pos) {
                Some(end) => end,
                None => break,
            },
        };
        sentences.push(Sentence {
            text: source[start..end].to_string(),
            start,
            end,
        });
        pos = end;
    }
    sentences
}

/// Skip whitespace and comments.
fn skip_blank(bytes: &[u8], mut pos: usize) -> usize {
    loop {
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if bytes[pos..].starts_with(b"(*") {
            pos = skip_comment(bytes, pos);
        } else {
            return pos;
        }
    }
}

/// Position after the comment opening at `pos`, or end of input if unclosed.
fn skip_comment(bytes: &[u8], mut pos: usize) -> usize {
    let mut depth = 0usize;
    while pos < bytes.len() {
        if bytes[pos..].starts_with(b"(*") {
            depth += 1;
            pos += 2;
        } else if bytes[pos..].starts_with(b"*)") {
            depth -= 1;
            pos += 2;
            if depth == 0 {
                return pos;
            }
        } else if bytes[pos] == b'"' {
            pos = skip_string(bytes, pos);
        } else {
            pos += 1;
        }
    }
    bytes.len()
}

/// Position after the string literal opening at `pos`. `""` is an escaped quote.
fn skip_string(bytes: &[u8], mut pos: usize) -> usize {
    pos += 1;
    while pos < bytes.len() {
        if bytes[pos] == b'"' {
            if bytes.get(pos + 1) == Some(&b'"') {
                pos += 2;
                continue;
            }
            return pos + 1;
        }
        pos += 1;
    }
    bytes.len()
}

fn bullet_end(bytes: &[u8], pos: usize) -> Option<usize> {
    match bytes[pos] {
        b'{' | b'}' => Some(pos + 1),
        c @ (b'-' | b'+' | b'*') => {
            let mut end = pos;
            while end < bytes.len() && bytes[end] == c {
                end += 1;
            }
            match bytes.get(end) {
                None => Some(end),
                Some(next) if next.is_ascii_whitespace() => Some(end),
                _ => None,
            }
        }
        _ => None,
    }
}

fn sentence_end(bytes: &[u8], mut pos: usize) -> Option<usize> {
    while pos < bytes.len() {
        if bytes[pos..].starts_with(b"(*") {
            pos = skip_comment(bytes, pos);
            continue;
        }
        match bytes[pos] {
            b'"' => pos = skip_string(bytes, pos),
            b'.' => {
                let next = bytes.get(pos + 1);
                if next.map_or(true, |c| c.is_ascii_whitespace()) {
                    return Some(pos + 1);
                }
                // `..` is part of a token (e.g. ellipsis); skip both dots.
                pos += if next == Some(&b'.') { 2 } else { 1 };
            }
            _ => pos += 1,
        }
    }
    None
}
