/// Fallback base used when a name slugifies to nothing (e.g. "!!!").
pub const EMPTY_SLUG_FALLBACK: &str = "location";

/// Lowercase comparison form of a free-text location label.
///
/// Normalization steps:
/// - lowercase
/// - drop every character outside `[a-z0-9 ]` (any whitespace counts as a space)
/// - collapse whitespace runs and trim
pub fn normalize(text: &str) -> String {
    collapse(text.to_lowercase().chars().filter_map(|c| {
        if c.is_whitespace() {
            Some(' ')
        } else if c.is_ascii_lowercase() || c.is_ascii_digit() {
            Some(c)
        } else {
            None
        }
    }))
}

/// URL-safe slug: `[a-z0-9]` words joined by single hyphens.
///
/// Hyphens and underscores in the input separate words, which keeps the
/// function idempotent: `slugify(slugify(x)) == slugify(x)`.
pub fn slugify(text: &str) -> String {
    let spaced: String = text
        .chars()
        .map(|c| if c == '-' || c == '_' { ' ' } else { c })
        .collect();
    let mut out = String::with_capacity(spaced.len());
    for ch in normalize(&spaced).chars() {
        let ch = if ch == ' ' { '-' } else { ch };
        if ch == '-' && (out.is_empty() || out.ends_with('-')) {
            continue;
        }
        out.push(ch);
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// `base` for the first candidate, `base-n` for later ones.
pub fn slug_with_suffix(base: &str, n: usize) -> String {
    let base = if base.is_empty() {
        EMPTY_SLUG_FALLBACK
    } else {
        base
    };
    if n <= 1 {
        base.to_string()
    } else {
        format!("{base}-{n}")
    }
}

fn collapse(chars: impl Iterator<Item = char>) -> String {
    let mut out = String::new();
    let mut pending_space = false;
    for c in chars {
        if c == ' ' {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(c);
    }
    out
}
