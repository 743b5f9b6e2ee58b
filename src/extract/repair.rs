//! Deterministic repair of near-JSON model output.
//!
//! Each pass is a string-aware rewrite: characters inside double-quoted
//! strings are copied through untouched, everything else is offered to the
//! pass. No regex is used.

/// Attempt to turn near-JSON into JSON that `serde_json` accepts.
///
/// Returns `None` when the input already parses or no combination of the
/// repairs produces valid JSON.
///
/// Passes, in order:
/// 1. Single-quoted keys and strings become double-quoted
/// 2. `//` and `/* */` comments are stripped
/// 3. Python `True`/`False`/`None` become `true`/`false`/`null`
/// 4. Bare object keys are quoted
/// 5. Raw newlines, carriage returns and tabs inside strings are escaped
/// 6. Unterminated strings and unclosed brackets are closed
/// 7. Trailing commas before `}` or `]` are removed
pub fn repair_json(broken: &str) -> Option<String> {
    if serde_json::from_str::<serde_json::Value>(broken).is_ok() {
        return None;
    }

    let s = requote_single_quoted(broken);
    let s = strip_comments(&s);
    let s = replace_python_literals(&s);
    let s = quote_bare_keys(&s);
    let s = escape_control_chars_in_strings(&s);
    let s = close_unbalanced(&s);
    let s = remove_trailing_commas(&s);

    serde_json::from_str::<serde_json::Value>(&s)
        .is_ok()
        .then_some(s)
}

/// Copy double-quoted strings verbatim and hand every other position to
/// `visit`, which appends to the output and returns how many chars it consumed.
fn rewrite_outside_strings(
    s: &str,
    mut visit: impl FnMut(&[char], usize, &mut String) -> usize,
) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    let mut in_string = false;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if c == '\\' {
                if let Some(&next) = chars.get(i + 1) {
                    out.push(next);
                    i += 1;
                }
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
        } else if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
        } else {
            i += visit(&chars, i, &mut out).max(1);
        }
    }
    out
}

fn next_non_ws(chars: &[char], from: usize) -> Option<(usize, char)> {
    chars[from.min(chars.len())..]
        .iter()
        .position(|c| !c.is_whitespace())
        .map(|off| (from + off, chars[from + off]))
}

fn prev_non_ws(chars: &[char], before: usize) -> Option<char> {
    chars[..before].iter().rev().find(|c| !c.is_whitespace()).copied()
}

fn requote_single_quoted(s: &str) -> String {
    rewrite_outside_strings(s, |chars, i, out| {
        if chars[i] != '\'' || !matches!(prev_non_ws(chars, i), None | Some('{' | '[' | ':' | ',')) {
            out.push(chars[i]);
            return 1;
        }
        let mut j = i + 1;
        let close = loop {
            match chars.get(j) {
                None => {
                    out.push(chars[i]);
                    return 1;
                }
                Some('\\') => j += 2,
                Some('\'') => break j,
                Some(_) => j += 1,
            }
        };
        if !matches!(next_non_ws(chars, close + 1), None | Some((_, '}' | ']' | ':' | ','))) {
            out.push(chars[i]);
            return 1;
        }

        out.push('"');
        let mut k = i + 1;
        while k < close {
            match chars[k] {
                '\\' if chars.get(k + 1) == Some(&'\'') => {
                    out.push('\'');
                    k += 2;
                    continue;
                }
                '"' => out.push_str("\\\""),
                c => out.push(c),
            }
            k += 1;
        }
        out.push('"');
        close + 1 - i
    })
}

fn strip_comments(s: &str) -> String {
    rewrite_outside_strings(s, |chars, i, out| {
        match (chars[i], chars.get(i + 1)) {
            ('/', Some('/')) => chars[i..]
                .iter()
                .position(|&c| c == '\n')
                .unwrap_or(chars.len() - i),
            ('/', Some('*')) => {
                let body = &chars[i + 2..];
                match body.windows(2).position(|w| w[0] == '*' && w[1] == '/') {
                    Some(end) => end + 4,
                    None => chars.len() - i,
                }
            }
            (c, _) => {
                out.push(c);
                1
            }
        }
    })
}

fn replace_python_literals(s: &str) -> String {
    const LITERALS: [(&str, &str); 3] = [("True", "true"), ("False", "false"), ("None", "null")];

    rewrite_outside_strings(s, |chars, i, out| {
        let boundary_before = i == 0 || !is_ident_char(chars[i - 1]);
        if boundary_before {
            for (from, to) in LITERALS {
                let len = from.chars().count();
                let matches_word = chars.len() >= i + len
                    && chars[i..i + len].iter().copied().eq(from.chars())
                    && chars.get(i + len).map_or(true, |c| !is_ident_char(*c));
                if matches_word {
                    out.push_str(to);
                    return len;
                }
            }
        }
        out.push(chars[i]);
        1
    })
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn quote_bare_keys(s: &str) -> String {
    rewrite_outside_strings(s, |chars, i, out| {
        let c = chars[i];
        out.push(c);
        if c != '{' && c != ',' {
            return 1;
        }
        let Some((start, first)) = next_non_ws(chars, i + 1) else {
            return 1;
        };
        if !(first.is_alphabetic() || first == '_') {
            return 1;
        }
        let end = chars[start..]
            .iter()
            .position(|c| !is_ident_char(*c))
            .map_or(chars.len(), |off| start + off);
        if !matches!(next_non_ws(chars, end), Some((_, ':'))) {
            return 1;
        }
        out.extend(&chars[i + 1..start]);
        out.push('"');
        out.extend(&chars[start..end]);
        out.push('"');
        end - i
    })
}

fn escape_control_chars_in_strings(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;

    for c in s.chars() {
        if !in_string {
            in_string = c == '"';
            out.push(c);
            continue;
        }
        if escaped {
            escaped = false;
            out.push(c);
            continue;
        }
        match c {
            '\\' => {
                escaped = true;
                out.push(c);
            }
            '"' => {
                in_string = false;
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

/// Close an unterminated string, then any brackets still open, innermost first.
fn close_unbalanced(s: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in s.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let mut out = s.trim_end().to_string();
    if in_string {
        out.push('"');
    }
    while let Some(close) = stack.pop() {
        out.push(close);
    }
    out
}

fn remove_trailing_commas(s: &str) -> String {
    rewrite_outside_strings(s, |chars, i, out| {
        if chars[i] == ',' && matches!(next_non_ws(chars, i + 1), Some((_, '}' | ']'))) {
            return 1;
        }
        out.push(chars[i]);
        1
    })
}
