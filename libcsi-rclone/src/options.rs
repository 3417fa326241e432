//! Mount option strings: tokenizing and merging.
//!
//! Users tune the mount bridge with a free-form, shell-quoted option string
//! (e.g. `--vfs-cache-mode=full "--user-agent=my agent"`).  [`parse`] splits
//! such a string into tokens and [`merge`] folds the tokens into a backend's
//! default argument list.

/// Split a raw option string into tokens using shell-like quoting.
///
/// A token is a maximal run of non-whitespace characters.  A double-quoted
/// span is part of the surrounding token even if it contains whitespace; the
/// quotes are removed and `\"` inside the span becomes a literal `"`.
///
/// An opening quote without a matching closing quote is kept as a literal
/// character and the rest of the input is tokenized as if unquoted.
pub fn parse(options: &str) -> Vec<String> {
    let chars: Vec<char> = options.chars().collect();
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            if in_token {
                tokens.push(std::mem::take(&mut current));
                in_token = false;
            }
            i += 1;
            continue;
        }

        in_token = true;
        if c == '"'
            && let Some(end) = closing_quote(&chars, i + 1)
        {
            let mut j = i + 1;
            while j < end {
                if chars[j] == '\\' && chars.get(j + 1) == Some(&'"') {
                    current.push('"');
                    j += 2;
                } else {
                    current.push(chars[j]);
                    j += 1;
                }
            }
            i = end + 1;
            continue;
        }

        current.push(c);
        i += 1;
    }

    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Index of the first unescaped `"` at or after `from`.
fn closing_quote(chars: &[char], from: usize) -> Option<usize> {
    let mut j = from;
    while j < chars.len() {
        match chars[j] {
            '\\' if chars.get(j + 1) == Some(&'"') => j += 2,
            '"' => return Some(j),
            _ => j += 1,
        }
    }
    None
}

/// Key of a `key=value` token, or `None` for a bare flag.
fn option_key(token: &str) -> Option<&str> {
    token.split_once('=').map(|(key, _)| key)
}

/// Merge user-supplied `extra` tokens into the `base` argument list.
///
/// * An `extra` `key=value` token replaces, in place, the first `base` token
///   with the same key.
/// * `extra` `key=value` tokens whose key is absent from `base` are appended
///   after the base tokens, in the order they were supplied.
/// * `extra` bare flags are appended last, in the order they were supplied.
///
/// When `extra` repeats a key, the last value wins and the key keeps the
/// position of its first occurrence.
pub fn merge<B, E>(base: &[B], extra: &[E]) -> Vec<String>
where
    B: AsRef<str>,
    E: AsRef<str>,
{
    let mut keyed: Vec<(&str, &str, bool)> = Vec::new();
    let mut flags: Vec<&str> = Vec::new();
    for token in extra.iter().map(AsRef::as_ref) {
        match option_key(token) {
            Some(key) => match keyed.iter_mut().find(|(k, _, _)| *k == key) {
                Some(entry) => entry.1 = token,
                None => keyed.push((key, token, false)),
            },
            None => flags.push(token),
        }
    }

    let mut args: Vec<String> = Vec::with_capacity(base.len() + extra.len());
    for token in base.iter().map(AsRef::as_ref) {
        let replacement = option_key(token).and_then(|key| {
            keyed
                .iter_mut()
                .find(|(k, _, used)| *k == key && !*used)
                .map(|entry| {
                    entry.2 = true;
                    entry.1
                })
        });
        args.push(replacement.unwrap_or(token).to_owned());
    }

    args.extend(
        keyed
            .iter()
            .filter(|(_, _, used)| !*used)
            .map(|(_, token, _)| (*token).to_owned()),
    );
    args.extend(flags.into_iter().map(str::to_owned));
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_has_no_tokens() {
        assert!(parse("").is_empty());
        assert!(parse("   \t ").is_empty());
    }

    #[test]
    fn splits_on_whitespace() {
        assert_eq!(
            parse("--allow-other  --vfs-cache-mode=full\t-v"),
            vec!["--allow-other", "--vfs-cache-mode=full", "-v"]
        );
    }

    #[test]
    fn quoted_span_stays_in_one_token() {
        assert_eq!(parse(r#""--opt=a b" --flag"#), vec!["--opt=a b", "--flag"]);
        assert_eq!(
            parse(r#"--user-agent="my agent" -v"#),
            vec!["--user-agent=my agent", "-v"]
        );
    }

    #[test]
    fn escaped_quote_inside_span() {
        assert_eq!(parse(r#""--x=say \"hi\"""#), vec![r#"--x=say "hi""#]);
    }

    #[test]
    fn empty_quoted_span() {
        assert_eq!(parse(r#"--opt="" """#), vec!["--opt=", ""]);
    }

    #[test]
    fn unbalanced_quote_is_literal() {
        assert_eq!(parse(r#"--a="b c"#), vec![r#"--a="b"#, "c"]);
    }

    #[test]
    fn merge_overrides_in_place_and_appends() {
        let base = ["--vfs-cache-mode=writes", "--allow-other"];
        let extra = ["--vfs-cache-mode=full", "--timeout=1h"];
        assert_eq!(
            merge(&base, &extra),
            vec!["--vfs-cache-mode=full", "--allow-other", "--timeout=1h"]
        );
    }

    #[test]
    fn merge_appends_flags_after_additions() {
        let base = ["mount", ":s3:bucket", "--daemon"];
        let extra = ["-v", "--b=2", "--read-only", "--a=1"];
        assert_eq!(
            merge(&base, &extra),
            vec!["mount", ":s3:bucket", "--daemon", "--b=2", "--a=1", "-v", "--read-only"]
        );
    }

    #[test]
    fn merge_last_duplicate_key_wins() {
        let base = ["--x=1", "--y=1"];
        let extra = ["--z=1", "--x=2", "--z=3", "--x=4"];
        assert_eq!(merge(&base, &extra), vec!["--x=4", "--y=1", "--z=3"]);
    }

    #[test]
    fn merge_replaces_only_first_base_occurrence() {
        let base = ["--x=1", "--x=2"];
        let extra = ["--x=3"];
        assert_eq!(merge(&base, &extra), vec!["--x=3", "--x=2"]);
    }

    #[test]
    fn merge_with_empty_extra_is_identity() {
        let base = ["mount", "--a=1", "-v"];
        let extra: [&str; 0] = [];
        assert_eq!(merge(&base, &extra), vec!["mount", "--a=1", "-v"]);
    }

    #[test]
    fn bare_flag_in_base_is_not_overridden() {
        let base = ["--allow-other"];
        let extra = ["--allow-other=false"];
        assert_eq!(
            merge(&base, &extra),
            vec!["--allow-other", "--allow-other=false"]
        );
    }
}
