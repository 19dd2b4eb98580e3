//! Minimal parser for `os-release` style `KEY=VALUE` files.
//!
//! The grammar is the shell-assignment subset those files use in practice:
//! one assignment per line, `#`/`;` comments, optional `export ` prefix,
//! values optionally wrapped in single or double quotes.  Anything else is
//! skipped with a debug log rather than failing the whole file, since
//! descriptors are frequently hand-edited.

use std::io::{self, BufRead};

use log::debug;

fn key_is_valid(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Strips one level of matching quotes.  Inside double quotes the shell
/// escapes `\"`, `\\`, `\$` and `` \` `` are undone; single quotes are
/// literal throughout.
fn unquote(value: &str) -> String {
    let value = value.trim();
    let bytes = value.as_bytes();

    if bytes.len() >= 2 {
        let quote = bytes[0];
        if (quote == b'"' || quote == b'\'') && bytes[bytes.len() - 1] == quote {
            let inner = &value[1..value.len() - 1];
            if quote == b'\'' {
                return inner.to_string();
            }

            let mut out = String::with_capacity(inner.len());
            let mut chars = inner.chars();
            while let Some(c) = chars.next() {
                if c != '\\' {
                    out.push(c);
                    continue;
                }
                match chars.next() {
                    Some(escaped @ ('"' | '\\' | '$' | '`')) => out.push(escaped),
                    Some(other) => {
                        out.push('\\');
                        out.push(other);
                    }
                    None => out.push('\\'),
                }
            }
            return out;
        }
    }

    value.to_string()
}

/// Parse a `KEY=VALUE` file into its pairs.
///
/// Pairs come back in file order.  A key assigned more than once keeps the
/// position of its first assignment but the value of its last one, matching
/// shell semantics and keeping the result deterministic for fixtures.
pub fn parse_env_file(reader: impl BufRead) -> io::Result<Vec<(String, String)>> {
    let mut pairs: Vec<(String, String)> = Vec::new();

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);

        let Some((key, value)) = line.split_once('=') else {
            debug!("Ignoring line without assignment: {line:?}");
            continue;
        };
        let key = key.trim_end();
        if !key_is_valid(key) {
            debug!("Ignoring assignment with invalid key: {key:?}");
            continue;
        }

        let value = unquote(value);
        match pairs.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = value,
            None => pairs.push((key.to_string(), value)),
        }
    }

    Ok(pairs)
}

/// The "give me these N keys" form: each slot whose key appears in the file
/// is filled with the (last) assigned value, the rest are left untouched.
pub fn parse_env_file_into(
    reader: impl BufRead,
    slots: &mut [(&str, &mut Option<String>)],
) -> io::Result<()> {
    for (key, value) in parse_env_file(reader)? {
        if let Some(slot) = slots.iter_mut().find(|slot| slot.0 == key) {
            *slot.1 = Some(value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    fn parse(text: &str) -> Vec<(String, String)> {
        parse_env_file(text.as_bytes()).unwrap()
    }

    fn pairs(expected: &[(&str, &str)]) -> Vec<(String, String)> {
        expected
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_basic_assignments() {
        let parsed = parse("ID=fedora\nVERSION_ID=39\n");
        assert_eq!(parsed, pairs(&[("ID", "fedora"), ("VERSION_ID", "39")]));
    }

    #[test]
    fn test_comments_and_blank_lines() {
        let parsed = parse("# a comment\n\n; another\nID=debian\n   \n");
        assert_eq!(parsed, pairs(&[("ID", "debian")]));
    }

    #[test]
    fn test_quoting() {
        let parsed = parse(concat!(
            "PRETTY_NAME=\"Fedora Linux 39 (Container Image)\"\n",
            "VERSION='39 (Thirty Nine)'\n",
            "ANSI_COLOR=\"0;38;2;60;110;180\"\n",
            "MOTD=\"say \\\"hi\\\" for \\$5\"\n",
        ));
        assert_eq!(
            parsed,
            pairs(&[
                ("PRETTY_NAME", "Fedora Linux 39 (Container Image)"),
                ("VERSION", "39 (Thirty Nine)"),
                ("ANSI_COLOR", "0;38;2;60;110;180"),
                ("MOTD", "say \"hi\" for $5"),
            ])
        );
    }

    #[test]
    fn test_export_prefix_and_whitespace() {
        let parsed = parse("export ID=arch\n  BUILD_ID = rolling \n");
        assert_eq!(parsed, pairs(&[("ID", "arch"), ("BUILD_ID", "rolling")]));
    }

    #[test]
    fn test_last_assignment_wins_first_position_kept() {
        let parsed = parse("ID=one\nVERSION_ID=1\nID=two\n");
        assert_eq!(parsed, pairs(&[("ID", "two"), ("VERSION_ID", "1")]));
    }

    #[test]
    fn test_junk_lines_are_skipped() {
        let parsed = parse("not an assignment\n2BAD=key\n=value\nID=ok\n");
        assert_eq!(parsed, pairs(&[("ID", "ok")]));
    }

    #[test]
    fn test_empty_and_unterminated_quotes() {
        let parsed = parse("A=\nB=\"\nC=''\n");
        // an unterminated quote is kept verbatim, not an error
        assert_eq!(parsed, pairs(&[("A", ""), ("B", "\""), ("C", "")]));
    }

    #[test]
    fn test_parse_into_slots() {
        let mut id = None;
        let mut missing = None;
        parse_env_file_into(
            "ID=fedora\nVERSION_ID=39\n".as_bytes(),
            &mut [("ID", &mut id), ("SUPPORT_END", &mut missing)],
        )
        .unwrap();
        assert_eq!(id.as_deref(), Some("fedora"));
        assert_eq!(missing, None);
    }
}
