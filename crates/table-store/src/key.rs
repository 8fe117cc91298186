//! Partition-key escaping.
//!
//! Table partition keys may not contain `/`, `\`, `#`, `?` or control
//! characters, but workflow ids are resource paths full of slashes. `|` is the
//! escape character:
//!
//! | Character | Encoded |
//! |-----------|---------|
//! | `/` | `\|\|` |
//! | `\` | `\|b` |
//! | `#` | `\|h` |
//! | `?` | `\|q` |
//! | `\|` | `\|p` |
//! | control `c` | `\|x` + two hex digits |
//!
//! `/` keeps its historical `||` encoding so existing rows decode unchanged.

use triggers::{StorageError, WorkflowId};

const ESCAPE: char = '|';

fn is_disallowed_control(c: char) -> bool {
    matches!(c as u32, 0x00..=0x1f | 0x7f..=0x9f)
}

/// Encodes a workflow id into a valid partition key.
pub fn encode_key(workflow_id: &WorkflowId) -> String {
    let raw = workflow_id.as_str();
    let mut out = String::with_capacity(raw.len() + 8);
    for c in raw.chars() {
        match c {
            '/' => out.push_str("||"),
            '\\' => out.push_str("|b"),
            '#' => out.push_str("|h"),
            '?' => out.push_str("|q"),
            '|' => out.push_str("|p"),
            c if is_disallowed_control(c) => {
                out.push_str(&format!("|x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

fn invalid(key: &str, message: impl Into<String>) -> StorageError {
    StorageError::InvalidKey {
        key: key.to_owned(),
        message: message.into(),
    }
}

/// Decodes a partition key back into the workflow id it was encoded from.
pub fn decode_key(key: &str) -> Result<WorkflowId, StorageError> {
    let mut out = String::with_capacity(key.len());
    let mut chars = key.chars();
    while let Some(c) = chars.next() {
        if c != ESCAPE {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('|') => out.push('/'),
            Some('b') => out.push('\\'),
            Some('h') => out.push('#'),
            Some('q') => out.push('?'),
            Some('p') => out.push('|'),
            Some('x') => {
                let hex: String = chars.by_ref().take(2).collect();
                let code = u32::from_str_radix(&hex, 16)
                    .ok()
                    .filter(|_| hex.len() == 2)
                    .ok_or_else(|| invalid(key, format!("bad control escape '|x{hex}'")))?;
                let decoded = char::from_u32(code)
                    .filter(|c| is_disallowed_control(*c))
                    .ok_or_else(|| invalid(key, format!("'|x{hex}' is not a control character")))?;
                out.push(decoded);
            }
            Some(other) => return Err(invalid(key, format!("unknown escape '|{other}'"))),
            None => return Err(invalid(key, "dangling escape at end of key")),
        }
    }
    WorkflowId::new(out).ok_or_else(|| invalid(key, "empty key"))
}
