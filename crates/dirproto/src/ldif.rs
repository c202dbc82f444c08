//! LDIF change records (RFC 2849)
//!
//! Renders write requests as change records. Values that are not
//! "safe strings" are base64-encoded with the `::` separator, and lines
//! longer than [`LINE_LENGTH`] are folded with a leading space.

use crate::error::{ProtocolError, Result};
use crate::message::{Control, Request};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Maximum line length before folding
pub const LINE_LENGTH: usize = 76;

/// Whether a value can be written verbatim after `: `
pub fn is_safe_string(value: &[u8]) -> bool {
    let Some((&first, _)) = value.split_first() else {
        return true;
    };
    if matches!(first, b' ' | b':' | b'<') {
        return false;
    }
    if value.last() == Some(&b' ') {
        return false;
    }
    value
        .iter()
        .all(|&b| b < 0x80 && !matches!(b, b'\0' | b'\n' | b'\r'))
}

/// Render one `name: value` line (or `name:: base64`), folded
pub fn attribute_line(name: &str, value: &[u8]) -> String {
    let line = if is_safe_string(value) {
        // Safe strings are ASCII by construction
        format!("{}: {}", name, String::from_utf8_lossy(value))
    } else {
        format!("{}:: {}", name, STANDARD.encode(value))
    };
    fold(&line)
}

/// Fold a line at [`LINE_LENGTH`] columns; continuation lines start with a space
pub fn fold(line: &str) -> String {
    if line.len() <= LINE_LENGTH || !line.is_ascii() {
        return line.to_string();
    }
    let mut out = String::with_capacity(line.len() + line.len() / LINE_LENGTH * 2);
    out.push_str(&line[..LINE_LENGTH]);
    let mut rest = &line[LINE_LENGTH..];
    while !rest.is_empty() {
        let take = rest.len().min(LINE_LENGTH - 1);
        out.push_str("\n ");
        out.push_str(&rest[..take]);
        rest = &rest[take..];
    }
    out
}

fn control_line(control: &Control) -> String {
    let criticality = if control.critical { "true" } else { "false" };
    let line = match &control.value {
        None => format!("control: {} {}", control.oid, criticality),
        Some(value) if is_safe_string(value) => format!(
            "control: {} {}: {}",
            control.oid,
            criticality,
            String::from_utf8_lossy(value)
        ),
        Some(value) => format!(
            "control: {} {}:: {}",
            control.oid,
            criticality,
            STANDARD.encode(value)
        ),
    };
    fold(&line)
}

/// Render a write request as one change record (no trailing blank line)
///
/// Only add, delete, modify and modify-DN requests have a change record
/// form; anything else is [`ProtocolError::Unsupported`].
pub fn change_record(request: &Request, controls: &[Control]) -> Result<String> {
    let (dn, body) = match request {
        Request::Add { dn, attributes } => {
            let mut lines = vec!["changetype: add".to_string()];
            for (name, values) in attributes {
                for value in values {
                    lines.push(attribute_line(name, value));
                }
            }
            (dn, lines)
        }
        Request::Delete { dn } => (dn, vec!["changetype: delete".to_string()]),
        Request::Modify { dn, changes } => {
            let mut lines = vec!["changetype: modify".to_string()];
            for change in changes {
                lines.push(format!("{}: {}", change.change.ldif_keyword(), change.attribute));
                for value in &change.values {
                    lines.push(attribute_line(&change.attribute, value));
                }
                lines.push("-".to_string());
            }
            (dn, lines)
        }
        Request::ModifyDn(modify_dn) => {
            let mut lines = vec![
                "changetype: modrdn".to_string(),
                attribute_line("newrdn", modify_dn.new_rdn.as_bytes()),
                format!("deleteoldrdn: {}", u8::from(modify_dn.delete_old_rdn)),
            ];
            if let Some(superior) = &modify_dn.new_superior {
                lines.push(attribute_line("newsuperior", superior.as_bytes()));
            }
            (&modify_dn.dn, lines)
        }
        other => {
            return Err(ProtocolError::Unsupported(format!(
                "{} has no LDIF change record form",
                other.operation()
            )))
        }
    };

    let mut record = Vec::with_capacity(body.len() + controls.len() + 1);
    record.push(attribute_line("dn", dn.as_bytes()));
    record.extend(controls.iter().map(control_line));
    record.extend(body);
    Ok(record.join("\n"))
}

/// Accumulates change records into one LDIF document
#[derive(Debug, Default, Clone)]
pub struct ChangeStream {
    records: Vec<String>,
}

impl ChangeStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: &Request, controls: &[Control]) -> Result<()> {
        let record = change_record(request, controls)?;
        self.records.push(record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// The whole document: `version: 1` once, records separated by a blank line
    pub fn render(&self) -> String {
        if self.records.is_empty() {
            return String::new();
        }
        let mut out = String::from("version: 1\n");
        for record in &self.records {
            out.push('\n');
            out.push_str(record);
            out.push('\n');
        }
        out
    }
}
