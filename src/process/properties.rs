//! `server.properties` access for the dashboard's settings page.
//!
//! Network binding and remote-console keys are never exposed or rewritten
//! through here.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

pub const FILE_NAME: &str = "server.properties";

const HIDDEN_KEYS: &[&str] = &["rcon.password", "rcon.port", "query.port", "server-ip"];

fn is_hidden(key: &str) -> bool {
    HIDDEN_KEYS.contains(&key)
}

/// `key=value` of a non-comment line. Values may themselves contain `=`.
fn split_entry(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim_start().starts_with('#') || line.trim().is_empty() {
        return None;
    }
    match line.split_once('=') {
        Some((key, value)) => Some((key.trim(), value)),
        None => Some((line.trim(), "")),
    }
}

pub fn read(path: &Path) -> io::Result<BTreeMap<String, String>> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter_map(split_entry)
        .filter(|(key, _)| !is_hidden(key))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect())
}

/// Replace the values of keys already present in the file, keeping comments
/// and line order. Returns the number of lines rewritten.
pub fn update(path: &Path, changes: &BTreeMap<String, String>) -> io::Result<usize> {
    let content = fs::read_to_string(path)?;
    let mut changed = 0;
    let mut out = String::with_capacity(content.len());

    for line in content.split_inclusive('\n') {
        let replacement = split_entry(line)
            .filter(|(key, _)| !is_hidden(key))
            .and_then(|(key, value)| changes.get(key).filter(|new| *new != value).map(|new| (key, new)));
        match replacement {
            Some((key, value)) => {
                out.push_str(&format!("{}={}\n", key, value));
                changed += 1;
            }
            None => out.push_str(line),
        }
    }

    for key in changes.keys() {
        if is_hidden(key) {
            tracing::warn!("Refusing to change hidden property '{}'", key);
        }
    }
    if changed == 0 {
        return Ok(0);
    }

    let tmp_path = path.with_extension("properties.tmp");
    fs::write(&tmp_path, out)?;
    fs::rename(&tmp_path, path)?;
    Ok(changed)
}
