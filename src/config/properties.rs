use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::config::ConfigError;

/// Loads a flat `key=value` properties file into a string map.
pub fn load<P: AsRef<Path>>(path: P) -> Result<HashMap<String, String>, ConfigError> {
    let raw = fs::read_to_string(&path).map_err(|e| ConfigError::Io {
        path: path.as_ref().to_path_buf(),
        source: e,
    })?;
    parse(&raw)
}

/// Properties conventions: `#` and `!` start comment lines, blank lines are
/// skipped, the first `=` or `:` separates key from value, both sides trimmed.
pub fn parse(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut map = HashMap::new();
    for (line_no, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let sep = line.find(['=', ':']).ok_or_else(|| ConfigError::Malformed {
            line: line_no + 1,
            content: line.to_string(),
        })?;
        let key = line[..sep].trim();
        if key.is_empty() {
            return Err(ConfigError::Malformed {
                line: line_no + 1,
                content: line.to_string(),
            });
        }
        map.insert(key.to_string(), line[sep + 1..].trim().to_string());
    }
    Ok(map)
}
