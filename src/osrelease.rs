//! `/etc/os-release` parsing.
//!
//! The descriptor is a list of `KEY=VALUE` lines. Values may be wrapped in
//! single or double quotes; blank lines and `#` comments are ignored. All
//! keys are kept because different provisioners look at different fields.

use std::collections::BTreeMap;

use crate::error::ProvisionError;

/// Parsed OS identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsRelease {
    fields: BTreeMap<String, String>,
}

impl OsRelease {
    /// Parses the raw descriptor text.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Parse`] when no `KEY=VALUE` line is found.
    pub fn parse(content: &str) -> Result<Self, ProvisionError> {
        let mut fields = BTreeMap::new();

        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                tracing::debug!(line = index + 1, "skipping os-release line without '=': {}", line);
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                tracing::debug!(line = index + 1, "skipping os-release line with empty key");
                continue;
            }
            fields.insert(key.to_string(), unquote(value.trim()));
        }

        if fields.is_empty() {
            return Err(ProvisionError::Parse(
                "no KEY=VALUE lines found in os-release content".to_string(),
            ));
        }

        Ok(Self { fields })
    }

    /// Looks up an arbitrary field.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// The `ID` field (e.g. `buildroot`, `ubuntu`).
    pub fn id(&self) -> Option<&str> {
        self.get("ID")
    }

    /// The whitespace-separated `ID_LIKE` list.
    pub fn id_like(&self) -> Vec<&str> {
        self.get("ID_LIKE")
            .map(|v| v.split_whitespace().collect())
            .unwrap_or_default()
    }

    pub fn version_id(&self) -> Option<&str> {
        self.get("VERSION_ID")
    }

    pub fn name(&self) -> Option<&str> {
        self.get("NAME")
    }

    pub fn pretty_name(&self) -> Option<&str> {
        self.get("PRETTY_NAME")
    }

    /// Iterates over all fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Strips one layer of matching quotes.
///
/// Double-quoted values honour the shell escapes os-release(5) allows.
fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == b'\'' && last == b'\'' {
            return value[1..value.len() - 1].to_string();
        }
        if first == b'"' && last == b'"' {
            let inner = &value[1..value.len() - 1];
            let mut out = String::with_capacity(inner.len());
            let mut chars = inner.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    match chars.next() {
                        Some(next @ ('"' | '\\' | '$' | '`')) => out.push(next),
                        Some(other) => {
                            out.push('\\');
                            out.push(other);
                        }
                        None => out.push('\\'),
                    }
                } else {
                    out.push(c);
                }
            }
            return out;
        }
    }
    value.to_string()
}
