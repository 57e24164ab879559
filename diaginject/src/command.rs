//! Helper command rendering.
//!
//! The attribute blob on the wire is opaque to everything except the
//! [`CommandBuilder`], which turns it into the `/bin/sh -c` script run in the
//! target container.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use diaginject_shared::constants::helper::ARTIFACT_PREFIX;
use diaginject_shared::{InjectorError, InjectorResult, PodKey};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Renders the helper invocation for one start request.
pub trait CommandBuilder: Send + Sync {
    /// Build the script passed to `/bin/sh -c`.
    ///
    /// # Errors
    ///
    /// `MalformedRequest` when `encoded_attrs` cannot be interpreted.
    fn build(&self, key: &PodKey, tool: &str, encoded_attrs: &str) -> InjectorResult<String>;
}

/// Runs `<helper_dest>/<tool>.sh` with one `--flag 'value'` per attribute.
///
/// Attributes are a base64 (standard alphabet) JSON object whose values are
/// strings, numbers or booleans. Output always goes to
/// `/serviceability/<namespace>/<pod>/performanceData`.
#[derive(Clone, Debug)]
pub struct ShellCommandBuilder {
    helper_dest: PathBuf,
}

impl ShellCommandBuilder {
    pub fn new(helper_dest: impl Into<PathBuf>) -> Self {
        Self {
            helper_dest: helper_dest.into(),
        }
    }

    /// Directory the helper writes its archive into.
    pub fn output_dir(key: &PodKey) -> String {
        format!(
            "{}/{}/{}/performanceData",
            ARTIFACT_PREFIX, key.namespace, key.name
        )
    }

    fn decode_attrs(encoded: &str) -> InjectorResult<BTreeMap<String, String>> {
        let encoded = encoded.trim();
        if encoded.is_empty() {
            return Ok(BTreeMap::new());
        }

        let raw = STANDARD
            .decode(encoded)
            .map_err(|e| InjectorError::MalformedRequest(format!("attributes: {}", e)))?;
        let object: BTreeMap<String, Value> = serde_json::from_slice(&raw)
            .map_err(|e| InjectorError::MalformedRequest(format!("attributes: {}", e)))?;

        object
            .into_iter()
            .map(|(key, value)| {
                if key.is_empty()
                    || !key
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
                {
                    return Err(InjectorError::MalformedRequest(format!(
                        "invalid attribute name '{}'",
                        key
                    )));
                }
                let value = match value {
                    Value::String(s) => s,
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    other => {
                        return Err(InjectorError::MalformedRequest(format!(
                            "attribute '{}' has unsupported value {}",
                            key, other
                        )));
                    }
                };
                Ok((key, value))
            })
            .collect()
    }
}

impl CommandBuilder for ShellCommandBuilder {
    fn build(&self, key: &PodKey, tool: &str, encoded_attrs: &str) -> InjectorResult<String> {
        if tool.is_empty() || tool.contains('/') {
            return Err(InjectorError::MalformedRequest(format!(
                "invalid tool name '{}'",
                tool
            )));
        }
        let attrs = Self::decode_attrs(encoded_attrs)?;

        let script = self.helper_dest.join(format!("{}.sh", tool));
        let mut command = format!(
            "{} --output-dir {}",
            shell_quote(&script.to_string_lossy()),
            shell_quote(&Self::output_dir(key))
        );
        for (name, value) in attrs {
            command.push_str(&format!(" --{} {}", name, shell_quote(&value)));
        }
        Ok(command)
    }
}

/// Single-quote `value` for POSIX sh.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
