//! Task result channel: exactly one `<name>: <json>` line in the combined output.

use serde_json::Value as Json;

use crate::error::SandboxError;

/// Extract the task result addressed to `name`. Zero or several sentinel
/// lines, or a payload that is not JSON, fail extraction.
pub fn extract_result<'a, I>(name: &str, lines: I) -> Result<Json, SandboxError>
where
    I: IntoIterator<Item = &'a str>,
{
    let prefix = format!("{name}: ");
    let mut found: Option<&str> = None;
    for line in lines {
        let Some(payload) = line.strip_prefix(prefix.as_str()) else { continue };
        if found.is_some() {
            return Err(SandboxError::ResultExtractionFailed(format!("more than one result line for {name}")));
        }
        found = Some(payload);
    }
    let payload = found.ok_or_else(|| SandboxError::ResultExtractionFailed(format!("no result line for {name}")))?;
    serde_json::from_str(payload)
        .map_err(|e| SandboxError::ResultExtractionFailed(format!("invalid result payload for {name}: {e}")))
}
