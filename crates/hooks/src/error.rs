use conflux_core::TemplateError;

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Hook {kind} unknown")]
    UnknownHook { kind: String },
    #[error("hook {kind} is already registered")]
    DuplicateRegistration { kind: String },
    #[error("invalid spec for hook {kind}: {source}")]
    InvalidSpec { kind: String, source: serde_json::Error },
    #[error("templating hook {kind}: {source}")]
    TemplatingFailed { kind: String, source: TemplateError },
    #[error("{method} {target} returned {found}, expected {expected}")]
    UnexpectedStatus { method: String, target: String, expected: u16, found: u16 },
    #[error("{method} {target}: {source}")]
    Transport { method: String, target: String, source: reqwest::Error },
}
