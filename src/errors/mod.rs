//! Structured error kinds surfaced at the boundaries that need more than a
//! plain string: schema negotiation for imported workflow packages. Step
//! execution failures flow through `domain::ErrorKind` instead, attached
//! directly to the `StepResult` they belong to.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("workflow package schema version {found} is newer than supported {supported}")]
    SchemaTooNew { found: u32, supported: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_too_new_message_names_both_versions() {
        let e = LoaderError::SchemaTooNew { found: 3, supported: 1 };
        assert_eq!(e.to_string(), "workflow package schema version 3 is newer than supported 1");
    }
}
