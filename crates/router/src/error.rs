use thiserror::Error;

/// Protocol-plane failures. These are dropped and counted, never retried;
/// the raw payload is preserved alongside the error for diagnostics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed topic: {0}")]
    MalformedTopic(String),

    #[error("unsupported topic version v{0}")]
    UnsupportedVersion(u32),

    #[error("unexpected sub-topic {sub:?} for kind {kind}")]
    UnexpectedSub { kind: String, sub: String },

    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("missing or malformed schema tag: {0}")]
    BadSchemaTag(String),

    #[error("schema {got:?} does not match topic kind {want}")]
    SchemaMismatch { want: String, got: String },

    #[error("unsupported schema major version {0}")]
    UnsupportedSchemaMajor(u32),

    #[error("timestamp {0} outside the accepted window")]
    BadTimestamp(i64),

    #[error("payload does not validate as {schema}: {details}")]
    PayloadInvalid { schema: String, details: String },
}
