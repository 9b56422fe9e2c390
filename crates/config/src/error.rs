use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use miette::{Diagnostic, SourceSpan};
use thiserror::Error;

#[derive(Error, Diagnostic, Debug, Clone)]
pub enum ConfigError {
    #[error("Failed to load config file: {path}")]
    #[diagnostic(
        code(lattice::config::load_failed),
        help("Check if the file exists and has correct permissions")
    )]
    LoadFailed {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("Invalid config format in {path}: {details}")]
    #[diagnostic(
        code(lattice::config::invalid_format),
        help("Check the YAML syntax and ensure values match the schema")
    )]
    InvalidFormat {
        path: PathBuf,
        details: String,
        #[source_code]
        content: String,
        #[label("Error occurred here")]
        span: SourceSpan,
    },

    #[error("Schema validation error in {}", .path.display())]
    #[diagnostic(
        code(lattice::config::schema::validation),
        help("Update the configuration to match the generated schema")
    )]
    SchemaValidation {
        details: String,
        path: PathBuf,
        #[source_code]
        content: String,
    },

    #[error("Failed to compile schema: {details}")]
    #[diagnostic(
        code(lattice::config::schema::compile),
        help("Check if the schema is valid JSON Schema")
    )]
    SchemaCompile { details: String },

    #[error("Invalid value for {field}: {details}")]
    #[diagnostic(
        code(lattice::config::invalid_value),
        help("Fix the named field and restart")
    )]
    InvalidValue { field: String, details: String },

    #[error("Invalid workflow definition {id:?}: {details}")]
    #[diagnostic(
        code(lattice::config::workflow),
        help("Run the workflow validator for the full error and warning list")
    )]
    InvalidWorkflow { id: String, details: String },
}
