use jsonschema::Validator;
use serde_json::Value;
use strand_core::{Error, Result};

/// Compile a capability's input schema. An invalid schema is a configuration error.
pub fn compile(capability: &str, schema: &Value) -> Result<Validator> {
    jsonschema::validator_for(schema)
        .map_err(|e| Error::Config(format!("Invalid input schema for '{}': {}", capability, e)))
}

/// Check `arguments` against a compiled schema, collecting every violation.
pub fn check(capability: &str, validator: &Validator, arguments: &Value) -> Result<()> {
    if validator.is_valid(arguments) {
        return Ok(());
    }
    let errors: Vec<String> = validator.iter_errors(arguments).map(|e| e.to_string()).collect();
    Err(Error::SchemaViolation {
        capability: capability.to_string(),
        message: errors.join("; "),
    })
}
