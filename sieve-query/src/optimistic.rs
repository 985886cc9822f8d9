//! Optimistic mutation results.

use serde_json::{Map, Value};

/// Type name of the synthetic mutation root in an optimistic response.
pub const MUTATION_TYPENAME: &str = "Mutation";

/// Speculative result of a mutation, built before the server answers.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticEnvelope {
    field: String,
    payload: Value,
}

impl OptimisticEnvelope {
    /// Build the envelope for `field` from the mutation input and the
    /// caller's partial response.
    ///
    /// Object inputs and partials are merged key by key with the partial
    /// winning. Returns `None` without a partial response: such writes have
    /// no optimistic phase.
    pub fn build(field: &str, input: Option<&Value>, partial: Option<&Value>) -> Option<Self> {
        let partial = partial?;
        let payload = match (input, partial) {
            (Some(Value::Object(input)), Value::Object(partial)) => {
                let mut merged: Map<String, Value> = input.clone();
                merged.extend(partial.iter().map(|(k, v)| (k.clone(), v.clone())));
                Value::Object(merged)
            }
            _ => partial.clone(),
        };
        Some(Self {
            field: field.to_string(),
            payload,
        })
    }

    /// Mutation field the payload belongs to.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// The value under the mutation field, fed to the modifier engine.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Full response shape: `{"__typename": "Mutation", <field>: payload}`.
    pub fn response(&self) -> Value {
        let mut response = Map::new();
        response.insert(
            sieve_core::TYPENAME_FIELD.to_string(),
            Value::String(MUTATION_TYPENAME.to_string()),
        );
        response.insert(self.field.clone(), self.payload.clone());
        Value::Object(response)
    }
}
