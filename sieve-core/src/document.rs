//! Query document model.
//!
//! A [`Document`] holds exactly one operation plus the fragment definitions it
//! uses. Documents are built programmatically; parsing query text is left to
//! the caller.

use crate::error::DocumentError;
use crate::keys::{canonical_json, FieldKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Variables bound to an executed document.
pub type Variables = Map<String, Value>;

/// Canonical rendering of a variables map, used to detect variable changes.
pub fn canonical_variables(variables: &Variables) -> String {
    canonical_json(&Value::Object(variables.clone()))
}

/// Operation type of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Query => write!(f, "query"),
            OperationKind::Mutation => write!(f, "mutation"),
            OperationKind::Subscription => write!(f, "subscription"),
        }
    }
}

/// A field argument, either a literal or a variable reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Argument {
    Value(Value),
    Variable(String),
}

/// A selected field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub alias: Option<String>,
    pub arguments: BTreeMap<String, Argument>,
    pub selection_set: Option<SelectionSet>,
}

impl Field {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            arguments: BTreeMap::new(),
            selection_set: None,
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Add a literal argument.
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(name.into(), Argument::Value(value.into()));
        self
    }

    /// Add an argument bound to an operation variable.
    pub fn var(mut self, name: impl Into<String>, variable: impl Into<String>) -> Self {
        self.arguments
            .insert(name.into(), Argument::Variable(variable.into()));
        self
    }

    /// Give the field a nested selection set.
    pub fn select<I, S>(mut self, selections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Selection>,
    {
        self.selection_set = Some(SelectionSet::new(selections));
        self
    }

    /// Key under which the field appears in a response.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// True for scalar leaves.
    pub fn is_leaf(&self) -> bool {
        self.selection_set.is_none()
    }

    /// Arguments with variables substituted.
    ///
    /// An argument bound to a variable that is not supplied is omitted.
    pub fn resolved_arguments(&self, variables: &Variables) -> Map<String, Value> {
        let mut resolved = Map::new();
        for (name, argument) in &self.arguments {
            match argument {
                Argument::Value(value) => {
                    resolved.insert(name.clone(), value.clone());
                }
                Argument::Variable(variable) => {
                    if let Some(value) = variables.get(variable) {
                        resolved.insert(name.clone(), value.clone());
                    }
                }
            }
        }
        resolved
    }

    /// Storage key of this field for the given variables.
    pub fn storage_key(&self, variables: &Variables) -> FieldKey {
        FieldKey::with_args(&self.name, &self.resolved_arguments(variables))
    }
}

/// Inline fragment with an optional type condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineFragment {
    pub type_condition: Option<String>,
    pub selection_set: SelectionSet,
}

/// One entry of a selection set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Selection {
    Field(Field),
    FragmentSpread(String),
    InlineFragment(InlineFragment),
}

impl Selection {
    pub fn spread(name: impl Into<String>) -> Self {
        Selection::FragmentSpread(name.into())
    }

    pub fn inline<I, S>(type_condition: Option<&str>, selections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Selection>,
    {
        Selection::InlineFragment(InlineFragment {
            type_condition: type_condition.map(str::to_string),
            selection_set: SelectionSet::new(selections),
        })
    }
}

impl From<Field> for Selection {
    fn from(field: Field) -> Self {
        Selection::Field(field)
    }
}

impl From<&str> for Selection {
    fn from(name: &str) -> Self {
        Selection::Field(Field::new(name))
    }
}

/// Ordered set of selections.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SelectionSet {
    pub selections: Vec<Selection>,
}

impl SelectionSet {
    pub fn new<I, S>(selections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Selection>,
    {
        Self {
            selections: selections.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.selections.is_empty()
    }

    /// Direct field selections, ignoring fragments.
    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.selections.iter().filter_map(|s| match s {
            Selection::Field(field) => Some(field),
            _ => None,
        })
    }
}

/// A declared operation variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDefinition {
    pub name: String,
    pub default_value: Option<Value>,
}

/// A named fragment definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentDefinition {
    pub name: String,
    pub type_condition: String,
    pub selection_set: SelectionSet,
}

impl FragmentDefinition {
    pub fn new<I, S>(name: impl Into<String>, type_condition: impl Into<String>, selections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Selection>,
    {
        Self {
            name: name.into(),
            type_condition: type_condition.into(),
            selection_set: SelectionSet::new(selections),
        }
    }
}

/// Immutable query document: one operation and its fragments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub kind: OperationKind,
    pub name: Option<String>,
    pub variable_definitions: Vec<VariableDefinition>,
    pub selection_set: SelectionSet,
    pub fragments: BTreeMap<String, FragmentDefinition>,
}

impl Document {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            name: None,
            variable_definitions: Vec::new(),
            selection_set: SelectionSet::default(),
            fragments: BTreeMap::new(),
        }
    }

    pub fn query(name: impl Into<String>) -> Self {
        Self::new(OperationKind::Query).named(name)
    }

    pub fn mutation(name: impl Into<String>) -> Self {
        Self::new(OperationKind::Mutation).named(name)
    }

    pub fn subscription(name: impl Into<String>) -> Self {
        Self::new(OperationKind::Subscription).named(name)
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Declare a variable, optionally with a default value.
    pub fn variable(mut self, name: impl Into<String>, default_value: Option<Value>) -> Self {
        self.variable_definitions.push(VariableDefinition {
            name: name.into(),
            default_value,
        });
        self
    }

    pub fn select<I, S>(mut self, selections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Selection>,
    {
        self.selection_set
            .selections
            .extend(selections.into_iter().map(Into::into));
        self
    }

    pub fn fragment(mut self, fragment: FragmentDefinition) -> Self {
        self.fragments.insert(fragment.name.clone(), fragment);
        self
    }

    /// Operation name, or the empty string for anonymous operations.
    pub fn operation_name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    pub fn is_subscription(&self) -> bool {
        self.kind == OperationKind::Subscription
    }

    /// The first top-level field of the operation (the mutation or
    /// subscription field whose payload carries the result).
    pub fn root_field(&self) -> Result<&Field, DocumentError> {
        self.selection_set
            .fields()
            .next()
            .ok_or_else(|| DocumentError::MissingOperationField {
                operation: self.operation_name().to_string(),
            })
    }

    /// Supplied variables layered over declared defaults.
    pub fn effective_variables(&self, supplied: &Variables) -> Variables {
        let mut effective = Variables::new();
        for definition in &self.variable_definitions {
            if let Some(default) = &definition.default_value {
                effective.insert(definition.name.clone(), default.clone());
            }
        }
        for (name, value) in supplied {
            effective.insert(name.clone(), value.clone());
        }
        effective
    }

    /// Copy of the document with every fragment inlined.
    ///
    /// The resulting selection sets hold only fields; fields sharing a response
    /// key are merged. Type conditions are dropped, since the cache has no
    /// schema to evaluate them against.
    pub fn expand_fragments(&self) -> Result<Document, DocumentError> {
        let mut visiting = BTreeSet::new();
        let selection_set = self.expand_set(&self.selection_set, &mut visiting)?;
        Ok(Document {
            kind: self.kind,
            name: self.name.clone(),
            variable_definitions: self.variable_definitions.clone(),
            selection_set,
            fragments: BTreeMap::new(),
        })
    }

    fn expand_set(
        &self,
        set: &SelectionSet,
        visiting: &mut BTreeSet<String>,
    ) -> Result<SelectionSet, DocumentError> {
        let mut fields: Vec<Field> = Vec::new();
        self.collect_fields(set, visiting, &mut fields)?;
        Ok(SelectionSet {
            selections: fields.into_iter().map(Selection::Field).collect(),
        })
    }

    fn collect_fields(
        &self,
        set: &SelectionSet,
        visiting: &mut BTreeSet<String>,
        out: &mut Vec<Field>,
    ) -> Result<(), DocumentError> {
        for selection in &set.selections {
            match selection {
                Selection::Field(field) => {
                    let mut expanded = field.clone();
                    if let Some(children) = &field.selection_set {
                        expanded.selection_set = Some(self.expand_set(children, visiting)?);
                    }
                    merge_field(out, expanded);
                }
                Selection::InlineFragment(inline) => {
                    self.collect_fields(&inline.selection_set, visiting, out)?;
                }
                Selection::FragmentSpread(name) => {
                    let fragment = self.fragments.get(name).ok_or_else(|| {
                        DocumentError::UndefinedFragment { name: name.clone() }
                    })?;
                    if !visiting.insert(name.clone()) {
                        return Err(DocumentError::FragmentCycle { name: name.clone() });
                    }
                    self.collect_fields(&fragment.selection_set, visiting, out)?;
                    visiting.remove(name);
                }
            }
        }
        Ok(())
    }
}

/// Merge a field into a list of expanded fields by response key.
fn merge_field(out: &mut Vec<Field>, field: Field) {
    let Some(existing) = out
        .iter_mut()
        .find(|f| f.response_key() == field.response_key())
    else {
        out.push(field);
        return;
    };
    let Some(incoming) = field.selection_set else {
        return;
    };
    // Both sides are already expanded, so they hold fields only.
    let current = existing.selection_set.get_or_insert_with(SelectionSet::default);
    let mut children: Vec<Field> = current
        .selections
        .drain(..)
        .filter_map(|s| match s {
            Selection::Field(f) => Some(f),
            _ => None,
        })
        .collect();
    for selection in incoming.selections {
        if let Selection::Field(child) = selection {
            merge_field(&mut children, child);
        }
    }
    current.selections = children.into_iter().map(Selection::Field).collect();
}
