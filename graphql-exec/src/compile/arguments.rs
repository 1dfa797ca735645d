//! Field-argument handling.
//!
//! Literal arguments are coerced into a JSON map at compile time. Arguments
//! that reference variables keep a small per-argument plan that is resolved
//! once per request. Deep value coercion against input types is the input
//! coercion layer's concern; this module only converts AST values and
//! substitutes variables.

use std::sync::Arc;

use apollo_compiler::ast;
use apollo_compiler::Name;
use apollo_compiler::Node;

use crate::response::JsonMap;
use crate::response::JsonValue;

/// The per-selection argument plan produced by the compiler.
#[derive(Debug, Clone)]
pub enum ArgumentTemplate {
    /// No arguments, or all arguments literal: the map is shared as-is.
    Ready(Arc<JsonMap>),
    /// At least one argument references a variable.
    Dynamic(Arc<Vec<ArgumentPlan>>),
    /// Compile-time coercion failed; resolving reports the message as a field
    /// error at the selection's path.
    Invalid(Arc<String>),
}

#[derive(Debug)]
pub struct ArgumentPlan {
    pub name: Name,
    pub required: bool,
    pub source: ArgumentSource,
}

#[derive(Debug)]
pub enum ArgumentSource {
    Literal(JsonValue),
    Variable {
        variable: Name,
        default: Option<JsonValue>,
    },
    /// A composite value containing variable references somewhere inside.
    Ast(Node<ast::Value>),
}

/// The error message for a failed argument resolution; reported as a field
/// error at the selection's path.
pub type ArgumentError = String;

impl ArgumentTemplate {
    pub fn empty() -> Self {
        ArgumentTemplate::Ready(Arc::new(JsonMap::new()))
    }

    pub fn invalid(message: ArgumentError) -> Self {
        ArgumentTemplate::Invalid(Arc::new(message))
    }

    /// Builds the plan for one bound field.
    pub fn build(
        definition: &ast::FieldDefinition,
        arguments: &[Node<ast::Argument>],
        // Unknown arguments are a validation concern; they are ignored here.
    ) -> Result<Self, ArgumentError> {
        let mut plans = Vec::new();
        let mut all_literal = true;
        for argument_def in &definition.arguments {
            let provided = arguments
                .iter()
                .find(|argument| argument.name == argument_def.name);
            let required = argument_def.ty.is_non_null() && argument_def.default_value.is_none();
            let source = match provided {
                Some(argument) => match argument.value.as_ref() {
                    ast::Value::Variable(variable) => ArgumentSource::Variable {
                        variable: variable.clone(),
                        default: argument_def
                            .default_value
                            .as_ref()
                            .map(|value| literal_to_json(value))
                            .transpose()?,
                    },
                    value if contains_variable(value) => {
                        all_literal = false;
                        ArgumentSource::Ast(argument.value.clone())
                    }
                    value => ArgumentSource::Literal(literal_to_json(value)?),
                },
                None => match &argument_def.default_value {
                    Some(default) => ArgumentSource::Literal(literal_to_json(default)?),
                    None if required => {
                        return Err(format!(
                            "Required argument \"{}\" was not provided.",
                            argument_def.name
                        ));
                    }
                    None => continue,
                },
            };
            if matches!(source, ArgumentSource::Variable { .. }) {
                all_literal = false;
            }
            plans.push(ArgumentPlan {
                name: argument_def.name.clone(),
                required,
                source,
            });
        }
        if all_literal {
            let mut map = JsonMap::with_capacity(plans.len());
            for plan in plans {
                let ArgumentSource::Literal(value) = plan.source else {
                    unreachable!("all_literal implies literal sources");
                };
                map.insert(plan.name.as_str(), value);
            }
            Ok(ArgumentTemplate::Ready(Arc::new(map)))
        } else {
            Ok(ArgumentTemplate::Dynamic(Arc::new(plans)))
        }
    }

    /// Produces the coerced argument map for one request.
    pub fn resolve(&self, variables: &JsonMap) -> Result<Arc<JsonMap>, ArgumentError> {
        match self {
            ArgumentTemplate::Invalid(message) => Err(message.as_ref().clone()),
            ArgumentTemplate::Ready(map) => Ok(map.clone()),
            ArgumentTemplate::Dynamic(plans) => {
                let mut map = JsonMap::with_capacity(plans.len());
                for plan in plans.iter() {
                    let value = match &plan.source {
                        ArgumentSource::Literal(value) => Some(value.clone()),
                        ArgumentSource::Variable { variable, default } => {
                            match variables.get(variable.as_str()) {
                                Some(value) => Some(value.clone()),
                                None => default.clone(),
                            }
                        }
                        ArgumentSource::Ast(value) => Some(ast_to_json(value, variables)?),
                    };
                    match value {
                        Some(value) => {
                            map.insert(plan.name.as_str(), value);
                        }
                        None if plan.required => {
                            return Err(format!(
                                "No value was provided for required argument \"{}\".",
                                plan.name
                            ));
                        }
                        None => {}
                    }
                }
                Ok(Arc::new(map))
            }
        }
    }
}

fn contains_variable(value: &ast::Value) -> bool {
    match value {
        ast::Value::Variable(_) => true,
        ast::Value::List(items) => items.iter().any(|item| contains_variable(item)),
        ast::Value::Object(fields) => fields.iter().any(|(_, value)| contains_variable(value)),
        _ => false,
    }
}

/// Converts an AST value with no variable references.
fn literal_to_json(value: &ast::Value) -> Result<JsonValue, ArgumentError> {
    ast_to_json(value, &JsonMap::new())
}

/// Converts an AST value, substituting variables from the request.
fn ast_to_json(value: &ast::Value, variables: &JsonMap) -> Result<JsonValue, ArgumentError> {
    Ok(match value {
        ast::Value::Null => JsonValue::Null,
        ast::Value::Boolean(value) => JsonValue::Bool(*value),
        ast::Value::Enum(value) => JsonValue::String(value.as_str().into()),
        ast::Value::String(value) => JsonValue::String(value.as_str().into()),
        ast::Value::Int(value) => {
            let parsed: i64 = value
                .as_str()
                .parse()
                .map_err(|_| format!("Int value \"{}\" is out of range.", value.as_str()))?;
            JsonValue::Number(parsed.into())
        }
        ast::Value::Float(value) => {
            let parsed: f64 = value
                .as_str()
                .parse()
                .map_err(|_| format!("Float value \"{}\" is not valid.", value.as_str()))?;
            serde_json::Number::from_f64(parsed)
                .map(JsonValue::Number)
                .ok_or_else(|| format!("Float value \"{}\" is not finite.", value.as_str()))?
        }
        ast::Value::Variable(variable) => variables
            .get(variable.as_str())
            .cloned()
            .unwrap_or(JsonValue::Null),
        ast::Value::List(items) => JsonValue::Array(
            items
                .iter()
                .map(|item| ast_to_json(item, variables))
                .collect::<Result<_, _>>()?,
        ),
        ast::Value::Object(fields) => {
            let mut map = JsonMap::with_capacity(fields.len());
            for (name, value) in fields {
                map.insert(name.as_str(), ast_to_json(value, variables)?);
            }
            JsonValue::Object(map)
        }
    })
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    fn field_definition(sdl_field: &str) -> ast::FieldDefinition {
        let sdl = format!("type Query {{ {sdl_field} }}");
        let schema = apollo_compiler::Schema::parse(&sdl, "test.graphql").expect("valid schema");
        schema
            .types
            .get("Query")
            .and_then(|ty| match ty {
                apollo_compiler::schema::ExtendedType::Object(object) => {
                    object.fields.values().next()
                }
                _ => None,
            })
            .map(|component| component.node.as_ref().clone())
            .expect("field definition")
    }

    fn arguments(query: &str, schema_field: &str) -> Vec<Node<ast::Argument>> {
        let sdl = format!("type Query {{ {schema_field} }}");
        let schema =
            apollo_compiler::Schema::parse_and_validate(&sdl, "test.graphql").expect("schema");
        let document = apollo_compiler::ExecutableDocument::parse(&schema, query, "query.graphql")
            .expect("document");
        let operation = document.operations.get(None).expect("operation");
        let apollo_compiler::executable::Selection::Field(field) =
            &operation.selection_set.selections[0]
        else {
            panic!("expected a field");
        };
        field.arguments.clone()
    }

    #[test]
    fn literal_arguments_are_precoerced() {
        let definition = field_definition("echo(x: Int, y: String): Int");
        let arguments = arguments(r#"{ echo(x: 1, y: "hi") }"#, "echo(x: Int, y: String): Int");
        let template = ArgumentTemplate::build(&definition, &arguments).expect("template");
        assert!(matches!(template, ArgumentTemplate::Ready(_)));
        let resolved = template.resolve(&JsonMap::new()).expect("resolved");
        assert_eq!(resolved.get("x"), Some(&json!(1)));
        assert_eq!(resolved.get("y"), Some(&json!("hi")));
    }

    #[test]
    fn variables_resolve_per_request() {
        let definition = field_definition("echo(x: Int): Int");
        let arguments = arguments(
            "query($v: Int) { echo(x: $v) }",
            "echo(x: Int): Int",
        );
        let template = ArgumentTemplate::build(&definition, &arguments).expect("template");
        let mut variables = JsonMap::new();
        variables.insert("v", json!(7));
        let resolved = template.resolve(&variables).expect("resolved");
        assert_eq!(resolved.get("x"), Some(&json!(7)));
    }

    #[test]
    fn defaults_apply_when_arguments_are_omitted() {
        let definition = field_definition("echo(x: Int = 3): Int");
        let template = ArgumentTemplate::build(&definition, &[]).expect("template");
        let resolved = template.resolve(&JsonMap::new()).expect("resolved");
        assert_eq!(resolved.get("x"), Some(&json!(3)));
    }

    #[test]
    fn missing_required_argument_is_an_error() {
        let definition = field_definition("echo(x: Int!): Int");
        let error = ArgumentTemplate::build(&definition, &[]).expect_err("must fail");
        assert!(error.contains("Required argument"));
    }

    #[test]
    fn composite_values_substitute_nested_variables() {
        let value = ast::Value::Object(vec![(
            apollo_compiler::name!("eq"),
            Node::new(ast::Value::Variable(apollo_compiler::name!("v"))),
        )]);
        let mut variables = JsonMap::new();
        variables.insert("v", json!(42));
        let resolved = ast_to_json(&value, &variables).expect("resolved");
        assert_eq!(resolved, json!({ "eq": 42 }));
    }
}
