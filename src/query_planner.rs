use graphql_parser::query::{
    Definition, Document, OperationDefinition, Selection, SelectionSet, parse_query,
};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// A field of the incoming selection, reduced to what a remote query needs.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionNode {
    pub name: String,
    /// Arguments already printed as GraphQL literals.
    pub arguments: Vec<(String, String)>,
    pub children: Vec<SelectionNode>,
}

impl SelectionNode {
    pub fn leaf(name: impl Into<String>) -> Self {
        SelectionNode {
            name: name.into(),
            arguments: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<SelectionNode>) -> Self {
        self.children = children;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
pub enum OperationType {
    #[default]
    Query,
    Mutation,
}

impl OperationType {
    fn keyword(self) -> &'static str {
        match self {
            OperationType::Query => "query",
            OperationType::Mutation => "mutation",
        }
    }
}

/// Root field signatures of a remote service, read from its introspection result.
#[derive(Debug, Clone, Default)]
pub struct RemoteSchema {
    query_type: Option<String>,
    mutation_type: Option<String>,
    arguments: HashMap<(String, String), Vec<(String, String)>>,
}

impl RemoteSchema {
    pub const INTROSPECTION_QUERY: &'static str = r#"
query StitchIntrospection {
  __schema {
    queryType { name }
    mutationType { name }
    types {
      name
      fields {
        name
        args { name type { ...TypeRef } }
      }
    }
  }
}
fragment TypeRef on __Type {
  kind name
  ofType { kind name ofType { kind name ofType { kind name ofType { kind name } } } }
}
"#;

    /// Reads the `data` of an introspection response.
    pub fn from_introspection(data: &Value) -> Result<Self, String> {
        let schema = data
            .get("__schema")
            .ok_or_else(|| "introspection result has no __schema".to_string())?;
        let type_name = |key: &str| {
            schema
                .get(key)
                .and_then(|t| t.get("name"))
                .and_then(Value::as_str)
                .map(String::from)
        };

        let mut arguments = HashMap::new();
        for ty in schema
            .get("types")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let Some(owner) = ty.get("name").and_then(Value::as_str) else {
                continue;
            };
            for field in ty.get("fields").and_then(Value::as_array).into_iter().flatten() {
                let Some(field_name) = field.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let args = field
                    .get("args")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(|arg| {
                        let name = arg.get("name")?.as_str()?.to_string();
                        Some((name, print_type_ref(arg.get("type")?)?))
                    })
                    .collect();
                arguments.insert((owner.to_string(), field_name.to_string()), args);
            }
        }

        Ok(RemoteSchema {
            query_type: type_name("queryType"),
            mutation_type: type_name("mutationType"),
            arguments,
        })
    }

    fn root_arguments(&self, operation: OperationType, field: &str) -> Option<&[(String, String)]> {
        let root = match operation {
            OperationType::Query => self.query_type.as_deref(),
            OperationType::Mutation => self.mutation_type.as_deref(),
        }?;
        self.arguments
            .get(&(root.to_string(), field.to_string()))
            .map(Vec::as_slice)
    }
}

fn print_type_ref(ty: &Value) -> Option<String> {
    let kind = ty.get("kind")?.as_str()?;
    match kind {
        "NON_NULL" => Some(format!("{}!", print_type_ref(ty.get("ofType")?)?)),
        "LIST" => Some(format!("[{}]", print_type_ref(ty.get("ofType")?)?)),
        _ => ty.get("name")?.as_str().map(String::from),
    }
}

/// The remote operation for one delegated field.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub query: String,
    pub variables: Map<String, Value>,
}

/// Builds the remote operation selecting `field_name` with the caller's sub-selection.
/// Arguments travel as variables typed after the remote field's signature.
pub fn plan_delegation(
    operation: OperationType,
    field_name: &str,
    arguments: &Map<String, Value>,
    remote: &RemoteSchema,
    selection: &[SelectionNode],
) -> Result<QueryPlan, String> {
    let signature = remote
        .root_arguments(operation, field_name)
        .ok_or_else(|| format!("Remote schema has no {} field \"{field_name}\"", operation.keyword()))?;

    let mut declarations = Vec::new();
    let mut passed = Vec::new();
    let mut variables = Map::new();
    for (name, value) in arguments {
        let (_, type_name) = signature
            .iter()
            .find(|(arg, _)| arg == name)
            .ok_or_else(|| format!("Remote field \"{field_name}\" has no argument \"{name}\""))?;
        declarations.push(format!("${name}: {type_name}"));
        passed.push(format!("{name}: ${name}"));
        variables.insert(name.clone(), value.clone());
    }

    let mut query = String::from(operation.keyword());
    query.push_str(" StitchDelegate");
    if !declarations.is_empty() {
        query.push_str(&format!("({})", declarations.join(", ")));
    }
    query.push_str(" { ");
    query.push_str(field_name);
    if !passed.is_empty() {
        query.push_str(&format!("({})", passed.join(", ")));
    }
    print_selection(&mut query, selection);
    query.push_str(" }");

    Ok(QueryPlan { query, variables })
}

fn print_selection(out: &mut String, selection: &[SelectionNode]) {
    if selection.is_empty() {
        return;
    }
    out.push_str(" { __typename");
    let mut seen = HashSet::from(["__typename".to_string()]);
    // child resolvers read values by field name, so aliases are not forwarded
    for node in selection {
        if !seen.insert(node.name.clone()) {
            continue;
        }
        out.push(' ');
        out.push_str(&node.name);
        if !node.arguments.is_empty() {
            let printed: Vec<_> = node
                .arguments
                .iter()
                .map(|(name, value)| format!("{name}: {value}"))
                .collect();
            out.push_str(&format!("({})", printed.join(", ")));
        }
        print_selection(out, &node.children);
    }
    out.push_str(" }");
}

/// Names of the root fields an incoming operation selects, following fragments.
pub fn root_fields(query: &str, operation_name: Option<&str>) -> Result<Vec<String>, String> {
    let document =
        parse_query::<String>(query).map_err(|e| format!("Failed to parse query: {}", e))?;

    let operation = document
        .definitions
        .iter()
        .filter_map(|definition| match definition {
            Definition::Operation(op) => Some(op),
            Definition::Fragment(_) => None,
        })
        .find(|op| match operation_name {
            Some(wanted) => operation_name_of(op) == Some(wanted),
            None => true,
        });

    let Some(operation) = operation else {
        return Ok(Vec::new());
    };
    let selection_set = match operation {
        OperationDefinition::SelectionSet(set) => set,
        OperationDefinition::Query(q) => &q.selection_set,
        OperationDefinition::Mutation(m) => &m.selection_set,
        OperationDefinition::Subscription(s) => &s.selection_set,
    };

    let mut fields = Vec::new();
    collect_fields(&document, selection_set, &mut fields, &mut HashSet::new());
    Ok(fields)
}

fn operation_name_of<'a>(op: &'a OperationDefinition<'_, String>) -> Option<&'a str> {
    match op {
        OperationDefinition::SelectionSet(_) => None,
        OperationDefinition::Query(q) => q.name.as_deref(),
        OperationDefinition::Mutation(m) => m.name.as_deref(),
        OperationDefinition::Subscription(s) => s.name.as_deref(),
    }
}

fn collect_fields<'d>(
    document: &'d Document<'_, String>,
    selection_set: &'d SelectionSet<'_, String>,
    fields: &mut Vec<String>,
    visited: &mut HashSet<&'d str>,
) {
    for selection in &selection_set.items {
        match selection {
            Selection::Field(field) => fields.push(field.name.clone()),
            Selection::InlineFragment(fragment) => {
                collect_fields(document, &fragment.selection_set, fields, visited)
            }
            Selection::FragmentSpread(spread) => {
                if !visited.insert(spread.fragment_name.as_str()) {
                    continue;
                }
                let fragment = document.definitions.iter().find_map(|d| match d {
                    Definition::Fragment(f) if f.name == spread.fragment_name => Some(f),
                    _ => None,
                });
                if let Some(fragment) = fragment {
                    collect_fields(document, &fragment.selection_set, fields, visited);
                }
            }
        }
    }
}
