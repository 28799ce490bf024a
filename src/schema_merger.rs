//! Merges independently authored SDL documents into a single document.
//!
//! Object, input object and union definitions (including their `extend` forms) are
//! grouped by name and folded together. Every other definition passes through
//! untouched, in first-occurrence order.

use graphql_parser::schema::{
    Definition, Directive, Document, Field, InputObjectType, InputValue, ObjectType, TypeDefinition,
    TypeExtension, UnionType, parse_schema,
};
use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::error::{BuildError, SchemaMergeError};

pub type SchemaDocument = Document<'static, String>;

/// One source document, named for error reporting.
#[derive(Debug, Clone)]
pub struct NamedDocument {
    pub name: String,
    pub document: SchemaDocument,
}

impl NamedDocument {
    pub fn parse(name: impl Into<String>, sdl: &str) -> Result<Self, BuildError> {
        let name = name.into();
        let document = parse_schema::<String>(sdl)
            .map_err(|e| BuildError::Parse {
                name: name.clone(),
                message: e.to_string(),
            })?
            .into_static();
        Ok(NamedDocument { name, document })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupKind {
    Object,
    InputObject,
    Union,
}

impl GroupKind {
    fn describe(self) -> &'static str {
        match self {
            GroupKind::Object => "object type",
            GroupKind::InputObject => "input object type",
            GroupKind::Union => "union",
        }
    }
}

enum MergedGroup {
    Object(ObjectType<'static, String>),
    InputObject(InputObjectType<'static, String>),
    Union(UnionType<'static, String>),
}

impl MergedGroup {
    fn kind(&self) -> GroupKind {
        match self {
            MergedGroup::Object(_) => GroupKind::Object,
            MergedGroup::InputObject(_) => GroupKind::InputObject,
            MergedGroup::Union(_) => GroupKind::Union,
        }
    }

    fn into_definition(self) -> Definition<'static, String> {
        let type_definition = match self {
            MergedGroup::Object(object) => TypeDefinition::Object(object),
            MergedGroup::InputObject(input) => TypeDefinition::InputObject(input),
            MergedGroup::Union(union_type) => TypeDefinition::Union(union_type),
        };
        Definition::TypeDefinition(type_definition)
    }
}

enum Slot {
    PassThrough(Definition<'static, String>),
    Group(String),
}

/// Merges documents in order. The first conflicting name aborts the whole merge.
pub fn merge(documents: &[NamedDocument]) -> Result<SchemaDocument, SchemaMergeError> {
    let mut slots = Vec::new();
    let mut groups: HashMap<String, MergedGroup> = HashMap::new();

    for definition in documents
        .iter()
        .flat_map(|doc| doc.document.definitions.iter().cloned())
    {
        let incoming = match into_group(definition) {
            Ok(group) => group,
            Err(definition) => {
                slots.push(Slot::PassThrough(definition));
                continue;
            }
        };

        let name = group_name(&incoming).to_string();
        match groups.entry(name) {
            Entry::Vacant(entry) => {
                slots.push(Slot::Group(entry.key().clone()));
                entry.insert(incoming);
            }
            Entry::Occupied(mut entry) => fold_group(entry.get_mut(), incoming)?,
        }
    }

    let definitions = slots
        .into_iter()
        .filter_map(|slot| match slot {
            Slot::PassThrough(definition) => Some(definition),
            Slot::Group(name) => groups.remove(&name).map(MergedGroup::into_definition),
        })
        .collect();

    Ok(Document { definitions })
}

/// Parses and merges raw SDL strings, the shape callers usually hold.
pub fn merge_sdl<'a>(
    sources: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Result<SchemaDocument, BuildError> {
    let documents = sources
        .into_iter()
        .map(|(name, sdl)| NamedDocument::parse(name, sdl))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(merge(&documents)?)
}

fn group_name(group: &MergedGroup) -> &str {
    match group {
        MergedGroup::Object(object) => &object.name,
        MergedGroup::InputObject(input) => &input.name,
        MergedGroup::Union(union_type) => &union_type.name,
    }
}

fn into_group(
    definition: Definition<'static, String>,
) -> Result<MergedGroup, Definition<'static, String>> {
    match definition {
        Definition::TypeDefinition(TypeDefinition::Object(object)) => {
            Ok(MergedGroup::Object(object))
        }
        Definition::TypeDefinition(TypeDefinition::InputObject(input)) => {
            Ok(MergedGroup::InputObject(input))
        }
        Definition::TypeDefinition(TypeDefinition::Union(union_type)) => {
            Ok(MergedGroup::Union(union_type))
        }
        Definition::TypeExtension(TypeExtension::Object(ext)) => Ok(MergedGroup::Object(ObjectType {
            position: ext.position,
            description: None,
            name: ext.name,
            implements_interfaces: ext.implements_interfaces,
            directives: ext.directives,
            fields: ext.fields,
        })),
        Definition::TypeExtension(TypeExtension::InputObject(ext)) => {
            Ok(MergedGroup::InputObject(InputObjectType {
                position: ext.position,
                description: None,
                name: ext.name,
                directives: ext.directives,
                fields: ext.fields,
            }))
        }
        Definition::TypeExtension(TypeExtension::Union(ext)) => Ok(MergedGroup::Union(UnionType {
            position: ext.position,
            description: None,
            name: ext.name,
            directives: ext.directives,
            types: ext.types,
        })),
        other => Err(other),
    }
}

fn fold_group(target: &mut MergedGroup, incoming: MergedGroup) -> Result<(), SchemaMergeError> {
    match (target, incoming) {
        (MergedGroup::Object(target), MergedGroup::Object(incoming)) => {
            merge_object(target, incoming)
        }
        (MergedGroup::InputObject(target), MergedGroup::InputObject(incoming)) => {
            merge_input_object(target, incoming)
        }
        (MergedGroup::Union(target), MergedGroup::Union(incoming)) => {
            merge_union(target, incoming);
            Ok(())
        }
        (target, incoming) => Err(SchemaMergeError::new(
            group_name(&incoming),
            format!(
                "defined as both {} and {}",
                target.kind().describe(),
                incoming.kind().describe()
            ),
        )),
    }
}

fn merge_object(
    target: &mut ObjectType<'static, String>,
    incoming: ObjectType<'static, String>,
) -> Result<(), SchemaMergeError> {
    if target.description.is_none() {
        target.description = incoming.description;
    }
    union_directives(&mut target.directives, incoming.directives);
    union_names(&mut target.implements_interfaces, incoming.implements_interfaces);

    for field in incoming.fields {
        match target.fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => {
                if let Some(reason) = field_mismatch(existing, &field) {
                    return Err(SchemaMergeError::new(
                        format!("{}.{}", target.name, field.name),
                        reason,
                    ));
                }
                union_directives(&mut existing.directives, field.directives);
                for (existing_arg, arg) in existing.arguments.iter_mut().zip(field.arguments) {
                    union_directives(&mut existing_arg.directives, arg.directives);
                }
            }
            None => target.fields.push(field),
        }
    }
    Ok(())
}

fn merge_input_object(
    target: &mut InputObjectType<'static, String>,
    incoming: InputObjectType<'static, String>,
) -> Result<(), SchemaMergeError> {
    if target.description.is_none() {
        target.description = incoming.description;
    }
    union_directives(&mut target.directives, incoming.directives);

    for field in incoming.fields {
        match target.fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => {
                if let Some(reason) = input_value_mismatch(existing, &field) {
                    return Err(SchemaMergeError::new(
                        format!("{}.{}", target.name, field.name),
                        reason,
                    ));
                }
                union_directives(&mut existing.directives, field.directives);
            }
            None => target.fields.push(field),
        }
    }
    Ok(())
}

fn merge_union(target: &mut UnionType<'static, String>, incoming: UnionType<'static, String>) {
    if target.description.is_none() {
        target.description = incoming.description;
    }
    union_directives(&mut target.directives, incoming.directives);
    union_names(&mut target.types, incoming.types);
}

/// Compares everything but directives, descriptions and source positions.
fn field_mismatch(a: &Field<'static, String>, b: &Field<'static, String>) -> Option<String> {
    if a.field_type != b.field_type {
        return Some(format!(
            "field type differs ({} vs {})",
            a.field_type, b.field_type
        ));
    }
    if a.arguments.len() != b.arguments.len() {
        return Some(format!(
            "argument count differs ({} vs {})",
            a.arguments.len(),
            b.arguments.len()
        ));
    }
    a.arguments
        .iter()
        .zip(&b.arguments)
        .find_map(|(x, y)| input_value_mismatch(x, y).map(|reason| format!("argument {reason}")))
}

fn input_value_mismatch(
    a: &InputValue<'static, String>,
    b: &InputValue<'static, String>,
) -> Option<String> {
    if a.name != b.name {
        return Some(format!("name differs ({} vs {})", a.name, b.name));
    }
    if a.value_type != b.value_type {
        return Some(format!(
            "\"{}\" type differs ({} vs {})",
            a.name, a.value_type, b.value_type
        ));
    }
    if a.default_value != b.default_value {
        return Some(format!("\"{}\" default value differs", a.name));
    }
    None
}

fn same_directive(a: &Directive<'static, String>, b: &Directive<'static, String>) -> bool {
    a.name == b.name && a.arguments == b.arguments
}

fn union_directives(
    target: &mut Vec<Directive<'static, String>>,
    incoming: Vec<Directive<'static, String>>,
) {
    for directive in incoming {
        if !target.iter().any(|d| same_directive(d, &directive)) {
            target.push(directive);
        }
    }
}

fn union_names(target: &mut Vec<String>, incoming: Vec<String>) {
    for name in incoming {
        if !target.contains(&name) {
            target.push(name);
        }
    }
}
