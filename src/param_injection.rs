//! Placeholder templates such as `/users/{source.id}?q={args.filter.name}`.

use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::exports::{ExportTracker, ObjectNode};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{(source|args|jwt|exports|result)\.(\w+(?:\.\w+)*)\}")
        .expect("placeholder pattern is valid")
});

static EMPTY_CLAIMS: LazyLock<Map<String, Value>> = LazyLock::new(Map::new);
static NULL: Value = Value::Null;

/// Where `{exports.*}` lookups start.
#[derive(Clone, Copy)]
pub struct ExportLookup<'a> {
    pub tracker: &'a ExportTracker,
    pub parent_type: &'a str,
    pub parent: Option<&'a ObjectNode>,
}

/// Everything a template may reference while resolving one field.
#[derive(Clone, Copy)]
pub struct ResolutionContext<'a> {
    pub source: &'a Value,
    pub args: &'a Value,
    pub jwt: &'a Map<String, Value>,
    pub exports: Option<ExportLookup<'a>>,
    pub result: Option<&'a Value>,
}

impl<'a> ResolutionContext<'a> {
    /// A context with nothing to resolve against; placeholders become null.
    pub fn empty() -> ResolutionContext<'static> {
        ResolutionContext {
            source: &NULL,
            args: &NULL,
            jwt: &EMPTY_CLAIMS,
            exports: None,
            result: None,
        }
    }

    pub fn with_jwt<'b>(self, jwt: &'b Map<String, Value>) -> ResolutionContext<'b>
    where
        'a: 'b,
    {
        ResolutionContext {
            source: self.source,
            args: self.args,
            jwt,
            exports: self.exports,
            result: self.result,
        }
    }

    fn lookup(&self, source: &str, path: &str) -> Value {
        match source {
            "source" => lookup_path(self.source, path),
            "args" => lookup_path(self.args, path),
            "result" => self
                .result
                .map(|result| lookup_path(result, path))
                .unwrap_or(Value::Null),
            "jwt" => {
                let (claim, rest) = path.split_once('.').unwrap_or((path, ""));
                match self.jwt.get(claim) {
                    Some(value) if rest.is_empty() => value.clone(),
                    Some(value) => lookup_path(value, rest),
                    None => Value::Null,
                }
            }
            "exports" => self
                .exports
                .and_then(|lookup| lookup.tracker.resolve(lookup.parent_type, lookup.parent, path))
                .unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }
}

/// Dotted traversal through objects and (numeric) array indices. Missing keys are null.
pub fn lookup_path(root: &Value, path: &str) -> Value {
    let mut current = root;
    for segment in path.split('.') {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// Resolves a template. A template that is exactly one placeholder keeps the value's
/// type; anything else is textual substitution.
pub fn inject(template: &str, ctx: &ResolutionContext<'_>) -> Value {
    if let Some(caps) = PLACEHOLDER.captures(template) {
        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        if whole.len() == template.len() {
            return ctx.lookup(&caps[1], &caps[2]);
        }
    } else {
        return Value::String(template.to_string());
    }

    let replaced = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
        stringify(&ctx.lookup(&caps[1], &caps[2]))
    });
    Value::String(replaced.into_owned())
}

/// Maps every placeholder found in `template` to its value. `None` when there are none.
pub fn resolve_parameters(
    template: &str,
    ctx: &ResolutionContext<'_>,
) -> Option<BTreeMap<String, Value>> {
    let resolved: BTreeMap<_, _> = PLACEHOLDER
        .captures_iter(template)
        .map(|caps| (caps[0].to_string(), ctx.lookup(&caps[1], &caps[2])))
        .collect();
    (!resolved.is_empty()).then_some(resolved)
}

/// Injects every string inside `value`, recursing through objects and arrays.
pub fn deep_inject(value: &Value, ctx: &ResolutionContext<'_>) -> Value {
    match value {
        Value::String(template) => inject(template, ctx),
        Value::Array(items) => Value::Array(items.iter().map(|v| deep_inject(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, v)| (key.clone(), deep_inject(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// String form used for textual substitution: strings raw, null empty, rest as JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exports::ExportMap;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn single_placeholder_keeps_its_type() {
        let source = json!({ "id": 7, "tags": ["a", "b"], "owner": { "name": "Ann" } });
        let ctx = ResolutionContext {
            source: &source,
            ..ResolutionContext::empty()
        };

        assert_eq!(inject("{source.id}", &ctx), json!(7));
        assert_eq!(inject("{source.tags}", &ctx), json!(["a", "b"]));
        assert_eq!(inject("{source.owner.name}", &ctx), json!("Ann"));
        assert_eq!(inject("{source.tags.1}", &ctx), json!("b"));
    }

    #[test]
    fn mixed_templates_become_strings() {
        let source = json!({ "id": 7 });
        let args = json!({ "filter": { "name": "x y" }, "flag": true });
        let ctx = ResolutionContext {
            source: &source,
            args: &args,
            ..ResolutionContext::empty()
        };

        assert_eq!(
            inject("/users/{source.id}/{args.filter.name}?f={args.flag}", &ctx),
            json!("/users/7/x y?f=true")
        );
        assert_eq!(inject("plain", &ctx), json!("plain"));
    }

    #[test]
    fn missing_paths_never_fail() {
        let ctx = ResolutionContext::empty();
        assert_eq!(inject("{source.a.b.c}", &ctx), Value::Null);
        assert_eq!(inject("id-{args.missing}", &ctx), json!("id-"));
        assert_eq!(inject("{exports.anything}", &ctx), Value::Null);
        assert_eq!(inject("{jwt.sub}", &ctx), Value::Null);
    }

    #[test]
    fn jwt_and_result_sources() {
        let claims = json!({ "sub": "alice", "org": { "id": "o1" } });
        let claims = claims.as_object().unwrap().clone();
        let result = json!({ "owner": "alice" });
        let ctx = ResolutionContext {
            result: Some(&result),
            ..ResolutionContext::empty().with_jwt(&claims)
        };

        assert_eq!(inject("{jwt.sub}", &ctx), json!("alice"));
        assert_eq!(inject("{jwt.org.id}", &ctx), json!("o1"));
        assert_eq!(inject("{result.owner}", &ctx), json!("alice"));
    }

    #[test]
    fn exports_walk_the_tracker() {
        let mut map = ExportMap::default();
        map.mark("User", "id", "userId");
        let tracker = ExportTracker::new(Arc::new(map));
        let user = tracker.record(json!({ "id": "u1" }), None, "Query");
        let post = tracker.record(json!({ "id": "p1" }), Some(&user), "User");

        let ctx = ResolutionContext {
            exports: Some(ExportLookup {
                tracker: &tracker,
                parent_type: "Post",
                parent: Some(&post),
            }),
            ..ResolutionContext::empty()
        };
        assert_eq!(inject("{exports.userId}", &ctx), json!("u1"));
    }

    #[test]
    fn resolve_parameters_lists_each_placeholder() {
        let source = json!({ "ids": [1, 2] });
        let ctx = ResolutionContext {
            source: &source,
            ..ResolutionContext::empty()
        };

        let resolved = resolve_parameters("{source.ids},{args.q}", &ctx).unwrap();
        assert_eq!(resolved["{source.ids}"], json!([1, 2]));
        assert_eq!(resolved["{args.q}"], Value::Null);
        assert_eq!(resolve_parameters("no placeholders", &ctx), None);
    }

    #[test]
    fn deep_inject_recurses() {
        let args = json!({ "id": 3 });
        let ctx = ResolutionContext {
            args: &args,
            ..ResolutionContext::empty()
        };
        let template = json!({ "where": { "id": "{args.id}", "label": "n{args.id}" }, "limit": 5 });

        assert_eq!(
            deep_inject(&template, &ctx),
            json!({ "where": { "id": 3, "label": "n3" }, "limit": 5 })
        );
    }
}
