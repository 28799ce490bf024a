use futures::FutureExt;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use super::{FieldInvocation, FieldResult, Resolver};
use crate::param_injection::deep_inject;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum MergeStrategy {
    #[default]
    Replace,
    Merge,
    MergeDeep,
}

/// Arguments of `@localResolver`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalResolverArgs {
    pub value: Value,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
}

/// `@stub`: a constant, with placeholders injected per call.
pub(super) fn resolver(value: Value) -> Resolver {
    let value = Arc::new(value);
    Arc::new(move |invocation: FieldInvocation| {
        let resolved = deep_inject(&value, &invocation.context(None));
        futures::future::ready(FieldResult::Ok(resolved)).boxed()
    })
}

/// `@localResolver`: like `@stub` for `Replace`, otherwise the injected value is
/// merged over what `inner` resolves.
pub(super) fn local_resolver(args: LocalResolverArgs, inner: Resolver) -> Resolver {
    let strategy = args.merge_strategy;
    if strategy == MergeStrategy::Replace {
        return resolver(args.value);
    }

    let value = Arc::new(args.value);
    Arc::new(move |invocation: FieldInvocation| {
        let stub = deep_inject(&value, &invocation.context(None));
        let inner = inner.clone();
        async move {
            let mut resolved = inner(invocation).await?;
            match strategy {
                MergeStrategy::MergeDeep => deep_merge(&mut resolved, stub),
                _ => shallow_merge(&mut resolved, stub),
            }
            FieldResult::Ok(resolved)
        }
        .boxed()
    })
}

/// Top level keys of `source` win. A non object on either side yields `source`.
fn shallow_merge(target: &mut Value, source: Value) {
    match (target.as_object_mut(), source) {
        (Some(target), Value::Object(source)) => target.extend(source),
        (_, source) => *target = source,
    }
}

/// Objects merge key by key and arrays index by index; anything else is overwritten.
fn deep_merge(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(target), Value::Array(source)) => {
            for (index, value) in source.into_iter().enumerate() {
                match target.get_mut(index) {
                    Some(existing) => deep_merge(existing, value),
                    None => target.push(value),
                }
            }
        }
        (target, source) => *target = source,
    }
}
