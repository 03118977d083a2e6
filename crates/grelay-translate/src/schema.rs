//! Reduction of client-supplied JSON Schema to the subset the Gemini
//! function-calling API accepts.
//!
//! The reduction is lossy but idempotent: running it twice yields the same
//! value as running it once. Every rule is best-effort; malformed corners of
//! the input degrade to an empty schema instead of failing the request.

use serde_json::{Map, Value, json};

const MAX_DEPTH: usize = 20;

const SUPPORTED_TYPES: &[&str] = &["string", "number", "integer", "boolean", "object", "array"];

const DROPPED_KEYWORDS: &[&str] = &[
    "$schema",
    "$defs",
    "definitions",
    "patternProperties",
    "examples",
    "deprecated",
    "readOnly",
    "writeOnly",
];

const NUMERIC_KEYWORDS: &[&str] = &[
    "minimum",
    "maximum",
    "multipleOf",
    "minLength",
    "maxLength",
    "minItems",
    "maxItems",
    "minProperties",
    "maxProperties",
];

#[derive(Debug, Clone)]
pub struct SanitizeOptions {
    /// Strip `title` keywords.
    pub strip_title: bool,
    /// Strip `additionalProperties` entirely. When retained, booleans pass
    /// through, object forms are sanitized, everything else becomes `false`.
    pub strip_additional_properties: bool,
}

impl Default for SanitizeOptions {
    fn default() -> Self {
        Self {
            strip_title: true,
            strip_additional_properties: true,
        }
    }
}

pub fn sanitize_schema(schema: &Value) -> Value {
    sanitize_schema_with(schema, &SanitizeOptions::default())
}

pub fn sanitize_schema_with(schema: &Value, options: &SanitizeOptions) -> Value {
    let mut ctx = Context {
        options,
        scopes: Vec::new(),
        resolving: Vec::new(),
    };
    sanitize_node(schema.clone(), &mut ctx, 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DefsKind {
    Defs,
    Definitions,
}

struct DefsScope {
    kind: DefsKind,
    entries: Map<String, Value>,
}

struct Context<'a> {
    options: &'a SanitizeOptions,
    scopes: Vec<DefsScope>,
    /// Definitions currently being inlined, keyed by scope index and name.
    /// A re-entry means the reference graph cycles; the node degrades to an
    /// empty schema.
    resolving: Vec<(usize, String)>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn sanitize_node(value: Value, ctx: &mut Context<'_>, depth: usize) -> Value {
    if depth > MAX_DEPTH {
        return empty_object();
    }
    let Value::Object(map) = value else {
        return empty_object();
    };

    let scopes_before = ctx.scopes.len();
    push_scopes(&map, ctx);

    let result = if let Some(Value::String(reference)) = map.get("$ref") {
        resolve_reference(reference, ctx, depth)
    } else {
        sanitize_object(map, ctx, depth)
    };

    ctx.scopes.truncate(scopes_before);
    result
}

fn push_scopes(map: &Map<String, Value>, ctx: &mut Context<'_>) {
    if let Some(Value::Object(entries)) = map.get("$defs") {
        ctx.scopes.push(DefsScope {
            kind: DefsKind::Defs,
            entries: entries.clone(),
        });
    }
    if let Some(Value::Object(entries)) = map.get("definitions") {
        ctx.scopes.push(DefsScope {
            kind: DefsKind::Definitions,
            entries: entries.clone(),
        });
    }
}

fn resolve_reference(reference: &str, ctx: &mut Context<'_>, depth: usize) -> Value {
    let target = reference
        .strip_prefix("#/$defs/")
        .map(|name| (DefsKind::Defs, name))
        .or_else(|| {
            reference
                .strip_prefix("#/definitions/")
                .map(|name| (DefsKind::Definitions, name))
        });
    let Some((kind, name)) = target else {
        // Non-local or unsupported reference shape.
        return empty_object();
    };

    for index in (0..ctx.scopes.len()).rev() {
        if ctx.scopes[index].kind != kind {
            continue;
        }
        let Some(node) = ctx.scopes[index].entries.get(name) else {
            continue;
        };
        let key = (index, name.to_string());
        if ctx.resolving.contains(&key) {
            return empty_object();
        }
        let node = node.clone();
        ctx.resolving.push(key);
        let out = sanitize_node(node, ctx, depth + 1);
        ctx.resolving.pop();
        return out;
    }

    empty_object()
}

fn sanitize_object(mut map: Map<String, Value>, ctx: &mut Context<'_>, depth: usize) -> Value {
    rename_combinator_aliases(&mut map);
    lift_type_array(&mut map);

    for key in ["anyOf", "oneOf", "allOf"] {
        match map.remove(key) {
            Some(Value::Array(branches)) => return collapse_branches(branches, ctx, depth),
            Some(_) => {} // malformed combinator value: dropped, keep going
            None => {}
        }
    }

    for key in DROPPED_KEYWORDS {
        map.remove(*key);
    }
    if ctx.options.strip_title {
        map.remove("title");
    }
    let additional_properties = map.remove("additionalProperties");
    map.remove("$ref");

    if let Some(value) = map.remove("const") {
        map.insert("enum".to_string(), json!([value]));
    }

    normalize_type(&mut map);
    infer_type(&mut map);

    // A typed node keeps `enum` only when the type is exactly "string";
    // untyped enums survive (covers `const` rewrites on scalar values).
    let enum_allowed = match map.get("type") {
        Some(declared) => declared.as_str() == Some("string"),
        None => true,
    };
    if !enum_allowed {
        map.remove("enum");
    }

    sanitize_numeric_keywords(&mut map);

    if let Some(properties) = map.remove("properties") {
        if let Value::Object(entries) = properties {
            let mut out = Map::new();
            for (name, sub) in entries {
                out.insert(name, sanitize_node(sub, ctx, depth + 1));
            }
            map.insert("properties".to_string(), Value::Object(out));
        }
        // non-object `properties` values are dropped
    }

    if let Some(items) = map.remove("items") {
        match items {
            Value::Object(_) => {
                let sanitized = sanitize_node(items, ctx, depth + 1);
                map.insert("items".to_string(), sanitized);
            }
            Value::Array(entries) => {
                let sanitized: Vec<Value> = entries
                    .into_iter()
                    .map(|entry| sanitize_node(entry, ctx, depth + 1))
                    .collect();
                map.insert("items".to_string(), Value::Array(sanitized));
            }
            _ => {}
        }
    }

    if let Some(Value::Array(entries)) = map.remove("prefixItems") {
        let sanitized: Vec<Value> = entries
            .into_iter()
            .map(|entry| sanitize_node(entry, ctx, depth + 1))
            .collect();
        map.insert("prefixItems".to_string(), Value::Array(sanitized));
    }

    if !ctx.options.strip_additional_properties
        && let Some(value) = additional_properties
    {
        let value = match value {
            Value::Bool(flag) => Value::Bool(flag),
            Value::Object(_) => sanitize_node(value, ctx, depth + 1),
            _ => Value::Bool(false),
        };
        map.insert("additionalProperties".to_string(), value);
    }

    Value::Object(map)
}

fn rename_combinator_aliases(map: &mut Map<String, Value>) {
    for (snake, camel) in [
        ("any_of", "anyOf"),
        ("one_of", "oneOf"),
        ("all_of", "allOf"),
    ] {
        if let Some(value) = map.remove(snake)
            && !map.contains_key(camel)
        {
            map.insert(camel.to_string(), value);
        }
    }
}

/// Multi-type `type` arrays turn into `anyOf` branches so the combinator
/// collapse reduces them to a single supported type.
fn lift_type_array(map: &mut Map<String, Value>) {
    if map.contains_key("anyOf") || map.contains_key("oneOf") || map.contains_key("allOf") {
        return;
    }
    let Some(Value::Array(types)) = map.get("type") else {
        return;
    };
    let branches: Vec<Value> = types
        .iter()
        .filter_map(Value::as_str)
        .map(|name| json!({ "type": name }))
        .collect();
    map.remove("type");
    map.insert("anyOf".to_string(), Value::Array(branches));
}

fn collapse_branches(branches: Vec<Value>, ctx: &mut Context<'_>, depth: usize) -> Value {
    let mut sanitized = Vec::new();
    for branch in branches {
        if is_null_only(&branch) {
            continue;
        }
        let branch = if is_empty_object(&branch) {
            json!({ "type": "object" })
        } else {
            branch
        };
        sanitized.push(sanitize_node(branch, ctx, depth + 1));
    }

    let object_branch = sanitized
        .iter()
        .position(|branch| branch.get("type").and_then(Value::as_str) == Some("object"));
    match object_branch {
        Some(index) => sanitized.swap_remove(index),
        None if !sanitized.is_empty() => sanitized.remove(0),
        None => json!({ "type": "object" }),
    }
}

fn is_null_only(branch: &Value) -> bool {
    let Some(map) = branch.as_object() else {
        return branch.is_null();
    };
    if map.get("type").and_then(Value::as_str) == Some("null") {
        return true;
    }
    matches!(map.get("enum"), Some(Value::Array(values)) if values.len() == 1 && values[0].is_null())
}

fn is_empty_object(branch: &Value) -> bool {
    matches!(branch, Value::Object(map) if map.is_empty())
}

fn normalize_type(map: &mut Map<String, Value>) {
    let Some(declared) = map.get("type") else {
        return;
    };
    let supported = declared
        .as_str()
        .map(|name| SUPPORTED_TYPES.contains(&name))
        .unwrap_or(false);
    if !supported {
        map.remove("type");
    }
}

fn infer_type(map: &mut Map<String, Value>) {
    if map.contains_key("type") {
        return;
    }
    if map.contains_key("properties") || map.contains_key("required") {
        map.insert("type".to_string(), json!("object"));
    } else if map.contains_key("items") || map.contains_key("prefixItems") {
        map.insert("type".to_string(), json!("array"));
    }
}

fn sanitize_numeric_keywords(map: &mut Map<String, Value>) {
    map.remove("exclusiveMinimum");
    map.remove("exclusiveMaximum");

    for key in NUMERIC_KEYWORDS {
        let Some(value) = map.get(*key) else {
            continue;
        };
        if value.is_number() {
            continue;
        }
        let coerced = value
            .as_str()
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .and_then(serde_json::Number::from_f64);
        match coerced {
            Some(number) => {
                map.insert((*key).to_string(), Value::Number(number));
            }
            None => {
                map.remove(*key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_banned_keywords_at_every_depth() {
        let input = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "title": "Root",
            "properties": {
                "inner": {
                    "type": "object",
                    "patternProperties": {".*": {"type": "string"}},
                    "examples": [1, 2],
                    "readOnly": true,
                    "properties": {
                        "leaf": {"type": "string", "writeOnly": true, "deprecated": true}
                    }
                }
            }
        });
        let out = sanitize_schema(&input);
        let rendered = out.to_string();
        for banned in [
            "$schema",
            "patternProperties",
            "examples",
            "readOnly",
            "writeOnly",
            "deprecated",
            "title",
        ] {
            assert!(!rendered.contains(banned), "found {banned} in {rendered}");
        }
    }

    #[test]
    fn collapses_any_of_and_rewrites_const() {
        let input = json!({
            "$schema": "x",
            "anyOf": [
                {"type": "null"},
                {"properties": {"x": {"const": 3}}}
            ]
        });
        let expected = json!({
            "type": "object",
            "properties": {"x": {"enum": [3]}}
        });
        assert_eq!(sanitize_schema(&input), expected);
    }

    #[test]
    fn collapse_prefers_object_branch() {
        let input = json!({
            "oneOf": [
                {"type": "string"},
                {"type": "object", "properties": {"a": {"type": "integer"}}}
            ]
        });
        let out = sanitize_schema(&input);
        assert_eq!(out["type"], "object");
        assert!(out["properties"]["a"].is_object());
    }

    #[test]
    fn collapse_of_all_null_branches_yields_object() {
        let input = json!({"anyOf": [{"type": "null"}, {"enum": [null]}]});
        assert_eq!(sanitize_schema(&input), json!({"type": "object"}));
    }

    #[test]
    fn empty_branch_coerces_to_object() {
        let input = json!({"anyOf": [{}, {"type": "string"}]});
        assert_eq!(sanitize_schema(&input), json!({"type": "object"}));
    }

    #[test]
    fn snake_case_aliases_are_recognized() {
        let input = json!({"any_of": [{"type": "null"}, {"type": "string"}]});
        assert_eq!(sanitize_schema(&input), json!({"type": "string"}));
    }

    #[test]
    fn type_arrays_collapse_to_single_type() {
        let input = json!({"type": ["string", "null"]});
        assert_eq!(sanitize_schema(&input), json!({"type": "string"}));

        let input = json!({"type": ["string", "object"]});
        assert_eq!(sanitize_schema(&input), json!({"type": "object"}));
    }

    #[test]
    fn unsupported_single_type_is_dropped() {
        let input = json!({"type": "date-time", "description": "d"});
        assert_eq!(sanitize_schema(&input), json!({"description": "d"}));
    }

    #[test]
    fn type_inferred_from_shape() {
        assert_eq!(
            sanitize_schema(&json!({"properties": {}}))["type"],
            "object"
        );
        assert_eq!(
            sanitize_schema(&json!({"required": ["a"]}))["type"],
            "object"
        );
        assert_eq!(
            sanitize_schema(&json!({"items": {"type": "string"}}))["type"],
            "array"
        );
    }

    #[test]
    fn enum_guard_keeps_string_and_untyped_enums() {
        let typed = json!({"type": "string", "enum": ["a", "b"]});
        assert_eq!(sanitize_schema(&typed), typed);

        let untyped = json!({"enum": [3]});
        assert_eq!(sanitize_schema(&untyped), untyped);

        let numeric = json!({"type": "integer", "enum": [1, 2]});
        assert_eq!(sanitize_schema(&numeric), json!({"type": "integer"}));
    }

    #[test]
    fn local_refs_are_inlined() {
        let input = json!({
            "$defs": {"Point": {"type": "object", "properties": {"x": {"type": "number"}}}},
            "type": "object",
            "properties": {"origin": {"$ref": "#/$defs/Point"}}
        });
        let out = sanitize_schema(&input);
        assert_eq!(out["properties"]["origin"]["type"], "object");
        assert_eq!(
            out["properties"]["origin"]["properties"]["x"]["type"],
            "number"
        );
        assert!(out.get("$defs").is_none());
    }

    #[test]
    fn definitions_refs_are_inlined() {
        let input = json!({
            "definitions": {"S": {"type": "string"}},
            "properties": {"v": {"$ref": "#/definitions/S"}}
        });
        let out = sanitize_schema(&input);
        assert_eq!(out["properties"]["v"], json!({"type": "string"}));
    }

    #[test]
    fn unresolvable_refs_become_empty() {
        let input = json!({"properties": {"v": {"$ref": "#/$defs/Missing"}}});
        let out = sanitize_schema(&input);
        assert_eq!(out["properties"]["v"], json!({}));

        let external = json!({"properties": {"v": {"$ref": "https://example.com/s.json"}}});
        let out = sanitize_schema(&external);
        assert_eq!(out["properties"]["v"], json!({}));
    }

    #[test]
    fn cyclic_refs_degrade_to_empty() {
        let input = json!({
            "$defs": {"Node": {
                "type": "object",
                "properties": {"next": {"$ref": "#/$defs/Node"}}
            }},
            "$ref": "#/$defs/Node"
        });
        let out = sanitize_schema(&input);
        assert_eq!(out["type"], "object");
        assert_eq!(out["properties"]["next"], json!({}));
    }

    #[test]
    fn depth_is_bounded() {
        let mut schema = json!({"type": "string"});
        for _ in 0..40 {
            schema = json!({"type": "object", "properties": {"n": schema}});
        }
        // Must terminate; deep tails degrade to empty schemas.
        let out = sanitize_schema(&schema);
        assert_eq!(out["type"], "object");
    }

    #[test]
    fn numeric_constraints_are_coerced_or_dropped() {
        let input = json!({
            "type": "integer",
            "minimum": "3",
            "maximum": "not-a-number",
            "exclusiveMinimum": 1,
            "exclusiveMaximum": 9
        });
        let out = sanitize_schema(&input);
        assert_eq!(out["minimum"], json!(3.0));
        assert!(out.get("maximum").is_none());
        assert!(out.get("exclusiveMinimum").is_none());
        assert!(out.get("exclusiveMaximum").is_none());
    }

    #[test]
    fn additional_properties_dropped_by_default() {
        let input = json!({"type": "object", "additionalProperties": {"type": "string"}});
        assert!(sanitize_schema(&input).get("additionalProperties").is_none());
    }

    #[test]
    fn additional_properties_retained_on_request() {
        let options = SanitizeOptions {
            strip_additional_properties: false,
            ..SanitizeOptions::default()
        };
        let boolean = json!({"type": "object", "additionalProperties": true});
        assert_eq!(
            sanitize_schema_with(&boolean, &options)["additionalProperties"],
            json!(true)
        );

        let object = json!({"type": "object", "additionalProperties": {"const": "a"}});
        assert_eq!(
            sanitize_schema_with(&object, &options)["additionalProperties"],
            json!({"enum": ["a"]})
        );

        let other = json!({"type": "object", "additionalProperties": 7});
        assert_eq!(
            sanitize_schema_with(&other, &options)["additionalProperties"],
            json!(false)
        );
    }

    #[test]
    fn non_object_inputs_become_empty_schemas() {
        assert_eq!(sanitize_schema(&json!(true)), json!({}));
        assert_eq!(sanitize_schema(&json!("string")), json!({}));
        assert_eq!(sanitize_schema(&json!([1, 2])), json!({}));
    }

    #[test]
    fn sanitization_is_idempotent() {
        let samples = [
            json!({"$schema": "x", "anyOf": [{"type": "null"}, {"properties": {"x": {"const": 3}}}]}),
            json!({"type": ["string", "null"], "minLength": "2"}),
            json!({
                "$defs": {"N": {"type": "object", "properties": {"next": {"$ref": "#/$defs/N"}}}},
                "$ref": "#/$defs/N"
            }),
            json!({"type": "object", "properties": {
                "a": {"const": 1},
                "b": {"enum": ["x"], "type": "string"},
                "c": {"one_of": [{}, {"type": "integer"}]},
                "d": {"items": {"type": ["integer", "null"]}}
            }, "required": ["a"], "additionalProperties": false}),
            json!({"enum": [null]}),
            json!({"properties": {"p": {"enum": ["a", "b"]}}}),
        ];
        for sample in samples {
            let once = sanitize_schema(&sample);
            let twice = sanitize_schema(&once);
            assert_eq!(once, twice, "not idempotent for {sample}");
        }
    }
}
