/// Lua expressions over run variables
///
/// Edge conditions, assignment expressions and script nodes all run in a fresh
/// sandboxed Lua state with the run variables installed as globals. Each call
/// gets its own state; nothing is shared between evaluations.

use crate::error::ActionError;
use crate::history::log::Trigger;
use mlua::{Lua, LuaSerdeExt, SerializeOptions};
use serde_json::{Map, Value};

/// Globals removed from every sandbox
const BLOCKED_GLOBALS: [&str; 9] = [
    "os",
    "io",
    "debug",
    "package",
    "require",
    "dofile",
    "loadfile",
    "load",
    "collectgarbage",
];

/// Build a sandboxed Lua state with `variables` installed as globals
fn sandbox(variables: &Map<String, Value>) -> mlua::Result<Lua> {
    let lua = Lua::new();
    let globals = lua.globals();

    globals.set("time", lua.create_function(|_, ()| Ok(chrono::Utc::now().timestamp()))?)?;
    globals.set("now", lua.create_function(|_, ()| Ok(chrono::Utc::now().to_rfc3339()))?)?;
    globals.set(
        "date",
        lua.create_function(|_, format: String| Ok(chrono::Utc::now().format(&format).to_string()))?,
    )?;

    for name in BLOCKED_GLOBALS {
        globals.set(name, mlua::Nil)?;
    }

    let options = SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false);
    for (key, value) in variables {
        globals.set(key.as_str(), lua.to_value_with(value, options)?)?;
    }
    globals.set("vars", lua.to_value_with(variables, options)?)?;

    Ok(lua)
}

/// Evaluate an expression and convert the result to JSON
pub fn evaluate(expr: &str, variables: &Map<String, Value>) -> Result<Value, ActionError> {
    let lua = sandbox(variables).map_err(|e| ActionError::new("expression_error", e.to_string()))?;
    let result: mlua::Value = lua
        .load(expr)
        .eval()
        .map_err(|e| ActionError::new("expression_error", format!("'{}': {}", expr, e)))?;
    lua_to_json(result)
}

/// Evaluate an edge condition with Lua truthiness (only nil and false are false)
pub fn evaluate_condition(expr: &str, variables: &Map<String, Value>) -> Result<bool, ActionError> {
    Ok(!matches!(evaluate(expr, variables)?, Value::Null | Value::Bool(false)))
}

/// Run a script body; a bare `return` value becomes the output
pub fn run_script(source: &str, variables: &Map<String, Value>) -> Result<Value, ActionError> {
    let lua = sandbox(variables).map_err(|e| ActionError::new("script_error", e.to_string()))?;
    let result: mlua::Value = lua
        .load(source)
        .set_name("script")
        .eval()
        .map_err(|e| ActionError::new("script_error", e.to_string()))?;
    lua_to_json(result)
}

/// Convert a Lua value to JSON; tables with dense 1-based keys become arrays
pub(crate) fn lua_to_json(value: mlua::Value) -> Result<Value, ActionError> {
    let convert = |e: mlua::Error| ActionError::new("expression_error", e.to_string());

    match value {
        mlua::Value::Nil => Ok(Value::Null),
        mlua::Value::Boolean(b) => Ok(Value::Bool(b)),
        mlua::Value::Integer(i) => Ok(Value::from(i)),
        mlua::Value::Number(f) => Ok(serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        mlua::Value::String(s) => Ok(Value::String(s.to_str().map_err(convert)?.to_string())),
        mlua::Value::Table(table) => {
            let mut count = 0usize;
            let mut max_index = 0usize;
            let mut is_array = true;
            for pair in table.pairs::<mlua::Value, mlua::Value>() {
                let (key, _) = pair.map_err(convert)?;
                count += 1;
                match key {
                    mlua::Value::Integer(i) if i > 0 => max_index = max_index.max(i as usize),
                    _ => {
                        is_array = false;
                        break;
                    }
                }
            }

            if is_array && count > 0 && count == max_index {
                let mut items = Vec::with_capacity(max_index);
                for i in 1..=max_index {
                    items.push(lua_to_json(table.get(i).map_err(convert)?)?);
                }
                Ok(Value::Array(items))
            } else {
                let mut object = Map::new();
                for pair in table.pairs::<mlua::Value, mlua::Value>() {
                    let (key, value) = pair.map_err(convert)?;
                    let key = match key {
                        mlua::Value::String(s) => s.to_str().map_err(convert)?.to_string(),
                        mlua::Value::Integer(i) => i.to_string(),
                        mlua::Value::Number(f) => f.to_string(),
                        _ => continue,
                    };
                    object.insert(key, lua_to_json(value)?);
                }
                Ok(Value::Object(object))
            }
        }
        // The JSON null sentinel and other userdata have no JSON form
        _ => Ok(Value::Null),
    }
}

/// State visible to `$` references in node params
pub struct ReferenceScope<'a> {
    pub execution_id: &'a str,
    pub variables: &'a Map<String, Value>,
    pub trigger: &'a Trigger,
}

/// Resolve `$var.path`, `$trigger.field` and `$execution.id` references
///
/// Only whole-string references are replaced; anything unresolved becomes null.
pub fn resolve_references(params: &Value, scope: &ReferenceScope<'_>) -> Value {
    match params {
        Value::String(s) if s.starts_with('$') => resolve_reference(&s[1..], scope),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_references(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_references(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_reference(reference: &str, scope: &ReferenceScope<'_>) -> Value {
    let mut parts = reference.split('.');
    match parts.next() {
        Some("var") => {
            let Some(first) = parts.next() else {
                return Value::Object(scope.variables.clone());
            };
            let root = scope.variables.get(first).cloned().unwrap_or(Value::Null);
            lookup_path(&root, parts)
        }
        Some("trigger") => {
            let trigger = serde_json::to_value(scope.trigger).unwrap_or(Value::Null);
            lookup_path(&trigger, parts)
        }
        Some("execution") => match parts.next() {
            Some("id") => Value::String(scope.execution_id.to_string()),
            _ => Value::Null,
        },
        _ => Value::Null,
    }
}

fn lookup_path<'a>(root: &Value, path: impl Iterator<Item = &'a str>) -> Value {
    let pointer: String = path
        .map(|segment| format!("/{}", segment.replace('~', "~0").replace('/', "~1")))
        .collect();
    root.pointer(&pointer).cloned().unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn conditions_see_variables() {
        let v = vars(json!({ "amount": 5000, "customer": { "tier": "gold" } }));
        assert!(evaluate_condition("amount > 1000", &v).unwrap());
        assert!(evaluate_condition("customer.tier == 'gold'", &v).unwrap());
        assert!(!evaluate_condition("amount < 10", &v).unwrap());
        assert!(!evaluate_condition("missing", &v).unwrap());
    }

    #[test]
    fn sandbox_blocks_os() {
        let err = evaluate("os.time()", &Map::new()).unwrap_err();
        assert_eq!(err.code, "expression_error");
    }

    #[test]
    fn tables_convert_to_arrays_and_objects() {
        let out = run_script("return { total = amount * 2, tags = { 'a', 'b' } }", &vars(json!({ "amount": 21 })))
            .unwrap();
        assert_eq!(out, json!({ "total": 42, "tags": ["a", "b"] }));
    }

    #[test]
    fn references_resolve_against_run_state() {
        let variables = vars(json!({ "order": { "lines": [{ "sku": "A-1" }] } }));
        let trigger = Trigger::manual().with_record("order", "o-42");
        let scope = ReferenceScope {
            execution_id: "run-9",
            variables: &variables,
            trigger: &trigger,
        };

        let params = json!({
            "sku": "$var.order.lines.0.sku",
            "id": "$trigger.recordId",
            "run": "$execution.id",
            "missing": "$var.nope.deeper",
            "literal": "plain",
        });
        assert_eq!(
            resolve_references(&params, &scope),
            json!({
                "sku": "A-1",
                "id": "o-42",
                "run": "run-9",
                "missing": null,
                "literal": "plain",
            })
        );
    }

    #[test]
    fn reference_segments_are_literal_keys() {
        let variables = vars(json!({ "headers": { "content/type": "json", "a~b": 1 }, "rows": [[7]] }));
        let trigger = Trigger::manual();
        let scope = ReferenceScope {
            execution_id: "run-1",
            variables: &variables,
            trigger: &trigger,
        };

        assert_eq!(resolve_reference("var.headers.content/type", &scope), json!("json"));
        assert_eq!(resolve_reference("var.headers.a~b", &scope), json!(1));
        assert_eq!(resolve_reference("var.rows.0.0", &scope), json!(7));
        assert_eq!(resolve_reference("var.rows.1", &scope), Value::Null);
        assert_eq!(resolve_reference("var.headers", &scope), variables["headers"]);
    }
}
