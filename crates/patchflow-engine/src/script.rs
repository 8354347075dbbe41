//! Sandboxed plugin script execution
//!
//! Plugin node logic is JavaScript, executed with boa_engine in an
//! isolated `Context` per invocation. The sandbox exposes no filesystem,
//! network or host objects beyond an injected `logger`, so plugin
//! execution is atomic and side-effect free from the engine's point of
//! view.
//!
//! A plugin module declares a top-level `NODE_INFO` record and, unless it
//! is spec-only, a `run` function whose positional parameters align with
//! `ports_in`. `invoke` adapts that into the engine's uniform
//! `(params, inputs) -> outputs-by-name` contract:
//!
//! - inputs are bound positionally with precedence edge value, then node
//!   params, then port default, then null
//! - a single-output `run` returns the value directly; plain object
//!   returns are rejected (reserved)
//! - a multi-output `run` returns an array of exactly `len(ports_out)`
//!   values, zipped to output names
//! - function-valued results travel as source-text envelopes and are
//!   revived into callables when fed to a downstream plugin; the
//!   envelope carries source only, so a transported function must not
//!   close over its module's state

use boa_engine::{js_string, Context, JsString, JsValue, Source};
use patchflow_core::events::LogLevel;
use patchflow_core::spec::NodeSpec;
use patchflow_core::value::{self, PortValues};
use serde_json::{Map, Value};

use crate::error::ScriptError;

/// Internal global holding the last `run` result while its shape is probed
const RESULT_SLOT: &str = "__patchflow_result";

/// Prelude evaluated before every plugin module, providing the logger
const LOGGER_PRELUDE: &str = r#"
const __patchflow_logs = [];
const logger = {
    debug: (m) => __patchflow_logs.push(["DEBUG", String(m)]),
    info: (m) => __patchflow_logs.push(["INFO", String(m)]),
    warn: (m) => __patchflow_logs.push(["WARN", String(m)]),
    error: (m) => __patchflow_logs.push(["ERROR", String(m)]),
};
"#;

/// A plugin module's source text, evaluated fresh for every use
#[derive(Debug, Clone)]
pub struct ScriptModule {
    source: String,
}

impl ScriptModule {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Evaluate the module once and read its declarations.
    ///
    /// Returns the normalized spec and whether the module declares a
    /// callable `run` (spec-only modules do not).
    pub fn load(&self) -> Result<(NodeSpec, bool), ScriptError> {
        let mut context = new_context()?;
        eval(&mut context, &self.source).map_err(ScriptError::Eval)?;

        let info = eval(
            &mut context,
            "typeof NODE_INFO === \"undefined\" ? undefined : NODE_INFO",
        )
        .map_err(ScriptError::Eval)?;
        if info.is_undefined() {
            return Err(ScriptError::MissingNodeInfo);
        }
        let info_json = info
            .to_json(&mut context)
            .map_err(|e| ScriptError::InvalidNodeInfo(e.to_string()))?;
        let spec = NodeSpec::from_node_info(&info_json)
            .map_err(|e| ScriptError::InvalidNodeInfo(e.to_string()))?;

        let run = eval(
            &mut context,
            "typeof run === \"function\" ? run : undefined",
        )
        .map_err(ScriptError::Eval)?;

        Ok((spec, run.is_callable()))
    }

    /// Invoke the module's `run` with positionally bound inputs.
    ///
    /// Lines the plugin wrote through `logger` are appended to `logs`
    /// whether or not the invocation succeeds.
    pub fn invoke(
        &self,
        spec: &NodeSpec,
        params: &Map<String, Value>,
        inputs: &PortValues,
        logs: &mut Vec<(LogLevel, String)>,
    ) -> Result<PortValues, ScriptError> {
        let mut context = new_context()?;
        eval(&mut context, &self.source).map_err(ScriptError::Eval)?;

        let run = eval(
            &mut context,
            "typeof run === \"function\" ? run : undefined",
        )
        .map_err(ScriptError::Eval)?;
        let run = run.as_callable().ok_or(ScriptError::MissingRun)?.clone();

        let mut args = Vec::with_capacity(spec.inputs.len());
        for port in &spec.inputs {
            let json = inputs
                .get(&port.name)
                .or_else(|| params.get(&port.name))
                .or(port.default.as_ref());
            let js = match json {
                Some(v) => json_to_js(v, &mut context).map_err(|message| {
                    ScriptError::Conversion {
                        port: port.name.clone(),
                        message,
                    }
                })?,
                None => JsValue::null(),
            };
            args.push(js);
        }

        let result = run.call(&JsValue::undefined(), &args, &mut context);
        drain_logs(&mut context, logs);

        let result = result.map_err(|e| ScriptError::Raised(e.to_string()))?;
        shape_outputs(result, spec, &mut context)
    }
}

/// Run a named hook function from `hooks.js` source, if it is defined.
///
/// Returns whether the hook existed. Errors from the hook body propagate;
/// the caller decides whether to suppress them.
pub fn call_hook(source: &str, hook: &str) -> Result<bool, ScriptError> {
    let mut context = new_context()?;
    eval(&mut context, source).map_err(ScriptError::Eval)?;

    let probe = format!("typeof {hook} === \"function\" ? {hook} : undefined");
    let func = eval(&mut context, &probe).map_err(ScriptError::Eval)?;
    let Some(func) = func.as_callable() else {
        return Ok(false);
    };
    func.call(&JsValue::undefined(), &[], &mut context)
        .map_err(|e| ScriptError::Raised(e.to_string()))?;
    Ok(true)
}

fn new_context() -> Result<Context, ScriptError> {
    let mut context = Context::default();
    eval(&mut context, LOGGER_PRELUDE).map_err(ScriptError::Eval)?;
    Ok(context)
}

fn eval(context: &mut Context, code: &str) -> Result<JsValue, String> {
    context
        .eval(Source::from_bytes(code))
        .map_err(|e| e.to_string())
}

/// Convert a JSON value to JS, reviving function envelopes into callables
fn json_to_js(json: &Value, context: &mut Context) -> Result<JsValue, String> {
    if let Some((_, source)) = value::as_function_envelope(json) {
        return eval(context, &format!("({source})"));
    }
    JsValue::from_json(json, context).map_err(|e| e.to_string())
}

/// Convert a JS value to JSON, capturing callables as function envelopes
fn js_to_json(js: &JsValue, context: &mut Context) -> Result<Value, String> {
    if js.is_null_or_undefined() {
        return Ok(Value::Null);
    }
    if let Some(func) = js.as_callable() {
        let name = func
            .get(js_string!("name"), context)
            .ok()
            .and_then(|v| v.to_string(context).ok())
            .map(|s| s.to_std_string_escaped())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "anonymous".to_string());
        let source = js
            .to_string(context)
            .map_err(|e| e.to_string())?
            .to_std_string_escaped();
        return Ok(value::function_envelope(&name, &source));
    }
    js.to_json(context).map_err(|e| e.to_string())
}

/// Zip a `run` return value onto the spec's output ports
fn shape_outputs(
    result: JsValue,
    spec: &NodeSpec,
    context: &mut Context,
) -> Result<PortValues, ScriptError> {
    let mut outputs = PortValues::new();
    if spec.outputs.is_empty() {
        return Ok(outputs);
    }

    let conversion = |port: &str, message: String| ScriptError::Conversion {
        port: port.to_string(),
        message,
    };

    if spec.outputs.len() == 1 {
        let port = &spec.outputs[0].name;
        if is_plain_object(&result, context)? {
            return Err(ScriptError::MappingReturn);
        }
        let json = js_to_json(&result, context).map_err(|m| conversion(port, m))?;
        outputs.insert(port.clone(), json);
        return Ok(outputs);
    }

    if !is_js_array(&result, context)? {
        if result.is_object() {
            return Err(ScriptError::MappingReturn);
        }
        return Err(ScriptError::OutputArity {
            expected: spec.outputs.len(),
            got: 1,
        });
    }

    let array = result.as_object().expect("arrays are objects").clone();
    let length = array
        .get(js_string!("length"), context)
        .and_then(|v| v.to_number(context))
        .map_err(|e| ScriptError::Eval(e.to_string()))? as usize;
    if length != spec.outputs.len() {
        return Err(ScriptError::OutputArity {
            expected: spec.outputs.len(),
            got: length,
        });
    }

    for (index, port) in spec.outputs.iter().enumerate() {
        let element = array
            .get(index as u32, context)
            .map_err(|e| conversion(&port.name, e.to_string()))?;
        let json = js_to_json(&element, context).map_err(|m| conversion(&port.name, m))?;
        outputs.insert(port.name.clone(), json);
    }
    Ok(outputs)
}

fn is_js_array(value: &JsValue, context: &mut Context) -> Result<bool, ScriptError> {
    probe_result(value, "Array.isArray(__patchflow_result)", context)
}

/// A non-array, non-callable object: the reserved "mapping" return shape
fn is_plain_object(value: &JsValue, context: &mut Context) -> Result<bool, ScriptError> {
    if !value.is_object() || value.is_callable() {
        return Ok(false);
    }
    Ok(!probe_result(value, "Array.isArray(__patchflow_result)", context)?)
}

fn probe_result(
    value: &JsValue,
    expression: &str,
    context: &mut Context,
) -> Result<bool, ScriptError> {
    context
        .global_object()
        .set(JsString::from(RESULT_SLOT), value.clone(), false, context)
        .map_err(|e| ScriptError::Eval(e.to_string()))?;
    let probed = eval(context, expression).map_err(ScriptError::Eval)?;
    Ok(probed.to_boolean())
}

fn drain_logs(context: &mut Context, logs: &mut Vec<(LogLevel, String)>) {
    let Ok(collected) = eval(context, "__patchflow_logs") else {
        return;
    };
    let Ok(json) = collected.to_json(context) else {
        return;
    };
    let Some(entries) = json.as_array() else {
        return;
    };
    for entry in entries {
        let level = entry
            .get(0)
            .and_then(Value::as_str)
            .map(parse_level)
            .unwrap_or(LogLevel::Info);
        let message = entry
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        logs.push((level, message));
    }
}

fn parse_level(raw: &str) -> LogLevel {
    match raw {
        "DEBUG" => LogLevel::Debug,
        "WARN" => LogLevel::Warn,
        "ERROR" => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invoke_simple(
        source: &str,
        params: Value,
        inputs: Value,
    ) -> Result<PortValues, ScriptError> {
        let module = ScriptModule::new(source);
        let (spec, has_run) = module.load()?;
        assert!(has_run);
        let params = params.as_object().cloned().unwrap_or_default();
        let inputs = inputs.as_object().cloned().unwrap_or_default();
        let mut logs = Vec::new();
        module.invoke(&spec, &params, &inputs, &mut logs)
    }

    #[test]
    fn test_load_reads_node_info() {
        let module = ScriptModule::new(
            r#"
            const NODE_INFO = {
                type: "conv_test_node",
                label: "Conv Test",
                category: "TEST",
                ports_in: [{name: "x", type: "NUMBER", default: 5}],
                ports_out: [{name: "y", type: "NUMBER"}],
            };
            function run(x) { return x * 10; }
            "#,
        );
        let (spec, has_run) = module.load().unwrap();
        assert_eq!(spec.node_type, "conv_test_node");
        assert_eq!(spec.inputs[0].default, Some(json!(5)));
        assert!(has_run);
    }

    #[test]
    fn test_load_spec_only_module() {
        let module = ScriptModule::new(
            r#"
            var NODE_INFO = {
                type: "spec_only",
                label: "Spec Only",
                category: "CONTROL",
                ports_in: [],
                ports_out: [],
            };
            "#,
        );
        let (spec, has_run) = module.load().unwrap();
        assert_eq!(spec.node_type, "spec_only");
        assert!(!has_run);
    }

    #[test]
    fn test_load_without_node_info_fails() {
        let module = ScriptModule::new("function run(x) { return x; }");
        assert!(matches!(module.load(), Err(ScriptError::MissingNodeInfo)));
    }

    #[test]
    fn test_load_syntax_error_fails() {
        let module = ScriptModule::new("const NODE_INFO = {");
        assert!(matches!(module.load(), Err(ScriptError::Eval(_))));
    }

    #[test]
    fn test_inputs_bound_positionally() {
        let outputs = invoke_simple(
            r#"
            const NODE_INFO = {
                type: "t", label: "T", category: "T",
                ports_in: [{name: "array", type: "ARRAY"}],
                ports_out: [{name: "array", type: "ARRAY"}],
            };
            function run(array) { return array.map((x) => x * 2); }
            "#,
            json!({}),
            json!({"array": [1, 2, 3]}),
        )
        .unwrap();
        assert_eq!(outputs["array"], json!([2, 4, 6]));
    }

    #[test]
    fn test_params_fill_unconnected_inputs() {
        let outputs = invoke_simple(
            r#"
            const NODE_INFO = {
                type: "t", label: "T", category: "T",
                ports_in: [{name: "size", type: "NUMBER", default: 1000}],
                ports_out: [{name: "size", type: "NUMBER"}],
            };
            function run(size) { return size; }
            "#,
            json!({"size": 5}),
            json!({}),
        )
        .unwrap();
        assert_eq!(outputs["size"], json!(5));
    }

    #[test]
    fn test_defaults_fill_last() {
        let outputs = invoke_simple(
            r#"
            const NODE_INFO = {
                type: "t", label: "T", category: "T",
                ports_in: [{name: "size", type: "NUMBER", default: 42}],
                ports_out: [{name: "size", type: "NUMBER"}],
            };
            function run(size) { return size; }
            "#,
            json!({}),
            json!({}),
        )
        .unwrap();
        assert_eq!(outputs["size"], json!(42));
    }

    #[test]
    fn test_edge_input_beats_params() {
        let outputs = invoke_simple(
            r#"
            const NODE_INFO = {
                type: "t", label: "T", category: "T",
                ports_in: [{name: "x", type: "NUMBER"}],
                ports_out: [{name: "x", type: "NUMBER"}],
            };
            function run(x) { return x; }
            "#,
            json!({"x": 1}),
            json!({"x": 2}),
        )
        .unwrap();
        assert_eq!(outputs["x"], json!(2));
    }

    #[test]
    fn test_multi_output_array_is_zipped() {
        let outputs = invoke_simple(
            r#"
            const NODE_INFO = {
                type: "t", label: "T", category: "T",
                ports_in: [{name: "x", type: "NUMBER"}],
                ports_out: [{name: "a", type: "NUMBER"}, {name: "b", type: "NUMBER"}],
            };
            function run(x) { return [x * 2, x * 3]; }
            "#,
            json!({"x": 10}),
            json!({}),
        )
        .unwrap();
        assert_eq!(outputs["a"], json!(20));
        assert_eq!(outputs["b"], json!(30));
    }

    #[test]
    fn test_single_output_array_is_the_value() {
        let outputs = invoke_simple(
            r#"
            const NODE_INFO = {
                type: "t", label: "T", category: "T",
                ports_in: [],
                ports_out: [{name: "array", type: "ARRAY"}],
            };
            function run() { return [7, 8, 9]; }
            "#,
            json!({}),
            json!({}),
        )
        .unwrap();
        assert_eq!(outputs["array"], json!([7, 8, 9]));
    }

    #[test]
    fn test_mapping_return_is_rejected() {
        let result = invoke_simple(
            r#"
            const NODE_INFO = {
                type: "t", label: "T", category: "T",
                ports_in: [],
                ports_out: [{name: "out", type: "ANY"}],
            };
            function run() { return {out: 1}; }
            "#,
            json!({}),
            json!({}),
        );
        assert!(matches!(result, Err(ScriptError::MappingReturn)));
    }

    #[test]
    fn test_output_arity_mismatch_is_rejected() {
        let result = invoke_simple(
            r#"
            const NODE_INFO = {
                type: "t", label: "T", category: "T",
                ports_in: [],
                ports_out: [{name: "a", type: "ANY"}, {name: "b", type: "ANY"}],
            };
            function run() { return [1, 2, 3]; }
            "#,
            json!({}),
            json!({}),
        );
        assert!(matches!(
            result,
            Err(ScriptError::OutputArity {
                expected: 2,
                got: 3
            })
        ));
    }

    #[test]
    fn test_run_exception_is_captured() {
        let result = invoke_simple(
            r#"
            const NODE_INFO = {
                type: "t", label: "T", category: "T",
                ports_in: [],
                ports_out: [{name: "out", type: "ANY"}],
            };
            function run() { throw new Error("deliberate failure"); }
            "#,
            json!({}),
            json!({}),
        );
        match result {
            Err(ScriptError::Raised(trace)) => assert!(trace.contains("deliberate failure")),
            other => panic!("expected Raised, got {other:?}"),
        }
    }

    #[test]
    fn test_logger_lines_are_collected() {
        let module = ScriptModule::new(
            r#"
            const NODE_INFO = {
                type: "t", label: "T", category: "T",
                ports_in: [{name: "array", type: "ARRAY"}],
                ports_out: [{name: "array", type: "ARRAY"}],
            };
            function run(array) {
                logger.info("got " + array.length + " items");
                logger.warn("slow path");
                return array;
            }
            "#,
        );
        let (spec, _) = module.load().unwrap();
        let inputs = json!({"array": [1, 2]}).as_object().cloned().unwrap();
        let mut logs = Vec::new();
        module
            .invoke(&spec, &Map::new(), &inputs, &mut logs)
            .unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0], (LogLevel::Info, "got 2 items".to_string()));
        assert_eq!(logs[1], (LogLevel::Warn, "slow path".to_string()));
    }

    #[test]
    fn test_logs_survive_a_failing_run() {
        let module = ScriptModule::new(
            r#"
            const NODE_INFO = {
                type: "t", label: "T", category: "T",
                ports_in: [],
                ports_out: [{name: "out", type: "ANY"}],
            };
            function run() {
                logger.error("about to fail");
                throw new Error("boom");
            }
            "#,
        );
        let (spec, _) = module.load().unwrap();
        let mut logs = Vec::new();
        let result = module.invoke(&spec, &Map::new(), &PortValues::new(), &mut logs);
        assert!(result.is_err());
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].0, LogLevel::Error);
    }

    #[test]
    fn test_function_output_becomes_envelope_and_revives() {
        let producer = ScriptModule::new(
            r#"
            const NODE_INFO = {
                type: "make_scale", label: "Make Scale", category: "COST",
                ports_in: [],
                ports_out: [{name: "fn", type: "FUNCTION"}],
            };
            function run() { return (x) => x * 3; }
            "#,
        );
        let (spec, _) = producer.load().unwrap();
        let mut logs = Vec::new();
        let outputs = producer
            .invoke(&spec, &Map::new(), &PortValues::new(), &mut logs)
            .unwrap();
        assert!(patchflow_core::value::as_function_envelope(&outputs["fn"]).is_some());

        let consumer = ScriptModule::new(
            r#"
            const NODE_INFO = {
                type: "apply", label: "Apply", category: "COST",
                ports_in: [{name: "fn", type: "FUNCTION"}, {name: "x", type: "NUMBER"}],
                ports_out: [{name: "y", type: "NUMBER"}],
            };
            function run(fn, x) { return fn(x); }
            "#,
        );
        let (consumer_spec, _) = consumer.load().unwrap();
        let mut consumer_inputs = PortValues::new();
        consumer_inputs.insert("fn".to_string(), outputs["fn"].clone());
        consumer_inputs.insert("x".to_string(), json!(5));
        let result = consumer
            .invoke(&consumer_spec, &Map::new(), &consumer_inputs, &mut logs)
            .unwrap();
        assert_eq!(result["y"], json!(15));
    }

    #[test]
    fn test_call_hook_runs_defined_hooks() {
        let source = r#"
            function on_activate() { /* warm caches */ }
        "#;
        assert!(call_hook(source, "on_activate").unwrap());
        assert!(!call_hook(source, "on_deactivate").unwrap());
    }

    #[test]
    fn test_call_hook_propagates_errors() {
        let source = r#"function on_uninstall() { throw new Error("refuse"); }"#;
        assert!(matches!(
            call_hook(source, "on_uninstall"),
            Err(ScriptError::Raised(_))
        ));
    }
}
