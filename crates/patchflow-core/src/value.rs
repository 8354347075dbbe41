//! Value summarization for the event stream
//!
//! Values flowing on edges are opaque `serde_json::Value` payloads. The
//! engine never inspects them except here, to produce compact summaries
//! for `node_complete` and `node_breakpoint` events so the canvas does not
//! receive megabytes of array data it cannot display anyway.
//!
//! Function-valued payloads (ports tagged `FUNCTION`) travel as an
//! envelope object carrying the function's source text; the script layer
//! revives the envelope into a callable on the receiving side.

use serde_json::{json, Map, Value};

/// Port-name keyed value map, the shape of a node's inputs and outputs
pub type PortValues = Map<String, Value>;

/// Envelope key marking a function value crossing the script boundary
pub const FUNCTION_KEY: &str = "__function__";

/// Arrays longer than this are summarized rather than passed verbatim
const ARRAY_SUMMARY_THRESHOLD: usize = 10;

/// Wrap a function's name and source text into a transportable envelope
pub fn function_envelope(name: &str, source: &str) -> Value {
    json!({ FUNCTION_KEY: { "name": name, "source": source } })
}

/// If `value` is a function envelope, return its (name, source)
pub fn as_function_envelope(value: &Value) -> Option<(&str, &str)> {
    let inner = value.as_object()?.get(FUNCTION_KEY)?;
    let name = inner.get("name")?.as_str()?;
    let source = inner.get("source")?.as_str()?;
    Some((name, source))
}

/// Summarize a single value for the event stream.
///
/// Long arrays become `{type:"array", length, first_10}`, function
/// envelopes become `{type:"function", name}`, everything else passes
/// through unchanged.
pub fn summarize(value: &Value) -> Value {
    if let Some((name, _)) = as_function_envelope(value) {
        return json!({ "type": "function", "name": name });
    }
    if let Value::Array(items) = value {
        if items.len() > ARRAY_SUMMARY_THRESHOLD {
            return json!({
                "type": "array",
                "length": items.len(),
                "first_10": items[..ARRAY_SUMMARY_THRESHOLD],
            });
        }
    }
    value.clone()
}

/// Summarize every value in a port map
pub fn summarize_map(values: &PortValues) -> PortValues {
    values
        .iter()
        .map(|(k, v)| (k.clone(), summarize(v)))
        .collect()
}
