//! Shared fixtures for the unit-test modules

use patchflow_core::spec::{NodeSpec, PortSpec};
use patchflow_core::value::PortValues;
use serde_json::Value;

/// Build a port map from a JSON object literal
pub(crate) fn port_values(value: Value) -> PortValues {
    value.as_object().cloned().unwrap_or_default()
}

pub(crate) fn gen_spec() -> NodeSpec {
    NodeSpec::new("gen", "Generate", "SOURCE")
        .with_input(PortSpec::optional("n", "NUMBER").with_default(3))
        .with_output(PortSpec::optional("out", "ARRAY"))
}

pub(crate) fn double_spec() -> NodeSpec {
    NodeSpec::new("double", "Double", "MAP")
        .with_input(PortSpec::optional("in", "ARRAY"))
        .with_output(PortSpec::optional("out", "ARRAY"))
}

pub(crate) fn sink_spec() -> NodeSpec {
    NodeSpec::new("collect", "Collect", "SINK")
        .with_input(PortSpec::optional("vals", "ANY"))
        .with_output(PortSpec::optional("vals", "ANY"))
}
