//! Machine Custom Resource Definition
//!
//! A Machine is the workload object of a user cluster. Its provider spec is
//! opaque to the control plane except for the `network` block, which the
//! IPAM controller fills in for machines marked with the `ipam` initializer.

use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::Condition;
use crate::error::{Error, Result};
use crate::unstructured::Unstructured;

/// Annotation listing pending initializers, comma separated
pub const INITIALIZERS_ANNOTATION: &str = "fleetplane.io/initializers";

/// Initializer token handled by the IPAM controller
pub const IPAM_INITIALIZER: &str = "ipam";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "cluster.fleetplane.io",
    version = "v1alpha1",
    kind = "Machine",
    namespaced,
    status = "MachineStatus",
    shortname = "ma",
    printcolumn = r#"{"name":"Address","type":"string","jsonPath":".spec.providerSpec.value.network.cidr"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    #[serde(default)]
    pub provider_spec: ProviderSpec,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubelet_version: Option<String>,
}

/// Cloud-provider specific configuration, kept as raw JSON
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ProviderSpec {
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub value: Value,
}

fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        Value::Bool(true),
    );
    Schema::Object(schema)
}

/// Static network assignment inside the provider spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Address with the prefix length of its pool, e.g. `192.168.0.2/16`
    pub cidr: String,
    pub gateway: String,
    #[serde(default)]
    pub dns: DnsConfig,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct DnsConfig {
    #[serde(default)]
    pub servers: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

const NETWORK_PATH: &[&str] = &["network"];

impl Machine {
    /// Network block of the provider spec, if one has been assigned
    pub fn network(&self) -> Result<Option<NetworkConfig>> {
        let value = &self.spec.provider_spec.value;
        if value.is_null() {
            return Ok(None);
        }
        let spec = Unstructured::from_value(value.clone())
            .map_err(|_| Error::field("spec.providerSpec.value", "expected an object"))?;
        match spec.value_at(NETWORK_PATH)? {
            None | Some(Value::Null) => Ok(None),
            Some(raw) => serde_json::from_value(raw.clone())
                .map(Some)
                .map_err(|e| Error::field("spec.providerSpec.value.network", e.to_string())),
        }
    }

    /// Write the network block, keeping every other provider field
    pub fn set_network(&mut self, network: &NetworkConfig) -> Result<()> {
        let value = std::mem::take(&mut self.spec.provider_spec.value);
        let mut spec = if value.is_null() {
            Unstructured::default()
        } else {
            Unstructured::from_value(value)
                .map_err(|_| Error::field("spec.providerSpec.value", "expected an object"))?
        };
        spec.set_at(NETWORK_PATH, serde_json::to_value(network)?)?;
        self.spec.provider_spec.value = spec.into_value();
        Ok(())
    }

    /// Whether `token` is listed in the initializers annotation
    pub fn has_initializer(&self, token: &str) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(INITIALIZERS_ANNOTATION))
            .map(|v| v.split(',').any(|t| t.trim() == token))
            .unwrap_or(false)
    }

    /// Drop `token` from the initializers annotation, removing the
    /// annotation once no initializer is left
    pub fn remove_initializer(&mut self, token: &str) {
        let Some(annotations) = self.metadata.annotations.as_mut() else {
            return;
        };
        let Some(current) = annotations.get(INITIALIZERS_ANNOTATION) else {
            return;
        };
        let remaining: Vec<String> = current
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty() && *t != token)
            .map(String::from)
            .collect();
        if remaining.is_empty() {
            annotations.remove(INITIALIZERS_ANNOTATION);
        } else {
            let joined = remaining.join(",");
            annotations.insert(INITIALIZERS_ANNOTATION.to_string(), joined);
        }
    }
}
