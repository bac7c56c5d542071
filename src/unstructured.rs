//! Typed access to unstructured objects
//!
//! Rendered addon manifests and live objects fetched through the dynamic
//! store arrive as plain JSON. Every accessor here walks a field path and
//! reports a `FieldError` naming the path when an intermediate node or the
//! leaf has an unexpected shape. An absent field is `Ok(None)`.

use std::collections::BTreeMap;

use kube::api::GroupVersionKind;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Unstructured(Map<String, Value>);

fn join(path: &[&str]) -> String {
    if path.is_empty() {
        ".".to_string()
    } else {
        path.join(".")
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn unexpected(path: &[&str], expected: &str, found: &Value) -> Error {
    Error::field(
        join(path),
        format!("expected {expected}, found {}", type_name(found)),
    )
}

impl Unstructured {
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(unexpected(&[], "object", &other)),
        }
    }

    pub fn from_object<T: serde::Serialize>(obj: &T) -> Result<Self> {
        Self::from_value(serde_json::to_value(obj)?)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn value_at(&self, path: &[&str]) -> Result<Option<&Value>> {
        let Some((last, parents)) = path.split_last() else {
            return Err(Error::field(".", "empty field path"));
        };
        let mut current = &self.0;
        for (depth, segment) in parents.iter().enumerate() {
            match current.get(*segment) {
                None | Some(Value::Null) => return Ok(None),
                Some(Value::Object(next)) => current = next,
                Some(other) => return Err(unexpected(&path[..=depth], "object", other)),
            }
        }
        Ok(current.get(*last))
    }

    pub fn str_at(&self, path: &[&str]) -> Result<Option<&str>> {
        match self.value_at(path)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(unexpected(path, "string", other)),
        }
    }

    pub fn bool_at(&self, path: &[&str]) -> Result<Option<bool>> {
        match self.value_at(path)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(unexpected(path, "bool", other)),
        }
    }

    pub fn map_at(&self, path: &[&str]) -> Result<Option<&Map<String, Value>>> {
        match self.value_at(path)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(m)) => Ok(Some(m)),
            Some(other) => Err(unexpected(path, "object", other)),
        }
    }

    /// A map whose values must all be strings, such as labels or matchLabels
    pub fn string_map_at(&self, path: &[&str]) -> Result<Option<BTreeMap<String, String>>> {
        let Some(map) = self.map_at(path)? else {
            return Ok(None);
        };
        let mut out = BTreeMap::new();
        for (k, v) in map {
            match v {
                Value::String(s) => {
                    out.insert(k.clone(), s.clone());
                }
                other => {
                    let mut full: Vec<&str> = path.to_vec();
                    full.push(k);
                    return Err(unexpected(&full, "string", other));
                }
            }
        }
        Ok(Some(out))
    }

    /// Set a field, creating intermediate objects as needed
    pub fn set_at(&mut self, path: &[&str], value: Value) -> Result<()> {
        let Some((last, parents)) = path.split_last() else {
            return Err(Error::field(".", "empty field path"));
        };
        let mut current = &mut self.0;
        for (depth, segment) in parents.iter().enumerate() {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if entry.is_null() {
                *entry = Value::Object(Map::new());
            }
            match entry {
                Value::Object(next) => current = next,
                other => return Err(unexpected(&path[..=depth], "object", other)),
            }
        }
        current.insert(last.to_string(), value);
        Ok(())
    }

    pub fn kind(&self) -> Result<&str> {
        self.str_at(&["kind"])?
            .ok_or_else(|| Error::field("kind", "missing"))
    }

    pub fn name(&self) -> Result<&str> {
        self.str_at(&["metadata", "name"])?
            .ok_or_else(|| Error::field("metadata.name", "missing"))
    }

    pub fn namespace(&self) -> Result<Option<&str>> {
        self.str_at(&["metadata", "namespace"])
    }

    pub fn gvk(&self) -> Result<GroupVersionKind> {
        let api_version = self
            .str_at(&["apiVersion"])?
            .ok_or_else(|| Error::field("apiVersion", "missing"))?;
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", api_version),
        };
        Ok(GroupVersionKind::gvk(group, version, self.kind()?))
    }
}

/// Parse a rendered multi-document YAML manifest, skipping empty documents
pub fn parse_manifests(yaml: &str) -> Result<Vec<Unstructured>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        objects.push(Unstructured::from_value(value)?);
    }
    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment() -> Unstructured {
        Unstructured::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "coredns", "namespace": "kube-system"},
            "spec": {
                "replicas": 2,
                "selector": {"matchLabels": {"app": "coredns"}}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_nested_access() {
        let obj = deployment();
        let labels = obj
            .string_map_at(&["spec", "selector", "matchLabels"])
            .unwrap()
            .unwrap();
        assert_eq!(labels.get("app").map(String::as_str), Some("coredns"));
        assert_eq!(obj.name().unwrap(), "coredns");
        assert_eq!(obj.namespace().unwrap(), Some("kube-system"));
    }

    #[test]
    fn test_missing_field_is_none() {
        let obj = deployment();
        assert!(obj.str_at(&["spec", "template", "name"]).unwrap().is_none());
    }

    #[test]
    fn test_wrong_shape_names_path() {
        let obj = deployment();
        let err = obj.str_at(&["spec", "replicas", "value"]).unwrap_err();
        match err {
            Error::FieldError { path, message } => {
                assert_eq!(path, "spec.replicas");
                assert!(message.contains("found number"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_set_creates_parents() {
        let mut obj = Unstructured::default();
        obj.set_at(&["network", "cidr"], json!("10.0.0.2/24"))
            .unwrap();
        assert_eq!(obj.str_at(&["network", "cidr"]).unwrap(), Some("10.0.0.2/24"));
    }

    #[test]
    fn test_gvk_core_group() {
        let obj =
            Unstructured::from_value(json!({"apiVersion": "v1", "kind": "ConfigMap"})).unwrap();
        let gvk = obj.gvk().unwrap();
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "ConfigMap");
    }

    #[test]
    fn test_parse_manifests_skips_empty_documents() {
        let yaml = r#"
---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: csi
---
---
apiVersion: storage.k8s.io/v1
kind: CSIDriver
metadata:
  name: csi.example.com
spec:
  attachRequired: true
"#;
        let objects = parse_manifests(yaml).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[1].kind().unwrap(), "CSIDriver");
        assert_eq!(objects[1].bool_at(&["spec", "attachRequired"]).unwrap(), Some(true));
    }
}
