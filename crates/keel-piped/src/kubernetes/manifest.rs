use std::{fmt, fs, path::Path};

use keel_common::{config::KubernetesInput, util::command::run_captured};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{
    deploysource::DeploySource,
    error::{KeelPipedError, KeelPipedResult},
    toolregistry::ToolRegistry,
};

pub const LABEL_APPLICATION: &str = "keel.dev/application";
pub const LABEL_MANAGED_BY: &str = "keel.dev/managed-by";
pub const LABEL_VARIANT: &str = "keel.dev/variant";
pub const ANNOTATION_COMMIT_HASH: &str = "keel.dev/commit-hash";
pub const MANAGED_BY_PIPED: &str = "piped";

pub const VARIANT_PRIMARY: &str = "primary";
pub const VARIANT_CANARY: &str = "canary";

const KUSTOMIZATION_FILES: [&str; 2] = ["kustomization.yaml", "kustomization.yml"];

/// Identity of a Kubernetes resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn from_body(body: &Value) -> KeelPipedResult<Self> {
        let field = |path: &[&str]| -> String {
            let mut v = body;
            for p in path {
                match v.get(p) {
                    Some(next) => v = next,
                    None => return String::new(),
                }
            }
            v.as_str().unwrap_or_default().to_string()
        };
        let key = Self {
            api_version: field(&["apiVersion"]),
            kind: field(&["kind"]),
            namespace: field(&["metadata", "namespace"]),
            name: field(&["metadata", "name"]),
        };
        if key.api_version.is_empty() || key.kind.is_empty() || key.name.is_empty() {
            return Err(KeelPipedError::InvalidConfig(
                "manifest must have apiVersion, kind and metadata.name".into(),
            ));
        }
        Ok(key)
    }

    /// Group and version of `api_version`; the core group is empty.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.api_version, self.kind, self.namespace, self.name
        )
    }
}

/// A single resource document.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub key: ResourceKey,
    pub body: Value,
}

impl Manifest {
    pub fn from_body(body: Value) -> KeelPipedResult<Self> {
        let key = ResourceKey::from_body(&body)?;
        Ok(Self { key, body })
    }

    fn metadata_map(&mut self, field: &str) -> Option<&mut Map<String, Value>> {
        let metadata = self
            .body
            .as_object_mut()?
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        let map = metadata
            .as_object_mut()?
            .entry(field)
            .or_insert_with(|| Value::Object(Map::new()));
        if map.is_null() {
            *map = Value::Object(Map::new());
        }
        map.as_object_mut()
    }

    pub fn add_labels<'a>(&mut self, labels: impl IntoIterator<Item = (&'a str, &'a str)>) {
        if let Some(map) = self.metadata_map("labels") {
            for (k, v) in labels {
                map.insert(k.to_string(), Value::String(v.to_string()));
            }
        }
    }

    pub fn add_annotations<'a>(&mut self, annotations: impl IntoIterator<Item = (&'a str, &'a str)>) {
        if let Some(map) = self.metadata_map("annotations") {
            for (k, v) in annotations {
                map.insert(k.to_string(), Value::String(v.to_string()));
            }
        }
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        self.key.namespace = namespace.to_string();
        if let Some(metadata) = self.body.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.insert("namespace".into(), Value::String(namespace.to_string()));
        }
    }

    pub fn set_name(&mut self, name: &str) {
        self.key.name = name.to_string();
        if let Some(metadata) = self.body.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.insert("name".into(), Value::String(name.to_string()));
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.body
            .get("metadata")?
            .get("labels")?
            .get(key)?
            .as_str()
    }

    pub fn is_workload(&self) -> bool {
        matches!(
            self.key.kind.as_str(),
            "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet"
        )
    }

    /// Stamps the labels and annotation every applied resource carries.
    pub fn add_builtin_metadata(&mut self, app_id: &str, commit_hash: &str, variant: &str) {
        self.add_labels([
            (LABEL_APPLICATION, app_id),
            (LABEL_MANAGED_BY, MANAGED_BY_PIPED),
            (LABEL_VARIANT, variant),
        ]);
        self.add_annotations([(ANNOTATION_COMMIT_HASH, commit_hash)]);
    }
}

/// Parses a multi document YAML stream. Empty documents are skipped.
pub fn parse_manifests(data: &str) -> KeelPipedResult<Vec<Manifest>> {
    let mut manifests = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(data) {
        let body = Value::deserialize(doc)?;
        if body.is_null() {
            continue;
        }
        manifests.push(Manifest::from_body(body)?);
    }
    Ok(manifests)
}

/// Loads the manifests of an application directory.
///
/// A kustomization in the directory is rendered with `kustomize build`;
/// otherwise the listed files are read, or every YAML file but the
/// application config when none are listed.
pub async fn load_manifests(
    app_dir: &Path,
    input: &KubernetesInput,
    config_filename: &str,
) -> KeelPipedResult<Vec<Manifest>> {
    let mut manifests = if KUSTOMIZATION_FILES.iter().any(|f| app_dir.join(f).is_file()) {
        kustomize_build(app_dir).await?
    } else {
        let files = if input.manifests.is_empty() {
            let mut files = Vec::new();
            for entry in fs::read_dir(app_dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if !entry.file_type()?.is_file() || name == config_filename {
                    continue;
                }
                if name.ends_with(".yaml") || name.ends_with(".yml") {
                    files.push(name);
                }
            }
            files.sort();
            files
        } else {
            input.manifests.clone()
        };
        let mut manifests = Vec::new();
        for file in files {
            let data = fs::read_to_string(app_dir.join(&file))?;
            manifests.extend(parse_manifests(&data)?);
        }
        manifests
    };

    if !input.namespace.is_empty() {
        for m in manifests.iter_mut() {
            m.set_namespace(&input.namespace);
        }
    }
    Ok(manifests)
}

/// Manifests of a checked out deploy source.
pub async fn manifests_of(source: &DeploySource) -> KeelPipedResult<Vec<Manifest>> {
    let input: KubernetesInput = source.app_config.input()?;
    load_manifests(&source.app_dir, &input, &source.config_filename).await
}

async fn kustomize_build(app_dir: &Path) -> KeelPipedResult<Vec<Manifest>> {
    let registry = ToolRegistry::global();
    let bin = registry
        .kustomize()
        .ok_or_else(|| KeelPipedError::runtime("kustomize was not found"))?;
    let out = run_captured(
        &bin.to_string_lossy(),
        ["build", "."],
        Some(app_dir),
        &[("PATH".to_string(), registry.path_env())],
    )
    .await?;
    if !out.success {
        return Err(KeelPipedError::runtime(format!(
            "kustomize build failed: {}",
            out.combined()
        )));
    }
    parse_manifests(&out.stdout)
}

/// Container images referenced by the workloads, in manifest order.
pub fn find_images(manifests: &[Manifest]) -> Vec<String> {
    fn walk(v: &Value, out: &mut Vec<String>) {
        match v {
            Value::Object(map) => {
                for (k, child) in map {
                    if k == "containers" || k == "initContainers" {
                        if let Some(items) = child.as_array() {
                            for image in items.iter().filter_map(|c| c.get("image")?.as_str()) {
                                if !out.iter().any(|i| i == image) {
                                    out.push(image.to_string());
                                }
                            }
                        }
                    } else {
                        walk(child, out);
                    }
                }
            }
            Value::Array(items) => items.iter().for_each(|i| walk(i, out)),
            _ => {}
        }
    }
    let mut images = Vec::new();
    for m in manifests.iter().filter(|m| m.is_workload()) {
        walk(&m.body, &mut images);
    }
    images
}

/// `nginx:1.25` for `docker.io/library/nginx:1.25`.
pub fn short_image_name(image: &str) -> &str {
    image.rsplit('/').next().unwrap_or(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFESTS: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 2
  template:
    spec:
      containers:
        - name: web
          image: ghcr.io/acme/web:v1
---
apiVersion: v1
kind: Service
metadata:
  name: web
---
"#;

    #[test]
    fn parses_documents_and_images() {
        let manifests = parse_manifests(MANIFESTS).unwrap();
        assert_eq!(manifests.len(), 2);
        assert_eq!(manifests[0].key.to_string(), "apps/v1:Deployment::web");
        assert_eq!(manifests[1].key.group_version(), ("", "v1"));
        assert_eq!(find_images(&manifests), vec!["ghcr.io/acme/web:v1".to_string()]);
        assert_eq!(short_image_name("ghcr.io/acme/web:v1"), "web:v1");
    }

    #[test]
    fn rejects_documents_without_identity() {
        assert!(parse_manifests("apiVersion: v1\nkind: ConfigMap\n").is_err());
    }

    #[tokio::test]
    async fn loads_every_yaml_but_the_app_config() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.keel.yaml"), "apiVersion: keel.dev/v1beta1\nkind: KubernetesApp\n").unwrap();
        fs::write(dir.path().join("k.yaml"), MANIFESTS).unwrap();
        fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        let input = KubernetesInput {
            namespace: "web".to_string(),
            ..Default::default()
        };
        let mut manifests = load_manifests(dir.path(), &input, "app.keel.yaml").await.unwrap();
        assert_eq!(manifests.len(), 2);
        assert!(manifests.iter().all(|m| m.key.namespace == "web"));

        manifests[0].add_builtin_metadata("a1", "abc", VARIANT_PRIMARY);
        assert_eq!(manifests[0].label(LABEL_APPLICATION), Some("a1"));
        assert_eq!(
            manifests[0].body["metadata"]["annotations"][ANNOTATION_COMMIT_HASH],
            "abc"
        );
    }
}
