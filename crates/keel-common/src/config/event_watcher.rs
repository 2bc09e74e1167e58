//! Event watcher configuration: the per-application `eventWatcher` section and
//! the repository-wide files of kind `EventWatcher` under `.pipe/`.
use std::{collections::HashMap, fs, path::Path};

use serde::{Deserialize, Serialize};

use super::{ConfigKind, Envelope, SHARED_CONFIGURATION_DIR_NAME};
use crate::{
    error::{KeelError, KeelResult},
    util::path_matcher::PathMatcher,
};

/// One value to rewrite in a file when an event arrives.
///
/// Exactly one of the field selectors (or `regex`) must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventWatcherReplacement {
    pub file: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub yaml_field: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub json_field: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hcl_field: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub regex: String,
}

impl EventWatcherReplacement {
    pub fn validate(&self) -> KeelResult {
        if self.file.is_empty() {
            return Err(KeelError::InvalidConfig("replacement must have file".into()));
        }
        let selectors = [
            &self.yaml_field,
            &self.json_field,
            &self.hcl_field,
            &self.regex,
        ]
        .iter()
        .filter(|s| !s.is_empty())
        .count();
        match selectors {
            0 => Err(KeelError::InvalidConfig(format!(
                "replacement for {} must have one of yamlField, jsonField, hclField or regex",
                self.file
            ))),
            1 => Ok(()),
            _ => Err(KeelError::InvalidConfig(format!(
                "replacement for {} must have only one of yamlField, jsonField, hclField or regex",
                self.file
            ))),
        }
    }
}

/// An event definition from a legacy `.pipe/` EventWatcher file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventWatcherEvent {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub replacements: Vec<EventWatcherReplacement>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventWatcherSpec {
    #[serde(default)]
    pub events: Vec<EventWatcherEvent>,
}

impl EventWatcherSpec {
    pub fn validate(&self) -> KeelResult {
        for event in &self.events {
            if event.name.is_empty() {
                return Err(KeelError::InvalidConfig("event name must not be empty".into()));
            }
            if event.replacements.is_empty() {
                return Err(KeelError::InvalidConfig(format!(
                    "event {} must have at least one replacement",
                    event.name
                )));
            }
            for r in &event.replacements {
                r.validate()?;
            }
        }
        Ok(())
    }
}

/// Loads and merges every EventWatcher file under `{repo_root}/.pipe/`.
///
/// Files are filtered by the agent's `includes` / `excludes` file names for
/// the repository; excludes win. A missing directory yields no events.
pub fn load_event_watcher(
    repo_root: &Path,
    includes: &[String],
    excludes: &[String],
) -> KeelResult<EventWatcherSpec> {
    let dir = repo_root.join(SHARED_CONFIGURATION_DIR_NAME);
    if !dir.is_dir() {
        return Ok(EventWatcherSpec::default());
    }

    let include = PathMatcher::new(includes)?;
    let exclude = PathMatcher::new(excludes)?;

    let mut names = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !(name.ends_with(".yaml") || name.ends_with(".yml")) {
            continue;
        }
        if exclude.matches(&name) {
            continue;
        }
        if !include.is_empty() && !include.matches(&name) {
            continue;
        }
        names.push(name);
    }
    names.sort();

    let mut spec = EventWatcherSpec::default();
    for name in names {
        let data = fs::read_to_string(dir.join(&name))?;
        let envelope = match Envelope::from_yaml(&data) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(file = %name, error = %e, "skip non-config file in shared directory");
                continue;
            }
        };
        if envelope.kind != ConfigKind::EventWatcher {
            continue;
        }
        let file_spec: EventWatcherSpec = envelope.spec()?;
        file_spec.validate()?;
        spec.events.extend(file_spec.events);
    }
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replacement(file: &str, yaml: &str) -> EventWatcherReplacement {
        EventWatcherReplacement {
            file: file.into(),
            yaml_field: yaml.into(),
            ..Default::default()
        }
    }

    #[test]
    fn validates_events() {
        let cases = vec![
            (
                "no name",
                EventWatcherEvent {
                    replacements: vec![replacement("file", "$.foo")],
                    ..Default::default()
                },
                true,
            ),
            (
                "no replacements",
                EventWatcherEvent {
                    name: "a".into(),
                    ..Default::default()
                },
                true,
            ),
            (
                "no file",
                EventWatcherEvent {
                    name: "a".into(),
                    replacements: vec![replacement("", "$.foo")],
                    ..Default::default()
                },
                true,
            ),
            (
                "no field",
                EventWatcherEvent {
                    name: "a".into(),
                    replacements: vec![replacement("file", "")],
                    ..Default::default()
                },
                true,
            ),
            (
                "two fields",
                EventWatcherEvent {
                    name: "a".into(),
                    replacements: vec![EventWatcherReplacement {
                        file: "file".into(),
                        yaml_field: "$.foo".into(),
                        json_field: "$.foo".into(),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                true,
            ),
            (
                "valid",
                EventWatcherEvent {
                    name: "a".into(),
                    replacements: vec![replacement("file", "$.foo")],
                    ..Default::default()
                },
                false,
            ),
        ];
        for (name, event, want_err) in cases {
            let spec = EventWatcherSpec {
                events: vec![event],
            };
            assert_eq!(spec.validate().is_err(), want_err, "{name}");
        }
    }

    #[test]
    fn loads_shared_directory() {
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join(SHARED_CONFIGURATION_DIR_NAME);
        fs::create_dir_all(&shared).unwrap();
        fs::write(
            shared.join("a.yaml"),
            r#"apiVersion: keel.dev/v1beta1
kind: EventWatcher
spec:
  events:
    - name: app1-image-update
      replacements:
        - file: app1/deployment.yaml
          yamlField: $.spec.template.spec.containers[0].image
"#,
        )
        .unwrap();
        fs::write(
            shared.join("b.yaml"),
            r#"apiVersion: keel.dev/v1beta1
kind: EventWatcher
spec:
  events:
    - name: app2-helm-release
      labels:
        repoId: repo-1
      replacements:
        - file: app2/app.keel.yaml
          yamlField: $.spec.input.helmChart.version
"#,
        )
        .unwrap();
        fs::write(shared.join("README.md"), "not a config").unwrap();

        let spec = load_event_watcher(dir.path(), &[], &[]).unwrap();
        assert_eq!(spec.events.len(), 2);
        assert_eq!(spec.events[0].name, "app1-image-update");
        assert_eq!(spec.events[1].labels["repoId"], "repo-1");

        let spec = load_event_watcher(dir.path(), &[], &["b.yaml".into()]).unwrap();
        assert_eq!(spec.events.len(), 1);

        let spec = load_event_watcher(dir.path(), &["b.yaml".into()], &[]).unwrap();
        assert_eq!(spec.events[0].name, "app2-helm-release");
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_event_watcher(dir.path(), &[], &[]).unwrap().events.is_empty());
    }
}
