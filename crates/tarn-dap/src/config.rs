//! Session configuration.
//!
//! Three overlay levels feed the effective configuration: global defaults
//! (installed at adapter construction), the `launch`/`attach` arguments, and
//! a runtime override. Higher levels win key-by-key.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use serde_json::Value;

pub const LEVEL_GLOBAL: usize = 0;
pub const LEVEL_LAUNCH: usize = 1;
pub const LEVEL_RUNTIME: usize = 2;

/// Text encoding of VM-produced bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Coding {
    #[default]
    Utf8,
    Ansi,
    /// Console output is dropped entirely. This matches the historical
    /// behavior of the adapter: `consoleCoding: "none"` silences the VM.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PathFormat {
    #[default]
    Path,
    Uri,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SourceMapEntry {
    pub src: String,
    pub dst: String,
}

/// The effective, merged option set.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DebugConfiguration {
    pub console_coding: Coding,
    pub source_coding: Coding,
    /// When non-empty, the debugger's helper API is exposed inside the VM's
    /// module registry under this name.
    pub internal_module: String,
    pub stop_on_entry: bool,
    pub path_format: PathFormat,
    pub workspace_folder: String,
    pub source_maps: Vec<SourceMapEntry>,
    pub skip_files: Vec<String>,
}

impl DebugConfiguration {
    /// Compile `skipFiles` globs. Patterns that fail to compile are skipped
    /// with a warning rather than failing the whole configuration.
    pub fn compile_skip_files(&self) -> GlobSet {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.skip_files {
            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(err) => {
                    tracing::warn!(target: "tarn.dap", %pattern, %err, "invalid skipFiles glob");
                }
            }
        }
        builder.build().unwrap_or_else(|_| GlobSet::empty())
    }
}

/// The raw overlay store. Levels hold JSON objects; unknown keys are kept
/// (and ignored by the typed view) so future clients can pass extra options
/// without being rejected.
#[derive(Default)]
pub struct ConfigStore {
    levels: [Option<Value>; 3],
}

impl ConfigStore {
    pub fn set_level_str(&mut self, level: usize, json: &str) -> Result<(), String> {
        let value: Value =
            serde_json::from_str(json).map_err(|err| format!("invalid configuration: {err}"))?;
        self.set_level(level, value)
    }

    pub fn set_level(&mut self, level: usize, value: Value) -> Result<(), String> {
        if level >= self.levels.len() {
            return Err(format!("invalid configuration level {level}"));
        }
        if !value.is_object() {
            return Err("configuration must be a JSON object".to_string());
        }
        self.levels[level] = Some(value);
        Ok(())
    }

    /// Merge the levels (higher wins) and deserialize the typed view.
    pub fn merged(&self) -> DebugConfiguration {
        let mut combined = serde_json::Map::new();
        for level in self.levels.iter().flatten() {
            if let Some(obj) = level.as_object() {
                for (key, value) in obj {
                    combined.insert(key.clone(), value.clone());
                }
            }
        }
        match serde_json::from_value(Value::Object(combined)) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(target: "tarn.dap", %err, "bad configuration value, using defaults");
                DebugConfiguration::default()
            }
        }
    }
}

/// Character-set conversion seam.
///
/// The corpus this adapter grew out of converts between the host ANSI
/// codepage and UTF-8 on Windows. No portable codepage machinery exists
/// here, so the default passes bytes through with UTF-8 validation and a
/// Windows host plugs in a real implementation.
pub trait Transcoder: Send + Sync {
    fn ansi_to_utf8(&self, bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).into_owned()
    }

    fn utf8_to_ansi(&self, text: &str) -> Vec<u8> {
        text.as_bytes().to_vec()
    }
}

pub struct IdentityTranscoder;

impl Transcoder for IdentityTranscoder {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn higher_levels_overlay_lower_ones() {
        let mut store = ConfigStore::default();
        store
            .set_level_str(
                LEVEL_GLOBAL,
                r#"{"consoleCoding": "utf8", "sourceCoding": "ansi"}"#,
            )
            .unwrap();
        store
            .set_level(LEVEL_LAUNCH, json!({"consoleCoding": "none", "stopOnEntry": true}))
            .unwrap();

        let merged = store.merged();
        assert_eq!(merged.console_coding, Coding::None);
        assert_eq!(merged.source_coding, Coding::Ansi);
        assert!(merged.stop_on_entry);

        store
            .set_level(LEVEL_RUNTIME, json!({"consoleCoding": "ansi"}))
            .unwrap();
        assert_eq!(store.merged().console_coding, Coding::Ansi);
    }

    #[test]
    fn rejects_non_object_levels_and_bad_indices() {
        let mut store = ConfigStore::default();
        assert!(store.set_level_str(LEVEL_GLOBAL, "[1,2]").is_err());
        assert!(store.set_level_str(LEVEL_GLOBAL, "not json").is_err());
        assert!(store.set_level(3, json!({})).is_err());
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let mut store = ConfigStore::default();
        store
            .set_level(LEVEL_LAUNCH, json!({"futureOption": 1, "stopOnEntry": true}))
            .unwrap();
        assert!(store.merged().stop_on_entry);
    }

    #[test]
    fn skip_files_compile_to_a_matcher() {
        let config = DebugConfiguration {
            skip_files: vec!["**/vendor/**".to_string(), "*.gen.lua".to_string()],
            ..Default::default()
        };
        let set = config.compile_skip_files();
        assert!(set.is_match("libs/vendor/json.lua"));
        assert!(set.is_match("module.gen.lua"));
        assert!(!set.is_match("src/main.lua"));
    }

    #[test]
    fn source_maps_deserialize() {
        let config: DebugConfiguration = serde_json::from_value(json!({
            "sourceMaps": [{"src": "/srv/app", "dst": "c:/work/app"}]
        }))
        .unwrap();
        assert_eq!(config.source_maps.len(), 1);
        assert_eq!(config.source_maps[0].src, "/srv/app");
    }
}
