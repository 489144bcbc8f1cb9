//! Canonical identity for pieces of script.
//!
//! A source is either a file on the host (`@path` chunks) or a synthesized
//! body registered under a nonzero reference (`=name` and raw string
//! chunks). Sources are created on demand from VM debug records, cached for
//! the life of the session, and translated to the client's view through a
//! pluggable path mapper.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use globset::GlobSet;
use serde_json::{json, Value};
use tarn_vm::ChunkOrigin;

use crate::config::{DebugConfiguration, PathFormat, SourceMapEntry};

pub type SourceKey = u32;

/// Outcome of mapping a server-side path to the client's view.
///
/// `Ok`/`Fail` are cached for the rest of the session; the `Once` variants
/// are used this time and re-asked next time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapOutcome {
    Ok(String),
    OkOnce(String),
    Fail,
    FailOnce,
}

pub trait PathMapper: Send {
    fn to_client(&mut self, server_path: &str) -> MapOutcome;
}

/// Default mapper: the client sees the server's paths unchanged.
pub struct IdentityMapper;

impl PathMapper for IdentityMapper {
    fn to_client(&mut self, server_path: &str) -> MapOutcome {
        MapOutcome::Ok(server_path.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct Source {
    pub name: String,
    /// Canonical server-side path, for file-backed sources.
    pub path: Option<PathBuf>,
    pub client_path: Option<String>,
    /// Nonzero for synthesized sources; the client retrieves the body with
    /// a `source` request carrying this reference.
    pub source_reference: u32,
    pub code: Option<String>,
    pub skip: bool,
    /// False when the path could not be presented to the client; invalid
    /// sources never appear in events.
    pub valid: bool,
}

impl Source {
    /// The DAP `Source` object describing this source.
    pub fn describe(&self) -> Value {
        if self.source_reference != 0 {
            json!({ "name": self.name, "sourceReference": self.source_reference })
        } else {
            json!({ "name": self.name, "path": self.client_path })
        }
    }
}

pub struct SourceRegistry {
    sources: Vec<Source>,
    by_path: HashMap<PathBuf, SourceKey>,
    by_name: HashMap<String, SourceKey>,
    by_ref: HashMap<u32, SourceKey>,
    next_ref: u32,
    mapper: Box<dyn PathMapper>,
    map_cache: HashMap<String, Option<String>>,
    source_maps: Vec<SourceMapEntry>,
    skip_set: GlobSet,
    path_format: PathFormat,
    workspace_folder: String,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            by_path: HashMap::new(),
            by_name: HashMap::new(),
            by_ref: HashMap::new(),
            next_ref: 0,
            mapper: Box::new(IdentityMapper),
            map_cache: HashMap::new(),
            source_maps: Vec::new(),
            skip_set: GlobSet::empty(),
            path_format: PathFormat::Path,
            workspace_folder: String::new(),
        }
    }

    pub fn set_mapper(&mut self, mapper: Box<dyn PathMapper>) {
        self.mapper = mapper;
        self.map_cache.clear();
    }

    pub fn apply_config(&mut self, config: &DebugConfiguration) {
        self.source_maps = config.source_maps.clone();
        self.skip_set = config.compile_skip_files();
        self.path_format = config.path_format;
        self.workspace_folder = config.workspace_folder.clone();
        for source in &mut self.sources {
            if let Some(path) = &source.path {
                source.skip = self.skip_set.is_match(path);
            }
        }
    }

    /// Derive (or look up) the source for a VM chunk origin. Returns `None`
    /// when the VM has no source info for the frame, and reports whether
    /// the source was created by this call.
    pub fn create(&mut self, origin: &ChunkOrigin) -> Option<(SourceKey, bool)> {
        match origin {
            ChunkOrigin::File { path } => {
                let canonical = normalize_path(path);
                if let Some(&key) = self.by_path.get(&canonical) {
                    return Some((key, false));
                }
                let client_path = self.translate(&canonical.to_string_lossy());
                let source = Source {
                    name: file_name(&canonical),
                    client_path,
                    skip: self.skip_set.is_match(&canonical),
                    path: Some(canonical.clone()),
                    source_reference: 0,
                    code: None,
                    valid: true,
                };
                let valid = source.client_path.is_some();
                let key = self.insert(Source { valid, ..source });
                self.by_path.insert(canonical, key);
                Some((key, true))
            }
            ChunkOrigin::Inline { name, code } => Some(self.create_by_ref(name, code)),
            ChunkOrigin::Unknown => None,
        }
    }

    /// Create or retrieve a synthesized source. Each unique name gets a
    /// stable nonzero reference; the registered body never changes for the
    /// life of the session.
    pub fn create_by_ref(&mut self, name: &str, code: &str) -> (SourceKey, bool) {
        if let Some(&key) = self.by_name.get(name) {
            return (key, false);
        }
        self.next_ref += 1;
        let reference = self.next_ref;
        let key = self.insert(Source {
            name: name.to_string(),
            path: None,
            client_path: None,
            source_reference: reference,
            code: Some(code.to_string()),
            skip: false,
            valid: true,
        });
        self.by_name.insert(name.to_string(), key);
        self.by_ref.insert(reference, key);
        (key, true)
    }

    /// Resolve the source a `setBreakpoints` request names by client path,
    /// creating a placeholder if the VM has not loaded that chunk yet.
    pub fn key_for_client_path(&mut self, client_path: &str) -> SourceKey {
        let server = self.to_server_path(client_path);
        let canonical = normalize_path(&server);
        if let Some(&key) = self.by_path.get(&canonical) {
            return key;
        }
        let key = self.insert(Source {
            name: file_name(&canonical),
            client_path: Some(client_path.to_string()),
            skip: self.skip_set.is_match(&canonical),
            path: Some(canonical.clone()),
            source_reference: 0,
            code: None,
            valid: true,
        });
        self.by_path.insert(canonical, key);
        key
    }

    pub fn key_for_ref(&self, reference: u32) -> Option<SourceKey> {
        self.by_ref.get(&reference).copied()
    }

    /// The code body for a synthesized source.
    pub fn get_code(&self, reference: u32) -> Option<&str> {
        let key = self.key_for_ref(reference)?;
        self.get(key).code.as_deref()
    }

    pub fn get(&self, key: SourceKey) -> &Source {
        &self.sources[key as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter()
    }

    fn insert(&mut self, source: Source) -> SourceKey {
        let key = self.sources.len() as SourceKey;
        self.sources.push(source);
        key
    }

    fn translate(&mut self, server_path: &str) -> Option<String> {
        let mapped = self.translate_inner(server_path)?;
        Some(match self.path_format {
            PathFormat::Path => mapped,
            PathFormat::Uri => format!("file://{mapped}"),
        })
    }

    fn translate_inner(&mut self, server_path: &str) -> Option<String> {
        for entry in &self.source_maps {
            if let Some(rest) = server_path.strip_prefix(entry.src.as_str()) {
                return Some(format!("{}{}", entry.dst, rest));
            }
        }
        if let Some(cached) = self.map_cache.get(server_path) {
            return cached.clone();
        }
        match self.mapper.to_client(server_path) {
            MapOutcome::Ok(path) => {
                self.map_cache
                    .insert(server_path.to_string(), Some(path.clone()));
                Some(path)
            }
            MapOutcome::OkOnce(path) => Some(path),
            MapOutcome::Fail => {
                self.map_cache.insert(server_path.to_string(), None);
                None
            }
            MapOutcome::FailOnce => None,
        }
    }

    /// Map a client-supplied path back to the server's view: unwrap
    /// `file://` URIs, reverse `sourceMaps`, and resolve relative paths
    /// against the workspace. Every request that names a path crosses
    /// through here before touching the filesystem.
    pub(crate) fn to_server_path(&self, client_path: &str) -> String {
        let client_path = client_path.strip_prefix("file://").unwrap_or(client_path);
        for entry in &self.source_maps {
            if let Some(rest) = client_path.strip_prefix(entry.dst.as_str()) {
                return format!("{}{}", entry.src, rest);
            }
        }
        // Relative client paths resolve against the configured workspace.
        if !self.workspace_folder.is_empty() && !Path::new(client_path).is_absolute() {
            return Path::new(&self.workspace_folder)
                .join(client_path)
                .to_string_lossy()
                .into_owned();
        }
        client_path.to_string()
    }
}

fn normalize_path(path: &str) -> PathBuf {
    #[cfg(windows)]
    let path = &path.to_lowercase();
    let raw = Path::new(path.trim_start_matches('@'));
    std::fs::canonicalize(raw).unwrap_or_else(|_| raw.to_path_buf())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
