//! Line breakpoint bookkeeping.
//!
//! Breakpoints are stored per source and replaced atomically when the
//! client re-sends a `setBreakpoints` for that source. The hot path — "does
//! line L of function F have an active breakpoint?" — is answered through a
//! per-function summary so that the common no-breakpoint case costs one
//! cached lookup, not a hash probe per line event.

use std::collections::HashMap;

use serde::Deserialize;
use tarn_vm::FunctionId;

use crate::source::SourceKey;

/// One installed source breakpoint. `hits` counts how many times the line
/// matched (before the hit-count predicate), for `hitCondition`.
#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub line: u32,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
    pub log_message: Option<String>,
    pub hits: u64,
}

/// `setBreakpoints` request shape for one breakpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceBreakpointArgs {
    pub line: u32,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub hit_condition: Option<String>,
    #[serde(default)]
    pub log_message: Option<String>,
}

impl From<SourceBreakpointArgs> for Breakpoint {
    fn from(args: SourceBreakpointArgs) -> Self {
        Breakpoint {
            line: args.line,
            condition: args.condition,
            hit_condition: args.hit_condition,
            log_message: args.log_message,
            hits: 0,
        }
    }
}

pub struct BreakpointMap {
    by_source: HashMap<SourceKey, Vec<Breakpoint>>,
    /// Which source each seen function belongs to. Stable for the life of
    /// the session (a function prototype has one chunk).
    func_source: HashMap<FunctionId, Option<SourceKey>>,
    generation: u64,
}

impl BreakpointMap {
    pub fn new() -> Self {
        Self {
            by_source: HashMap::new(),
            func_source: HashMap::new(),
            generation: 0,
        }
    }

    /// Replace the whole set for one source. All prior entries for that
    /// source are gone; hit counters start over.
    pub fn replace(&mut self, source: SourceKey, breakpoints: Vec<Breakpoint>) {
        if breakpoints.is_empty() {
            self.by_source.remove(&source);
        } else {
            self.by_source.insert(source, breakpoints);
        }
        self.generation += 1;
    }

    /// Bumped on every mutation; threads use this to refresh their cached
    /// breakpoint hint.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_any(&self, source: SourceKey) -> bool {
        self.by_source.contains_key(&source)
    }

    pub fn find(&mut self, source: SourceKey, line: u32) -> Option<&mut Breakpoint> {
        self.by_source
            .get_mut(&source)?
            .iter_mut()
            .find(|bp| bp.line == line)
    }

    pub fn lines(&self, source: SourceKey) -> Vec<u32> {
        self.by_source
            .get(&source)
            .map(|bps| bps.iter().map(|bp| bp.line).collect())
            .unwrap_or_default()
    }

    /// Resolve (and memoize) the source a function belongs to.
    pub fn function_source(
        &mut self,
        function: FunctionId,
        resolve: impl FnOnce() -> Option<SourceKey>,
    ) -> Option<SourceKey> {
        *self
            .func_source
            .entry(function)
            .or_insert_with(resolve)
    }

    /// The memoized source for a function, without resolving.
    pub fn cached_function_source(&self, function: FunctionId) -> Option<SourceKey> {
        self.func_source.get(&function).copied().flatten()
    }
}

/// Evaluate a DAP `hitCondition` against the running hit count.
///
/// Accepted forms: a bare count (`5` means "on the 5th hit"), a comparison
/// (`>= 3`, `> 3`, `< 3`, `<= 3`, `== 3`, `= 3`), or a modulo (`% 2`,
/// every 2nd hit). Unparsable specs are ignored, matching everything.
pub fn hit_predicate_matches(spec: &str, hits: u64) -> bool {
    let spec = spec.trim();
    let (op, rest) = if let Some(rest) = spec.strip_prefix(">=") {
        (">=", rest)
    } else if let Some(rest) = spec.strip_prefix("<=") {
        ("<=", rest)
    } else if let Some(rest) = spec.strip_prefix("==") {
        ("==", rest)
    } else if let Some(rest) = spec.strip_prefix('>') {
        (">", rest)
    } else if let Some(rest) = spec.strip_prefix('<') {
        ("<", rest)
    } else if let Some(rest) = spec.strip_prefix('=') {
        ("==", rest)
    } else if let Some(rest) = spec.strip_prefix('%') {
        ("%", rest)
    } else {
        ("==", spec)
    };

    let Ok(value) = rest.trim().parse::<u64>() else {
        tracing::warn!(target: "tarn.dap", %spec, "unparsable hitCondition, ignoring");
        return true;
    };

    match op {
        ">" => hits > value,
        ">=" => hits >= value,
        "<" => hits < value,
        "<=" => hits <= value,
        "%" => value != 0 && hits % value == 0,
        _ => hits == value,
    }
}
