use std::collections::{HashMap, VecDeque};

use crate::{
    FrameSnapshot, HandlerKind, ScriptValue, ScriptVm, TableId, Variable, VmError, VmThreadId,
};

/// Deterministic, in-memory VM test double.
///
/// Tests script the stack explicitly: `push_frame`/`pop_frame` simulate the
/// call structure the real interpreter would report, and `set_evaluation`
/// queues results for adapter-initiated evaluation.
#[derive(Default)]
pub struct MockVm {
    frames: HashMap<VmThreadId, Vec<FrameSnapshot>>,
    handler_kinds: HashMap<VmThreadId, HandlerKind>,
    error_texts: HashMap<VmThreadId, String>,
    evaluations: HashMap<(VmThreadId, String), VecDeque<Result<ScriptValue, VmError>>>,
    locals: HashMap<(VmThreadId, u32), Vec<Variable>>,
    upvalues: HashMap<(VmThreadId, u32), Vec<Variable>>,
    tables: HashMap<TableId, Vec<Variable>>,
    /// Every `set_trace_enabled` call, in order. Lets tests assert the
    /// disable/restore bracketing around adapter-internal VM calls.
    pub trace_switches: Vec<(VmThreadId, bool)>,
    pub registered_modules: Vec<String>,
    pub set_local_calls: Vec<(VmThreadId, u32, String, String)>,
}

impl MockVm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a frame onto the top of `thread`'s scripted stack.
    pub fn push_frame(&mut self, thread: VmThreadId, frame: FrameSnapshot) {
        self.frames.entry(thread).or_default().insert(0, frame);
    }

    pub fn pop_frame(&mut self, thread: VmThreadId) {
        if let Some(frames) = self.frames.get_mut(&thread) {
            if !frames.is_empty() {
                frames.remove(0);
            }
        }
    }

    /// Replace the whole stack for `thread` (index 0 = top).
    pub fn set_frames(&mut self, thread: VmThreadId, frames: Vec<FrameSnapshot>) {
        self.frames.insert(thread, frames);
    }

    /// Update the current line of the top frame, as a line event would.
    pub fn set_current_line(&mut self, thread: VmThreadId, line: u32) {
        if let Some(frame) = self.frames.get_mut(&thread).and_then(|f| f.first_mut()) {
            frame.line = Some(line);
        }
    }

    pub fn set_handler_kind(&mut self, thread: VmThreadId, kind: HandlerKind) {
        self.handler_kinds.insert(thread, kind);
    }

    pub fn set_error_text(&mut self, thread: VmThreadId, text: impl Into<String>) {
        self.error_texts.insert(thread, text.into());
    }

    pub fn set_evaluation(
        &mut self,
        thread: VmThreadId,
        expression: impl Into<String>,
        result: Result<ScriptValue, VmError>,
    ) {
        self.evaluations
            .entry((thread, expression.into()))
            .or_default()
            .push_back(result);
    }

    pub fn set_locals(&mut self, thread: VmThreadId, level: u32, vars: Vec<Variable>) {
        self.locals.insert((thread, level), vars);
    }

    pub fn set_upvalues(&mut self, thread: VmThreadId, level: u32, vars: Vec<Variable>) {
        self.upvalues.insert((thread, level), vars);
    }

    pub fn insert_table(&mut self, table: TableId, children: Vec<Variable>) {
        self.tables.insert(table, children);
    }
}

impl ScriptVm for MockVm {
    fn stack_depth(&mut self, thread: VmThreadId) -> u32 {
        self.frames.get(&thread).map(|f| f.len() as u32).unwrap_or(0)
    }

    fn frame(&mut self, thread: VmThreadId, level: u32) -> Option<FrameSnapshot> {
        self.frames
            .get(&thread)
            .and_then(|f| f.get(level as usize))
            .cloned()
    }

    fn handler_kind(&mut self, thread: VmThreadId) -> HandlerKind {
        self.handler_kinds
            .get(&thread)
            .copied()
            .unwrap_or(HandlerKind::None)
    }

    fn error_text(&mut self, thread: VmThreadId) -> Option<String> {
        self.error_texts.get(&thread).cloned()
    }

    fn evaluate(
        &mut self,
        thread: VmThreadId,
        _level: u32,
        expression: &str,
    ) -> Result<ScriptValue, VmError> {
        match self
            .evaluations
            .get_mut(&(thread, expression.to_string()))
            .and_then(|queue| queue.pop_front())
        {
            Some(result) => result,
            None => Err(VmError::Evaluation(format!(
                "no mock evaluation configured for `{expression}`"
            ))),
        }
    }

    fn locals(&mut self, thread: VmThreadId, level: u32) -> Result<Vec<Variable>, VmError> {
        Ok(self.locals.get(&(thread, level)).cloned().unwrap_or_default())
    }

    fn upvalues(&mut self, thread: VmThreadId, level: u32) -> Result<Vec<Variable>, VmError> {
        Ok(self
            .upvalues
            .get(&(thread, level))
            .cloned()
            .unwrap_or_default())
    }

    fn table_children(&mut self, table: TableId) -> Result<Vec<Variable>, VmError> {
        Ok(self.tables.get(&table).cloned().unwrap_or_default())
    }

    fn set_local(
        &mut self,
        thread: VmThreadId,
        level: u32,
        name: &str,
        value: &str,
    ) -> Result<ScriptValue, VmError> {
        self.set_local_calls
            .push((thread, level, name.to_string(), value.to_string()));
        let parsed = parse_literal(value);
        if let Some(vars) = self.locals.get_mut(&(thread, level)) {
            if let Some(var) = vars.iter_mut().find(|v| v.name == name) {
                var.value = parsed.clone();
                return Ok(parsed);
            }
        }
        Err(VmError::UnknownVariable(name.to_string()))
    }

    fn set_upvalue(
        &mut self,
        thread: VmThreadId,
        level: u32,
        name: &str,
        value: &str,
    ) -> Result<ScriptValue, VmError> {
        let parsed = parse_literal(value);
        if let Some(vars) = self.upvalues.get_mut(&(thread, level)) {
            if let Some(var) = vars.iter_mut().find(|v| v.name == name) {
                var.value = parsed.clone();
                return Ok(parsed);
            }
        }
        Err(VmError::UnknownVariable(name.to_string()))
    }

    fn set_table_field(
        &mut self,
        table: TableId,
        name: &str,
        value: &str,
    ) -> Result<ScriptValue, VmError> {
        let parsed = parse_literal(value);
        let children = self
            .tables
            .get_mut(&table)
            .ok_or(VmError::Other(format!("unknown table {table}")))?;
        match children.iter_mut().find(|v| v.name == name) {
            Some(var) => var.value = parsed.clone(),
            None => children.push(Variable::new(name, parsed.clone())),
        }
        Ok(parsed)
    }

    fn set_trace_enabled(&mut self, thread: VmThreadId, enabled: bool) {
        self.trace_switches.push((thread, enabled));
    }

    fn register_internal_module(&mut self, name: &str) -> Result<(), VmError> {
        self.registered_modules.push(name.to_string());
        Ok(())
    }
}

fn parse_literal(value: &str) -> ScriptValue {
    match value {
        "nil" => ScriptValue::Nil,
        "true" => ScriptValue::Boolean(true),
        "false" => ScriptValue::Boolean(false),
        other => {
            if let Ok(i) = other.parse::<i64>() {
                ScriptValue::Integer(i)
            } else if let Ok(n) = other.parse::<f64>() {
                ScriptValue::Number(n)
            } else {
                ScriptValue::Str(other.trim_matches('"').to_string())
            }
        }
    }
}
