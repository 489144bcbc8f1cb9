//! The two request dispatch tables and their handlers.
//!
//! Main-table commands are accepted in any non-birth state and never need
//! the VM. Hook-table commands are accepted only inside the stopped loop,
//! where the script thread that produced the stop hands its VM reference
//! through. A command missing from both tables falls through to the
//! dispatcher's state-named error response.

use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::atomic::Ordering;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tarn_vm::{with_trace_disabled, FrameKind, FrameSnapshot, ScriptValue, ScriptVm, VmThreadId};

use crate::breakpoints::{Breakpoint, SourceBreakpointArgs};
use crate::config::LEVEL_LAUNCH;
use crate::dap::messages::Request;
use crate::session::{DebugAdapter, ExceptionKind, FrameHandle, Session, VarRef};
use crate::state::SessionState;
use crate::threads::{StepDescriptor, StepMode};

fn parse_args<T: DeserializeOwned>(request: &Request) -> Result<T, String> {
    let value = request
        .arguments
        .clone()
        .unwrap_or(Value::Object(Default::default()));
    serde_json::from_value(value).map_err(|err| format!("invalid arguments: {err}"))
}

fn frame_name(frame: &FrameSnapshot) -> String {
    match (&frame.name, frame.kind) {
        (Some(name), _) => name.clone(),
        (None, FrameKind::Main) => "main chunk".to_string(),
        (None, FrameKind::Native) => "[C]".to_string(),
        (None, FrameKind::Lua) => "?".to_string(),
    }
}

impl DebugAdapter {
    /// Route a main-table command. `None` means the command is not in this
    /// table; `Some(quit)` tells the stopped loop whether to exit.
    pub(crate) fn dispatch_main(&self, cell: &RefCell<Session>, request: &Request) -> Option<bool> {
        let quit = match request.command.as_str() {
            "launch" => self.request_launch(cell, request),
            "attach" => self.request_attach(cell, request),
            "configurationDone" => self.request_configuration_done(request),
            "terminate" => self.request_terminate(cell, request),
            "disconnect" => self.request_disconnect(cell, request),
            "setBreakpoints" => self.request_set_breakpoints(cell, request),
            "setExceptionBreakpoints" => self.request_set_exception_breakpoints(cell, request),
            "pause" => self.request_pause(cell, request),
            _ => return None,
        };
        Some(quit)
    }

    /// Route a hook-table command, valid only while stopped.
    pub(crate) fn dispatch_hook<V: ScriptVm>(
        &self,
        cell: &RefCell<Session>,
        vm: &mut V,
        vm_thread: VmThreadId,
        request: &Request,
    ) -> Option<bool> {
        let quit = match request.command.as_str() {
            "continue" => self.request_continue(cell, vm_thread, request),
            "next" => self.request_step(cell, vm, vm_thread, request, StepMode::Over),
            "stepIn" => self.request_step(cell, vm, vm_thread, request, StepMode::Into),
            "stepOut" => self.request_step(cell, vm, vm_thread, request, StepMode::Out),
            "stackTrace" => self.request_stack_trace(cell, vm, request),
            "scopes" => self.request_scopes(cell, request),
            "variables" => self.request_variables(cell, vm, request),
            "setVariable" => self.request_set_variable(cell, vm, request),
            "source" => self.request_source(cell, request),
            "threads" => self.request_threads(cell, request),
            "evaluate" => self.request_evaluate(cell, vm, vm_thread, request),
            "exceptionInfo" => self.request_exception_info(cell, request),
            "loadedSources" => self.request_loaded_sources(cell, request),
            _ => return None,
        };
        Some(quit)
    }

    pub(crate) fn request_initialize(&self, cell: &RefCell<Session>, request: &Request) {
        {
            let mut s = cell.borrow_mut();
            if s.state == SessionState::Birth {
                self.set_state(&mut s, SessionState::Initialized);
            }
        }

        let capabilities = json!({
            "supportsConfigurationDoneRequest": true,
            "supportsSetVariable": true,
            "supportsConditionalBreakpoints": true,
            "supportsHitConditionalBreakpoints": true,
            "supportsLogPoints": true,
            "supportsEvaluateForHovers": true,
            "supportsExceptionInfoRequest": true,
            "supportsLoadedSourcesRequest": true,
            "supportsTerminateRequest": true,
            "supportsDelayedStackTraceLoading": true,
            "exceptionBreakpointFilters": [
                { "filter": "pcall", "label": "Errors caught by pcall", "default": false },
                { "filter": "xpcall", "label": "Errors caught by xpcall", "default": false },
                { "filter": "lua_pcall", "label": "Uncaught errors", "default": true },
                { "filter": "lua_panic", "label": "VM panics", "default": true },
            ],
        });
        self.inner.wire.respond_ok(request, Some(capabilities));
        self.inner.wire.send_event("initialized", None);
        self.signal_client_attached();
    }

    fn request_launch(&self, cell: &RefCell<Session>, request: &Request) -> bool {
        self.apply_session_start(cell, request, false)
    }

    fn request_attach(&self, cell: &RefCell<Session>, request: &Request) -> bool {
        self.apply_session_start(cell, request, true)
    }

    fn apply_session_start(
        &self,
        cell: &RefCell<Session>,
        request: &Request,
        attach: bool,
    ) -> bool {
        {
            let mut s = cell.borrow_mut();
            if let Some(arguments) = &request.arguments {
                if let Err(err) = s.config.set_level(LEVEL_LAUNCH, arguments.clone()) {
                    drop(s);
                    self.inner.wire.respond_error(request, err);
                    return false;
                }
            }
            s.attach_mode = attach;
            self.apply_effective(&mut s);
            s.entry_armed = s.effective.stop_on_entry;
            self.set_state(&mut s, SessionState::Running);
        }
        self.inner.wire.respond_ok(request, None);
        false
    }

    fn request_configuration_done(&self, request: &Request) -> bool {
        self.inner.wire.respond_ok(request, None);
        false
    }

    fn request_terminate(&self, cell: &RefCell<Session>, request: &Request) -> bool {
        {
            let mut s = cell.borrow_mut();
            self.set_state(&mut s, SessionState::Terminated);
        }
        self.inner.wire.respond_ok(request, None);
        self.inner.wire.send_event("terminated", None);
        true
    }

    fn request_disconnect(&self, cell: &RefCell<Session>, request: &Request) -> bool {
        let attach = {
            let mut s = cell.borrow_mut();
            self.set_state(&mut s, SessionState::Terminated);
            s.pause_target = None;
            s.entry_armed = false;
            s.attach_mode
        };
        self.inner.wire.respond_ok(request, None);
        self.inner.wire.send_event("terminated", None);
        self.inner.wire.close_session();
        *self.inner.attached.lock() = false;
        if !attach {
            self.inner.worker_stop.store(true, Ordering::SeqCst);
        }
        true
    }

    fn request_set_breakpoints(&self, cell: &RefCell<Session>, request: &Request) -> bool {
        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct SourceArg {
            #[serde(default)]
            path: Option<String>,
            #[serde(default)]
            source_reference: Option<u32>,
        }

        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            source: SourceArg,
            #[serde(default)]
            breakpoints: Vec<SourceBreakpointArgs>,
        }

        let args: Args = match parse_args(request) {
            Ok(args) => args,
            Err(err) => {
                self.inner.wire.respond_error(request, err);
                return false;
            }
        };

        let mut s = cell.borrow_mut();
        let key = if let Some(reference) = args.source.source_reference.filter(|r| *r != 0) {
            match s.sources.key_for_ref(reference) {
                Some(key) => key,
                None => {
                    drop(s);
                    self.inner
                        .wire
                        .respond_error(request, format!("unknown sourceReference {reference}"));
                    return false;
                }
            }
        } else if let Some(path) = &args.source.path {
            s.sources.key_for_client_path(path)
        } else {
            drop(s);
            self.inner
                .wire
                .respond_ok(request, Some(json!({ "breakpoints": [] })));
            return false;
        };

        let installed: Vec<Breakpoint> =
            args.breakpoints.into_iter().map(Breakpoint::from).collect();
        let response: Vec<Value> = installed
            .iter()
            .map(|bp| json!({ "verified": true, "line": bp.line }))
            .collect();
        s.breakpoints.replace(key, installed);
        drop(s);

        self.inner
            .wire
            .respond_ok(request, Some(json!({ "breakpoints": response })));
        false
    }

    fn request_set_exception_breakpoints(
        &self,
        cell: &RefCell<Session>,
        request: &Request,
    ) -> bool {
        #[derive(Debug, Deserialize)]
        struct Args {
            #[serde(default)]
            filters: Vec<String>,
        }

        let args: Args = match parse_args(request) {
            Ok(args) => args,
            Err(err) => {
                self.inner.wire.respond_error(request, err);
                return false;
            }
        };

        let mut enabled = HashSet::new();
        for filter in &args.filters {
            match ExceptionKind::from_filter_id(filter) {
                Some(kind) => {
                    enabled.insert(kind);
                }
                None => {
                    tracing::warn!(target: "tarn.dap", %filter, "unknown exception filter");
                }
            }
        }
        cell.borrow_mut().exceptions = enabled;
        self.inner.wire.respond_ok(request, None);
        false
    }

    fn request_pause(&self, cell: &RefCell<Session>, request: &Request) -> bool {
        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            #[serde(default)]
            thread_id: Option<i64>,
        }

        let args: Args = match parse_args(request) {
            Ok(args) => args,
            Err(err) => {
                self.inner.wire.respond_error(request, err);
                return false;
            }
        };

        let mut s = cell.borrow_mut();
        let target = args
            .thread_id
            .or(s.threads.last_busy)
            .filter(|id| s.threads.by_id(*id).is_some());
        match target {
            Some(id) => {
                s.pause_target = Some(id);
                drop(s);
                self.inner.wire.respond_ok(request, None);
            }
            None => {
                drop(s);
                self.inner
                    .wire
                    .respond_error(request, "cannot pause: no script thread has run yet");
            }
        }
        false
    }

    fn request_continue(
        &self,
        cell: &RefCell<Session>,
        vm_thread: VmThreadId,
        request: &Request,
    ) -> bool {
        let thread_id = {
            let mut s = cell.borrow_mut();
            s.stop_reason = "step";
            self.set_state(&mut s, SessionState::Running);
            s.threads.by_vm(vm_thread).map(|t| t.id).unwrap_or(0)
        };
        self.inner
            .wire
            .respond_ok(request, Some(json!({ "allThreadsContinued": true })));
        self.inner.wire.send_event(
            "continued",
            Some(json!({ "threadId": thread_id, "allThreadsContinued": true })),
        );
        true
    }

    fn request_step<V: ScriptVm>(
        &self,
        cell: &RefCell<Session>,
        vm: &mut V,
        vm_thread: VmThreadId,
        request: &Request,
        mode: StepMode,
    ) -> bool {
        let depth = vm.stack_depth(vm_thread);
        let line = vm.frame(vm_thread, 0).and_then(|f| f.line);

        let mut s = cell.borrow_mut();
        match s.threads.by_vm(vm_thread) {
            Some(thread) => thread.step = Some(StepDescriptor { mode, depth, line }),
            None => {
                drop(s);
                self.inner
                    .wire
                    .respond_error(request, "no script thread to step");
                return false;
            }
        }
        s.stop_reason = "step";
        self.set_state(&mut s, SessionState::Stepping);
        drop(s);

        self.inner.wire.respond_ok(request, None);
        true
    }

    fn request_stack_trace<V: ScriptVm>(
        &self,
        cell: &RefCell<Session>,
        vm: &mut V,
        request: &Request,
    ) -> bool {
        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            thread_id: i64,
            #[serde(default)]
            start_frame: Option<i64>,
            #[serde(default)]
            levels: Option<i64>,
        }

        let args: Args = match parse_args(request) {
            Ok(args) => args,
            Err(err) => {
                self.inner.wire.respond_error(request, err);
                return false;
            }
        };
        if args.start_frame.is_some_and(|start| start < 0) {
            self.inner
                .wire
                .respond_error(request, "stackTrace.startFrame must be >= 0");
            return false;
        }
        if args.levels.is_some_and(|levels| levels < 0) {
            self.inner
                .wire
                .respond_error(request, "stackTrace.levels must be >= 0");
            return false;
        }

        let target = {
            let mut s = cell.borrow_mut();
            s.threads.by_id(args.thread_id).map(|t| (t.vm_thread, t.id))
        };
        let Some((vm_thread, thread_id)) = target else {
            self.inner.wire.respond_ok(
                request,
                Some(json!({ "stackFrames": [], "totalFrames": 0 })),
            );
            return false;
        };

        let total = vm.stack_depth(vm_thread);
        let start = args.start_frame.unwrap_or(0) as u32;
        let levels = args
            .levels
            .filter(|l| *l > 0)
            .map(|l| l as usize)
            .unwrap_or(usize::MAX);

        let mut frames = Vec::new();
        let mut level = start;
        while level < total && frames.len() < levels {
            let Some(frame) = vm.frame(vm_thread, level) else {
                break;
            };
            let mut s = cell.borrow_mut();
            let source = if frame.kind == FrameKind::Native {
                Value::Null
            } else {
                match s.sources.create(&frame.origin) {
                    Some((key, created)) => {
                        if created {
                            self.announce_source(&s, key);
                        }
                        let source = s.sources.get(key);
                        if source.valid {
                            source.describe()
                        } else {
                            Value::Null
                        }
                    }
                    None => Value::Null,
                }
            };
            let id = s.frame_handles.alloc(FrameHandle {
                thread_id,
                vm_thread,
                level,
            });
            frames.push(json!({
                "id": id,
                "name": frame_name(&frame),
                "source": source,
                "line": frame.line.unwrap_or(0),
                "column": 1,
            }));
            level += 1;
        }

        self.inner.wire.respond_ok(
            request,
            Some(json!({ "stackFrames": frames, "totalFrames": total })),
        );
        false
    }

    fn request_scopes(&self, cell: &RefCell<Session>, request: &Request) -> bool {
        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            frame_id: i64,
        }

        let args: Args = match parse_args(request) {
            Ok(args) => args,
            Err(err) => {
                self.inner.wire.respond_error(request, err);
                return false;
            }
        };

        let mut s = cell.borrow_mut();
        let Some(frame) = s.frame_handles.get(args.frame_id).copied() else {
            drop(s);
            self.inner
                .wire
                .respond_error(request, format!("unknown frameId {}", args.frame_id));
            return false;
        };
        let locals = s.var_handles.alloc(VarRef::Locals(frame));
        let upvalues = s.var_handles.alloc(VarRef::Upvalues(frame));
        drop(s);

        self.inner.wire.respond_ok(
            request,
            Some(json!({
                "scopes": [
                    {
                        "name": "Locals",
                        "presentationHint": "locals",
                        "variablesReference": locals,
                        "expensive": false,
                    },
                    {
                        "name": "Upvalues",
                        "variablesReference": upvalues,
                        "expensive": false,
                    },
                ]
            })),
        );
        false
    }

    fn request_variables<V: ScriptVm>(
        &self,
        cell: &RefCell<Session>,
        vm: &mut V,
        request: &Request,
    ) -> bool {
        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            variables_reference: i64,
            #[serde(default)]
            start: Option<usize>,
            #[serde(default)]
            count: Option<usize>,
        }

        let args: Args = match parse_args(request) {
            Ok(args) => args,
            Err(err) => {
                self.inner.wire.respond_error(request, err);
                return false;
            }
        };

        let var_ref = cell
            .borrow()
            .var_handles
            .get(args.variables_reference)
            .copied();
        let Some(var_ref) = var_ref else {
            self.inner
                .wire
                .respond_ok(request, Some(json!({ "variables": [] })));
            return false;
        };

        let (vm_thread, fetched) = match var_ref {
            VarRef::Locals(frame) => (
                frame.vm_thread,
                with_trace_disabled(vm, frame.vm_thread, |vm| {
                    vm.locals(frame.vm_thread, frame.level)
                }),
            ),
            VarRef::Upvalues(frame) => (
                frame.vm_thread,
                with_trace_disabled(vm, frame.vm_thread, |vm| {
                    vm.upvalues(frame.vm_thread, frame.level)
                }),
            ),
            VarRef::Table(thread, table) => (
                thread,
                with_trace_disabled(vm, thread, |vm| vm.table_children(table)),
            ),
        };

        match fetched {
            Ok(variables) => {
                let start = args.start.unwrap_or(0);
                let count = args.count.filter(|c| *c > 0).unwrap_or(usize::MAX);
                let mut s = cell.borrow_mut();
                let rendered: Vec<Value> = variables
                    .iter()
                    .skip(start)
                    .take(count)
                    .map(|var| render_variable(&mut s, vm_thread, &var.name, &var.value))
                    .collect();
                drop(s);
                self.inner
                    .wire
                    .respond_ok(request, Some(json!({ "variables": rendered })));
            }
            Err(err) => {
                self.inner.wire.respond_error(request, err.to_string());
            }
        }
        false
    }

    fn request_set_variable<V: ScriptVm>(
        &self,
        cell: &RefCell<Session>,
        vm: &mut V,
        request: &Request,
    ) -> bool {
        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            variables_reference: i64,
            name: String,
            value: String,
        }

        let args: Args = match parse_args(request) {
            Ok(args) => args,
            Err(err) => {
                self.inner.wire.respond_error(request, err);
                return false;
            }
        };

        let var_ref = cell
            .borrow()
            .var_handles
            .get(args.variables_reference)
            .copied();
        let Some(var_ref) = var_ref else {
            self.inner.wire.respond_error(
                request,
                format!("unknown variablesReference {}", args.variables_reference),
            );
            return false;
        };

        let (vm_thread, result) = match var_ref {
            VarRef::Locals(frame) => (
                frame.vm_thread,
                with_trace_disabled(vm, frame.vm_thread, |vm| {
                    vm.set_local(frame.vm_thread, frame.level, &args.name, &args.value)
                }),
            ),
            VarRef::Upvalues(frame) => (
                frame.vm_thread,
                with_trace_disabled(vm, frame.vm_thread, |vm| {
                    vm.set_upvalue(frame.vm_thread, frame.level, &args.name, &args.value)
                }),
            ),
            VarRef::Table(thread, table) => (
                thread,
                with_trace_disabled(vm, thread, |vm| {
                    vm.set_table_field(table, &args.name, &args.value)
                }),
            ),
        };

        match result {
            Ok(value) => {
                let mut s = cell.borrow_mut();
                let body = render_variable(&mut s, vm_thread, &args.name, &value);
                drop(s);
                self.inner.wire.respond_ok(request, Some(body));
            }
            Err(err) => {
                self.inner.wire.respond_error(request, err.to_string());
            }
        }
        false
    }

    fn request_source(&self, cell: &RefCell<Session>, request: &Request) -> bool {
        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct SourceArg {
            #[serde(default)]
            path: Option<String>,
            #[serde(default)]
            source_reference: Option<u32>,
        }

        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            #[serde(default)]
            source: Option<SourceArg>,
            #[serde(default)]
            source_reference: Option<u32>,
        }

        let args: Args = match parse_args(request) {
            Ok(args) => args,
            Err(err) => {
                self.inner.wire.respond_error(request, err);
                return false;
            }
        };

        let reference = args
            .source_reference
            .or_else(|| args.source.as_ref().and_then(|s| s.source_reference))
            .filter(|r| *r != 0);

        if let Some(reference) = reference {
            let body = {
                let s = cell.borrow();
                s.sources
                    .get_code(reference)
                    .map(|code| json!({ "content": code, "mimeType": "text/x-lua" }))
            };
            match body {
                Some(body) => self.inner.wire.respond_ok(request, Some(body)),
                None => self
                    .inner
                    .wire
                    .respond_error(request, format!("unknown sourceReference {reference}")),
            }
            return false;
        }

        let Some(path) = args.source.and_then(|s| s.path) else {
            self.inner
                .wire
                .respond_error(request, "source request needs a sourceReference or path");
            return false;
        };
        // The client names its own view of the file; apply the same
        // mapping `setBreakpoints` does before touching the disk.
        let (server_path, coding) = {
            let s = cell.borrow();
            (
                s.sources.to_server_path(&path),
                s.effective.source_coding,
            )
        };
        match std::fs::read(&server_path) {
            Ok(bytes) => {
                let content = self.inner.wire.decode_source(coding, &bytes);
                self.inner
                    .wire
                    .respond_ok(request, Some(json!({ "content": content })));
            }
            Err(err) => {
                self.inner
                    .wire
                    .respond_error(request, format!("cannot read {server_path}: {err}"));
            }
        }
        false
    }

    fn request_threads(&self, cell: &RefCell<Session>, request: &Request) -> bool {
        let body = {
            let s = cell.borrow();
            let threads: Vec<Value> = s
                .threads
                .iter()
                .map(|t| json!({ "id": t.id, "name": format!("thread #{}", t.id) }))
                .collect();
            json!({ "threads": threads })
        };
        self.inner.wire.respond_ok(request, Some(body));
        false
    }

    fn request_evaluate<V: ScriptVm>(
        &self,
        cell: &RefCell<Session>,
        vm: &mut V,
        vm_thread: VmThreadId,
        request: &Request,
    ) -> bool {
        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            expression: String,
            #[serde(default)]
            frame_id: Option<i64>,
        }

        let args: Args = match parse_args(request) {
            Ok(args) => args,
            Err(err) => {
                self.inner.wire.respond_error(request, err);
                return false;
            }
        };

        let frame = args
            .frame_id
            .and_then(|id| cell.borrow().frame_handles.get(id).copied());
        let (thread, level) = frame
            .map(|f| (f.vm_thread, f.level))
            .unwrap_or((vm_thread, 0));

        match with_trace_disabled(vm, thread, |vm| {
            vm.evaluate(thread, level, &args.expression)
        }) {
            Ok(value) => {
                let mut s = cell.borrow_mut();
                let reference = match &value {
                    ScriptValue::Table(id) => s.var_handles.alloc(VarRef::Table(thread, *id)),
                    _ => 0,
                };
                drop(s);
                self.inner.wire.respond_ok(
                    request,
                    Some(json!({
                        "result": value.to_string(),
                        "type": value.type_name(),
                        "variablesReference": reference,
                    })),
                );
            }
            Err(err) => {
                self.inner.wire.respond_error(request, err.to_string());
            }
        }
        false
    }

    fn request_exception_info(&self, cell: &RefCell<Session>, request: &Request) -> bool {
        let info = cell.borrow().last_exception.clone();
        match info {
            Some((kind, description)) => {
                self.inner.wire.respond_ok(
                    request,
                    Some(json!({
                        "exceptionId": kind.filter_id(),
                        "description": description,
                        "breakMode": "always",
                    })),
                );
            }
            None => {
                self.inner
                    .wire
                    .respond_error(request, "no exception information available");
            }
        }
        false
    }

    fn request_loaded_sources(&self, cell: &RefCell<Session>, request: &Request) -> bool {
        let body = {
            let s = cell.borrow();
            let sources: Vec<Value> = s
                .sources
                .iter()
                .filter(|source| source.valid)
                .map(|source| source.describe())
                .collect();
            json!({ "sources": sources })
        };
        self.inner.wire.respond_ok(request, Some(body));
        false
    }
}

fn render_variable(
    s: &mut Session,
    vm_thread: VmThreadId,
    name: &str,
    value: &ScriptValue,
) -> Value {
    let reference = match value {
        ScriptValue::Table(id) => s.var_handles.alloc(VarRef::Table(vm_thread, *id)),
        _ => 0,
    };
    json!({
        "name": name,
        "value": value.to_string(),
        "type": value.type_name(),
        "variablesReference": reference,
    })
}
