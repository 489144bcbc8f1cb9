//! The session core: the hook dispatcher, the stopped inner loop, and the
//! idle tick.
//!
//! Everything the adapter owns sits behind one re-entrant session mutex.
//! The VM's hook body, every command handler, and cross-thread output all
//! run under it; the worker thread only ever `try_lock`s, so a stopped
//! script holds the whole world still until the client resumes it.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, ReentrantMutex};
use serde_json::{json, Value};
use tarn_vm::{
    with_trace_disabled, FrameKind, FrameSnapshot, HandlerKind, ScriptVm, TableId, TraceEvent,
    VmThreadId,
};

use crate::breakpoints::{hit_predicate_matches, BreakpointMap};
use crate::config::{
    Coding, ConfigStore, DebugConfiguration, IdentityTranscoder, Transcoder, LEVEL_GLOBAL,
};
use crate::dap::codec::{encode_message, FrameDecoder};
use crate::dap::messages::{Event, Request, Response};
use crate::dap::schema::{EnvelopeValidator, RequestValidator};
use crate::error::{AdapterError, AdapterResult};
use crate::source::{PathMapper, SourceKey, SourceRegistry};
use crate::state::SessionState;
use crate::threads::ThreadRegistry;
use crate::transport::{self, Transport};

/// How long the stopped loop sleeps between polls when no request is
/// pending.
const STOPPED_POLL: Duration = Duration::from_millis(10);

/// Exception categories the client can enable through
/// `setExceptionBreakpoints`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    /// Error caught by `pcall`.
    Pcall,
    /// Error caught by `xpcall`.
    Xpcall,
    /// Error with no protected call below it; it will reach the host's
    /// `lua_pcall`.
    LuaPcall,
    /// Fatal VM error. Always stops regardless of the enabled set.
    LuaPanic,
}

impl ExceptionKind {
    pub fn filter_id(self) -> &'static str {
        match self {
            ExceptionKind::Pcall => "pcall",
            ExceptionKind::Xpcall => "xpcall",
            ExceptionKind::LuaPcall => "lua_pcall",
            ExceptionKind::LuaPanic => "lua_panic",
        }
    }

    pub fn from_filter_id(id: &str) -> Option<Self> {
        match id {
            "pcall" => Some(ExceptionKind::Pcall),
            "xpcall" => Some(ExceptionKind::Xpcall),
            "lua_pcall" => Some(ExceptionKind::LuaPcall),
            "lua_panic" => Some(ExceptionKind::LuaPanic),
            _ => None,
        }
    }
}

/// OS-level stdout/stderr capture seam. The host opens the platform
/// redirector and hands it over; the adapter drains it on every tick.
pub trait OutputRedirector: Send {
    fn peek(&mut self) -> usize;
    fn read(&mut self, buf: &mut [u8]) -> usize;
}

/// A stack frame handed to the client; valid until the next resume.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHandle {
    pub thread_id: i64,
    pub vm_thread: VmThreadId,
    pub level: u32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum VarRef {
    Locals(FrameHandle),
    Upvalues(FrameHandle),
    Table(VmThreadId, TableId),
}

pub(crate) struct HandleTable<T> {
    next: i64,
    map: HashMap<i64, T>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self {
            next: 0,
            map: HashMap::new(),
        }
    }
}

impl<T> HandleTable<T> {
    pub fn alloc(&mut self, value: T) -> i64 {
        self.next += 1;
        let id = self.next;
        self.map.insert(id, value);
        id
    }

    pub fn get(&self, id: i64) -> Option<&T> {
        self.map.get(&id)
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

/// All mutable session state. Lives inside the re-entrant session mutex;
/// the worker and the script threads contend for it as whole.
pub(crate) struct Session {
    pub state: SessionState,
    /// True until a `launch` request claims ownership of the VM lifetime.
    pub attach_mode: bool,
    pub stop_reason: &'static str,
    pub exceptions: HashSet<ExceptionKind>,
    pub config: ConfigStore,
    pub effective: DebugConfiguration,
    pub sources: SourceRegistry,
    pub breakpoints: BreakpointMap,
    pub threads: ThreadRegistry,
    /// Armed by `pause`: the thread id that should stop at its next line
    /// event.
    pub pause_target: Option<i64>,
    /// Armed by `launch` with `stopOnEntry`.
    pub entry_armed: bool,
    pub last_exception: Option<(ExceptionKind, String)>,
    pub frame_handles: HandleTable<FrameHandle>,
    pub var_handles: HandleTable<VarRef>,
    pub decoder: FrameDecoder,
    pub validator: Box<dyn RequestValidator>,
    pub redirectors: Vec<(String, Box<dyn OutputRedirector>)>,
}

/// The outbound side. Lock-free where the stopped loop needs it to be:
/// `seq` and the state/coding mirrors are atomics so a cross-thread output
/// call never has to touch the session `RefCell`.
pub(crate) struct Wire {
    seq: AtomicI64,
    state: AtomicU8,
    console_coding: AtomicU8,
    transport: Mutex<Option<Box<dyn Transport>>>,
    peer_lost: Arc<AtomicBool>,
    transcoder: Box<dyn Transcoder>,
}

impl Wire {
    fn next_seq(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    pub fn send_json(&self, value: &Value) -> bool {
        let Ok(bytes) = encode_message(value) else {
            return false;
        };
        match self.transport.lock().as_mut() {
            Some(transport) => transport.send(&bytes),
            None => false,
        }
    }

    pub fn respond_ok(&self, request: &Request, body: Option<Value>) {
        let response = Response::success(self.next_seq(), request, body);
        if let Ok(value) = serde_json::to_value(&response) {
            self.send_json(&value);
        }
    }

    pub fn respond_error(&self, request: &Request, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(target: "tarn.dap", command = %request.command, %message, "error response");
        let response = Response::error(self.next_seq(), request, message);
        if let Ok(value) = serde_json::to_value(&response) {
            self.send_json(&value);
        }
    }

    pub fn send_event(&self, event: &'static str, body: Option<Value>) -> i64 {
        let seq = self.next_seq();
        if let Ok(value) = serde_json::to_value(Event::new(seq, event, body)) {
            self.send_json(&value);
        }
        seq
    }

    /// Emit an `output` event, honoring state and coding. Output is
    /// suppressed outside running/stepping, and dropped entirely when
    /// `consoleCoding` is `none`.
    pub fn output_event(&self, category: &str, bytes: &[u8], location: Option<(Value, u32)>) {
        if !SessionState::from_u8(self.state.load(Ordering::SeqCst)).hook_active() {
            return;
        }
        let text = match coding_from_u8(self.console_coding.load(Ordering::SeqCst)) {
            Coding::None => return,
            Coding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Coding::Ansi => self.transcoder.ansi_to_utf8(bytes),
        };
        let mut body = json!({ "category": category, "output": text });
        if let Some((source, line)) = location {
            body["source"] = source;
            body["line"] = json!(line);
        }
        self.send_event("output", Some(body));
    }

    /// True while the session is in a state where spontaneous events
    /// (output, thread, loadedSource) may flow.
    pub fn session_active(&self) -> bool {
        SessionState::from_u8(self.state.load(Ordering::SeqCst)).hook_active()
    }

    pub fn update_transport(&self, timeout: Duration) {
        if let Some(transport) = self.transport.lock().as_mut() {
            transport.update(timeout);
        }
    }

    pub fn take_peer_lost(&self) -> bool {
        self.peer_lost.swap(false, Ordering::SeqCst)
    }

    pub fn close_session(&self) {
        if let Some(transport) = self.transport.lock().as_mut() {
            transport.close();
        }
        self.peer_lost.store(false, Ordering::SeqCst);
    }

    pub fn get_port(&self) -> u16 {
        self.transport
            .lock()
            .as_ref()
            .map(|t| t.get_port())
            .unwrap_or(0)
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn set_console_coding(&self, coding: Coding) {
        self.console_coding
            .store(coding_to_u8(coding), Ordering::SeqCst);
    }

    pub fn decode_source(&self, coding: Coding, bytes: &[u8]) -> String {
        match coding {
            Coding::Ansi => self.transcoder.ansi_to_utf8(bytes),
            _ => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

fn coding_to_u8(coding: Coding) -> u8 {
    match coding {
        Coding::Utf8 => 0,
        Coding::Ansi => 1,
        Coding::None => 2,
    }
}

fn coding_from_u8(raw: u8) -> Coding {
    match raw {
        0 => Coding::Utf8,
        1 => Coding::Ansi,
        _ => Coding::None,
    }
}

pub(crate) struct Inner {
    pub session: ReentrantMutex<RefCell<Session>>,
    pub wire: Wire,
    pub worker: Mutex<Option<std::thread::JoinHandle<()>>>,
    pub worker_stop: Arc<AtomicBool>,
    pub attached: Mutex<bool>,
    pub attached_cv: Condvar,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.worker_stop.store(true, Ordering::SeqCst);
    }
}

/// The debug adapter. Constructed by the host around a transport, then fed
/// VM trace events from the script threads while the worker thread services
/// administrative requests.
///
/// The VM itself is never stored: every entry point that needs it takes a
/// `&mut` implementation of [`ScriptVm`], the way an interpreter hands its
/// state to a C hook.
pub struct DebugAdapter {
    pub(crate) inner: Arc<Inner>,
}

impl DebugAdapter {
    /// Listen on `addr` (`host:port`, bare port, or a unix socket path) and
    /// serve one client at a time.
    pub fn listen(addr: &str) -> AdapterResult<Self> {
        Ok(Self::with_transport(transport::listen(addr)?))
    }

    /// Connect out to a client listening at `addr`.
    pub fn connect(addr: &str) -> AdapterResult<Self> {
        Ok(Self::with_transport(transport::connect(addr)?))
    }

    pub fn with_transport(mut transport: Box<dyn Transport>) -> Self {
        let peer_lost = Arc::new(AtomicBool::new(false));
        let flag = peer_lost.clone();
        transport.set_close_hook(Box::new(move || {
            flag.store(true, Ordering::SeqCst);
        }));

        let mut config = ConfigStore::default();
        // Installed defaults; launch/attach and runtime levels overlay.
        let _ = config.set_level(
            LEVEL_GLOBAL,
            json!({ "consoleCoding": "utf8", "sourceCoding": "ansi" }),
        );
        let effective = config.merged();

        let session = Session {
            state: SessionState::Birth,
            attach_mode: true,
            stop_reason: "step",
            exceptions: HashSet::new(),
            config,
            effective: effective.clone(),
            sources: SourceRegistry::new(),
            breakpoints: BreakpointMap::new(),
            threads: ThreadRegistry::new(),
            pause_target: None,
            entry_armed: false,
            last_exception: None,
            frame_handles: HandleTable::default(),
            var_handles: HandleTable::default(),
            decoder: FrameDecoder::new(),
            validator: Box::new(EnvelopeValidator),
            redirectors: Vec::new(),
        };

        let wire = Wire {
            seq: AtomicI64::new(1),
            state: AtomicU8::new(SessionState::Birth as u8),
            console_coding: AtomicU8::new(coding_to_u8(effective.console_coding)),
            transport: Mutex::new(Some(transport)),
            peer_lost,
            transcoder: Box::new(IdentityTranscoder),
        };

        DebugAdapter {
            inner: Arc::new(Inner {
                session: ReentrantMutex::new(RefCell::new(session)),
                wire,
                worker: Mutex::new(None),
                worker_stop: Arc::new(AtomicBool::new(false)),
                attached: Mutex::new(false),
                attached_cv: Condvar::new(),
            }),
        }
    }

    /// The bound port in TCP server mode (0 before listening).
    pub fn get_port(&self) -> u16 {
        self.inner.wire.get_port()
    }

    /// Current lifecycle state. Lock-free; reads the wire-side mirror.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.inner.wire.state.load(Ordering::SeqCst))
    }

    /// Spawn the host worker thread, which services network I/O whenever
    /// the adapter is not inside a VM hook.
    pub fn start_worker(&self) {
        let mut worker = self.inner.worker.lock();
        if worker.is_some() {
            return;
        }
        self.inner.worker_stop.store(false, Ordering::SeqCst);
        let weak = Arc::downgrade(&self.inner);
        let stop = self.inner.worker_stop.clone();
        let handle = std::thread::Builder::new()
            .name("tarn-dap-worker".to_string())
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    DebugAdapter { inner }.update();
                    std::thread::sleep(STOPPED_POLL);
                }
            });
        match handle {
            Ok(handle) => *worker = Some(handle),
            Err(err) => {
                tracing::error!(target: "tarn.dap", %err, "failed to spawn worker thread");
            }
        }
    }

    /// Stop and join the worker. Must not be called from the worker itself.
    pub fn stop_worker(&self) {
        self.inner.worker_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.inner.worker.lock().take() {
            let _ = handle.join();
        }
    }

    /// Block until a client has attached and completed `initialize`.
    /// Returns immediately when a session is already past that point. The
    /// worker must be running, since it is what processes the handshake.
    pub fn wait_client(&self) {
        {
            let guard = self.inner.session.lock();
            let state = guard.borrow().state;
            if !matches!(state, SessionState::Birth | SessionState::Initialized) {
                return;
            }
        }
        let mut attached = self.inner.attached.lock();
        while !*attached {
            self.inner.attached_cv.wait(&mut attached);
        }
    }

    /// One worker tick. `try_lock` only: while a script thread is stopped
    /// in the hook, the tick simply skips — that back-pressure is what
    /// keeps every other thread frozen.
    pub fn update(&self) {
        let Some(guard) = self.inner.session.try_lock() else {
            return;
        };
        self.run_idle(&guard);
    }

    pub fn set_config(&self, level: usize, config_json: &str) -> AdapterResult<()> {
        let guard = self.inner.session.lock();
        let mut s = guard.borrow_mut();
        s.config
            .set_level_str(level, config_json)
            .map_err(AdapterError::Config)?;
        self.apply_effective(&mut s);
        Ok(())
    }

    pub fn set_path_mapper(&self, mapper: Box<dyn PathMapper>) {
        let guard = self.inner.session.lock();
        guard.borrow_mut().sources.set_mapper(mapper);
    }

    /// Hand over an OS-level output capture to be drained on every tick as
    /// `output` events of the given category.
    pub fn open_redirect(&self, category: &str, redirector: Box<dyn OutputRedirector>) {
        let guard = self.inner.session.lock();
        guard
            .borrow_mut()
            .redirectors
            .push((category.to_string(), redirector));
    }

    pub fn close_redirect(&self) {
        let guard = self.inner.session.lock();
        guard.borrow_mut().redirectors.clear();
    }

    /// A cloneable handle for the host's `print` replacement. Joins its
    /// arguments with tabs and emits them as `stdout` output, serialized
    /// through the session mutex.
    pub fn console_handle(&self) -> ConsoleHandle {
        ConsoleHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Register a VM main thread with the debugger. Returns true when the
    /// thread was new, false when an already-known thread was re-enabled.
    pub fn attach_script_thread<V: ScriptVm>(&self, vm: &mut V, vm_thread: VmThreadId) -> bool {
        let guard = self.inner.session.lock();
        let (is_new, id, module) = {
            let mut s = guard.borrow_mut();
            let outcome = s.threads.attach(vm_thread);
            let module = s.effective.internal_module.clone();
            match outcome {
                crate::threads::AttachOutcome::New(id) => (true, id, module),
                crate::threads::AttachOutcome::Reenabled(id) => (false, id, module),
            }
        };
        if is_new {
            if !module.is_empty() {
                if let Err(err) = vm.register_internal_module(&module) {
                    tracing::warn!(target: "tarn.dap", %err, "internal module registration failed");
                }
            }
            if self.state().hook_active() {
                self.inner.wire.send_event(
                    "thread",
                    Some(json!({ "reason": "started", "threadId": id })),
                );
            }
        }
        is_new
    }

    /// Disable the thread (or erase it when `remove`); a disabled thread is
    /// transparent to the hook until re-attached.
    pub fn detach_script_thread(&self, vm_thread: VmThreadId, remove: bool) {
        let guard = self.inner.session.lock();
        let id = guard.borrow_mut().threads.detach(vm_thread, remove);
        if let Some(id) = id {
            if self.state().hook_active() {
                self.inner.wire.send_event(
                    "thread",
                    Some(json!({ "reason": "exited", "threadId": id })),
                );
            }
        }
    }

    pub fn detach_all(&self, release: bool) {
        let guard = self.inner.session.lock();
        guard.borrow_mut().threads.detach_all(release);
    }

    /// The VM trace hook. Called by the host on every trace event, on the
    /// script thread that produced it.
    pub fn trace_event<V: ScriptVm>(&self, vm: &mut V, vm_thread: VmThreadId, event: TraceEvent) {
        let guard = self.inner.session.lock();
        let cell: &RefCell<Session> = &guard;
        {
            let mut s = cell.borrow_mut();
            let Some(thread) = s.threads.by_vm(vm_thread) else {
                return;
            };
            if !thread.enabled {
                return;
            }
            thread.busy = true;
            let id = thread.id;
            s.threads.last_busy = Some(id);
        }
        self.dispatch_trace(cell, vm, vm_thread, event);
        if let Some(thread) = cell.borrow_mut().threads.by_vm(vm_thread) {
            thread.busy = false;
        };
    }

    /// External error notification, for errors surfaced outside the hook
    /// (e.g. by the host's own message handler). When `vm_thread` is not
    /// given, the currently busy thread is targeted. Returns false when no
    /// target thread could be determined.
    pub fn exception<V: ScriptVm>(
        &self,
        vm: &mut V,
        vm_thread: Option<VmThreadId>,
        kind: ExceptionKind,
    ) -> bool {
        let guard = self.inner.session.lock();
        let cell: &RefCell<Session> = &guard;
        let target = match vm_thread {
            Some(thread) => Some(thread),
            None => cell
                .borrow()
                .threads
                .iter()
                .find(|t| t.busy)
                .map(|t| t.vm_thread),
        };
        let Some(target) = target else {
            return false;
        };
        if !cell.borrow().threads.iter().any(|t| t.vm_thread == target) {
            return false;
        }
        with_trace_disabled(vm, target, |vm| {
            self.exception_stop(cell, vm, target, kind, kind == ExceptionKind::LuaPanic);
        });
        true
    }

    /// Thread-safe console output. Blocks on the session mutex, so a
    /// second script thread logging while another is stopped waits until
    /// the resume.
    pub fn output(&self, category: &str, text: &str) {
        let _guard = self.inner.session.lock();
        self.inner.wire.output_event(category, text.as_bytes(), None);
    }

    /// Like [`DebugAdapter::output`], with the calling frame's source and
    /// line attached when the VM can report them.
    pub fn output_from_vm<V: ScriptVm>(
        &self,
        vm: &mut V,
        vm_thread: VmThreadId,
        category: &str,
        text: &str,
    ) {
        let guard = self.inner.session.lock();
        let cell: &RefCell<Session> = &guard;
        let frame = vm
            .frame(vm_thread, 1)
            .or_else(|| vm.frame(vm_thread, 0))
            .filter(|f| f.kind != FrameKind::Native);
        let location = frame.and_then(|f| {
            let mut s = cell.borrow_mut();
            let (key, created) = s.sources.create(&f.origin)?;
            if created {
                self.announce_source(&s, key);
            }
            let source = s.sources.get(key);
            if !source.valid {
                return None;
            }
            Some((source.describe(), f.line.unwrap_or(0)))
        });
        self.inner
            .wire
            .output_event(category, text.as_bytes(), location);
    }

    /// Host notification that the debuggee finished. Emits `terminated`
    /// (and `exited` when a code is given) and ends the session.
    pub fn terminate(&self, exit_code: Option<i64>) {
        let guard = self.inner.session.lock();
        let mut s = guard.borrow_mut();
        if s.state == SessionState::Terminated {
            return;
        }
        self.set_state(&mut s, SessionState::Terminated);
        drop(s);
        if let Some(code) = exit_code {
            self.inner
                .wire
                .send_event("exited", Some(json!({ "exitCode": code })));
        }
        self.inner.wire.send_event("terminated", None);
    }

    /// Full teardown: stop the worker, drop the client, release threads.
    pub fn close(&self) {
        self.stop_worker();
        let guard = self.inner.session.lock();
        let mut s = guard.borrow_mut();
        self.set_state(&mut s, SessionState::Terminated);
        s.threads.detach_all(true);
        s.redirectors.clear();
        drop(s);
        self.inner.wire.close_session();
    }

    // ---- internals ----

    pub(crate) fn set_state(&self, s: &mut Session, state: SessionState) {
        s.state = state;
        self.inner.wire.set_state(state);
    }

    pub(crate) fn apply_effective(&self, s: &mut Session) {
        s.effective = s.config.merged();
        s.sources.apply_config(&s.effective);
        self.inner.wire.set_console_coding(s.effective.console_coding);
    }

    pub(crate) fn signal_client_attached(&self) {
        let mut attached = self.inner.attached.lock();
        *attached = true;
        self.inner.attached_cv.notify_all();
    }

    fn dispatch_trace<V: ScriptVm>(
        &self,
        cell: &RefCell<Session>,
        vm: &mut V,
        vm_thread: VmThreadId,
        event: TraceEvent,
    ) {
        let state = cell.borrow().state;
        if !state.hook_active() && !matches!(event, TraceEvent::Panic) {
            return;
        }
        match event {
            TraceEvent::Call | TraceEvent::TailCall | TraceEvent::Return => {
                self.on_call_ret(cell, vm, vm_thread);
            }
            TraceEvent::Line { line } => self.on_line(cell, vm, vm_thread, line),
            TraceEvent::ErrorRaised => self.on_error(cell, vm, vm_thread),
            TraceEvent::Panic => {
                self.exception_stop(cell, vm, vm_thread, ExceptionKind::LuaPanic, true)
            }
        }
    }

    fn on_call_ret<V: ScriptVm>(
        &self,
        cell: &RefCell<Session>,
        vm: &mut V,
        vm_thread: VmThreadId,
    ) {
        let frame = vm.frame(vm_thread, 0);
        let mut s = cell.borrow_mut();
        self.refresh_position(&mut s, vm_thread, frame);
    }

    /// Recompute the thread's current-function handle and breakpoint hint.
    fn refresh_position(
        &self,
        s: &mut Session,
        vm_thread: VmThreadId,
        frame: Option<FrameSnapshot>,
    ) -> Option<SourceKey> {
        let function = frame.as_ref().and_then(|f| f.function);
        let origin = frame.map(|f| f.origin);
        let Session {
            breakpoints,
            sources,
            threads,
            ..
        } = s;
        let wire = &self.inner.wire;
        let source_key = function.and_then(|f| {
            breakpoints.function_source(f, || {
                let (key, created) = sources.create(origin.as_ref()?)?;
                if created {
                    let source = sources.get(key);
                    if source.valid && wire.session_active() {
                        wire.send_event("loadedSource", Some(json!({
                            "reason": "new",
                            "source": source.describe(),
                        })));
                    }
                }
                Some(key)
            })
        });
        let has_breakpoint = source_key.map(|k| breakpoints.has_any(k)).unwrap_or(false);
        let generation = breakpoints.generation();
        if let Some(thread) = threads.by_vm(vm_thread) {
            thread.cur_function = function;
            thread.has_breakpoint = has_breakpoint;
            thread.hint_generation = generation;
        }
        source_key
    }

    fn on_line<V: ScriptVm>(
        &self,
        cell: &RefCell<Session>,
        vm: &mut V,
        vm_thread: VmThreadId,
        line: u32,
    ) {
        // Refresh the cached position when the breakpoint set changed or
        // the function handle is stale (e.g. the first line after attach).
        let frame = vm.frame(vm_thread, 0);
        let (source_key, has_breakpoint, skip) = {
            let mut s = cell.borrow_mut();
            let function = frame.as_ref().and_then(|f| f.function);
            let generation = s.breakpoints.generation();
            let stale = match s.threads.by_vm(vm_thread) {
                Some(t) => t.cur_function != function || t.hint_generation != generation,
                None => return,
            };
            let source_key = if stale {
                self.refresh_position(&mut s, vm_thread, frame)
            } else {
                function.and_then(|f| s.breakpoints.cached_function_source(f))
            };
            let has_breakpoint = s
                .threads
                .by_vm(vm_thread)
                .map(|t| t.has_breakpoint)
                .unwrap_or(false);
            let skip = source_key
                .map(|k| s.sources.get(k).skip)
                .unwrap_or(false);
            (source_key, has_breakpoint, skip)
        };

        // 1. Breakpoints dominate.
        if line > 0 && has_breakpoint && !skip {
            if let Some(key) = source_key {
                match self.breakpoint_action(cell, vm, vm_thread, key, line) {
                    BreakpointAction::Stop => {
                        self.run_stopped(cell, vm, vm_thread, "breakpoint", None);
                        return;
                    }
                    BreakpointAction::Logged | BreakpointAction::Pass => {}
                }
            }
        }

        // 2. An armed pause targets this thread.
        let paused = {
            let mut s = cell.borrow_mut();
            let id = s.threads.by_vm(vm_thread).map(|t| t.id);
            match (s.pause_target, id) {
                (Some(target), Some(id)) if target == id => {
                    s.pause_target = None;
                    true
                }
                _ => false,
            }
        };
        if paused {
            self.run_stopped(cell, vm, vm_thread, "pause", None);
            return;
        }

        // 3. stopOnEntry.
        if !skip {
            let entry = {
                let mut s = cell.borrow_mut();
                std::mem::take(&mut s.entry_armed)
            };
            if entry {
                self.run_stopped(cell, vm, vm_thread, "entry", None);
                return;
            }
        }

        // 4. Stepping.
        let (stepping, descriptor) = {
            let s = cell.borrow();
            let result = (
                s.state == SessionState::Stepping,
                s.threads
                    .iter()
                    .find(|t| t.vm_thread == vm_thread)
                    .and_then(|t| t.step),
            );
            result
        };
        if stepping && !skip {
            if let Some(descriptor) = descriptor {
                // The completion check calls into the VM; the descriptor
                // copy keeps the session unborrowed across it.
                if descriptor.complete(vm, vm_thread, line) {
                    let reason = cell.borrow().stop_reason;
                    self.run_stopped(cell, vm, vm_thread, reason, None);
                }
            }
        }
    }

    fn breakpoint_action<V: ScriptVm>(
        &self,
        cell: &RefCell<Session>,
        vm: &mut V,
        vm_thread: VmThreadId,
        source: SourceKey,
        line: u32,
    ) -> BreakpointAction {
        let (condition, hit_condition, log_message) = {
            let mut s = cell.borrow_mut();
            match s.breakpoints.find(source, line) {
                Some(bp) => (
                    bp.condition.clone(),
                    bp.hit_condition.clone(),
                    bp.log_message.clone(),
                ),
                None => return BreakpointAction::Pass,
            }
        };

        if let Some(condition) = condition {
            match with_trace_disabled(vm, vm_thread, |vm| vm.evaluate(vm_thread, 0, &condition)) {
                Ok(value) if value.is_truthy() => {}
                Ok(_) => return BreakpointAction::Pass,
                Err(err) => {
                    self.inner.wire.output_event(
                        "console",
                        format!("breakpoint condition `{condition}` failed: {err}\n").as_bytes(),
                        None,
                    );
                    return BreakpointAction::Pass;
                }
            }
        }

        let hits = {
            let mut s = cell.borrow_mut();
            match s.breakpoints.find(source, line) {
                Some(bp) => {
                    bp.hits += 1;
                    bp.hits
                }
                None => return BreakpointAction::Pass,
            }
        };
        if let Some(spec) = hit_condition {
            if !hit_predicate_matches(&spec, hits) {
                return BreakpointAction::Pass;
            }
        }

        if let Some(message) = log_message {
            let text = self.interpolate_log(vm, vm_thread, &message);
            self.inner
                .wire
                .output_event("console", format!("{text}\n").as_bytes(), None);
            return BreakpointAction::Logged;
        }

        BreakpointAction::Stop
    }

    /// Expand `{expr}` segments of a logpoint message by evaluating them in
    /// the paused frame. A failed expansion keeps the literal text.
    fn interpolate_log<V: ScriptVm>(
        &self,
        vm: &mut V,
        vm_thread: VmThreadId,
        message: &str,
    ) -> String {
        let mut out = String::with_capacity(message.len());
        let mut rest = message;
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            rest = &rest[start + 1..];
            let Some(end) = rest.find('}') else {
                out.push('{');
                break;
            };
            let expr = &rest[..end];
            match with_trace_disabled(vm, vm_thread, |vm| vm.evaluate(vm_thread, 0, expr)) {
                Ok(value) => out.push_str(&value.to_string()),
                Err(_) => {
                    out.push('{');
                    out.push_str(expr);
                    out.push('}');
                }
            }
            rest = &rest[end + 1..];
        }
        out.push_str(rest);
        out
    }

    fn on_error<V: ScriptVm>(&self, cell: &RefCell<Session>, vm: &mut V, vm_thread: VmThreadId) {
        let kind = match vm.handler_kind(vm_thread) {
            HandlerKind::ProtectedCall => ExceptionKind::Pcall,
            HandlerKind::MessageHandler => ExceptionKind::Xpcall,
            HandlerKind::None => ExceptionKind::LuaPcall,
        };
        self.exception_stop(cell, vm, vm_thread, kind, false);
    }

    fn exception_stop<V: ScriptVm>(
        &self,
        cell: &RefCell<Session>,
        vm: &mut V,
        vm_thread: VmThreadId,
        kind: ExceptionKind,
        force: bool,
    ) {
        if !force && !cell.borrow().exceptions.contains(&kind) {
            return;
        }
        let text = vm.error_text(vm_thread);
        {
            let mut s = cell.borrow_mut();
            s.last_exception = Some((kind, text.clone().unwrap_or_default()));
        }
        self.run_stopped(cell, vm, vm_thread, "exception", text);
    }

    /// The stopped inner loop. Holds the session mutex for its whole
    /// lifetime — including the poll sleeps — so every script thread stays
    /// frozen while the client explores state (stop-the-world is the
    /// intended semantics, not an accident).
    pub(crate) fn run_stopped<V: ScriptVm>(
        &self,
        cell: &RefCell<Session>,
        vm: &mut V,
        vm_thread: VmThreadId,
        reason: &str,
        text: Option<String>,
    ) {
        let thread_id = {
            let mut s = cell.borrow_mut();
            let Some(thread) = s.threads.by_vm(vm_thread) else {
                return;
            };
            let id = thread.id;
            thread.step = None;
            id
        };

        let mut body = json!({
            "reason": reason,
            "threadId": thread_id,
            "allThreadsStopped": true,
        });
        if let Some(text) = &text {
            body["text"] = json!(text);
            body["description"] = json!(text);
        }
        self.inner.wire.send_event("stopped", Some(body));

        let mut quit = false;
        while !quit {
            self.drain_redirectors(cell);
            self.inner.wire.update_transport(Duration::ZERO);
            if self.inner.wire.take_peer_lost() {
                self.on_disconnect(cell);
                break;
            }

            let request = {
                let mut s = cell.borrow_mut();
                self.io_input(&mut s)
            };
            let Some(request) = request else {
                std::thread::sleep(STOPPED_POLL);
                continue;
            };
            if request.type_ != "request" {
                continue;
            }

            let state = cell.borrow().state;
            if state == SessionState::Birth {
                if request.command == "initialize" {
                    self.request_initialize(cell, &request);
                    continue;
                }
            } else {
                if let Some(q) = self.dispatch_main(cell, &request) {
                    quit = q;
                    continue;
                }
                if let Some(q) = self.dispatch_hook(cell, vm, vm_thread, &request) {
                    quit = q;
                    continue;
                }
            }
            self.inner.wire.respond_error(
                &request,
                format!("`{}` not yet implemented (stopped)", request.command),
            );
        }

        // The stop is over; everything handed to the client about this
        // pause is now invalid.
        let mut s = cell.borrow_mut();
        s.frame_handles.clear();
        s.var_handles.clear();
    }

    pub(crate) fn run_idle(&self, cell: &RefCell<Session>) {
        self.drain_redirectors(cell);
        self.inner.wire.update_transport(Duration::ZERO);
        if self.inner.wire.take_peer_lost() {
            self.on_disconnect(cell);
            return;
        }

        let state = cell.borrow().state;
        match state {
            SessionState::Birth => {
                let request = {
                    let mut s = cell.borrow_mut();
                    self.io_input(&mut s)
                };
                let Some(request) = request else { return };
                if request.type_ != "request" {
                    return;
                }
                if request.command == "initialize" {
                    self.request_initialize(cell, &request);
                    return;
                }
                self.inner.wire.respond_error(
                    &request,
                    format!("`{}` not yet implemented (birth)", request.command),
                );
            }
            SessionState::Initialized | SessionState::Running | SessionState::Stepping => {
                let request = {
                    let mut s = cell.borrow_mut();
                    self.io_input(&mut s)
                };
                let Some(request) = request else { return };
                if request.type_ != "request" {
                    return;
                }
                if self.dispatch_main(cell, &request).is_none() {
                    self.inner.wire.respond_error(
                        &request,
                        format!(
                            "`{}` not yet implemented ({})",
                            request.command,
                            state.name()
                        ),
                    );
                }
            }
            SessionState::Terminated => {
                // Idle rebirth: ready for the next client.
                let mut s = cell.borrow_mut();
                self.set_state(&mut s, SessionState::Birth);
            }
        }
    }

    /// Read at most one validated request off the wire. Malformed JSON and
    /// schema violations are dropped as if no request were available.
    fn io_input(&self, s: &mut Session) -> Option<Request> {
        let mut transport_guard = self.inner.wire.transport.lock();
        let transport = transport_guard.as_mut()?;
        let frame = match s.decoder.poll(transport.as_mut())? {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(target: "tarn.dap", %err, "dropping malformed frame");
                return None;
            }
        };
        drop(transport_guard);

        let value: Value = match serde_json::from_slice(&frame) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(target: "tarn.dap", %err, "dropping malformed JSON payload");
                return None;
            }
        };
        if let Err(err) = s.validator.validate(&value) {
            tracing::warn!(target: "tarn.dap", %err, "dropping request failing validation");
            return None;
        }
        match serde_json::from_value(value) {
            Ok(request) => Some(request),
            Err(err) => {
                tracing::warn!(target: "tarn.dap", %err, "dropping unreadable request");
                None
            }
        }
    }

    /// The transport-level close path: in attach mode the VM keeps running
    /// and the adapter returns to birth awaiting a new client; in launch
    /// mode the session terminates and the worker is told to stop.
    pub(crate) fn on_disconnect(&self, cell: &RefCell<Session>) {
        tracing::info!(target: "tarn.dap", "client disconnected");
        let attach = {
            let mut s = cell.borrow_mut();
            let attach = s.attach_mode;
            self.set_state(
                &mut s,
                if attach {
                    SessionState::Birth
                } else {
                    SessionState::Terminated
                },
            );
            s.decoder.clear();
            s.frame_handles.clear();
            s.var_handles.clear();
            s.threads.clear_steps();
            s.pause_target = None;
            s.entry_armed = false;
            attach
        };
        self.inner.wire.close_session();
        if !attach {
            self.inner.worker_stop.store(true, Ordering::SeqCst);
        }
        let mut attached = self.inner.attached.lock();
        *attached = false;
    }

    pub(crate) fn announce_source(&self, s: &Session, key: SourceKey) {
        let source = s.sources.get(key);
        if source.valid && self.inner.wire.session_active() {
            self.inner.wire.send_event(
                "loadedSource",
                Some(json!({ "reason": "new", "source": source.describe() })),
            );
        }
    }

    fn drain_redirectors(&self, cell: &RefCell<Session>) {
        let mut s = cell.borrow_mut();
        let Session { redirectors, .. } = &mut *s;
        for (category, redirector) in redirectors.iter_mut() {
            let pending = redirector.peek();
            if pending == 0 {
                continue;
            }
            let mut buf = vec![0u8; pending];
            let read = redirector.read(&mut buf);
            buf.truncate(read);
            if !buf.is_empty() {
                self.inner.wire.output_event(category, &buf, None);
            }
        }
    }
}

enum BreakpointAction {
    /// Condition/hit-count filtered the match out.
    Pass,
    /// Logpoint: output emitted, execution continues.
    Logged,
    Stop,
}

/// Cloneable console side-channel for the host's `print` replacement.
pub struct ConsoleHandle {
    inner: Weak<Inner>,
}

impl Clone for ConsoleHandle {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl ConsoleHandle {
    /// Emit one `print` call: arguments joined by tabs, newline-terminated,
    /// category `stdout`.
    pub fn print(&self, parts: &[&str]) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let adapter = DebugAdapter { inner };
        adapter.output("stdout", &format!("{}\n", parts.join("\t")));
    }

    pub fn write(&self, category: &str, text: &str) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let adapter = DebugAdapter { inner };
        adapter.output(category, text);
    }
}
