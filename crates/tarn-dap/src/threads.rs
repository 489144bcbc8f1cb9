//! Logical script threads known to the debugger.
//!
//! One entry per VM main thread. Disabled threads are transparent to the
//! hook; the busy flag marks the thread currently inside a hook call and
//! feeds `pause` targeting when the client does not name a thread.

use std::collections::BTreeMap;

use tarn_vm::{FunctionId, ScriptVm, VmThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    Into,
    Over,
    Out,
}

/// Decides when a step completes: the mode, the stack depth when the step
/// was armed, and the line the step started on.
#[derive(Debug, Clone, Copy)]
pub struct StepDescriptor {
    pub mode: StepMode,
    pub depth: u32,
    pub line: Option<u32>,
}

impl StepDescriptor {
    /// Whether this step finishes at a line event on `line` of `vm_thread`.
    pub fn complete<V: ScriptVm + ?Sized>(
        &self,
        vm: &mut V,
        vm_thread: VmThreadId,
        line: u32,
    ) -> bool {
        match self.mode {
            StepMode::Into => true,
            StepMode::Over => vm.stack_depth(vm_thread) <= self.depth && Some(line) != self.line,
            StepMode::Out => vm.stack_depth(vm_thread) < self.depth,
        }
    }
}

#[derive(Debug)]
pub struct ScriptThread {
    pub id: i64,
    pub vm_thread: VmThreadId,
    pub enabled: bool,
    pub busy: bool,
    /// Function at the top of the stack, maintained on call/return events
    /// for the breakpoint fast path.
    pub cur_function: Option<FunctionId>,
    /// True iff any breakpoint is registered against `cur_function`'s
    /// source.
    pub has_breakpoint: bool,
    /// Breakpoint-map generation `has_breakpoint` was computed against.
    pub hint_generation: u64,
    pub step: Option<StepDescriptor>,
}

impl ScriptThread {
    /// Whether the armed step finishes at a line event on `line`.
    pub fn step_complete<V: ScriptVm + ?Sized>(&self, vm: &mut V, line: u32) -> bool {
        match self.step {
            Some(step) => step.complete(vm, self.vm_thread, line),
            None => false,
        }
    }
}

/// Outcome of registering a VM thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// First time seen; a fresh id was assigned.
    New(i64),
    /// Already known; the thread was re-enabled.
    Reenabled(i64),
}

pub struct ThreadRegistry {
    threads: BTreeMap<i64, ScriptThread>,
    next_id: i64,
    /// Most recent thread to enter a hook; `pause` falls back to it.
    pub last_busy: Option<i64>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            threads: BTreeMap::new(),
            next_id: 0,
            last_busy: None,
        }
    }

    pub fn attach(&mut self, vm_thread: VmThreadId) -> AttachOutcome {
        if let Some(thread) = self.threads.values_mut().find(|t| t.vm_thread == vm_thread) {
            thread.enabled = true;
            return AttachOutcome::Reenabled(thread.id);
        }
        self.next_id += 1;
        let id = self.next_id;
        self.threads.insert(
            id,
            ScriptThread {
                id,
                vm_thread,
                enabled: true,
                busy: false,
                cur_function: None,
                has_breakpoint: false,
                hint_generation: 0,
                step: None,
            },
        );
        AttachOutcome::New(id)
    }

    /// Disable the thread, or erase it entirely when `remove` is set.
    pub fn detach(&mut self, vm_thread: VmThreadId, remove: bool) -> Option<i64> {
        let id = self
            .threads
            .values()
            .find(|t| t.vm_thread == vm_thread)?
            .id;
        if remove {
            self.threads.remove(&id);
        } else if let Some(thread) = self.threads.get_mut(&id) {
            thread.enabled = false;
        }
        Some(id)
    }

    /// Session teardown: disable everything, erasing when `release`.
    pub fn detach_all(&mut self, release: bool) {
        if release {
            self.threads.clear();
            self.last_busy = None;
        } else {
            for thread in self.threads.values_mut() {
                thread.enabled = false;
            }
        }
    }

    pub fn by_vm(&mut self, vm_thread: VmThreadId) -> Option<&mut ScriptThread> {
        self.threads.values_mut().find(|t| t.vm_thread == vm_thread)
    }

    pub fn by_id(&mut self, id: i64) -> Option<&mut ScriptThread> {
        self.threads.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScriptThread> {
        self.threads.values()
    }

    pub fn clear_steps(&mut self) {
        for thread in self.threads.values_mut() {
            thread.step = None;
        }
    }
}
