//! Shared harness: a scripted client on one end of an in-memory pipe, the
//! adapter on the other, and a mock VM driven by the test body.

#![allow(dead_code)]

use serde_json::{json, Value};
use tarn_dap::dap::codec::{encode_message, FrameDecoder};
use tarn_dap::transport::{pipe, PipeTransport, Transport};
use tarn_dap::DebugAdapter;
use tarn_vm::{ChunkOrigin, FrameKind, FrameSnapshot, MockVm, TraceEvent, VmThreadId};

/// The VM main thread used by most tests.
pub const T: VmThreadId = 7;

pub struct Client {
    pub transport: PipeTransport,
    decoder: FrameDecoder,
    next_seq: i64,
    pub received: Vec<Value>,
}

impl Client {
    pub fn new(transport: PipeTransport) -> Self {
        Self {
            transport,
            decoder: FrameDecoder::new(),
            next_seq: 1,
            received: Vec::new(),
        }
    }

    pub fn send(&mut self, command: &str, arguments: Value) -> i64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let message = json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        });
        let bytes = encode_message(&message).unwrap();
        assert!(self.transport.send(&bytes), "client send failed");
        seq
    }

    pub fn send_bytes(&mut self, bytes: &[u8]) {
        assert!(self.transport.send(bytes));
    }

    /// Pull everything the adapter has written so far.
    pub fn drain(&mut self) {
        while let Some(frame) = self.decoder.poll(&mut self.transport) {
            let value: Value = serde_json::from_slice(&frame.unwrap()).unwrap();
            self.received.push(value);
        }
    }

    pub fn response_for(&mut self, request_seq: i64) -> Value {
        self.drain();
        self.received
            .iter()
            .find(|m| {
                m["type"] == "response" && m["request_seq"].as_i64() == Some(request_seq)
            })
            .cloned()
            .unwrap_or_else(|| panic!("no response for request seq {request_seq}"))
    }

    pub fn events(&mut self, name: &str) -> Vec<Value> {
        self.drain();
        self.received
            .iter()
            .filter(|m| m["type"] == "event" && m["event"] == name)
            .cloned()
            .collect()
    }

    pub fn event(&mut self, name: &str) -> Value {
        self.events(name)
            .into_iter()
            .next()
            .unwrap_or_else(|| panic!("no `{name}` event received"))
    }

    pub fn assert_no_event(&mut self, name: &str) {
        assert!(
            self.events(name).is_empty(),
            "unexpected `{name}` event received"
        );
    }

    /// Every outbound message carries a strictly increasing `seq`.
    pub fn assert_seq_monotonic(&mut self) {
        self.drain();
        let seqs: Vec<i64> = self
            .received
            .iter()
            .map(|m| m["seq"].as_i64().expect("message without seq"))
            .collect();
        for pair in seqs.windows(2) {
            assert!(
                pair[0] < pair[1],
                "outbound seq not strictly increasing: {seqs:?}"
            );
        }
    }
}

pub fn setup() -> (DebugAdapter, Client, MockVm) {
    let (client_end, server_end) = pipe();
    let adapter = DebugAdapter::with_transport(Box::new(server_end));
    let client = Client::new(client_end);
    let mut vm = MockVm::new();
    adapter.attach_script_thread(&mut vm, T);
    (adapter, client, vm)
}

/// Drive the DAP handshake through the idle tick.
pub fn handshake(adapter: &DebugAdapter, client: &mut Client) {
    let seq = client.send("initialize", json!({}));
    adapter.update();
    let response = client.response_for(seq);
    assert_eq!(response["success"], true);
    client.event("initialized");
}

pub fn request_ok(adapter: &DebugAdapter, client: &mut Client, command: &str, args: Value) {
    let seq = client.send(command, args);
    adapter.update();
    let response = client.response_for(seq);
    assert_eq!(
        response["success"], true,
        "`{command}` failed: {response:?}"
    );
}

pub fn launch(adapter: &DebugAdapter, client: &mut Client, args: Value) {
    request_ok(adapter, client, "launch", args);
}

pub fn set_breakpoints(adapter: &DebugAdapter, client: &mut Client, path: &str, lines: &[u32]) {
    let breakpoints: Vec<Value> = lines.iter().map(|line| json!({ "line": line })).collect();
    request_ok(
        adapter,
        client,
        "setBreakpoints",
        json!({ "source": { "path": path }, "breakpoints": breakpoints }),
    );
}

pub fn file_frame(path: &str, function: u64, line: u32) -> FrameSnapshot {
    FrameSnapshot {
        function: Some(function),
        origin: ChunkOrigin::File {
            path: path.to_string(),
        },
        line: Some(line),
        kind: FrameKind::Lua,
        name: None,
    }
}

pub fn main_frame(path: &str, function: u64, line: u32) -> FrameSnapshot {
    FrameSnapshot {
        kind: FrameKind::Main,
        ..file_frame(path, function, line)
    }
}

pub fn inline_frame(name: &str, code: &str, function: u64, line: u32) -> FrameSnapshot {
    FrameSnapshot {
        function: Some(function),
        origin: ChunkOrigin::Inline {
            name: name.to_string(),
            code: code.to_string(),
        },
        line: Some(line),
        kind: FrameKind::Lua,
        name: None,
    }
}

/// Simulate the VM entering a function.
pub fn run_call(adapter: &DebugAdapter, vm: &mut MockVm, frame: FrameSnapshot) {
    vm.push_frame(T, frame);
    adapter.trace_event(vm, T, TraceEvent::Call);
}

/// Simulate the VM returning from the current function.
pub fn run_return(adapter: &DebugAdapter, vm: &mut MockVm) {
    vm.pop_frame(T);
    adapter.trace_event(vm, T, TraceEvent::Return);
}

/// Simulate a line event. Blocks for the whole stopped loop if it stops.
pub fn run_line(adapter: &DebugAdapter, vm: &mut MockVm, line: u32) {
    vm.set_current_line(T, line);
    adapter.trace_event(vm, T, TraceEvent::Line { line });
}
