//! End-to-end session tests: handshake, breakpoints, exceptions, output,
//! and the disconnect paths, all driven over an in-memory pipe against a
//! mock VM.

mod common;

use std::time::Duration;

use common::*;
use serde_json::json;
use tarn_dap::dap::codec::encode_message;
use tarn_dap::transport::Transport;
use tarn_dap::{DebugAdapter, SessionState};
use tarn_vm::{HandlerKind, TraceEvent};

#[test]
fn breakpoint_hit_then_continue_then_terminate() {
    let (adapter, mut client, mut vm) = setup();
    handshake(&adapter, &mut client);
    set_breakpoints(&adapter, &mut client, "/a.lua", &[3]);
    launch(&adapter, &mut client, json!({}));

    // Queue the resume before the script reaches the breakpoint; the
    // stopped loop will find it.
    client.send("continue", json!({ "threadId": 1 }));

    run_call(&adapter, &mut vm, main_frame("/a.lua", 1, 1));
    run_line(&adapter, &mut vm, 3);

    let stopped = client.event("stopped");
    assert_eq!(stopped["body"]["reason"], "breakpoint");
    assert_eq!(stopped["body"]["threadId"], 1);
    client.event("continued");

    adapter.terminate(Some(0));
    client.event("terminated");
    client.event("exited");
    client.assert_seq_monotonic();
}

#[test]
fn lines_without_breakpoints_do_not_stop() {
    let (adapter, mut client, mut vm) = setup();
    handshake(&adapter, &mut client);
    set_breakpoints(&adapter, &mut client, "/a.lua", &[3]);
    launch(&adapter, &mut client, json!({}));

    run_call(&adapter, &mut vm, main_frame("/a.lua", 1, 1));
    run_line(&adapter, &mut vm, 1);
    run_line(&adapter, &mut vm, 2);

    client.assert_no_event("stopped");
}

#[test]
fn replacing_breakpoints_clears_stale_lines() {
    let (adapter, mut client, mut vm) = setup();
    handshake(&adapter, &mut client);
    set_breakpoints(&adapter, &mut client, "/a.lua", &[2]);
    launch(&adapter, &mut client, json!({}));

    // Move the breakpoint from line 2 to line 4 before the script runs.
    set_breakpoints(&adapter, &mut client, "/a.lua", &[4]);

    client.send("continue", json!({ "threadId": 1 }));
    run_call(&adapter, &mut vm, main_frame("/a.lua", 1, 1));
    run_line(&adapter, &mut vm, 2);
    assert!(client.events("stopped").is_empty(), "stale breakpoint fired");

    run_line(&adapter, &mut vm, 4);
    let stopped = client.event("stopped");
    assert_eq!(stopped["body"]["reason"], "breakpoint");
}

#[test]
fn unhandled_error_stops_with_exception_info() {
    let (adapter, mut client, mut vm) = setup();
    handshake(&adapter, &mut client);
    request_ok(
        &adapter,
        &mut client,
        "setExceptionBreakpoints",
        json!({ "filters": ["lua_pcall"] }),
    );
    launch(&adapter, &mut client, json!({}));

    let info_seq = client.send("exceptionInfo", json!({ "threadId": 1 }));
    client.send("continue", json!({ "threadId": 1 }));

    run_call(&adapter, &mut vm, main_frame("/boom.lua", 1, 1));
    vm.set_error_text(T, "boom");
    vm.set_handler_kind(T, HandlerKind::None);
    adapter.trace_event(&mut vm, T, TraceEvent::ErrorRaised);

    let stopped = client.event("stopped");
    assert_eq!(stopped["body"]["reason"], "exception");
    assert_eq!(stopped["body"]["text"], "boom");

    let info = client.response_for(info_seq);
    assert_eq!(info["body"]["exceptionId"], "lua_pcall");
    assert_eq!(info["body"]["description"], "boom");
}

#[test]
fn pcall_swallowed_error_does_not_stop_but_enabled_does() {
    // Disabled: the error inside pcall passes through silently and the
    // script's own output still arrives.
    let (adapter, mut client, mut vm) = setup();
    handshake(&adapter, &mut client);
    launch(&adapter, &mut client, json!({}));

    run_call(&adapter, &mut vm, main_frame("/s4.lua", 1, 1));
    vm.set_error_text(T, "x");
    vm.set_handler_kind(T, HandlerKind::ProtectedCall);
    adapter.trace_event(&mut vm, T, TraceEvent::ErrorRaised);
    client.assert_no_event("stopped");

    adapter.console_handle().print(&["ok"]);
    let output = client.event("output");
    assert_eq!(output["body"]["category"], "stdout");
    assert_eq!(output["body"]["output"], "ok\n");

    // Enabled: the same error stops before the pcall returns.
    let (adapter, mut client, mut vm) = setup();
    handshake(&adapter, &mut client);
    request_ok(
        &adapter,
        &mut client,
        "setExceptionBreakpoints",
        json!({ "filters": ["pcall"] }),
    );
    launch(&adapter, &mut client, json!({}));

    client.send("continue", json!({ "threadId": 1 }));
    run_call(&adapter, &mut vm, main_frame("/s4.lua", 1, 1));
    vm.set_error_text(T, "x");
    vm.set_handler_kind(T, HandlerKind::ProtectedCall);
    adapter.trace_event(&mut vm, T, TraceEvent::ErrorRaised);

    let stopped = client.event("stopped");
    assert_eq!(stopped["body"]["reason"], "exception");
}

#[test]
fn panic_stops_even_with_no_filters_enabled() {
    let (adapter, mut client, mut vm) = setup();
    handshake(&adapter, &mut client);
    launch(&adapter, &mut client, json!({}));

    let info_seq = client.send("exceptionInfo", json!({ "threadId": 1 }));
    client.send("continue", json!({ "threadId": 1 }));

    run_call(&adapter, &mut vm, main_frame("/p.lua", 1, 1));
    vm.set_error_text(T, "stack overflow");
    adapter.trace_event(&mut vm, T, TraceEvent::Panic);

    let stopped = client.event("stopped");
    assert_eq!(stopped["body"]["reason"], "exception");
    let info = client.response_for(info_seq);
    assert_eq!(info["body"]["exceptionId"], "lua_panic");
}

#[test]
fn commands_in_wrong_state_error_with_state_name_and_do_not_transition() {
    let (adapter, mut client, _vm) = setup();

    // Birth: everything but initialize is refused.
    let seq = client.send("launch", json!({}));
    adapter.update();
    let response = client.response_for(seq);
    assert_eq!(response["success"], false);
    assert!(response["message"].as_str().unwrap().contains("birth"));
    assert_eq!(adapter.state(), SessionState::Birth);

    handshake(&adapter, &mut client);

    // Initialized: hook commands are not reachable outside a stop.
    let seq = client.send("next", json!({ "threadId": 1 }));
    adapter.update();
    let response = client.response_for(seq);
    assert_eq!(response["success"], false);
    assert!(response["message"].as_str().unwrap().contains("initialized"));
    assert_eq!(adapter.state(), SessionState::Initialized);

    launch(&adapter, &mut client, json!({}));

    // Running but not stopped: continue is a hook command.
    let seq = client.send("continue", json!({ "threadId": 1 }));
    adapter.update();
    let response = client.response_for(seq);
    assert_eq!(response["success"], false);
    assert!(response["message"].as_str().unwrap().contains("running"));
    assert_eq!(adapter.state(), SessionState::Running);

    client.assert_seq_monotonic();
}

#[test]
fn unknown_command_is_a_structured_error() {
    let (adapter, mut client, _vm) = setup();
    handshake(&adapter, &mut client);
    launch(&adapter, &mut client, json!({}));

    let seq = client.send("restartFrame", json!({}));
    adapter.update();
    let response = client.response_for(seq);
    assert_eq!(response["success"], false);
    let message = response["message"].as_str().unwrap();
    assert!(message.contains("restartFrame"));
    assert!(message.contains("not yet implemented"));
}

#[test]
fn malformed_payloads_are_dropped_as_no_ops() {
    let (adapter, mut client, _vm) = setup();

    let bad_json = b"Content-Length: 9\r\n\r\nnot json!";
    client.send_bytes(bad_json);
    adapter.update();

    // Schema violation: seq must be positive.
    let invalid = json!({ "seq": 0, "type": "request", "command": "initialize" });
    let bytes = encode_message(&invalid).unwrap();
    client.send_bytes(&bytes);
    adapter.update();

    client.drain();
    assert!(client.received.is_empty());

    // The session still works afterwards.
    handshake(&adapter, &mut client);
}

#[test]
fn disabled_thread_is_transparent_to_the_hook() {
    let (adapter, mut client, mut vm) = setup();
    handshake(&adapter, &mut client);
    set_breakpoints(&adapter, &mut client, "/a.lua", &[3]);
    launch(&adapter, &mut client, json!({}));

    adapter.detach_script_thread(T, false);

    run_call(&adapter, &mut vm, main_frame("/a.lua", 1, 1));
    run_line(&adapter, &mut vm, 3);
    client.assert_no_event("stopped");

    // Re-attaching re-enables the same thread id and stops resume working.
    let was_new = adapter.attach_script_thread(&mut vm, T);
    assert!(!was_new);
    client.send("continue", json!({ "threadId": 1 }));
    run_call(&adapter, &mut vm, main_frame("/a.lua", 1, 1));
    run_line(&adapter, &mut vm, 3);
    let stopped = client.event("stopped");
    assert_eq!(stopped["body"]["threadId"], 1);
}

#[test]
fn disconnect_request_terminates_then_idle_tick_rebirths() {
    let (adapter, mut client, mut vm) = setup();
    handshake(&adapter, &mut client);
    request_ok(&adapter, &mut client, "attach", json!({}));
    set_breakpoints(&adapter, &mut client, "/a.lua", &[2]);

    client.send("disconnect", json!({}));
    run_call(&adapter, &mut vm, main_frame("/a.lua", 1, 1));
    run_line(&adapter, &mut vm, 2);

    client.event("stopped");
    client.event("terminated");
    assert_eq!(adapter.state(), SessionState::Terminated);

    adapter.update();
    assert_eq!(adapter.state(), SessionState::Birth);
}

#[test]
fn transport_loss_during_stop_exits_the_loop() {
    // Attach mode: the VM keeps running and the adapter returns to birth.
    let (adapter, mut client, mut vm) = setup();
    handshake(&adapter, &mut client);
    request_ok(&adapter, &mut client, "attach", json!({}));
    set_breakpoints(&adapter, &mut client, "/a.lua", &[2]);

    let handle = std::thread::spawn({
        let mut transport = client.transport;
        move || {
            std::thread::sleep(Duration::from_millis(60));
            transport.close();
            transport
        }
    });

    run_call(&adapter, &mut vm, main_frame("/a.lua", 1, 1));
    run_line(&adapter, &mut vm, 2);

    let transport = handle.join().unwrap();
    assert_eq!(adapter.state(), SessionState::Birth);
    let mut client = Client::new(transport);
    client.event("stopped");

    // Launch mode: the same loss terminates the session.
    let (adapter, mut client, mut vm) = setup();
    handshake(&adapter, &mut client);
    launch(&adapter, &mut client, json!({}));
    set_breakpoints(&adapter, &mut client, "/a.lua", &[2]);

    let handle = std::thread::spawn({
        let mut transport = client.transport;
        move || {
            std::thread::sleep(Duration::from_millis(60));
            transport.close();
            transport
        }
    });

    run_call(&adapter, &mut vm, main_frame("/a.lua", 1, 1));
    run_line(&adapter, &mut vm, 2);

    handle.join().unwrap();
    assert_eq!(adapter.state(), SessionState::Terminated);
}

#[test]
fn concurrent_output_blocks_until_resume_and_orders_after_stop() {
    let (adapter, mut client, mut vm) = setup();
    handshake(&adapter, &mut client);
    launch(&adapter, &mut client, json!({}));
    set_breakpoints(&adapter, &mut client, "/a.lua", &[3]);

    let resume = json!({
        "seq": 99, "type": "request", "command": "continue",
        "arguments": { "threadId": 1 },
    });
    let resume_bytes = encode_message(&resume).unwrap();

    let sender = std::thread::spawn({
        let mut transport = client.transport;
        move || {
            std::thread::sleep(Duration::from_millis(150));
            assert!(transport.send(&resume_bytes));
            transport
        }
    });

    std::thread::scope(|scope| {
        let logger = scope.spawn(|| {
            // Give the hook time to take the session mutex and stop.
            std::thread::sleep(Duration::from_millis(50));
            adapter.output("stdout", "late\n");
        });

        run_call(&adapter, &mut vm, main_frame("/a.lua", 1, 1));
        run_line(&adapter, &mut vm, 3);
        logger.join().unwrap();
    });

    let transport = sender.join().unwrap();
    let mut client = Client::new(transport);
    let stopped = client.event("stopped");
    let output = client.event("output");
    assert_eq!(output["body"]["output"], "late\n");
    assert!(
        output["seq"].as_i64().unwrap() > stopped["seq"].as_i64().unwrap(),
        "output must be serialized after the stop"
    );
    client.assert_seq_monotonic();
}

#[test]
fn console_coding_none_silently_drops_output() {
    let (adapter, mut client, _vm) = setup();
    handshake(&adapter, &mut client);
    launch(&adapter, &mut client, json!({ "consoleCoding": "none" }));

    adapter.console_handle().print(&["invisible"]);
    client.assert_no_event("output");
}

#[test]
fn output_outside_a_running_session_is_suppressed() {
    let (adapter, mut client, _vm) = setup();
    adapter.console_handle().print(&["too early"]);
    handshake(&adapter, &mut client);
    adapter.console_handle().print(&["still too early"]);
    client.assert_no_event("output");
}

#[test]
fn worker_thread_services_the_handshake() {
    let (client_end, server_end) = tarn_dap::transport::pipe();
    let adapter = DebugAdapter::with_transport(Box::new(server_end));
    adapter.start_worker();

    let mut client = Client::new(client_end);
    client.send("initialize", json!({}));

    adapter.wait_client();
    assert_eq!(adapter.state(), SessionState::Initialized);

    adapter.close();
    client.event("initialized");
}

#[test]
fn print_joins_arguments_with_tabs() {
    let (adapter, mut client, _vm) = setup();
    handshake(&adapter, &mut client);
    launch(&adapter, &mut client, json!({}));

    let handle = adapter.console_handle();
    handle.print(&["a", "b", "c"]);
    let output = client.event("output");
    assert_eq!(output["body"]["output"], "a\tb\tc\n");
}

struct QueueRedirector(Vec<u8>);

impl tarn_dap::OutputRedirector for QueueRedirector {
    fn peek(&mut self) -> usize {
        self.0.len()
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.0.len());
        buf[..n].copy_from_slice(&self.0[..n]);
        self.0.drain(..n);
        n
    }
}

#[test]
fn redirected_stderr_is_drained_on_idle_ticks() {
    let (adapter, mut client, _vm) = setup();
    handshake(&adapter, &mut client);
    launch(&adapter, &mut client, json!({}));

    adapter.open_redirect("stderr", Box::new(QueueRedirector(b"oops\n".to_vec())));
    adapter.update();

    let output = client.event("output");
    assert_eq!(output["body"]["category"], "stderr");
    assert_eq!(output["body"]["output"], "oops\n");
}

#[test]
fn external_exception_notification_targets_the_busy_thread() {
    let (adapter, mut client, mut vm) = setup();
    handshake(&adapter, &mut client);
    request_ok(
        &adapter,
        &mut client,
        "setExceptionBreakpoints",
        json!({ "filters": ["xpcall"] }),
    );
    launch(&adapter, &mut client, json!({}));

    // No thread is busy and none is named: nothing to target.
    vm.set_error_text(T, "late error");
    assert!(!adapter.exception(&mut vm, None, tarn_dap::ExceptionKind::Xpcall));

    client.send("continue", json!({ "threadId": 1 }));
    run_call(&adapter, &mut vm, main_frame("/a.lua", 1, 1));
    assert!(adapter.exception(&mut vm, Some(T), tarn_dap::ExceptionKind::Xpcall));

    let stopped = client.event("stopped");
    assert_eq!(stopped["body"]["reason"], "exception");
    // The hook was disabled around the notification and restored after.
    assert!(vm.trace_switches.contains(&(T, false)));
    assert_eq!(vm.trace_switches.last(), Some(&(T, true)));
}
