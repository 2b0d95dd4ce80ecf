//! Wire-format tests for the agent contract.

use ferry_core::agent::{Agent, AgentStatus};
use ferry_core::cmd::*;
use ferry_core::ids::*;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::BTreeSet;

#[test]
fn test_shell_in_json_shape() {
    let flow_id = FlowId::new();
    let job_id = JobId::new();
    let shell = ShellIn::new(flow_id, job_id, 1800)
        .with_bash("echo hello")
        .with_input("FLOW_WORKSPACE", "/ws");

    let value = serde_json::to_value(CmdIn::Shell(shell.clone())).expect("serialize");

    assert_eq!(value["type"], json!("SHELL"));
    assert_eq!(value["id"], json!(shell.id.to_string()));
    assert_eq!(value["flow_id"], json!(flow_id.to_string()));
    assert_eq!(value["bash"], json!(["echo hello"]));
    assert_eq!(value["inputs"]["FLOW_WORKSPACE"], json!("/ws"));
    assert_eq!(value["timeout"], json!(1800));
}

#[test]
fn test_unit_commands_are_bare_tags() {
    let kill = serde_json::to_value(CmdIn::Kill).expect("serialize");
    assert_eq!(kill, json!({ "type": "KILL" }));

    let close: CmdIn = serde_json::from_str(r#"{"type":"CLOSE"}"#).expect("deserialize");
    assert_eq!(close, CmdIn::Close);
}

#[test]
fn test_shell_out_defaults() {
    let id = CmdId::new();
    let raw = format!(r#"{{"id":"{}","status":"RUNNING","process_id":42}}"#, id);

    let out: ShellOut = serde_json::from_str(&raw).expect("deserialize");

    assert_eq!(out.id, id);
    assert_eq!(out.status, ExecStatus::Running);
    assert_eq!(out.process_id, Some(42));
    assert_eq!(out.log_size, -1);
    assert!(out.output.is_empty());
    assert!(!out.is_terminal());
}

#[test]
fn test_callback_frame_shell() {
    let mut out = ShellOut::new(CmdId::new(), ExecStatus::Success);
    out.code = Some(0);
    out.output.insert("FLOW_VERSION".to_string(), "1.2.0".to_string());

    let frame = CmdOut::Shell(out.clone()).encode().expect("encode");
    assert_eq!(frame[0], SHELL_OUT_IND);

    let decoded = CmdOut::decode(&frame).expect("decode");
    assert_eq!(decoded, CmdOut::Shell(out));
}

#[test]
fn test_callback_frame_accepts_echoed_ids() {
    let id = CmdId::new();
    let shown = format!(r#"{{"id":"{}","status":"SUCCESS","code":0}}"#, id);
    let bare = format!(r#"{{"id":"{}","status":"SUCCESS","code":0}}"#, id.as_uuid());

    for body in [shown, bare] {
        let mut frame = vec![SHELL_OUT_IND];
        frame.extend_from_slice(body.as_bytes());

        match CmdOut::decode(&frame).expect("decode") {
            CmdOut::Shell(out) => {
                assert_eq!(out.id, id);
                assert!(out.is_terminal());
            }
            other => panic!("expected shell output, got {:?}", other),
        }
    }
}

#[test]
fn test_callback_frame_tty() {
    let out = TtyOut {
        id: SessionId::new(),
        action: TtyAction::Open,
        success: false,
        error: Some("no such container".to_string()),
    };

    let frame = CmdOut::Tty(out.clone()).encode().expect("encode");
    assert_eq!(frame[0], TTY_OUT_IND);
    assert_eq!(CmdOut::decode(&frame).expect("decode"), CmdOut::Tty(out));
}

#[test]
fn test_unframed_json_is_shell_out() {
    let out = ShellOut::new(CmdId::new(), ExecStatus::Killed);
    let raw = serde_json::to_vec(&out).expect("serialize");

    assert_eq!(CmdOut::decode(&raw).expect("decode"), CmdOut::Shell(out));
}

#[test]
fn test_agent_status_wire_names() {
    let mut agent = Agent::new("linux-1", "token", BTreeSet::from(["linux".to_string()]));
    agent.status = AgentStatus::Busy;
    agent.job_id = Some(JobId::new());

    let value = serde_json::to_value(&agent).expect("serialize");
    assert_eq!(value["status"], json!("BUSY"));

    let parsed: Agent = serde_json::from_value(value).expect("deserialize");
    assert_eq!(parsed, agent);
}
