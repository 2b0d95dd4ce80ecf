//! JSON Schema of the agent wire contract.

use crate::cmd::{CmdIn, ShellOut, TtyLog, TtyOut};
use crate::settings::Settings;
use schemars::schema::RootSchema;
use schemars::schema_for;

/// Schemas of every payload an agent sends or receives, by type name.
pub fn wire_schemas() -> Vec<(&'static str, RootSchema)> {
    vec![
        ("CmdIn", schema_for!(CmdIn)),
        ("ShellOut", schema_for!(ShellOut)),
        ("TtyOut", schema_for!(TtyOut)),
        ("TtyLog", schema_for!(TtyLog)),
        ("Settings", schema_for!(Settings)),
    ]
}
