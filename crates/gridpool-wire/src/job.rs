//! Job and script descriptors — the unit of work sent to a worker.

use serde::{Deserialize, Serialize};

use crate::value::{LuaArg, LuaValue};

/// Description of one unit of work opened on a worker instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Caller-chosen job id, unique per open job.
    pub id: String,
    /// Time-to-live for the job on the worker side.
    pub expiration_in_seconds: f64,
    /// Worker-defined scheduling category.
    pub category: i32,
    /// Declared physical cores this job needs.
    pub cores: f64,
}

impl Job {
    pub fn new(id: impl Into<String>, expiration_in_seconds: f64) -> Self {
        Self {
            id: id.into(),
            expiration_in_seconds,
            category: 0,
            cores: 0.0,
        }
    }
}

/// A named script plus its ordered wire arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptExecution {
    pub name: String,
    pub script: String,
    pub arguments: Vec<LuaValue>,
}

impl ScriptExecution {
    /// Build a script execution with no arguments.
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            arguments: Vec::new(),
        }
    }

    /// Build a script execution from native arguments.
    pub fn with_args(
        name: impl Into<String>,
        script: impl Into<String>,
        args: impl IntoIterator<Item = LuaArg>,
    ) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            arguments: args.into_iter().map(LuaValue::from).collect(),
        }
    }

    /// The canonical empty script.
    pub fn empty() -> Self {
        Self::new("EmptyScript", "return")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::LuaType;

    #[test]
    fn with_args_encodes_native_values() {
        let script = ScriptExecution::with_args(
            "test",
            "return ...",
            [LuaArg::from(1i64), LuaArg::from("two")],
        );
        assert_eq!(script.arguments.len(), 2);
        assert_eq!(script.arguments[0].kind, LuaType::Number);
        assert_eq!(script.arguments[1].kind, LuaType::String);
    }

    #[test]
    fn empty_script_has_no_arguments() {
        let script = ScriptExecution::empty();
        assert_eq!(script.script, "return");
        assert!(script.arguments.is_empty());
    }
}
