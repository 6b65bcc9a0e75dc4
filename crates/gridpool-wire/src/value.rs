//! The `LuaValue` tree — tagged, recursive values marshalled to workers.
//!
//! A value is either a scalar (string-encoded payload, `table` empty) or a
//! table (`value` unused, nested children in `table`). Decoding rejects any
//! node that violates that invariant.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// The Lua type tag carried on every wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LuaType {
    #[serde(rename = "LUA_TNIL")]
    Nil,
    #[serde(rename = "LUA_TBOOLEAN")]
    Boolean,
    #[serde(rename = "LUA_TNUMBER")]
    Number,
    #[serde(rename = "LUA_TSTRING")]
    String,
    #[serde(rename = "LUA_TTABLE")]
    Table,
}

/// One node of the wire value tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LuaValue {
    #[serde(rename = "type")]
    pub kind: LuaType,
    /// Scalar payload, string-encoded. Unused for tables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Nested children. Present exactly when `kind` is `Table`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<Vec<LuaValue>>,
}

impl LuaValue {
    pub fn nil() -> Self {
        Self {
            kind: LuaType::Nil,
            value: None,
            table: None,
        }
    }

    pub fn boolean(value: bool) -> Self {
        Self {
            kind: LuaType::Boolean,
            value: Some(if value { "true" } else { "false" }.to_string()),
            table: None,
        }
    }

    pub fn number(value: f64) -> Self {
        Self {
            kind: LuaType::Number,
            value: Some(value.to_string()),
            table: None,
        }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self {
            kind: LuaType::String,
            value: Some(value.into()),
            table: None,
        }
    }

    pub fn table(children: Vec<LuaValue>) -> Self {
        Self {
            kind: LuaType::Table,
            value: None,
            table: Some(children),
        }
    }

    /// Check the scalar-xor-table invariant, recursively.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.value.is_some() && self.table.is_some() {
            return Err(ProtocolError::ScalarAndTable);
        }

        match self.kind {
            LuaType::Nil => {
                // Workers encode nil as an empty string; tolerate both.
                if self.table.is_some() {
                    return Err(ProtocolError::UnexpectedPayload(self.kind));
                }
                if let Some(v) = &self.value {
                    if !v.is_empty() {
                        return Err(ProtocolError::UnexpectedPayload(self.kind));
                    }
                }
            }
            LuaType::Boolean | LuaType::Number | LuaType::String => {
                if self.table.is_some() {
                    return Err(ProtocolError::UnexpectedPayload(self.kind));
                }
                if self.value.is_none() {
                    return Err(ProtocolError::MissingPayload(self.kind));
                }
            }
            LuaType::Table => {
                if self.value.is_some() {
                    return Err(ProtocolError::UnexpectedPayload(self.kind));
                }
                let children = self
                    .table
                    .as_ref()
                    .ok_or(ProtocolError::MissingPayload(self.kind))?;
                for child in children {
                    child.validate()?;
                }
            }
        }

        Ok(())
    }

    /// Parse this node back into a native argument.
    pub fn to_arg(&self) -> Result<LuaArg, ProtocolError> {
        self.validate()?;

        Ok(match self.kind {
            LuaType::Nil => LuaArg::Nil,
            LuaType::Boolean => {
                let raw = self.value.as_deref().unwrap_or_default();
                match raw {
                    "true" => LuaArg::Boolean(true),
                    "false" => LuaArg::Boolean(false),
                    other => return Err(ProtocolError::BadBoolean(other.to_string())),
                }
            }
            LuaType::Number => {
                let raw = self.value.as_deref().unwrap_or_default();
                let parsed = raw
                    .parse::<f64>()
                    .map_err(|_| ProtocolError::BadNumber(raw.to_string()))?;
                LuaArg::Number(parsed)
            }
            LuaType::String => LuaArg::String(self.value.clone().unwrap_or_default()),
            LuaType::Table => {
                let children = self.table.as_deref().unwrap_or_default();
                let mut args = Vec::with_capacity(children.len());
                for child in children {
                    args.push(child.to_arg()?);
                }
                LuaArg::Table(args)
            }
        })
    }

    /// Decode a result array from a raw JSON body, validating every node.
    pub fn decode_many(body: &[u8]) -> Result<Vec<LuaValue>, ProtocolError> {
        let values: Vec<LuaValue> = serde_json::from_slice(body)?;
        for value in &values {
            value.validate()?;
        }
        Ok(values)
    }

    /// Render a result array the way the original tooling displayed it:
    /// scalars comma-joined, tables bracketed.
    pub fn display_many(values: &[LuaValue]) -> String {
        let mut out = String::new();
        for value in values {
            let rendered = match &value.table {
                Some(children) => format!("[{}]", Self::display_many(children)),
                None => value.value.clone().unwrap_or_default(),
            };
            if !out.is_empty() {
                out.push_str(", ");
            }
            out.push_str(&rendered);
        }
        out
    }
}

/// A native script argument, converted to a `LuaValue` before dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum LuaArg {
    Nil,
    Boolean(bool),
    Number(f64),
    String(String),
    Table(Vec<LuaArg>),
}

impl From<LuaArg> for LuaValue {
    fn from(arg: LuaArg) -> Self {
        match arg {
            LuaArg::Nil => LuaValue::nil(),
            LuaArg::Boolean(b) => LuaValue::boolean(b),
            LuaArg::Number(n) => LuaValue::number(n),
            LuaArg::String(s) => LuaValue::string(s),
            LuaArg::Table(children) => {
                LuaValue::table(children.into_iter().map(LuaValue::from).collect())
            }
        }
    }
}

impl From<f64> for LuaArg {
    fn from(v: f64) -> Self {
        LuaArg::Number(v)
    }
}

impl From<i64> for LuaArg {
    fn from(v: i64) -> Self {
        LuaArg::Number(v as f64)
    }
}

impl From<bool> for LuaArg {
    fn from(v: bool) -> Self {
        LuaArg::Boolean(v)
    }
}

impl From<&str> for LuaArg {
    fn from(v: &str) -> Self {
        LuaArg::String(v.to_string())
    }
}

impl From<String> for LuaArg {
    fn from(v: String) -> Self {
        LuaArg::String(v)
    }
}
