//! The JSON action document exchanged between server and boot client.
//!
//! An action document carries kernel arguments plus a `v1` payload that is
//! either a chain (one level of indirection to another document) or an
//! executable batch of vars, files, env and commands. The wire shape of
//! `vars` and `commands` is heterogeneous; the tagged unions here absorb that
//! at the parser boundary so the interpreter only ever sees normalized
//! shapes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kargs::Kargs;

/// Errors raised while normalizing a parsed action document.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActionError {
    /// A `vars` value was neither a string nor a list of strings.
    #[error("unsupported vars value for {key:?}: expected string or string list")]
    UnsupportedVarsValue {
        /// The offending vars key.
        key: String,
    },

    /// A `vars` or `files` key contains `.`, which would collide with dotted
    /// template navigation.
    #[error("key {key:?} must not contain '.'")]
    DottedKey {
        /// The offending key.
        key: String,
    },

    /// A `files` entry has no `url` sub-key.
    #[error("file spec {key:?} has no url")]
    MissingFileUrl {
        /// The offending files key.
        key: String,
    },
}

/// A complete action document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Action {
    /// Kernel arguments. Populated locally from the command line; a remote
    /// document's kargs are merged only on request and never replace local
    /// keys.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kargs: Kargs,

    /// The action payload. Optional so that permissive parsing accepts
    /// documents that carry only kargs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v1: Option<V1>,
}

impl Action {
    /// Parses a document from JSON bytes. Unknown top-level keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns the underlying JSON error for malformed input.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Pretty-printed JSON form, used for logging and the `debug.config`
    /// report field.
    #[must_use]
    pub fn to_pretty_string(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|err| format!("<unserializable: {err}>"))
    }

    /// Merges kargs from a remote document, keeping every local key.
    pub fn merge_kargs(&mut self, remote: &Kargs) {
        for (key, value) in remote {
            self.kargs
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }

    /// The chain URL of the current payload, empty when there is none.
    #[must_use]
    pub fn chain(&self) -> &str {
        self.v1.as_ref().map_or("", |v1| v1.chain.as_str())
    }
}

/// The `v1` payload of an action document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct V1 {
    /// URL of the next action document. When non-empty, the batch fields are
    /// ignored and the client chains to this URL instead.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chain: String,

    /// Template variables, evaluated with access to kargs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, VarValue>,

    /// Files to download before running commands. Each spec needs a `url`
    /// key and may carry a `sha256` checksum; the interpreter records the
    /// local path under `name`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, BTreeMap<String, String>>,

    /// Environment variables added while commands run.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Commands to execute in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<CommandEntry>,
}

/// A `vars` value as found on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VarValue {
    /// A single string.
    Text(String),
    /// A list of strings, joined with single spaces during normalization.
    List(Vec<String>),
    /// Anything else. Rejected during normalization.
    Other(serde_json::Value),
}

impl VarValue {
    /// Collapses the wire shape into a single string: lists are joined with
    /// one space, strings pass through.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::UnsupportedVarsValue`] for any other shape.
    pub fn flatten(&self, key: &str) -> Result<String, ActionError> {
        match self {
            Self::Text(s) => Ok(s.clone()),
            Self::List(items) => Ok(items.join(" ")),
            Self::Other(_) => Err(ActionError::UnsupportedVarsValue { key: key.to_string() }),
        }
    }
}

/// A `commands` entry as found on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandEntry {
    /// A full command line; template-evaluated then shell-split.
    Line(String),
    /// An argv list; each element template-evaluated, quoting left as-is.
    Argv(Vec<String>),
    /// Anything else. Skipped during normalization.
    Other(serde_json::Value),
}

/// Rejects `vars`/`files` keys containing `.`, which dotted template
/// navigation could not address.
///
/// # Errors
///
/// Returns [`ActionError::DottedKey`] for the first offending key.
pub fn check_key(key: &str) -> Result<(), ActionError> {
    if key.contains('.') {
        return Err(ActionError::DottedKey { key: key.to_string() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_chain_document() {
        let action = Action::from_json(br#"{"v1":{"chain":"https://s/s2.json"}}"#).unwrap();
        assert_eq!(action.chain(), "https://s/s2.json");
    }

    #[test]
    fn parses_document_without_v1() {
        let action = Action::from_json(br#"{"kargs":{"a":"b"}}"#).unwrap();
        assert!(action.v1.is_none());
        assert_eq!(action.chain(), "");
    }

    #[test]
    fn ignores_unknown_top_level_keys() {
        let action = Action::from_json(br#"{"v2":{"x":1},"v1":{"chain":"u"}}"#).unwrap();
        assert_eq!(action.chain(), "u");
    }

    #[test]
    fn reemission_of_normalized_document_is_stable() {
        let raw = br#"{"kargs":{"k":"v"},"v1":{"chain":"https://s/next"}}"#;
        let action = Action::from_json(raw).unwrap();
        let reparsed = Action::from_json(serde_json::to_string(&action).unwrap().as_bytes()).unwrap();
        assert_eq!(
            serde_json::to_string(&action).unwrap(),
            serde_json::to_string(&reparsed).unwrap()
        );
    }

    #[test]
    fn empty_fields_are_omitted_on_the_wire() {
        let action = Action {
            kargs: Kargs::new(),
            v1: Some(V1 { chain: "https://s/s2.json".to_string(), ..V1::default() }),
        };
        assert_eq!(
            serde_json::to_string(&action).unwrap(),
            r#"{"v1":{"chain":"https://s/s2.json"}}"#
        );
    }

    #[test]
    fn var_value_string_flattens_to_itself() {
        let v = VarValue::Text("hello".to_string());
        assert_eq!(v.flatten("k").unwrap(), "hello");
    }

    #[test]
    fn var_value_list_joins_with_spaces() {
        let v = VarValue::List(vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        assert_eq!(v.flatten("k").unwrap(), "a b c");
    }

    #[test]
    fn var_value_other_is_fatal() {
        let doc: V1 = serde_json::from_str(r#"{"vars":{"bad":{"nested":1}}}"#).unwrap();
        let err = doc.vars["bad"].flatten("bad").unwrap_err();
        assert_eq!(err, ActionError::UnsupportedVarsValue { key: "bad".to_string() });
    }

    #[test]
    fn command_entries_take_both_wire_shapes() {
        let doc: V1 = serde_json::from_str(
            r#"{"commands":["/bin/echo hi",["/bin/echo","hi"],42]}"#,
        )
        .unwrap();
        assert!(matches!(doc.commands[0], CommandEntry::Line(_)));
        assert!(matches!(doc.commands[1], CommandEntry::Argv(_)));
        assert!(matches!(doc.commands[2], CommandEntry::Other(_)));
    }

    #[test]
    fn merge_kargs_never_replaces_local_keys() {
        let mut action = Action::from_json(br#"{"kargs":{"epoxy.stage2":"local"}}"#).unwrap();
        let mut remote = Kargs::new();
        remote.insert("epoxy.stage2".to_string(), "remote".to_string());
        remote.insert("epoxy.extra".to_string(), "new".to_string());
        action.merge_kargs(&remote);
        assert_eq!(action.kargs.get("epoxy.stage2").map(String::as_str), Some("local"));
        assert_eq!(action.kargs.get("epoxy.extra").map(String::as_str), Some("new"));
    }

    #[test]
    fn dotted_keys_are_rejected() {
        assert!(check_key("plain").is_ok());
        assert_eq!(
            check_key("a.b"),
            Err(ActionError::DottedKey { key: "a.b".to_string() })
        );
    }
}
