//! The action-document template language.
//!
//! Strings inside an action document may contain directives delimited by
//! `{{` and `}}`. Two forms are recognized:
//!
//! - `{{kargs `key`}}` — the `kargs` function looks up a kernel argument. A
//!   missing key evaluates to the empty string. The argument may be quoted
//!   with backticks or double quotes.
//! - `{{.vars.key}}` / `{{.files.key.name}}` — dotted navigation into the
//!   evaluation namespaces. Which namespaces are visible depends on the
//!   evaluation pass: vars see only kargs, file URLs see vars, env and
//!   commands see vars and files.
//!
//! Unknown references and malformed directives are fatal for the value being
//! evaluated; the interpreter surfaces them to the report step.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::kargs::Kargs;

/// Errors raised while evaluating a template string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// A `{{` was never closed by `}}`.
    #[error("unterminated template directive in {0:?}")]
    Unterminated(String),

    /// The directive text was not a `kargs` call or dotted reference.
    #[error("malformed template directive {0:?}")]
    Malformed(String),

    /// A dotted reference pointed at a namespace or key that does not exist
    /// in this evaluation pass.
    #[error("unknown template reference {0:?}")]
    UnknownReference(String),
}

/// The namespaces visible to one evaluation pass.
///
/// `kargs` is always available through the `kargs` function. `vars` and
/// `files` are enabled per pass, mirroring the dependency order of the
/// interpreter: vars → files → env → commands.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    kargs: &'a Kargs,
    vars: Option<&'a BTreeMap<String, String>>,
    files: Option<&'a BTreeMap<String, BTreeMap<String, String>>>,
}

impl<'a> Context<'a> {
    /// A context exposing only kernel arguments (the vars pass).
    #[must_use]
    pub fn kargs_only(kargs: &'a Kargs) -> Self {
        Self { kargs, vars: None, files: None }
    }

    /// A context exposing kargs and vars (the files pass).
    #[must_use]
    pub fn with_vars(kargs: &'a Kargs, vars: &'a BTreeMap<String, String>) -> Self {
        Self { kargs, vars: Some(vars), files: None }
    }

    /// A context exposing kargs, vars and files (env and commands passes).
    #[must_use]
    pub fn with_vars_and_files(
        kargs: &'a Kargs,
        vars: &'a BTreeMap<String, String>,
        files: &'a BTreeMap<String, BTreeMap<String, String>>,
    ) -> Self {
        Self { kargs, vars: Some(vars), files: Some(files) }
    }

    fn resolve_path(&self, path: &str) -> Result<String, TemplateError> {
        let mut parts = path.split('.');
        // A reference always begins with '.', so the first segment is empty.
        let _ = parts.next();
        let namespace = parts.next().unwrap_or_default();
        match namespace {
            "vars" => {
                let vars = self
                    .vars
                    .ok_or_else(|| TemplateError::UnknownReference(path.to_string()))?;
                let key = parts.next().unwrap_or_default();
                if parts.next().is_some() {
                    return Err(TemplateError::UnknownReference(path.to_string()));
                }
                vars.get(key)
                    .cloned()
                    .ok_or_else(|| TemplateError::UnknownReference(path.to_string()))
            },
            "files" => {
                let files = self
                    .files
                    .ok_or_else(|| TemplateError::UnknownReference(path.to_string()))?;
                let key = parts.next().unwrap_or_default();
                let field = parts.next().unwrap_or_default();
                if parts.next().is_some() {
                    return Err(TemplateError::UnknownReference(path.to_string()));
                }
                files
                    .get(key)
                    .and_then(|spec| spec.get(field))
                    .cloned()
                    .ok_or_else(|| TemplateError::UnknownReference(path.to_string()))
            },
            _ => Err(TemplateError::UnknownReference(path.to_string())),
        }
    }
}

/// Evaluates `input` against `ctx`, replacing every directive with its value.
///
/// # Errors
///
/// Returns an error for an unterminated `{{`, a directive that is neither a
/// `kargs` call nor a dotted reference, or a reference that cannot be
/// resolved in this context.
pub fn render(input: &str, ctx: &Context) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(TemplateError::Unterminated(input.to_string()));
        };
        let directive = after[..end].trim();
        out.push_str(&evaluate_directive(directive, ctx)?);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn evaluate_directive(directive: &str, ctx: &Context) -> Result<String, TemplateError> {
    if let Some(arg) = directive.strip_prefix("kargs") {
        let key = unquote(arg.trim())
            .ok_or_else(|| TemplateError::Malformed(directive.to_string()))?;
        // Missing kernel arguments evaluate to the empty string.
        return Ok(ctx.kargs.get(key).cloned().unwrap_or_default());
    }
    if directive.starts_with('.') {
        return ctx.resolve_path(directive);
    }
    Err(TemplateError::Malformed(directive.to_string()))
}

/// Strips matching backtick or double-quote delimiters from a function
/// argument. Returns `None` when the argument is not a quoted string.
fn unquote(arg: &str) -> Option<&str> {
    for delim in ['`', '"'] {
        if arg.len() >= 2 && arg.starts_with(delim) && arg.ends_with(delim) {
            return Some(&arg[1..arg.len() - 1]);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kargs() -> Kargs {
        let mut k = Kargs::new();
        k.insert("kargkey".to_string(), "world".to_string());
        k
    }

    #[test]
    fn renders_kargs_function_with_backticks() {
        let k = kargs();
        let ctx = Context::kargs_only(&k);
        assert_eq!(render("hello, {{kargs `kargkey`}}", &ctx).unwrap(), "hello, world");
    }

    #[test]
    fn renders_kargs_function_with_double_quotes() {
        let k = kargs();
        let ctx = Context::kargs_only(&k);
        assert_eq!(render(r#"{{kargs "kargkey"}}!"#, &ctx).unwrap(), "world!");
    }

    #[test]
    fn missing_karg_renders_empty() {
        let k = kargs();
        let ctx = Context::kargs_only(&k);
        assert_eq!(render("[{{kargs `nope`}}]", &ctx).unwrap(), "[]");
    }

    #[test]
    fn renders_vars_reference() {
        let k = kargs();
        let mut vars = BTreeMap::new();
        vars.insert("greeting".to_string(), "hello, world".to_string());
        let ctx = Context::with_vars(&k, &vars);
        assert_eq!(render("{{.vars.greeting}}", &ctx).unwrap(), "hello, world");
    }

    #[test]
    fn renders_files_reference() {
        let k = kargs();
        let vars = BTreeMap::new();
        let mut spec = BTreeMap::new();
        spec.insert("name".to_string(), "/tmp/initram-x".to_string());
        let mut files = BTreeMap::new();
        files.insert("initram".to_string(), spec);
        let ctx = Context::with_vars_and_files(&k, &vars, &files);
        assert_eq!(
            render("--initrd {{.files.initram.name}}", &ctx).unwrap(),
            "--initrd /tmp/initram-x"
        );
    }

    #[test]
    fn vars_invisible_to_vars_pass() {
        let k = kargs();
        let ctx = Context::kargs_only(&k);
        assert_eq!(
            render("{{.vars.greeting}}", &ctx),
            Err(TemplateError::UnknownReference(".vars.greeting".to_string()))
        );
    }

    #[test]
    fn unknown_key_is_fatal() {
        let k = kargs();
        let vars = BTreeMap::new();
        let ctx = Context::with_vars(&k, &vars);
        assert!(matches!(
            render("{{.vars.missing}}", &ctx),
            Err(TemplateError::UnknownReference(_))
        ));
    }

    #[test]
    fn unterminated_directive_is_fatal() {
        let k = kargs();
        let ctx = Context::kargs_only(&k);
        assert!(matches!(
            render("oops {{kargs `x`", &ctx),
            Err(TemplateError::Unterminated(_))
        ));
    }

    #[test]
    fn malformed_directive_is_fatal() {
        let k = kargs();
        let ctx = Context::kargs_only(&k);
        assert!(matches!(render("{{frobnicate}}", &ctx), Err(TemplateError::Malformed(_))));
        assert!(matches!(render("{{kargs unquoted}}", &ctx), Err(TemplateError::Malformed(_))));
    }

    #[test]
    fn plain_text_passes_through() {
        let k = kargs();
        let ctx = Context::kargs_only(&k);
        assert_eq!(render("no directives here", &ctx).unwrap(), "no directives here");
    }

    #[test]
    fn output_contains_no_directive_openers() {
        let k = kargs();
        let ctx = Context::kargs_only(&k);
        let out = render("a {{kargs `kargkey`}} b {{kargs `kargkey`}}", &ctx).unwrap();
        assert!(!out.contains("{{"));
    }
}
