//! The action interpreter.
//!
//! A runner owns one action document for the lifetime of a boot attempt.
//! Kernel arguments are loaded once from the command line and never
//! overwritten by remote documents; only the `v1` payload is replaced as the
//! chain is followed. Once no chain remains, the batch runs in four ordered
//! passes — vars, files, env, commands — each able to reference the results
//! of the previous through the template language.
//!
//! Resources acquired along the way are scoped: downloaded temp files are
//! owned by a cleanup list drained on every outcome, and environment
//! changes are recorded and restored when the command pass exits.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};

use epoxy_core::action::{Action, ActionError, CommandEntry, VarValue, check_key};
use epoxy_core::kargs::Kargs;
use epoxy_core::shellwords::{self, SplitError};
use epoxy_core::template::{self, Context, TemplateError};
use thiserror::Error;
use tracing::{info, warn};

use crate::download::{self, DownloadError};

/// Timeout for control-plane calls: loading actions and posting reports.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Upper bound on a single download or command execution.
pub const LARGE_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Errors raised while loading or interpreting an action document. Every
/// variant is terminal for the current attempt; the bootstrap loop reports
/// `error: <detail>` and decides whether to retry.
#[derive(Debug, Error)]
pub enum RunError {
    /// The configured karg key holds no URL.
    #[error("action URL key not found: {key}")]
    ActionUrlNotFound {
        /// The karg key that was looked up.
        key: String,
    },

    /// The HTTP client could not be constructed.
    #[error("building HTTP client: {0}")]
    Client(String),

    /// A document could not be fetched.
    #[error("loading {url}: {detail}")]
    Load {
        /// The requested URL.
        url: String,
        /// Transport-level detail.
        detail: String,
    },

    /// A document fetch answered with a non-success status.
    #[error("bad status code for {url}: got {status}, expected 200")]
    BadStatus {
        /// The requested URL.
        url: String,
        /// The status received.
        status: u16,
    },

    /// A fetched document is not valid action JSON.
    #[error("parsing action document from {url}: {detail}")]
    Parse {
        /// The source URL.
        url: String,
        /// Parser detail.
        detail: String,
    },

    /// A template failed to evaluate.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// The document shape broke a normalization rule.
    #[error(transparent)]
    Action(#[from] ActionError),

    /// A command string could not be split.
    #[error(transparent)]
    Split(#[from] SplitError),

    /// A file download failed.
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// Local filesystem access failed.
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    /// A command exited non-zero or could not be spawned.
    #[error("command {command:?} failed: {detail}")]
    CommandFailed {
        /// The command line, space-joined.
        command: String,
        /// Exit status or spawn error.
        detail: String,
    },

    /// A command exceeded its timeout and was killed.
    #[error("command {command:?} timed out after {seconds}s")]
    CommandTimeout {
        /// The command line, space-joined.
        command: String,
        /// The timeout that expired.
        seconds: u64,
    },
}

/// How an action document is fetched.
enum LoadMethod {
    /// Used for the initial action URL, which the server treats as
    /// state-changing.
    Post,
    /// Used for chain URLs, typically plain object storage.
    Get,
}

/// Deletes its paths when dropped, whatever the outcome of the pass that
/// filled it.
#[derive(Default)]
struct CleanupList {
    paths: Vec<PathBuf>,
}

impl CleanupList {
    fn add(&mut self, path: PathBuf) {
        self.paths.push(path);
    }
}

impl Drop for CleanupList {
    fn drop(&mut self) {
        for path in &self.paths {
            info!(path = %path.display(), "removing tmpfile");
            if let Err(err) = std::fs::remove_file(path) {
                warn!(path = %path.display(), %err, "failed to remove tmpfile");
            }
        }
    }
}

/// Applies environment variables on construction and restores the previous
/// state on drop: added keys are unset, changed keys get their old value
/// back. Commands resolve `PATH` through the real process environment, so
/// the variables are set for real rather than passed per child.
struct EnvGuard {
    added: Vec<String>,
    changed: Vec<(String, String)>,
}

impl EnvGuard {
    fn apply(env: &BTreeMap<String, String>) -> Self {
        let mut added = Vec::new();
        let mut changed = Vec::new();
        for (key, value) in env {
            match std::env::var(key) {
                Ok(previous) => changed.push((key.clone(), previous)),
                Err(_) => added.push(key.clone()),
            }
            std::env::set_var(key, value);
        }
        Self { added, changed }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for key in &self.added {
            std::env::remove_var(key);
        }
        for (key, value) in &self.changed {
            std::env::set_var(key, value);
        }
    }
}

/// Interprets action documents for one boot attempt.
pub struct Runner {
    action: Action,
    control: reqwest::blocking::Client,
    download: reqwest::blocking::Client,
    dryrun: bool,
    add_kargs: bool,
}

impl Runner {
    /// Creates a runner over the given kernel arguments.
    ///
    /// When `dryrun` is set, configs are still fetched (the server may
    /// change state) but nothing is downloaded or executed. When
    /// `add_kargs` is set, kargs from loaded documents are merged without
    /// ever replacing a local key.
    ///
    /// # Errors
    ///
    /// Fails when the HTTP clients cannot be constructed.
    pub fn new(kargs: Kargs, dryrun: bool, add_kargs: bool) -> Result<Self, RunError> {
        let control = reqwest::blocking::Client::builder()
            .timeout(CONTROL_TIMEOUT)
            .build()
            .map_err(|err| RunError::Client(err.to_string()))?;
        let download = reqwest::blocking::Client::builder()
            .timeout(LARGE_TIMEOUT)
            .build()
            .map_err(|err| RunError::Client(err.to_string()))?;
        Ok(Self {
            action: Action { kargs, ..Action::default() },
            control,
            download,
            dryrun,
            add_kargs,
        })
    }

    /// The current action document.
    #[must_use]
    pub fn action(&self) -> &Action {
        &self.action
    }

    /// Loads the action behind `Kargs[action_key]`, follows the chain until
    /// a command batch appears, and runs it.
    ///
    /// # Errors
    ///
    /// Any load, evaluation, download or execution failure is returned
    /// unchanged for the caller to report.
    pub fn run(&mut self, action_key: &str) -> Result<(), RunError> {
        let url = self
            .action
            .kargs
            .get(action_key)
            .cloned()
            .ok_or_else(|| RunError::ActionUrlNotFound { key: action_key.to_string() })?;
        info!(%url, "loading action");
        self.load_action(&url, &LoadMethod::Post)?;

        while !self.action.chain().is_empty() {
            let chain = self.action.chain().to_string();
            info!(%chain, "running chain");
            self.load_action(&chain, &LoadMethod::Get)?;
        }

        info!("running commands");
        self.run_commands()
    }

    /// Posts `message` to the report URL behind `Kargs[report_key]`,
    /// attaching a pretty-printed snapshot of the current document as
    /// `debug.config`.
    ///
    /// # Errors
    ///
    /// Fails when the key is missing or the POST does not succeed.
    pub fn report(&self, report_key: &str, message: &str) -> Result<(), RunError> {
        let url = self
            .action
            .kargs
            .get(report_key)
            .ok_or_else(|| RunError::ActionUrlNotFound { key: report_key.to_string() })?;
        info!(%url, message, "reporting result");

        let values = [
            ("message", message.to_string()),
            ("debug.config", self.action.to_pretty_string()),
        ];
        if self.dryrun {
            info!(message, "dryrun: skipping report POST");
            return Ok(());
        }
        let response = self
            .control
            .post(url)
            .form(&values)
            .send()
            .map_err(|err| RunError::Load { url: url.clone(), detail: err.to_string() })?;
        if !response.status().is_success() {
            return Err(RunError::BadStatus {
                url: url.clone(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    /// Fetches a document and splices its `v1` payload into the current
    /// config. Local kargs always win; a remote document's kargs are merged
    /// only when `add_kargs` is set and never replace an existing key.
    fn load_action(&mut self, source: &str, method: &LoadMethod) -> Result<(), RunError> {
        let bytes = if let Some(path) = source.strip_prefix("file://") {
            std::fs::read(path)?
        } else {
            let response = match method {
                LoadMethod::Post => {
                    self.control.post(source).form(&Vec::<(String, String)>::new()).send()
                },
                LoadMethod::Get => self.control.get(source).send(),
            }
            .map_err(|err| RunError::Load { url: source.to_string(), detail: err.to_string() })?;
            if !response.status().is_success() {
                return Err(RunError::BadStatus {
                    url: source.to_string(),
                    status: response.status().as_u16(),
                });
            }
            response
                .bytes()
                .map_err(|err| RunError::Load { url: source.to_string(), detail: err.to_string() })?
                .to_vec()
        };

        let loaded = Action::from_json(&bytes)
            .map_err(|err| RunError::Parse { url: source.to_string(), detail: err.to_string() })?;
        if self.add_kargs {
            self.action.merge_kargs(&loaded.kargs);
        }
        self.action.v1 = loaded.v1;
        Ok(())
    }

    /// Runs the four evaluation passes and executes the resulting commands.
    fn run_commands(&mut self) -> Result<(), RunError> {
        let vars = self.evaluate_vars()?;

        // The cleanup list owns every temp file from here on; dropping it at
        // any exit of this function deletes them all.
        let mut cleanup = CleanupList::default();
        let files = self.evaluate_and_download_files(&vars, &mut cleanup)?;
        let env = self.evaluate_env(&vars, &files)?;
        let commands = self.evaluate_commands(&vars, &files)?;

        let _env = EnvGuard::apply(&env);
        for argv in &commands {
            if argv.is_empty() {
                // Comment strings split to nothing; not an error.
                continue;
            }
            info!("Command: \"{}\"", argv.join("\" \""));
            if self.dryrun {
                continue;
            }
            execute(argv, LARGE_TIMEOUT)?;
        }
        Ok(())
    }

    /// Vars pass: collapse each value to a string and evaluate it with
    /// access to kargs only.
    fn evaluate_vars(&mut self) -> Result<BTreeMap<String, String>, RunError> {
        let Action { kargs, v1 } = &mut self.action;
        let mut out = BTreeMap::new();
        let Some(v1) = v1.as_mut() else {
            return Ok(out);
        };
        let ctx = Context::kargs_only(kargs);
        for (key, value) in &mut v1.vars {
            check_key(key)?;
            let flat = value.flatten(key)?;
            let rendered = template::render(&flat, &ctx)?;
            out.insert(key.clone(), rendered.clone());
            *value = VarValue::Text(rendered);
        }
        Ok(out)
    }

    /// Files pass: evaluate each URL with vars and kargs, download into a
    /// temp file, verify the checksum when present, and record the local
    /// path under `name`.
    fn evaluate_and_download_files(
        &mut self,
        vars: &BTreeMap<String, String>,
        cleanup: &mut CleanupList,
    ) -> Result<BTreeMap<String, BTreeMap<String, String>>, RunError> {
        let Action { kargs, v1 } = &mut self.action;
        let mut out = BTreeMap::new();
        let Some(v1) = v1.as_mut() else {
            return Ok(out);
        };
        let ctx = Context::with_vars(kargs, vars);
        for (name, spec) in &mut v1.files {
            check_key(name)?;
            let url = spec
                .get("url")
                .ok_or_else(|| ActionError::MissingFileUrl { key: name.clone() })?;
            let url = template::render(url, &ctx)?;
            spec.insert("url".to_string(), url.clone());

            let tmp = tempfile::Builder::new().prefix(&format!("{name}-")).tempfile()?;
            let path = tmp
                .into_temp_path()
                .keep()
                .map_err(|err| RunError::Io(err.error))?;
            cleanup.add(path.clone());

            if !self.dryrun {
                download::fetch_to_file(
                    &self.download,
                    &url,
                    &path,
                    spec.get("sha256").map(String::as_str),
                )?;
            }

            spec.insert("name".to_string(), path.display().to_string());
            out.insert(name.clone(), spec.clone());
        }
        Ok(out)
    }

    /// Env pass: evaluate each value with vars, files and kargs.
    fn evaluate_env(
        &mut self,
        vars: &BTreeMap<String, String>,
        files: &BTreeMap<String, BTreeMap<String, String>>,
    ) -> Result<BTreeMap<String, String>, RunError> {
        let Action { kargs, v1 } = &mut self.action;
        let Some(v1) = v1.as_mut() else {
            return Ok(BTreeMap::new());
        };
        let ctx = Context::with_vars_and_files(kargs, vars, files);
        for value in v1.env.values_mut() {
            *value = template::render(value, &ctx)?;
        }
        Ok(v1.env.clone())
    }

    /// Commands pass (normalization): strings are evaluated then shell-split
    /// (a comment splits to nothing); argv lists get each element evaluated;
    /// anything else is ignored.
    fn evaluate_commands(
        &mut self,
        vars: &BTreeMap<String, String>,
        files: &BTreeMap<String, BTreeMap<String, String>>,
    ) -> Result<Vec<Vec<String>>, RunError> {
        let Action { kargs, v1 } = &mut self.action;
        let mut out = Vec::new();
        let Some(v1) = v1.as_mut() else {
            return Ok(out);
        };
        let ctx = Context::with_vars_and_files(kargs, vars, files);
        for entry in &mut v1.commands {
            match entry {
                CommandEntry::Line(line) => {
                    let rendered = template::render(line, &ctx)?;
                    let argv = shellwords::split(&rendered)?;
                    out.push(argv.clone());
                    *entry = CommandEntry::Argv(argv);
                },
                CommandEntry::Argv(argv) => {
                    for arg in argv.iter_mut() {
                        *arg = template::render(arg, &ctx)?;
                    }
                    out.push(argv.clone());
                },
                CommandEntry::Other(value) => {
                    warn!(?value, "ignoring command entry with unsupported type");
                },
            }
        }
        Ok(out)
    }
}

/// Spawns one command with inherited stdio and waits for it, killing it if
/// the timeout expires. Non-zero exit is fatal for the batch.
fn execute(argv: &[String], timeout: Duration) -> Result<(), RunError> {
    let command = argv.join(" ");
    let mut child = Command::new(&argv[0])
        .args(&argv[1..])
        .spawn()
        .map_err(|err| RunError::CommandFailed { command: command.clone(), detail: err.to_string() })?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait()? {
            Some(status) if status.success() => return Ok(()),
            Some(status) => {
                return Err(RunError::CommandFailed { command, detail: status.to_string() });
            },
            None => {
                if Instant::now() >= deadline {
                    // The child gets SIGKILL; there is nothing gentler worth
                    // doing this deep in a boot.
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(RunError::CommandTimeout {
                        command,
                        seconds: timeout.as_secs(),
                    });
                }
                std::thread::sleep(Duration::from_millis(50));
            },
        }
    }
}
