// src/hooks/mod.rs

//! Transaction hooks: `.hook` trigger files and legacy script directories
//!
//! Hooks are INI-style files with one or more `[Trigger]` sections and
//! exactly one `[Action]`. Triggers match package names or manifest paths
//! touched by the transaction; actions run before or after the whole
//! transaction, ordered by their `Depends` lists. The hook set is scanned
//! once when the transaction locks and treated as immutable afterwards.
//!
//! Legacy per-package scripts (`post_install.d/*`, `post_upgrade.d/*`) run
//! after the owning package's files are committed.

use crate::config::Config;
use crate::error::{Error, Result};
use glob::Pattern;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use wait_timeout::ChildExt;

/// Transaction phase an action runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookWhen {
    PreTransaction,
    PostTransaction,
}

impl HookWhen {
    fn as_str(&self) -> &'static str {
        match self {
            Self::PreTransaction => "PreTransaction",
            Self::PostTransaction => "PostTransaction",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pretransaction" => Some(Self::PreTransaction),
            "posttransaction" => Some(Self::PostTransaction),
            _ => None,
        }
    }
}

/// Operation kinds a trigger can match
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HookOperation {
    Install,
    Upgrade,
    Remove,
}

impl HookOperation {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "install" => Some(Self::Install),
            "upgrade" => Some(Self::Upgrade),
            "remove" => Some(Self::Remove),
            _ => None,
        }
    }
}

/// What a trigger matches against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    Package,
    Path,
}

/// One `[Trigger]` section
#[derive(Debug, Clone)]
pub struct HookTrigger {
    pub trigger_type: TriggerType,
    pub operations: BTreeSet<HookOperation>,
    pub targets: Vec<String>,
}

/// The `[Action]` section
#[derive(Debug, Clone)]
pub struct HookAction {
    pub when: HookWhen,
    pub exec: Vec<String>,
    pub needs_targets: bool,
    pub depends: Vec<String>,
    pub abort_on_fail: bool,
}

/// A parsed hook file
#[derive(Debug, Clone)]
pub struct Hook {
    pub name: String,
    pub path: PathBuf,
    pub triggers: Vec<HookTrigger>,
    pub action: HookAction,
}

fn parse_error(path: &Path, reason: impl Into<String>) -> Error {
    Error::HookParse {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Minimal shell-style splitter for `Exec` lines: whitespace-separated
/// words with single/double quoting and backslash escapes.
fn split_command(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    let mut in_word = false;
    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                in_word = true;
                let quote = c;
                for q in chars.by_ref() {
                    if q == quote {
                        break;
                    }
                    current.push(q);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(&next) = chars.peek() {
                    current.push(next);
                    chars.next();
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    out.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        out.push(current);
    }
    out
}

/// Parse one `.hook` file. Unknown keys and duplicate non-repeatable keys
/// are hard errors.
pub fn parse_hook(path: &Path) -> Result<Hook> {
    let text = fs::read_to_string(path)?;

    #[derive(PartialEq)]
    enum Section {
        None,
        Trigger,
        Action,
    }

    let mut triggers: Vec<HookTrigger> = Vec::new();
    let mut current_type: Option<TriggerType> = None;
    let mut current_ops: BTreeSet<HookOperation> = BTreeSet::new();
    let mut current_targets: Vec<String> = Vec::new();
    let mut in_trigger = false;

    let mut when: Option<HookWhen> = None;
    let mut exec: Option<Vec<String>> = None;
    let mut needs_targets: Option<bool> = None;
    let mut depends: Option<Vec<String>> = None;
    let mut abort_on_fail: Option<bool> = None;
    let mut action_seen = false;

    let mut section = Section::None;

    let mut finalize_trigger = |trigger_type: &mut Option<TriggerType>,
                                ops: &mut BTreeSet<HookOperation>,
                                targets: &mut Vec<String>,
                                active: &mut bool|
     -> Result<()> {
        if !*active {
            return Ok(());
        }
        let trigger_type = trigger_type
            .take()
            .ok_or_else(|| parse_error(path, "Trigger missing Type"))?;
        if ops.is_empty() {
            return Err(parse_error(path, "Trigger missing Operation"));
        }
        if targets.is_empty() {
            return Err(parse_error(path, "Trigger missing Target"));
        }
        triggers.push(HookTrigger {
            trigger_type,
            operations: std::mem::take(ops),
            targets: std::mem::take(targets),
        });
        *active = false;
        Ok(())
    };

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            let name = line[1..line.len() - 1].trim();
            finalize_trigger(
                &mut current_type,
                &mut current_ops,
                &mut current_targets,
                &mut in_trigger,
            )?;
            match name {
                "Trigger" => {
                    section = Section::Trigger;
                    in_trigger = true;
                }
                "Action" => {
                    if action_seen {
                        return Err(parse_error(path, "multiple [Action] sections"));
                    }
                    action_seen = true;
                    section = Section::Action;
                }
                other => return Err(parse_error(path, format!("unknown section [{other}]"))),
            }
            continue;
        }

        let (key, value) = match line.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => (line, "true"),
        };

        match section {
            Section::None => {
                return Err(parse_error(path, "entry outside [Trigger]/[Action]"));
            }
            Section::Trigger => match key {
                "Type" => {
                    if current_type.is_some() {
                        return Err(parse_error(path, "duplicate Type in Trigger"));
                    }
                    current_type = Some(match value.to_lowercase().as_str() {
                        "package" => TriggerType::Package,
                        "path" => TriggerType::Path,
                        other => {
                            return Err(parse_error(path, format!("invalid Type '{other}'")))
                        }
                    });
                }
                "Operation" => {
                    let op = HookOperation::parse(value)
                        .ok_or_else(|| parse_error(path, format!("invalid Operation '{value}'")))?;
                    current_ops.insert(op);
                }
                "Target" => current_targets.push(value.to_string()),
                other => {
                    return Err(parse_error(path, format!("unknown Trigger key '{other}'")))
                }
            },
            Section::Action => match key {
                "When" => {
                    if when.is_some() {
                        return Err(parse_error(path, "duplicate When in Action"));
                    }
                    when = Some(
                        HookWhen::parse(value)
                            .ok_or_else(|| parse_error(path, format!("invalid When '{value}'")))?,
                    );
                }
                "Exec" => {
                    if exec.is_some() {
                        return Err(parse_error(path, "duplicate Exec in Action"));
                    }
                    let argv = split_command(value);
                    if argv.is_empty() {
                        return Err(parse_error(path, "Exec command is empty"));
                    }
                    exec = Some(argv);
                }
                "NeedsTargets" => {
                    if needs_targets.is_some() {
                        return Err(parse_error(path, "duplicate NeedsTargets in Action"));
                    }
                    needs_targets = Some(parse_bool(value));
                }
                "Depends" => {
                    if depends.is_some() {
                        return Err(parse_error(path, "duplicate Depends in Action"));
                    }
                    depends = Some(value.split_whitespace().map(String::from).collect());
                }
                "AbortOnFail" => {
                    if abort_on_fail.is_some() {
                        return Err(parse_error(path, "duplicate AbortOnFail in Action"));
                    }
                    abort_on_fail = Some(parse_bool(value));
                }
                other => {
                    return Err(parse_error(path, format!("unknown Action key '{other}'")))
                }
            },
        }
    }

    finalize_trigger(
        &mut current_type,
        &mut current_ops,
        &mut current_targets,
        &mut in_trigger,
    )?;

    if triggers.is_empty() {
        return Err(parse_error(path, "hook must define at least one [Trigger]"));
    }
    let when = when.ok_or_else(|| parse_error(path, "Action missing When"))?;
    let exec = exec.ok_or_else(|| parse_error(path, "Action missing Exec"))?;

    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(Hook {
        name,
        path: path.to_path_buf(),
        triggers,
        action: HookAction {
            when,
            exec,
            needs_targets: needs_targets.unwrap_or(false),
            depends: depends.unwrap_or_default(),
            abort_on_fail: abort_on_fail.unwrap_or(false),
        },
    })
}

/// Scan hook directories in order; later directories override earlier ones
/// by hook name.
pub fn load_hooks(dirs: &[PathBuf]) -> Result<BTreeMap<String, Hook>> {
    let mut hooks = BTreeMap::new();
    for dir in dirs {
        let Ok(entries) = fs::read_dir(dir) else {
            continue;
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().map(|e| e == "hook").unwrap_or(false))
            .collect();
        paths.sort();
        for path in paths {
            let hook = parse_hook(&path)?;
            debug!("loaded hook {} from {}", hook.name, path.display());
            hooks.insert(hook.name.clone(), hook);
        }
    }
    Ok(hooks)
}

/// One package operation the transaction performs, as hooks see it
#[derive(Debug, Clone)]
pub struct HookEvent {
    pub name: String,
    pub operation: HookOperation,
    pub version: String,
    pub release: u32,
    pub paths: Vec<String>,
}

impl HookEvent {
    fn package_target(&self) -> String {
        format!("{}-{}-{}", self.name, self.version, self.release)
    }
}

/// Per-transaction hook orchestration
pub struct HookManager {
    hooks: BTreeMap<String, Hook>,
    root: PathBuf,
    timeout: Option<Duration>,
    events: Vec<HookEvent>,
    pre_ran: bool,
    post_ran: bool,
}

impl HookManager {
    /// Snapshot the hook directories for this transaction
    pub fn load(config: &Config) -> Result<Self> {
        Ok(Self {
            hooks: load_hooks(&config.hook_dirs())?,
            root: config.root.clone(),
            timeout: config.hook_timeout,
            events: Vec::new(),
            pre_ran: false,
            post_ran: false,
        })
    }

    #[cfg(test)]
    fn with_hooks(hooks: BTreeMap<String, Hook>, root: PathBuf) -> Self {
        Self {
            hooks,
            root,
            timeout: Some(Duration::from_secs(30)),
            events: Vec::new(),
            pre_ran: false,
            post_ran: false,
        }
    }

    /// Register a package operation before the phases run
    pub fn add_event(&mut self, event: HookEvent) {
        self.events.push(event);
    }

    /// Run PreTransaction hooks once
    pub fn run_pre(&mut self) -> Result<()> {
        if self.pre_ran {
            return Ok(());
        }
        self.pre_ran = true;
        self.run_when(HookWhen::PreTransaction)
    }

    /// Run PostTransaction hooks once
    pub fn run_post(&mut self) -> Result<()> {
        if self.post_ran {
            return Ok(());
        }
        self.post_ran = true;
        self.run_when(HookWhen::PostTransaction)
    }

    fn gather_matches(&self, trigger: &HookTrigger) -> Vec<String> {
        let patterns: Vec<Pattern> = trigger
            .targets
            .iter()
            .filter_map(|t| Pattern::new(t).ok())
            .collect();
        let mut matches: Vec<String> = Vec::new();
        for event in &self.events {
            if !trigger.operations.contains(&event.operation) {
                continue;
            }
            match trigger.trigger_type {
                TriggerType::Package => {
                    if patterns.iter().any(|p| p.matches(&event.name)) {
                        let target = event.package_target();
                        if !matches.contains(&target) {
                            matches.push(target);
                        }
                    }
                }
                TriggerType::Path => {
                    for path in &event.paths {
                        let stripped = path.trim_start_matches('/');
                        if patterns
                            .iter()
                            .any(|p| p.matches(path) || p.matches(stripped))
                            && !matches.contains(path)
                        {
                            matches.push(path.clone());
                        }
                    }
                }
            }
        }
        matches
    }

    fn run_when(&self, when: HookWhen) -> Result<()> {
        let mut triggered: Vec<(&Hook, Vec<String>)> = Vec::new();
        for hook in self.hooks.values() {
            if hook.action.when != when {
                continue;
            }
            let mut targets: Vec<String> = Vec::new();
            for trigger in &hook.triggers {
                for m in self.gather_matches(trigger) {
                    if !targets.contains(&m) {
                        targets.push(m);
                    }
                }
            }
            if !targets.is_empty() {
                triggered.push((hook, targets));
            }
        }
        if triggered.is_empty() {
            return Ok(());
        }

        let ordered = order_by_depends(triggered)?;
        info!(
            "running {} {} hook(s)",
            ordered.len(),
            when.as_str().to_lowercase()
        );
        for (hook, targets) in ordered {
            self.run_hook(hook, &targets)?;
        }
        Ok(())
    }

    fn run_hook(&self, hook: &Hook, targets: &[String]) -> Result<()> {
        let mut argv = hook.action.exec.clone();
        let mut command = Command::new(&argv[0]);

        command
            .env("LPM_HOOK_NAME", &hook.name)
            .env("LPM_HOOK_PATH", &hook.path)
            .env("LPM_HOOK_WHEN", hook.action.when.as_str())
            .env("LPM_ROOT", &self.root)
            .stdin(Stdio::null());

        if hook.action.needs_targets {
            command
                .env("LPM_TARGETS", targets.join("\n"))
                .env("LPM_TARGET_COUNT", targets.len().to_string());
            argv.extend(targets.iter().cloned());
        }
        command.args(&argv[1..]);

        debug!("hook {}: exec {argv:?}", hook.name);
        let outcome = run_with_timeout(&mut command, self.timeout, &hook.name);
        match outcome {
            Ok(()) => Ok(()),
            Err(e) if hook.action.abort_on_fail => Err(e),
            Err(e) => {
                error!("hook {} failed (continuing): {e}", hook.name);
                Ok(())
            }
        }
    }
}

/// Topologically order triggered hooks by their `Depends` lists. Depends
/// naming hooks that did not trigger are ignored; a cycle is an error.
fn order_by_depends(
    triggered: Vec<(&Hook, Vec<String>)>,
) -> Result<Vec<(&Hook, Vec<String>)>> {
    let names: BTreeSet<&str> = triggered.iter().map(|(h, _)| h.name.as_str()).collect();
    let mut pending: BTreeMap<&str, BTreeSet<&str>> = triggered
        .iter()
        .map(|(hook, _)| {
            let deps: BTreeSet<&str> = hook
                .action
                .depends
                .iter()
                .map(String::as_str)
                .filter(|d| names.contains(d))
                .collect();
            (hook.name.as_str(), deps)
        })
        .collect();

    let by_name: BTreeMap<&str, &(&Hook, Vec<String>)> = triggered
        .iter()
        .map(|entry| (entry.0.name.as_str(), entry))
        .collect();

    let mut ordered: Vec<(&Hook, Vec<String>)> = Vec::new();
    while !pending.is_empty() {
        let ready: Vec<&str> = pending
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(&name, _)| name)
            .collect();
        if ready.is_empty() {
            let stuck: Vec<String> = pending.keys().map(|s| s.to_string()).collect();
            return Err(Error::HookCycle(stuck));
        }
        for name in ready {
            pending.remove(name);
            for deps in pending.values_mut() {
                deps.remove(name);
            }
            let entry = by_name[name];
            ordered.push((entry.0, entry.1.clone()));
        }
    }
    Ok(ordered)
}

fn run_with_timeout(
    command: &mut Command,
    timeout: Option<Duration>,
    name: &str,
) -> Result<()> {
    let mut child = command.spawn().map_err(|e| Error::HookExec {
        name: name.to_string(),
        reason: format!("spawn failed: {e}"),
    })?;

    let status = match timeout {
        Some(limit) => match child.wait_timeout(limit).map_err(|e| Error::HookExec {
            name: name.to_string(),
            reason: e.to_string(),
        })? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::HookExec {
                    name: name.to_string(),
                    reason: format!("timed out after {}s", limit.as_secs()),
                });
            }
        },
        None => child.wait().map_err(|e| Error::HookExec {
            name: name.to_string(),
            reason: e.to_string(),
        })?,
    };

    if status.success() {
        Ok(())
    } else {
        Err(Error::HookExec {
            name: name.to_string(),
            reason: format!("exit status {}", status.code().unwrap_or(-1)),
        })
    }
}

/// Run legacy per-package scripts from a directory such as
/// `post_install.d`. Scripts run in name order with the package
/// environment; failures are logged and do not abort the transaction.
pub fn run_legacy_scripts(
    config: &Config,
    dir_name: &str,
    env: &[(String, String)],
) -> Result<()> {
    let dir = config.legacy_script_dir(dir_name);
    let Ok(entries) = fs::read_dir(&dir) else {
        return Ok(());
    };
    let mut scripts: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_executable(p))
        .collect();
    scripts.sort();

    for script in scripts {
        let name = script
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        debug!("running legacy script {dir_name}/{name}");
        let mut command = Command::new(&script);
        command.stdin(Stdio::null());
        for (key, value) in env {
            command.env(key, value);
        }
        if let Err(e) = run_with_timeout(&mut command, config.hook_timeout, &name) {
            warn!("legacy script {dir_name}/{name} failed: {e}");
        }
    }
    Ok(())
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
