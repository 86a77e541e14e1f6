//! Process actuator
//!
//! Matches running processes against a promiser regex plus per-attribute
//! selection predicates, asserts count ranges, runs stop commands, sends
//! signals with the usual guard rails (never pids 0..3, init only gets a
//! lone HUP, never ourselves) and delegates restarts by defining the
//! promised restart class.

use std::collections::BTreeSet;

use pledge_context::ClassContext;
use pledge_core::{
    Action, ActuatorError, ClassScope, ProcessAttrs, ProcessSelect, Promise, PromiseResult, Range,
};
use regex::Regex;
use tracing::{debug, error, info, warn};

// ============================================================================
// PROCESS TABLE
// ============================================================================

/// One row of the process table.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessEntry {
    pub pid: i32,
    pub ppid: i32,
    pub pgid: i32,
    pub uid: u32,
    pub uname: String,
    pub state: String,
    pub start_time: i64,
    pub cpu_seconds: i64,
    pub vsize_kb: i64,
    pub rss_kb: i64,
    pub priority: i64,
    pub threads: i64,
    pub tty: Option<String>,
    pub cmd: String,
    pub cmdline: String,
}

/// Supplier of the process table; the OS enumerator is an external
/// collaborator behind this trait.
pub trait ProcessSource {
    fn process_table(&self) -> Result<Vec<ProcessEntry>, ActuatorError>;
}

/// Delivers signals; swapped out in tests.
pub trait Signaler {
    fn kill(&self, pid: i32, signal: i32) -> std::io::Result<()>;
    fn own_pid(&self) -> i32;
}

/// The real thing.
pub struct LibcSignaler;

impl Signaler for LibcSignaler {
    fn kill(&self, pid: i32, signal: i32) -> std::io::Result<()> {
        let rc = unsafe { libc::kill(pid, signal) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    fn own_pid(&self) -> i32 {
        std::process::id() as i32
    }
}

/// Runs the promised stop command; swapped out in tests.
pub trait CommandRunner {
    /// Run through a shell, reporting whether the exit status was zero.
    fn shell_returns_zero(&self, command: &str) -> Result<bool, ActuatorError>;
}

/// `/bin/sh -c` runner.
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn shell_returns_zero(&self, command: &str) -> Result<bool, ActuatorError> {
        let status = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .status()?;
        Ok(status.success())
    }
}

// ============================================================================
// SELECTION
// ============================================================================

fn range_match(value: i64, range: Range) -> bool {
    match range {
        Some((min, max)) => min <= value && value <= max,
        None => false,
    }
}

fn regex_match_anchored(text: &str, pattern: &str) -> Result<bool, ActuatorError> {
    let anchored = format!("^(?:{pattern})$");
    let re = Regex::new(&anchored).map_err(|e| ActuatorError::Validation {
        reason: format!("invalid process selection regex '{pattern}': {e}"),
    })?;
    Ok(re.is_match(text))
}

fn regex_match_anywhere(text: &str, pattern: &str) -> Result<bool, ActuatorError> {
    let re = Regex::new(pattern).map_err(|e| ActuatorError::Validation {
        reason: format!("invalid process regex '{pattern}': {e}"),
    })?;
    Ok(re.is_match(text))
}

/// Evaluate the selection predicates against one entry, collecting the
/// names of those that held, then fold through the `process_result`
/// expression. An empty expression means the conjunction of every
/// predicate that was specified in the body.
fn select_by_attributes(
    entry: &ProcessEntry,
    select: &ProcessSelect,
) -> Result<bool, ActuatorError> {
    let mut matched: BTreeSet<&'static str> = BTreeSet::new();
    let mut specified: Vec<&'static str> = Vec::new();

    if !select.owner.is_empty() {
        specified.push("process_owner");
        for pattern in &select.owner {
            if regex_match_anchored(&entry.uname, pattern)? {
                matched.insert("process_owner");
                break;
            }
        }
    }

    let numeric: [(&'static str, i64, Range); 9] = [
        ("pid", entry.pid as i64, select.pid),
        ("ppid", entry.ppid as i64, select.ppid),
        ("pgid", entry.pgid as i64, select.pgid),
        ("vsize", entry.vsize_kb, select.vsize),
        ("rsize", entry.rss_kb, select.rsize),
        ("ttime", entry.cpu_seconds, select.ttime),
        ("stime", entry.start_time, select.stime),
        ("priority", entry.priority, select.priority),
        ("threads", entry.threads, select.threads),
    ];
    for (name, value, range) in numeric {
        if range.is_some() {
            specified.push(name);
            if range_match(value, range) {
                matched.insert(name);
            }
        }
    }

    if let Some(pattern) = &select.status {
        specified.push("status");
        if regex_match_anchored(&entry.state, pattern)? {
            matched.insert("status");
        }
    }
    if let Some(pattern) = &select.command {
        specified.push("command");
        if regex_match_anchored(&entry.cmdline, pattern)? {
            matched.insert("command");
        }
    }
    if let Some(pattern) = &select.tty {
        specified.push("tty");
        let tty = entry.tty.as_deref().unwrap_or("");
        if regex_match_anchored(tty, pattern)? {
            matched.insert("tty");
        }
    }

    match &select.process_result {
        Some(expr) => eval_process_result(expr, &matched),
        None => Ok(specified.iter().all(|name| matched.contains(name))),
    }
}

/// Boolean expression over predicate names: `&`/`.` and, `|` or, `!` not,
/// parentheses; a bare name is true iff its predicate matched.
fn eval_process_result(
    expr: &str,
    matched: &BTreeSet<&'static str>,
) -> Result<bool, ActuatorError> {
    struct Parser<'a> {
        input: &'a [u8],
        pos: usize,
        matched: &'a BTreeSet<&'static str>,
    }

    impl Parser<'_> {
        fn peek(&mut self) -> Option<u8> {
            while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
                self.pos += 1;
            }
            self.input.get(self.pos).copied()
        }

        fn parse_or(&mut self) -> Result<bool, ActuatorError> {
            let mut value = self.parse_and()?;
            while self.peek() == Some(b'|') {
                self.pos += 1;
                if self.peek() == Some(b'|') {
                    self.pos += 1;
                }
                let rhs = self.parse_and()?;
                value = value || rhs;
            }
            Ok(value)
        }

        fn parse_and(&mut self) -> Result<bool, ActuatorError> {
            let mut value = self.parse_not()?;
            while matches!(self.peek(), Some(b'&') | Some(b'.')) {
                let op = self.input[self.pos];
                self.pos += 1;
                if op == b'&' && self.peek() == Some(b'&') {
                    self.pos += 1;
                }
                let rhs = self.parse_not()?;
                value = value && rhs;
            }
            Ok(value)
        }

        fn parse_not(&mut self) -> Result<bool, ActuatorError> {
            if self.peek() == Some(b'!') {
                self.pos += 1;
                return Ok(!self.parse_not()?);
            }
            self.parse_atom()
        }

        fn parse_atom(&mut self) -> Result<bool, ActuatorError> {
            match self.peek() {
                Some(b'(') => {
                    self.pos += 1;
                    let value = self.parse_or()?;
                    if self.peek() != Some(b')') {
                        return Err(ActuatorError::Validation {
                            reason: "unbalanced parentheses in process_result".to_string(),
                        });
                    }
                    self.pos += 1;
                    Ok(value)
                }
                Some(c) if c.is_ascii_alphanumeric() || c == b'_' => {
                    let start = self.pos;
                    while self.pos < self.input.len()
                        && (self.input[self.pos].is_ascii_alphanumeric()
                            || self.input[self.pos] == b'_')
                    {
                        self.pos += 1;
                    }
                    let name = std::str::from_utf8(&self.input[start..self.pos])
                        .unwrap_or_default();
                    Ok(self.matched.contains(name))
                }
                _ => Err(ActuatorError::Validation {
                    reason: "expected a predicate name in process_result".to_string(),
                }),
            }
        }
    }

    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Ok(matched.is_empty());
    }
    let mut parser = Parser {
        input: trimmed.as_bytes(),
        pos: 0,
        matched,
    };
    let value = parser.parse_or()?;
    if parser.peek().is_some() {
        return Err(ActuatorError::Validation {
            reason: format!("trailing input in process_result '{expr}'"),
        });
    }
    Ok(value)
}

/// Filter the table down to the entries the promise selects: cmdline
/// matches the promiser regex anywhere, and the selection body (when
/// given) holds.
pub fn select_processes<'a>(
    table: &'a [ProcessEntry],
    promiser: &str,
    select: Option<&ProcessSelect>,
) -> Result<Vec<&'a ProcessEntry>, ActuatorError> {
    let mut out = Vec::new();
    for entry in table {
        if !regex_match_anywhere(&entry.cmdline, promiser)? {
            continue;
        }
        if let Some(select) = select {
            if !select_by_attributes(entry, select)? {
                continue;
            }
        }
        out.push(entry);
    }
    Ok(out)
}

// ============================================================================
// SIGNALS
// ============================================================================

/// A parsed element of the `signals` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSpec {
    Signal(i32),
    /// `<N>` or `<N>s`: sleep between deliveries.
    Sleep(u64),
}

/// Parse one signals element: a named signal, a bare integer, or a sleep.
pub fn parse_signal_spec(spec: &str) -> Result<SignalSpec, ActuatorError> {
    // `30` or `30s` means sleep; anything else is a signal name.
    let digits = spec.strip_suffix('s').unwrap_or(spec);
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        if spec.ends_with('s') || spec == digits {
            return Ok(SignalSpec::Sleep(digits.parse::<u64>().map_err(|e| {
                ActuatorError::Validation {
                    reason: format!("bad sleep element '{spec}': {e}"),
                }
            })?));
        }
    }

    let signal = match spec {
        "hup" => libc::SIGHUP,
        "int" => libc::SIGINT,
        "trap" => libc::SIGTRAP,
        "kill" => libc::SIGKILL,
        "pipe" => libc::SIGPIPE,
        "cont" => libc::SIGCONT,
        "abrt" => libc::SIGABRT,
        "stop" => libc::SIGSTOP,
        "quit" => libc::SIGQUIT,
        "term" => libc::SIGTERM,
        "child" => libc::SIGCHLD,
        "usr1" => libc::SIGUSR1,
        "usr2" => libc::SIGUSR2,
        "bus" => libc::SIGBUS,
        "segv" => libc::SIGSEGV,
        _ => {
            return Err(ActuatorError::Validation {
                reason: format!("unknown signal '{spec}'"),
            })
        }
    };
    Ok(SignalSpec::Signal(signal))
}

/// Whether this pid may be signalled at all under the given signal list.
fn pid_is_signalable(pid: i32, signals: &[String], own_pid: i32) -> bool {
    if pid == 1 {
        let only_hup = signals.len() == 1 && signals[0] == "hup";
        if only_hup {
            debug!("okay to send only HUP to init");
            return true;
        }
        return false;
    }
    if pid < 4 {
        debug!(pid, "will not signal or restart processes 0,1,2,3");
        return false;
    }
    if pid == own_pid {
        debug!("the agent will not signal itself");
        return false;
    }
    true
}

/// Deliver the promised signals to every matched process. Returns whether
/// a kill-class signal (TERM or KILL) was delivered successfully.
pub fn deliver_signals(
    matches: &[&ProcessEntry],
    attrs: &ProcessAttrs,
    signaler: &dyn Signaler,
    result: &mut PromiseResult,
) -> bool {
    if matches.is_empty() || attrs.signals.is_empty() {
        return false;
    }

    let mut killed = false;
    let mut failure = false;

    for entry in matches {
        if !pid_is_signalable(entry.pid, &attrs.signals, signaler.own_pid()) {
            continue;
        }

        for spec in &attrs.signals {
            match parse_signal_spec(spec) {
                Ok(SignalSpec::Sleep(secs)) => {
                    std::thread::sleep(std::time::Duration::from_secs(secs));
                }
                Ok(SignalSpec::Signal(signal)) => {
                    match signaler.kill(entry.pid, signal) {
                        Ok(()) => {
                            info!(
                                signal = %spec,
                                pid = entry.pid,
                                cmd = %entry.cmd,
                                "signalled process"
                            );
                            if signal == libc::SIGKILL || signal == libc::SIGTERM {
                                killed = true;
                            }
                            result.update(PromiseResult::Change);
                            failure = false;
                        }
                        Err(e) => {
                            warn!(
                                signal = %spec,
                                pid = entry.pid,
                                error = %e,
                                "could not send promised signal (might be dead)"
                            );
                            failure = true;
                        }
                    }
                }
                Err(e) => {
                    warn!(spec = %spec, error = %e, "bad signals element");
                    failure = true;
                }
            }
        }
    }

    if failure {
        result.update(PromiseResult::Fail);
    }
    killed
}

// ============================================================================
// PROMISE VERIFICATION
// ============================================================================

/// Consistency checks on a process promise's attribute record. Problems
/// are reported but, matching the original, do not abort evaluation.
pub fn process_sanity_checks(promiser: &str, attrs: &ProcessAttrs) -> bool {
    let mut ok = true;

    if attrs.restart_class.is_some() {
        if attrs.signals.iter().any(|s| s == "term" || s == "kill") {
            warn!(promiser, "promise kills then restarts, never strictly converges");
        }
        if attrs.count.is_some() {
            warn!(
                promiser,
                "both process_count and restart_class define classes, check for logic errors"
            );
            ok = false;
        }
        if let Some(count) = &attrs.count {
            if count.min == 0 && count.max == 0 {
                error!(promiser, "processes cannot have zero count if restarted");
                ok = false;
            }
        }
    }

    if let Some(count) = &attrs.count {
        if count.in_range_define.is_empty() && count.out_of_range_define.is_empty() {
            error!(
                promiser,
                "process_count must specify at least one of in_range_define or out_of_range_define"
            );
            ok = false;
        }
    }

    ok
}

/// Evaluate one processes promise against a concrete (already expanded)
/// promiser regex.
pub fn verify_process_promise(
    classes: &mut ClassContext,
    promise: &Promise,
    promiser: &str,
    source: &dyn ProcessSource,
    signaler: &dyn Signaler,
    runner: &dyn CommandRunner,
) -> PromiseResult {
    let attrs = match &promise.attrs {
        pledge_core::PromiseAttrs::Processes(attrs) => attrs,
        _ => return PromiseResult::Fail,
    };
    process_sanity_checks(promiser, attrs);

    let table = match source.process_table() {
        Ok(table) => table,
        Err(e) => {
            error!(error = %e, "cannot fetch the process table");
            return PromiseResult::Fail;
        }
    };
    let matches = match select_processes(&table, promiser, attrs.select.as_ref()) {
        Ok(matches) => matches,
        Err(e) => {
            error!(promiser, error = %e, "process selection failed");
            return PromiseResult::Interrupted;
        }
    };
    debug!(promiser, count = matches.len(), "processes matched");

    let mut result = PromiseResult::Noop;
    let class_scope = if promise.bundle.is_common() {
        ClassScope::Namespace
    } else {
        ClassScope::Bundle
    };

    // Count-range assertion.
    if let Some(count) = &attrs.count {
        let n = matches.len() as i64;
        if n < count.min || n > count.max {
            info!(promiser, found = n, "process count out of promised range");
            result.update(PromiseResult::Change);
            for class in &count.out_of_range_define {
                classes.define(
                    Some(&promise.bundle.ns),
                    class,
                    ClassScope::Namespace,
                    &["source=promise"],
                );
            }
        } else {
            for class in &count.in_range_define {
                classes.define(
                    Some(&promise.bundle.ns),
                    class,
                    ClassScope::Namespace,
                    &["source=promise"],
                );
            }
            info!(promiser, "process promise kept");
            return result;
        }
    }

    let do_signals = attrs.transaction.action != Action::Warn;
    if !do_signals {
        result.update(PromiseResult::Warn);
    }

    // Stop command and signal delivery for live matches.
    let mut killed = false;
    if do_signals && !matches.is_empty() {
        if let Some(stop) = &attrs.stop {
            match runner.shell_returns_zero(stop) {
                Ok(true) => {
                    info!(promiser, command = %stop, "stop command returned zero");
                    result.update(PromiseResult::Change);
                }
                Ok(false) => {
                    error!(promiser, command = %stop, "stop command returned nonzero");
                    result.update(PromiseResult::Fail);
                }
                Err(e) => {
                    error!(promiser, command = %stop, error = %e, "stop command could not run");
                    result.update(PromiseResult::Fail);
                    return result;
                }
            }
        }
        killed = deliver_signals(&matches, attrs, signaler, &mut result);
    }

    // Delegated restart for killed or absent processes.
    if let Some(restart_class) = &attrs.restart_class {
        if killed || matches.is_empty() {
            if attrs.transaction.action == Action::Warn {
                warn!(
                    promiser,
                    "need to keep restart promise, but only a warning is promised"
                );
                result.update(PromiseResult::Warn);
            } else {
                let status = if killed {
                    PromiseResult::Change
                } else {
                    PromiseResult::Noop
                };
                result.update(status);
                info!(class = %restart_class, "defining restart class");
                classes.define(
                    Some(&promise.bundle.ns),
                    restart_class,
                    class_scope,
                    &["source=promise"],
                );
            }
        } else {
            debug!(promiser, "no restart needed");
        }
    }

    result
}
