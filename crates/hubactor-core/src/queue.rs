//! Priority command queue with collision rules.
//!
//! Commands are queued by verb priority and run one at a time. Higher
//! priority runs first, equal priority runs in arrival order, and
//! [`Priority::Immediate`] clears the queue and asks the running command to
//! die. Rules in the [`QueuePolicy`] decide what happens when an incoming
//! command collides with a queued or running one.
//!
//! The queue never finishes a running command itself. It calls the kill
//! function and waits for the command's owner to set a terminal state; that
//! state change is what lets the next command start.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::command::{Command, CommandState};
use crate::error::QueueError;

/// Verb pattern that matches every verb.
pub const ALL_VERBS: &str = "all";

/// Queue priority of a verb.
///
/// Ordered so that any level is below `Immediate` and larger levels are higher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "PriorityRepr", into = "PriorityRepr")]
pub enum Priority {
    Level(u32),
    Immediate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum PriorityRepr {
    Level(u32),
    Name(String),
}

impl TryFrom<PriorityRepr> for Priority {
    type Error = QueueError;

    fn try_from(repr: PriorityRepr) -> Result<Self, Self::Error> {
        match repr {
            PriorityRepr::Level(level) => Ok(Priority::Level(level)),
            PriorityRepr::Name(name) => name.parse(),
        }
    }
}

impl From<Priority> for PriorityRepr {
    fn from(priority: Priority) -> Self {
        match priority {
            Priority::Level(level) => PriorityRepr::Level(level),
            Priority::Immediate => PriorityRepr::Name("immediate".to_string()),
        }
    }
}

impl FromStr for Priority {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("immediate") {
            return Ok(Priority::Immediate);
        }
        s.parse::<u32>()
            .map(Priority::Level)
            .map_err(|_| QueueError::InvalidPriority(s.to_string()))
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Level(level) => write!(f, "{level}"),
            Priority::Immediate => f.write_str("immediate"),
        }
    }
}

/// What to do when an incoming command collides with a queued or running one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Cancel the incoming command; nothing queued changes.
    CancelNew,
    /// Cancel the matching queued command.
    CancelQueued,
    /// Cancel the matching queued command, or kill it if it is running.
    KillRunning,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::CancelNew => "cancel_new",
            RuleAction::CancelQueued => "cancel_queued",
            RuleAction::KillRunning => "kill_running",
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleAction {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|ch| *ch != '_' && *ch != '-')
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "cancelnew" => Ok(RuleAction::CancelNew),
            "cancelqueued" => Ok(RuleAction::CancelQueued),
            "killrunning" => Ok(RuleAction::KillRunning),
            _ => Err(QueueError::UnknownAction(s.to_string())),
        }
    }
}

/// One side of a rule: a single verb or every verb.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VerbPattern {
    All,
    Verb(String),
}

impl VerbPattern {
    pub fn parse(verb: &str) -> Self {
        let verb = verb.trim().to_lowercase();
        if verb == ALL_VERBS {
            VerbPattern::All
        } else {
            VerbPattern::Verb(verb)
        }
    }

    pub fn matches(&self, verb: &str) -> bool {
        match self {
            VerbPattern::All => true,
            VerbPattern::Verb(own) => own == verb,
        }
    }

    fn overlaps(&self, other: &VerbPattern) -> bool {
        match (self, other) {
            (VerbPattern::Verb(a), VerbPattern::Verb(b)) => a == b,
            _ => true,
        }
    }

    fn is_exact(&self) -> bool {
        matches!(self, VerbPattern::Verb(_))
    }
}

impl fmt::Display for VerbPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerbPattern::All => f.write_str(ALL_VERBS),
            VerbPattern::Verb(verb) => f.write_str(verb),
        }
    }
}

/// A collision rule for one (incoming, queued) verb pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub action: RuleAction,
    pub new_verb: VerbPattern,
    pub queued_verb: VerbPattern,
}

impl Rule {
    fn specificity(&self) -> (u8, bool) {
        (
            u8::from(self.new_verb.is_exact()) + u8::from(self.queued_verb.is_exact()),
            self.new_verb.is_exact(),
        )
    }

    fn same_key(&self, other: &Rule) -> bool {
        self.new_verb == other.new_verb && self.queued_verb == other.queued_verb
    }

    fn overlaps(&self, other: &Rule) -> bool {
        self.new_verb.overlaps(&other.new_verb) && self.queued_verb.overlaps(&other.queued_verb)
    }

    fn matches(&self, new_verb: &str, queued_verb: &str) -> bool {
        self.new_verb.matches(new_verb) && self.queued_verb.matches(queued_verb)
    }
}

/// Priority table and collision rules. Built before the queue starts, read-only after.
#[derive(Debug, Clone, Default)]
pub struct QueuePolicy {
    priorities: HashMap<String, Priority>,
    default_priority: Option<Priority>,
    rules: Vec<Rule>,
}

impl QueuePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(verb, priority)` pairs.
    pub fn from_priorities<I, S>(priorities: I) -> Self
    where
        I: IntoIterator<Item = (S, Priority)>,
        S: AsRef<str>,
    {
        let mut policy = Self::new();
        for (verb, priority) in priorities {
            policy.set_priority(verb.as_ref(), priority);
        }
        policy
    }

    pub fn set_priority(&mut self, verb: &str, priority: Priority) {
        self.priorities.insert(verb.trim().to_lowercase(), priority);
    }

    pub fn with_priority(mut self, verb: &str, priority: Priority) -> Self {
        self.set_priority(verb, priority);
        self
    }

    /// Priority for verbs missing from the table. Without one such verbs are rejected.
    pub fn with_default_priority(mut self, priority: Priority) -> Self {
        self.default_priority = Some(priority);
        self
    }

    pub fn set_default_priority(&mut self, priority: Option<Priority>) {
        self.default_priority = priority;
    }

    pub fn default_priority(&self) -> Option<Priority> {
        self.default_priority
    }

    /// True if `verb` has its own entry in the priority table.
    pub fn contains_verb(&self, verb: &str) -> bool {
        self.priorities.contains_key(verb)
    }

    /// Priority a command with `verb` is queued at.
    pub fn priority_of(&self, verb: &str) -> Option<Priority> {
        self.priorities
            .get(verb)
            .copied()
            .or(self.default_priority)
    }

    /// The priority table, sorted by verb.
    pub fn priorities(&self) -> BTreeMap<&str, Priority> {
        self.priorities
            .iter()
            .map(|(verb, priority)| (verb.as_str(), *priority))
            .collect()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Register `action` for every incoming verb in `new_verbs` against every
    /// queued or running verb in `queued_verbs`. `"all"` matches every verb.
    ///
    /// Every named verb must be in the priority table. A pair whose action
    /// differs from an equally specific overlapping rule is rejected, as is
    /// an exact pair registered twice. A more specific rule overrides a
    /// wildcard one. Nothing is registered if any pair is rejected.
    pub fn add_rule<N, Q>(
        &mut self,
        action: RuleAction,
        new_verbs: &[N],
        queued_verbs: &[Q],
    ) -> Result<(), QueueError>
    where
        N: AsRef<str>,
        Q: AsRef<str>,
    {
        let new_patterns = self.patterns(new_verbs)?;
        let queued_patterns = self.patterns(queued_verbs)?;

        let mut pending: Vec<Rule> = Vec::new();
        for new_verb in &new_patterns {
            for queued_verb in &queued_patterns {
                let candidate = Rule {
                    action,
                    new_verb: new_verb.clone(),
                    queued_verb: queued_verb.clone(),
                };
                if self.check_rule(&candidate, &pending)? {
                    pending.push(candidate);
                }
            }
        }
        for rule in &pending {
            debug!(action = %rule.action, new = %rule.new_verb, queued = %rule.queued_verb, "added queue rule");
        }
        self.rules.extend(pending);
        Ok(())
    }

    /// Builder-style [`QueuePolicy::add_rule`].
    pub fn with_rule<N, Q>(
        mut self,
        action: RuleAction,
        new_verbs: &[N],
        queued_verbs: &[Q],
    ) -> Result<Self, QueueError>
    where
        N: AsRef<str>,
        Q: AsRef<str>,
    {
        self.add_rule(action, new_verbs, queued_verbs)?;
        Ok(self)
    }

    fn patterns<S: AsRef<str>>(&self, verbs: &[S]) -> Result<Vec<VerbPattern>, QueueError> {
        verbs
            .iter()
            .map(|verb| {
                let pattern = VerbPattern::parse(verb.as_ref());
                match &pattern {
                    VerbPattern::Verb(name) if !self.priorities.contains_key(name) => {
                        Err(QueueError::UnknownRuleVerb(verb.as_ref().to_string()))
                    }
                    _ => Ok(pattern),
                }
            })
            .collect()
    }

    /// Ok(false) means an identical wildcard rule already exists.
    fn check_rule(&self, candidate: &Rule, pending: &[Rule]) -> Result<bool, QueueError> {
        for existing in self.rules.iter().chain(pending) {
            if !existing.overlaps(candidate) {
                continue;
            }
            if existing.same_key(candidate) {
                if existing.action != candidate.action {
                    return Err(conflict(existing, candidate));
                }
                if candidate.new_verb.is_exact() && candidate.queued_verb.is_exact() {
                    return Err(QueueError::DuplicateRule {
                        action: candidate.action,
                        new_verb: candidate.new_verb.to_string(),
                        queued_verb: candidate.queued_verb.to_string(),
                    });
                }
                return Ok(false);
            }
            if existing.action != candidate.action
                && existing.specificity().0 == candidate.specificity().0
            {
                return Err(conflict(existing, candidate));
            }
        }
        Ok(true)
    }

    /// The action for an incoming `new_verb` colliding with `queued_verb`, if any.
    ///
    /// The most specific matching rule wins; an exact incoming verb beats an
    /// exact queued verb.
    pub fn rule(&self, new_verb: &str, queued_verb: &str) -> Option<RuleAction> {
        let mut best: Option<&Rule> = None;
        for rule in self.rules.iter().filter(|r| r.matches(new_verb, queued_verb)) {
            if best.is_none_or(|b| rule.specificity() > b.specificity()) {
                best = Some(rule);
            }
        }
        best.map(|rule| rule.action)
    }
}

fn conflict(existing: &Rule, candidate: &Rule) -> QueueError {
    QueueError::ConflictingRule {
        action: candidate.action,
        existing: existing.action,
        new_verb: candidate.new_verb.to_string(),
        queued_verb: candidate.queued_verb.to_string(),
    }
}

/// Queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Commands waiting to run
    pub queued: usize,
    /// Commands accepted by `add_cmd`
    pub submitted: u64,
    /// Commands promoted to running
    pub started: u64,
    /// Incoming commands cancelled by a rule
    pub rejected: u64,
    /// Queued commands cancelled by a rule or an immediate command
    pub cancelled_on_queue: u64,
    /// Calls made to the kill function
    pub kill_requests: u64,
}

/// Called to ask the running command (first argument) to finish early; the
/// second argument is the command that caused the request.
pub type KillFn = Arc<dyn Fn(&Command, &Command) + Send + Sync>;

type RunFn = Box<dyn FnOnce(&Command) + Send>;

struct QueuedCommand {
    cmd: Command,
    priority: Priority,
    run_fn: Option<RunFn>,
}

struct QueueState {
    queue: VecDeque<QueuedCommand>,
    running: Option<Command>,
    /// Commands that have already asked the running command to die
    killers: Vec<Command>,
    enabled: bool,
    stats: QueueStats,
}

struct QueueShared {
    policy: QueuePolicy,
    kill_fn: KillFn,
    state: Mutex<QueueState>,
    tick_scheduled: AtomicBool,
}

/// Priority command queue. Clones share the same queue.
#[derive(Clone)]
pub struct CommandQueue {
    shared: Arc<QueueShared>,
}

enum Step {
    Idle,
    Start(Command, Option<RunFn>),
    Kill(Command, Command),
    CancelNext(Command, String),
}

impl CommandQueue {
    /// Create a queue. `kill_fn` is how the queue asks a running command to die.
    pub fn new<K>(policy: QueuePolicy, kill_fn: K) -> Self
    where
        K: Fn(&Command, &Command) + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(QueueShared {
                policy,
                kill_fn: Arc::new(kill_fn),
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    running: None,
                    killers: Vec::new(),
                    enabled: true,
                    stats: QueueStats::default(),
                }),
                tick_scheduled: AtomicBool::new(false),
            }),
        }
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.shared.policy
    }

    /// Queue `cmd`. `run_fn` is called once, right after the command is set
    /// Running.
    ///
    /// A command cancelled by a `CancelNew` rule is still `Ok`: rejection
    /// shows up as the command's own Cancelled state. Errors leave the
    /// command untouched.
    pub fn add_cmd<F>(&self, cmd: Command, run_fn: F) -> Result<(), QueueError>
    where
        F: FnOnce(&Command) + Send + 'static,
    {
        if cmd.is_done() {
            return Err(QueueError::CommandDone(cmd.cmd_str().to_string()));
        }
        let priority = self
            .shared
            .policy
            .priority_of(cmd.verb())
            .ok_or_else(|| QueueError::UnknownVerb(cmd.verb().to_string()))?;
        debug!(cmd = %cmd, %priority, "queueing command");

        if priority == Priority::Immediate {
            self.add_immediate(cmd, Box::new(run_fn));
        } else {
            self.add_normal(cmd, priority, Box::new(run_fn));
        }
        self.shared.schedule_tick();
        Ok(())
    }

    fn add_immediate(&self, cmd: Command, run_fn: RunFn) {
        let (to_cancel, to_kill) = {
            let mut state = self.shared.state.lock();
            state.stats.submitted += 1;
            let to_cancel: Vec<Command> = state
                .queue
                .iter()
                .filter(|queued| !queued.cmd.is_done())
                .map(|queued| queued.cmd.clone())
                .collect();
            state.stats.cancelled_on_queue += to_cancel.len() as u64;
            let to_kill = state.kill_target(&cmd);
            insert_sorted(&mut state.queue, cmd.clone(), Priority::Immediate, run_fn);
            (to_cancel, to_kill)
        };

        let msg = format!(
            "Cancelled on queue by immediate priority command: {:?}",
            cmd.cmd_str()
        );
        for queued in &to_cancel {
            cancel(queued, &msg);
        }
        if let Some(running) = to_kill {
            self.shared.request_kill(&running, &cmd);
        }
    }

    fn add_normal(&self, cmd: Command, priority: Priority, run_fn: RunFn) {
        let policy = &self.shared.policy;
        let verb = cmd.verb();

        let (to_cancel, to_kill) = {
            let mut state = self.shared.state.lock();
            state.stats.submitted += 1;

            // a CancelNew match anywhere rejects the incoming command outright
            let blocker = state
                .queue
                .iter()
                .map(|queued| (&queued.cmd, false))
                .chain(state.running.iter().map(|running| (running, true)))
                .filter(|(other, _)| !other.is_done())
                .find(|(other, _)| policy.rule(verb, other.verb()) == Some(RuleAction::CancelNew))
                .map(|(other, is_running)| (other.verb().to_string(), is_running));
            if let Some((blocker_verb, is_running)) = blocker {
                state.stats.rejected += 1;
                drop(state);
                let msg = if is_running {
                    format!("Cancelled by currently executing command: {blocker_verb}")
                } else {
                    format!("Cancelled by a preceding command in the queue: {blocker_verb}")
                };
                cancel(&cmd, &msg);
                return;
            }

            let to_cancel: Vec<Command> = state
                .queue
                .iter()
                .filter(|queued| !queued.cmd.is_done())
                .filter(|queued| {
                    matches!(
                        policy.rule(verb, queued.cmd.verb()),
                        Some(RuleAction::CancelQueued | RuleAction::KillRunning)
                    )
                })
                .map(|queued| queued.cmd.clone())
                .collect();
            state.stats.cancelled_on_queue += to_cancel.len() as u64;

            let kills_running = state.running.as_ref().is_some_and(|running| {
                policy.rule(verb, running.verb()) == Some(RuleAction::KillRunning)
            });
            let to_kill = if kills_running {
                state.kill_target(&cmd)
            } else {
                None
            };
            insert_sorted(&mut state.queue, cmd.clone(), priority, run_fn);
            (to_cancel, to_kill)
        };

        let msg = format!("Cancelled by a new command added to the queue: {verb}");
        for queued in &to_cancel {
            cancel(queued, &msg);
        }
        if let Some(running) = to_kill {
            self.shared.request_kill(&running, &cmd);
        }
    }

    /// Fail every queued command and the running one with `reason`.
    ///
    /// Scheduling is suspended while the queue is drained.
    pub fn kill_all(&self, reason: &str) {
        let (queued, running) = {
            let mut state = self.shared.state.lock();
            state.enabled = false;
            let queued: Vec<Command> = state.queue.drain(..).map(|queued| queued.cmd).collect();
            (queued, state.running.clone())
        };
        debug!(queued = queued.len(), reason, "killing all queued commands");

        for cmd in queued.iter().chain(running.iter()) {
            if cmd.is_done() {
                continue;
            }
            if let Err(err) = cmd.set_state(CommandState::Failed, reason) {
                error!(cmd = %cmd, error = %err, "failed to kill command");
            }
        }

        self.shared.state.lock().enabled = true;
        self.shared.schedule_tick();
    }

    /// Number of queued (not yet running) commands that are not done.
    pub fn len(&self) -> usize {
        self.shared
            .state
            .lock()
            .queue
            .iter()
            .filter(|queued| !queued.cmd.is_done())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The running command, if it has not finished.
    pub fn running(&self) -> Option<Command> {
        self.shared
            .state
            .lock()
            .running
            .clone()
            .filter(|cmd| !cmd.is_done())
    }

    /// Queued commands in the order they will run.
    pub fn queued(&self) -> Vec<Command> {
        self.shared
            .state
            .lock()
            .queue
            .iter()
            .filter(|queued| !queued.cmd.is_done())
            .map(|queued| queued.cmd.clone())
            .collect()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.shared.state.lock();
        QueueStats {
            queued: state
                .queue
                .iter()
                .filter(|queued| !queued.cmd.is_done())
                .count(),
            ..state.stats.clone()
        }
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("CommandQueue")
            .field("queued", &state.queue.len())
            .field("running", &state.running)
            .field("enabled", &state.enabled)
            .finish()
    }
}

impl QueueState {
    /// The running command, if `killer` has not yet asked for it to be killed.
    fn kill_target(&mut self, killer: &Command) -> Option<Command> {
        let running = self.running.clone().filter(|cmd| !cmd.is_done())?;
        if self.killers.iter().any(|other| other.ptr_eq(killer)) {
            return None;
        }
        self.killers.push(killer.clone());
        self.stats.kill_requests += 1;
        Some(running)
    }
}

impl QueueShared {
    fn schedule_tick(self: &Arc<Self>) {
        if self.tick_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.tick_scheduled.store(false, Ordering::SeqCst);
            warn!("no async runtime; command queue not evaluated");
            return;
        };
        let shared = self.clone();
        runtime.spawn(async move {
            shared.run_queue();
        });
    }

    fn run_queue(self: &Arc<Self>) {
        self.tick_scheduled.store(false, Ordering::SeqCst);

        let step = {
            let mut state = self.state.lock();
            if !state.enabled {
                return;
            }
            state.queue.retain(|queued| !queued.cmd.is_done());
            self.next_step(&mut state)
        };

        match step {
            Step::Idle => {}
            Step::Start(cmd, run_fn) => self.start(cmd, run_fn),
            Step::Kill(running, next) => self.request_kill(&running, &next),
            Step::CancelNext(next, msg) => {
                cancel(&next, &msg);
                self.schedule_tick();
            }
        }
    }

    fn next_step(&self, state: &mut QueueState) -> Step {
        if state.queue.is_empty() {
            return Step::Idle;
        }
        let Some(running) = state.running.clone().filter(|cmd| !cmd.is_done()) else {
            let Some(mut queued) = state.queue.pop_front() else {
                return Step::Idle;
            };
            state.running = Some(queued.cmd.clone());
            state.killers.clear();
            state.stats.started += 1;
            let run_fn = queued.run_fn.take();
            return Step::Start(queued.cmd, run_fn);
        };
        if running.state() == CommandState::Cancelling {
            return Step::Idle;
        }
        let Some(next) = state.queue.front().map(|queued| queued.cmd.clone()) else {
            return Step::Idle;
        };

        match self.policy.rule(next.verb(), running.verb()) {
            Some(RuleAction::KillRunning) => {
                match state.kill_target(&next) {
                    Some(running) => Step::Kill(running, next),
                    None => Step::Idle,
                }
            }
            Some(RuleAction::CancelNew) => {
                state.stats.rejected += 1;
                let msg = format!(
                    "{} cancelled by currently executing command: {}",
                    next.verb(),
                    running.verb()
                );
                Step::CancelNext(next, msg)
            }
            _ => Step::Idle,
        }
    }

    fn start(self: &Arc<Self>, cmd: Command, run_fn: Option<RunFn>) {
        debug!(cmd = %cmd, "starting queued command");
        if let Err(err) = cmd.set_state(CommandState::Running, "") {
            error!(cmd = %cmd, error = %err, "could not start queued command");
            self.schedule_tick();
            return;
        }

        let weak: Weak<QueueShared> = Arc::downgrade(self);
        cmd.add_callback(move |cmd: &Command| {
            if cmd.is_done() {
                if let Some(shared) = weak.upgrade() {
                    shared.schedule_tick();
                }
            }
        });

        if let Some(run_fn) = run_fn {
            run_fn(&cmd);
        }
    }

    fn request_kill(&self, running: &Command, killer: &Command) {
        debug!(running = %running, killer = %killer, "requesting kill of running command");
        (self.kill_fn)(running, killer);
    }
}

fn insert_sorted(
    queue: &mut VecDeque<QueuedCommand>,
    cmd: Command,
    priority: Priority,
    run_fn: RunFn,
) {
    let index = queue.partition_point(|queued| queued.priority >= priority);
    queue.insert(
        index,
        QueuedCommand {
            cmd,
            priority,
            run_fn: Some(run_fn),
        },
    );
}

fn cancel(cmd: &Command, msg: &str) {
    if cmd.is_done() {
        return;
    }
    debug!(cmd = %cmd, reason = msg, "cancelling command");
    if let Err(err) = cmd.set_state(CommandState::Cancelled, msg) {
        error!(cmd = %cmd, error = %err, "failed to cancel command");
    }
}
