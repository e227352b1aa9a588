//! Workflow definition types.
//!
//! A `WorkflowSpec` is the resolved form of a workflow definition: YAML and
//! JSON documents deserialize straight into it. Task kinds are a sum type
//! resolved once at deserialization time, so the engine never dispatches on
//! a string discriminator at runtime.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Action used by tasks that name neither an action nor a workflow.
pub const DEFAULT_ACTION: &str = "std.noop";

// ---------------------------------------------------------------------------
// Stored definitions
// ---------------------------------------------------------------------------

/// A registered workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    pub namespace: String,
    pub spec: WorkflowSpec,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A named, stored environment that executions can reference at start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub variables: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Workflow spec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared input parameters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input: Vec<InputParam>,
    /// Initial workflow variables (may contain expressions over the input).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub vars: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(
        default,
        alias = "output-on-error",
        skip_serializing_if = "Option::is_none"
    )]
    pub output_on_error: Option<Value>,
    /// Policies applied to every task that does not set its own.
    #[serde(
        default,
        alias = "task-defaults",
        skip_serializing_if = "Option::is_none"
    )]
    pub task_defaults: Option<PolicySpec>,
    pub tasks: Vec<TaskSpec>,
}

impl WorkflowSpec {
    pub fn task(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Names of every task that has a transition into `name`.
    pub fn inbound_task_names(&self, name: &str) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| t.transition_targets().any(|target| target == name))
            .map(|t| t.name.as_str())
            .collect()
    }

    pub fn declares_input(&self, name: &str) -> bool {
        self.input.iter().any(|p| p.name == name)
    }

    /// Policies in force for `task`: its own, then the workflow defaults.
    pub fn effective_policies(&self, task: &TaskSpec) -> PolicySpec {
        match &self.task_defaults {
            Some(defaults) => task.policies.clone().or(defaults),
            None => task.policies.clone(),
        }
    }
}

/// A declared workflow input: a bare name (required) or `{name: default}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawInputParam", into = "RawInputParam")]
pub struct InputParam {
    pub name: String,
    pub default: Option<Value>,
}

impl InputParam {
    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawInputParam {
    Required(String),
    WithDefault(Map<String, Value>),
}

impl TryFrom<RawInputParam> for InputParam {
    type Error = String;

    fn try_from(raw: RawInputParam) -> Result<Self, Self::Error> {
        match raw {
            RawInputParam::Required(name) => Ok(Self { name, default: None }),
            RawInputParam::WithDefault(map) => {
                if map.len() != 1 {
                    return Err(format!(
                        "input parameter with default must have exactly one key, got {}",
                        map.len()
                    ));
                }
                let (name, default) = map.into_iter().next().ok_or("empty input parameter")?;
                Ok(Self {
                    name,
                    default: Some(default),
                })
            }
        }
    }
}

impl From<InputParam> for RawInputParam {
    fn from(param: InputParam) -> Self {
        match param.default {
            None => RawInputParam::Required(param.name),
            Some(default) => {
                let mut map = Map::new();
                map.insert(param.name, default);
                RawInputParam::WithDefault(map)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Task spec
// ---------------------------------------------------------------------------

/// A single task in a direct workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTaskSpec", into = "RawTaskSpec")]
pub struct TaskSpec {
    pub name: String,
    pub description: Option<String>,
    pub kind: TaskKind,
    pub publish: Option<PublishSpec>,
    pub publish_on_error: Option<PublishSpec>,
    pub on_success: Vec<Transition>,
    pub on_error: Vec<Transition>,
    pub on_complete: Vec<Transition>,
    pub on_skip: Vec<Transition>,
    pub join: Option<JoinSpec>,
    pub target: Option<String>,
    pub policies: PolicySpec,
    pub safe_rerun: bool,
    pub keep_result: bool,
}

impl TaskSpec {
    pub fn is_with_items(&self) -> bool {
        matches!(self.kind, TaskKind::WithItems(_))
    }

    pub fn is_join(&self) -> bool {
        self.join.is_some()
    }

    /// The invocation performed per run (or per item for with-items tasks).
    pub fn invocation(&self) -> Invocation<'_> {
        match &self.kind {
            TaskKind::Action(action) => Invocation::Action(action),
            TaskKind::Workflow(workflow) => Invocation::Workflow(workflow),
            TaskKind::WithItems(with_items) => with_items.invocation.as_invocation(),
        }
    }

    pub fn transition_targets(&self) -> impl Iterator<Item = &str> {
        self.on_success
            .iter()
            .chain(&self.on_error)
            .chain(&self.on_complete)
            .chain(&self.on_skip)
            .filter(|t| t.command().is_none())
            .map(|t| t.task.as_str())
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Behaviour wrapped around a task run. Unset fields fall back to the
/// workflow's `task-defaults`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySpec {
    /// Seconds to hold the task in RUNNING_DELAYED before scheduling work.
    #[serde(default, alias = "wait-before", skip_serializing_if = "Option::is_none")]
    pub wait_before: Option<u64>,
    /// Seconds to hold a finished task before it is completed.
    #[serde(default, alias = "wait-after", skip_serializing_if = "Option::is_none")]
    pub wait_after: Option<u64>,
    /// Seconds after start at which an unfinished task is failed.
    #[serde(default, alias = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// `true` or an expression; pauses the workflow before the task starts.
    #[serde(default, alias = "pause-before", skip_serializing_if = "Option::is_none")]
    pub pause_before: Option<Value>,
    /// `true` or an expression over the task result; turns SUCCESS into ERROR.
    #[serde(default, alias = "fail-on", skip_serializing_if = "Option::is_none")]
    pub fail_on: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
}

impl PolicySpec {
    /// Fill every unset field from `defaults`.
    pub fn or(self, defaults: &PolicySpec) -> PolicySpec {
        PolicySpec {
            wait_before: self.wait_before.or(defaults.wait_before),
            wait_after: self.wait_after.or(defaults.wait_after),
            timeout_secs: self.timeout_secs.or(defaults.timeout_secs),
            pause_before: self.pause_before.or_else(|| defaults.pause_before.clone()),
            fail_on: self.fail_on.or_else(|| defaults.fail_on.clone()),
            retry: self.retry.or_else(|| defaults.retry.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == PolicySpec::default()
    }
}

/// Re-run a finished task up to `count` more times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySpec {
    pub count: u32,
    /// Seconds between attempts.
    #[serde(default)]
    pub delay: u64,
    /// Stop retrying a failed task once this condition holds.
    #[serde(default, alias = "break-on", skip_serializing_if = "Option::is_none")]
    pub break_on: Option<String>,
    /// Keep retrying, even on success, while this condition holds.
    #[serde(default, alias = "continue-on", skip_serializing_if = "Option::is_none")]
    pub continue_on: Option<String>,
}

/// What a task runs.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    Action(ActionInvocation),
    Workflow(WorkflowInvocation),
    WithItems(WithItems),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionInvocation {
    pub action: String,
    pub input: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowInvocation {
    pub workflow: String,
    pub input: Map<String, Value>,
}

/// Borrowed view of the invocation a task performs.
#[derive(Debug, Clone, Copy)]
pub enum Invocation<'a> {
    Action(&'a ActionInvocation),
    Workflow(&'a WorkflowInvocation),
}

impl Invocation<'_> {
    pub fn input(&self) -> &Map<String, Value> {
        match self {
            Invocation::Action(a) => &a.input,
            Invocation::Workflow(w) => &w.input,
        }
    }
}

/// The body of a with-items task.
#[derive(Debug, Clone, PartialEq)]
pub struct WithItems {
    pub items: Vec<ItemsClause>,
    pub concurrency: Option<usize>,
    pub invocation: ItemInvocation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemInvocation {
    Action(ActionInvocation),
    Workflow(WorkflowInvocation),
}

impl ItemInvocation {
    fn as_invocation(&self) -> Invocation<'_> {
        match self {
            ItemInvocation::Action(a) => Invocation::Action(a),
            ItemInvocation::Workflow(w) => Invocation::Workflow(w),
        }
    }
}

/// One `var in <expression>` clause of a with-items task.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemsClause {
    pub var: String,
    /// Either a literal list or an expression string evaluating to one.
    pub expression: Value,
}

/// Variables a task publishes when it finishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "RawPublish")]
pub struct PublishSpec {
    /// Visible only to this task's descendants.
    pub branch: Map<String, Value>,
    /// Merged into the workflow execution context.
    pub global: Map<String, Value>,
}

#[derive(Serialize)]
struct RawPublish {
    branch: Map<String, Value>,
    global: Map<String, Value>,
}

impl From<Map<String, Value>> for PublishSpec {
    fn from(map: Map<String, Value>) -> Self {
        let structured = !map.is_empty()
            && map
                .iter()
                .all(|(k, v)| (k == "branch" || k == "global") && v.is_object());

        if !structured {
            return Self {
                branch: map,
                global: Map::new(),
            };
        }

        let mut spec = Self::default();
        for (key, value) in map {
            if let Value::Object(vars) = value {
                if key == "branch" {
                    spec.branch = vars;
                } else {
                    spec.global = vars;
                }
            }
        }
        spec
    }
}

impl From<PublishSpec> for RawPublish {
    fn from(spec: PublishSpec) -> Self {
        Self {
            branch: spec.branch,
            global: spec.global,
        }
    }
}

/// An outgoing edge to another task, optionally guarded by a condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTransition", into = "RawTransition")]
pub struct Transition {
    pub task: String,
    pub when: Option<String>,
}

impl Transition {
    pub fn to(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            when: None,
        }
    }

    /// The engine command this transition names instead of a task.
    pub fn command(&self) -> Option<EngineCommand> {
        EngineCommand::parse(&self.task)
    }
}

/// Reserved transition targets that act on the workflow itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineCommand {
    /// Fail the workflow.
    Fail,
    /// Complete the workflow successfully.
    Succeed,
    /// Pause the workflow.
    Pause,
    /// Do nothing.
    Noop,
}

impl EngineCommand {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "fail" => Some(EngineCommand::Fail),
            "succeed" => Some(EngineCommand::Succeed),
            "pause" => Some(EngineCommand::Pause),
            "noop" => Some(EngineCommand::Noop),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawTransition {
    Name(String),
    Conditional(BTreeMap<String, String>),
}

impl TryFrom<RawTransition> for Transition {
    type Error = String;

    fn try_from(raw: RawTransition) -> Result<Self, Self::Error> {
        match raw {
            RawTransition::Name(task) => Ok(Self::to(task)),
            RawTransition::Conditional(map) => {
                if map.len() != 1 {
                    return Err(format!(
                        "conditional transition must have exactly one task, got {}",
                        map.len()
                    ));
                }
                let (task, when) = map.into_iter().next().ok_or("empty transition")?;
                Ok(Self {
                    task,
                    when: Some(when),
                })
            }
        }
    }
}

impl From<Transition> for RawTransition {
    fn from(t: Transition) -> Self {
        match t.when {
            None => RawTransition::Name(t.task),
            Some(when) => RawTransition::Conditional(BTreeMap::from([(t.task, when)])),
        }
    }
}

/// Join mode for a task with several inbound transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawJoin", into = "RawJoin")]
pub enum JoinSpec {
    /// Every inbound task must trigger the join.
    All,
    /// At least this many inbound tasks must trigger the join.
    Count(usize),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawJoin {
    Mode(String),
    Count(usize),
}

impl TryFrom<RawJoin> for JoinSpec {
    type Error = String;

    fn try_from(raw: RawJoin) -> Result<Self, Self::Error> {
        match raw {
            RawJoin::Mode(mode) => match mode.as_str() {
                "all" => Ok(JoinSpec::All),
                "one" => Ok(JoinSpec::Count(1)),
                other => Err(format!("invalid join mode: '{other}'")),
            },
            RawJoin::Count(0) => Err("join count must be positive".to_string()),
            RawJoin::Count(n) => Ok(JoinSpec::Count(n)),
        }
    }
}

impl From<JoinSpec> for RawJoin {
    fn from(join: JoinSpec) -> Self {
        match join {
            JoinSpec::All => RawJoin::Mode("all".to_string()),
            JoinSpec::Count(n) => RawJoin::Count(n),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw (document) form of a task
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct RawTaskSpec {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    workflow: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    input: Map<String, Value>,
    #[serde(default, alias = "with-items", skip_serializing_if = "Option::is_none")]
    with_items: Option<RawWithItems>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    publish: Option<PublishSpec>,
    #[serde(
        default,
        alias = "publish-on-error",
        skip_serializing_if = "Option::is_none"
    )]
    publish_on_error: Option<PublishSpec>,
    #[serde(default, alias = "on-success", skip_serializing_if = "Option::is_none")]
    on_success: Option<OneOrMany<Transition>>,
    #[serde(default, alias = "on-error", skip_serializing_if = "Option::is_none")]
    on_error: Option<OneOrMany<Transition>>,
    #[serde(default, alias = "on-complete", skip_serializing_if = "Option::is_none")]
    on_complete: Option<OneOrMany<Transition>>,
    #[serde(default, alias = "on-skip", skip_serializing_if = "Option::is_none")]
    on_skip: Option<OneOrMany<Transition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    join: Option<JoinSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(flatten)]
    policies: PolicySpec,
    #[serde(default, alias = "safe-rerun")]
    safe_rerun: bool,
    #[serde(default = "default_keep_result", alias = "keep-result")]
    keep_result: bool,
}

fn default_keep_result() -> bool {
    true
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

fn many<T>(items: Vec<T>) -> Option<OneOrMany<T>> {
    (!items.is_empty()).then_some(OneOrMany::Many(items))
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawWithItems {
    Clause(String),
    Clauses(Vec<String>),
    Map(Map<String, Value>),
}

impl RawWithItems {
    fn into_clauses(self) -> Result<Vec<ItemsClause>, String> {
        match self {
            RawWithItems::Clause(clause) => Ok(vec![parse_items_clause(&clause)?]),
            RawWithItems::Clauses(clauses) => clauses.iter().map(|c| parse_items_clause(c)).collect(),
            RawWithItems::Map(map) => Ok(map
                .into_iter()
                .map(|(var, expression)| ItemsClause { var, expression })
                .collect()),
        }
    }
}

/// Parse `var in <expression>`; a JSON literal on the right is kept as a value.
fn parse_items_clause(clause: &str) -> Result<ItemsClause, String> {
    let (var, rest) = clause
        .split_once(" in ")
        .ok_or_else(|| format!("invalid with_items clause: '{clause}'"))?;

    let var = var.trim();
    if var.is_empty() {
        return Err(format!("with_items clause has no variable: '{clause}'"));
    }

    let rest = rest.trim();
    let expression = serde_json::from_str::<Value>(rest)
        .ok()
        .filter(Value::is_array)
        .unwrap_or_else(|| Value::String(rest.to_string()));

    Ok(ItemsClause {
        var: var.to_string(),
        expression,
    })
}

impl TryFrom<RawTaskSpec> for TaskSpec {
    type Error = String;

    fn try_from(raw: RawTaskSpec) -> Result<Self, Self::Error> {
        let invocation = match (raw.action, raw.workflow) {
            (Some(_), Some(_)) => {
                return Err(format!(
                    "task '{}' must define either an action or a workflow, not both",
                    raw.name
                ));
            }
            (None, Some(workflow)) => ItemInvocation::Workflow(WorkflowInvocation {
                workflow,
                input: raw.input,
            }),
            (action, None) => ItemInvocation::Action(ActionInvocation {
                action: action.unwrap_or_else(|| DEFAULT_ACTION.to_string()),
                input: raw.input,
            }),
        };

        let kind = match raw.with_items {
            Some(items) => TaskKind::WithItems(WithItems {
                items: items.into_clauses()?,
                concurrency: raw.concurrency,
                invocation,
            }),
            None => match invocation {
                ItemInvocation::Action(a) => TaskKind::Action(a),
                ItemInvocation::Workflow(w) => TaskKind::Workflow(w),
            },
        };

        Ok(TaskSpec {
            name: raw.name,
            description: raw.description,
            kind,
            publish: raw.publish,
            publish_on_error: raw.publish_on_error,
            on_success: raw.on_success.map(OneOrMany::into_vec).unwrap_or_default(),
            on_error: raw.on_error.map(OneOrMany::into_vec).unwrap_or_default(),
            on_complete: raw.on_complete.map(OneOrMany::into_vec).unwrap_or_default(),
            on_skip: raw.on_skip.map(OneOrMany::into_vec).unwrap_or_default(),
            join: raw.join,
            target: raw.target,
            policies: raw.policies,
            safe_rerun: raw.safe_rerun,
            keep_result: raw.keep_result,
        })
    }
}

impl From<TaskSpec> for RawTaskSpec {
    fn from(spec: TaskSpec) -> Self {
        let (invocation, with_items, concurrency) = match spec.kind {
            TaskKind::Action(a) => (ItemInvocation::Action(a), None, None),
            TaskKind::Workflow(w) => (ItemInvocation::Workflow(w), None, None),
            TaskKind::WithItems(w) => {
                let map = w
                    .items
                    .into_iter()
                    .map(|clause| (clause.var, clause.expression))
                    .collect();
                (w.invocation, Some(RawWithItems::Map(map)), w.concurrency)
            }
        };

        let (action, workflow, input) = match invocation {
            ItemInvocation::Action(a) => (Some(a.action), None, a.input),
            ItemInvocation::Workflow(w) => (None, Some(w.workflow), w.input),
        };

        RawTaskSpec {
            name: spec.name,
            description: spec.description,
            action,
            workflow,
            input,
            with_items,
            concurrency,
            publish: spec.publish,
            publish_on_error: spec.publish_on_error,
            on_success: many(spec.on_success),
            on_error: many(spec.on_error),
            on_complete: many(spec.on_complete),
            on_skip: many(spec.on_skip),
            join: spec.join,
            target: spec.target,
            policies: spec.policies,
            safe_rerun: spec.safe_rerun,
            keep_result: spec.keep_result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const YAML: &str = r#"
name: fetch-all
input:
  - urls
  - retries: 3
vars:
  seen: 0
output:
  pages: "<% pages %>"
tasks:
  - name: fetch
    action: std.echo
    with-items: url in <% urls %>
    concurrency: 2
    input:
      output: "<% url %>"
    publish:
      pages: "<% task.result %>"
    on-success:
      - report
      - alert: "<% pages|length == 0 %>"
    on-error: cleanup
  - name: report
    workflow: summarize
    input:
      pages: "<% pages %>"
    join: all
  - name: alert
    publish:
      global:
        alerted: true
      branch:
        level: high
  - name: cleanup
    join: one
"#;

    fn spec() -> WorkflowSpec {
        serde_yaml_ng::from_str(YAML).unwrap()
    }

    #[test]
    fn test_input_params_required_and_default() {
        let spec = spec();
        assert_eq!(spec.input.len(), 2);
        assert!(spec.input[0].is_required());
        assert_eq!(spec.input[1].name, "retries");
        assert_eq!(spec.input[1].default, Some(json!(3)));
    }

    #[test]
    fn test_with_items_clause_resolves_to_tagged_kind() {
        let spec = spec();
        let fetch = spec.task("fetch").unwrap();
        match &fetch.kind {
            TaskKind::WithItems(w) => {
                assert_eq!(w.items.len(), 1);
                assert_eq!(w.items[0].var, "url");
                assert_eq!(w.items[0].expression, json!("<% urls %>"));
                assert_eq!(w.concurrency, Some(2));
                assert!(matches!(&w.invocation, ItemInvocation::Action(a) if a.action == "std.echo"));
            }
            other => panic!("expected with-items kind, got {other:?}"),
        }
    }

    #[test]
    fn test_transitions_accept_single_name_and_conditions() {
        let spec = spec();
        let fetch = spec.task("fetch").unwrap();
        assert_eq!(fetch.on_success.len(), 2);
        assert_eq!(fetch.on_success[0], Transition::to("report"));
        assert_eq!(fetch.on_success[1].task, "alert");
        assert!(fetch.on_success[1].when.is_some());
        assert_eq!(fetch.on_error, vec![Transition::to("cleanup")]);
    }

    #[test]
    fn test_task_without_action_defaults_to_noop() {
        let spec = spec();
        match &spec.task("alert").unwrap().kind {
            TaskKind::Action(a) => assert_eq!(a.action, DEFAULT_ACTION),
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_publish_plain_map_is_branch_shorthand() {
        let spec = spec();
        let publish = spec.task("fetch").unwrap().publish.clone().unwrap();
        assert!(publish.branch.contains_key("pages"));
        assert!(publish.global.is_empty());

        let structured = spec.task("alert").unwrap().publish.clone().unwrap();
        assert_eq!(structured.global.get("alerted"), Some(&json!(true)));
        assert_eq!(structured.branch.get("level"), Some(&json!("high")));
    }

    #[test]
    fn test_join_modes() {
        let spec = spec();
        assert_eq!(spec.task("report").unwrap().join, Some(JoinSpec::All));
        assert_eq!(spec.task("cleanup").unwrap().join, Some(JoinSpec::Count(1)));
        assert!(serde_json::from_value::<JoinSpec>(json!("some")).is_err());
        assert!(serde_json::from_value::<JoinSpec>(json!(0)).is_err());
    }

    #[test]
    fn test_inbound_task_names() {
        let spec = spec();
        assert_eq!(spec.inbound_task_names("report"), vec!["fetch"]);
        assert!(spec.inbound_task_names("fetch").is_empty());
    }

    #[test]
    fn test_action_and_workflow_together_is_rejected() {
        let result: Result<TaskSpec, _> = serde_json::from_value(json!({
            "name": "bad",
            "action": "std.noop",
            "workflow": "other",
        }));
        assert!(result.unwrap_err().to_string().contains("not both"));
    }

    #[test]
    fn test_spec_survives_json_storage() {
        let original = spec();
        let stored = serde_json::to_value(&original).unwrap();
        let restored: WorkflowSpec = serde_json::from_value(stored).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn test_items_clause_with_literal_list() {
        let clause = parse_items_clause("n in [1, 2, 3]").unwrap();
        assert_eq!(clause.var, "n");
        assert_eq!(clause.expression, json!([1, 2, 3]));
        assert!(parse_items_clause("no clause here").is_err());
    }

    #[test]
    fn test_policies_parse_and_fall_back_to_task_defaults() {
        let spec: WorkflowSpec = serde_yaml_ng::from_str(
            r#"
name: policies
task-defaults:
  timeout: 30
  retry:
    count: 2
    delay: 5
tasks:
  - name: fetch
    action: std.http
    wait-before: 1
    pause-before: true
    fail-on: "<% task.result.status != 200 %>"
    retry:
      count: 5
      break-on: "<% task.result.fatal %>"
  - name: store
    timeout: 10
"#,
        )
        .unwrap();

        let fetch = spec.effective_policies(spec.task("fetch").unwrap());
        assert_eq!(fetch.wait_before, Some(1));
        assert_eq!(fetch.timeout_secs, Some(30));
        assert_eq!(fetch.pause_before, Some(json!(true)));
        let retry = fetch.retry.unwrap();
        assert_eq!(retry.count, 5);
        assert_eq!(retry.delay, 0);
        assert!(retry.break_on.is_some());

        let store = spec.effective_policies(spec.task("store").unwrap());
        assert_eq!(store.timeout_secs, Some(10));
        assert_eq!(store.retry.unwrap().delay, 5);
        assert!(spec.task("store").unwrap().policies.retry.is_none());
    }

    #[test]
    fn test_engine_commands_are_not_task_targets() {
        let task: TaskSpec = serde_json::from_value(json!({
            "name": "check",
            "on-success": ["next", "succeed"],
            "on-error": "fail",
        }))
        .unwrap();
        assert_eq!(task.on_error[0].command(), Some(EngineCommand::Fail));
        assert_eq!(task.on_success[0].command(), None);
        assert_eq!(task.transition_targets().collect::<Vec<_>>(), vec!["next"]);
        assert_eq!(EngineCommand::parse("noop"), Some(EngineCommand::Noop));
    }
}
