//! Prompt rendering for implementation attempts, preflight and code review.
//!
//! Templates carry `<!-- section:KEY required|droppable -->` markers. After
//! rendering, droppable sections are removed whole until the prompt fits the
//! context budget; required sections are never cut.

pub mod result;

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::task::{Task, TaskFile};
use crate::io::config::PromptConfig;
use crate::io::memory::{MemoryExcerpt, MemoryStore};

const IMPLEMENT_TEMPLATE: &str = include_str!("templates/implement.md");
const DISCOVERY_TEMPLATE: &str = include_str!("templates/discovery.md");
const REQUIREMENTS_REVIEW_TEMPLATE: &str = include_str!("templates/requirements_review.md");
const CODE_REVIEW_TEMPLATE: &str = include_str!("templates/code_review.md");

/// Approximate characters per token used for all budget math.
pub const CHARS_PER_TOKEN: usize = 4;
const OUTLINE_MAX_TASKS: usize = 60;
/// Rendering overhead per memory excerpt ("From `x`:" plus blank lines).
const EXCERPT_OVERHEAD_CHARS: usize = 16;

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section regex")
});

/// Decomposition allowance for the task being prompted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecomposeHint {
    pub max_depth: u32,
    pub remaining: u32,
    pub max_children: usize,
}

/// A plan file produced by preflight.
#[derive(Debug, Clone, Copy)]
pub struct PlanRef<'a> {
    pub path: &'a str,
    pub content: &'a str,
}

/// Everything needed to render one implementation prompt.
#[derive(Debug, Clone, Copy)]
pub struct PromptRequest<'a> {
    pub task: &'a Task,
    pub file: &'a TaskFile,
    pub config: &'a PromptConfig,
    pub retry_context: Option<&'a str>,
    pub plan: Option<PlanRef<'a>>,
    /// `None` when decomposition is disabled or exhausted for this task.
    pub decompose: Option<DecomposeHint>,
}

#[derive(Debug, Serialize)]
struct TaskContext<'a> {
    key: &'a str,
    text: &'a str,
    line: usize,
    phase: String,
}

impl<'a> TaskContext<'a> {
    fn from_task(task: &'a Task) -> Self {
        Self {
            key: task.key.as_str(),
            text: &task.text,
            line: task.line,
            phase: task.phase_label(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChildContext<'a> {
    text: &'a str,
    checked: bool,
}

fn engine() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.add_template("implement", IMPLEMENT_TEMPLATE)
        .context("load implement template")?;
    env.add_template("discovery", DISCOVERY_TEMPLATE)
        .context("load discovery template")?;
    env.add_template("requirements_review", REQUIREMENTS_REVIEW_TEMPLATE)
        .context("load requirements review template")?;
    env.add_template("code_review", CODE_REVIEW_TEMPLATE)
        .context("load code review template")?;
    Ok(env)
}

/// Build the implementation prompt, consulting `memory` within its time bound.
pub async fn build_prompt(
    request: &PromptRequest<'_>,
    memory: Option<&dyn MemoryStore>,
) -> Result<String> {
    let excerpts = match memory {
        Some(store) => recall_memory(store, request.task, request.config).await,
        None => Vec::new(),
    };
    render_implement(request, &excerpts)
}

/// Render the implementation prompt with already-recalled excerpts.
pub fn render_implement(request: &PromptRequest<'_>, excerpts: &[MemoryExcerpt]) -> Result<String> {
    let env = engine()?;
    let budget_chars = request.config.max_context_tokens * CHARS_PER_TOKEN;

    let without_memory = render_implement_with(&env, request, &[])?;
    let remaining = budget_chars.saturating_sub(without_memory.chars().count());
    let memory = select_excerpts(excerpts, request.config.max_excerpt_chars, remaining);

    let rendered = render_implement_with(&env, request, &memory)?;
    let mut sections = parse_sections(&rendered);
    apply_budget_to_sections(&mut sections, budget_chars);
    Ok(render_sections(&sections))
}

fn render_implement_with(
    env: &Environment<'static>,
    request: &PromptRequest<'_>,
    memory: &[MemoryExcerpt],
) -> Result<String> {
    let task = request.task;
    let children: Vec<ChildContext<'_>> = request
        .file
        .children(&task.key)
        .into_iter()
        .map(|child| ChildContext {
            text: &child.text,
            checked: child.checked,
        })
        .collect();
    let memory: Vec<_> = memory
        .iter()
        .map(|m| context! { source => m.source.as_str(), text => m.text.as_str() })
        .collect();
    let template = env.get_template("implement")?;
    let rendered = template.render(context! {
        file_path => request.file.path.display().to_string(),
        task => TaskContext::from_task(task),
        children => children,
        plan => request.plan.map(|p| context! { path => p.path, content => p.content.trim() }),
        retry => request.retry_context.map(str::trim).filter(|s| !s.is_empty()),
        decompose => request.decompose.map(|d| context! {
            max_depth => d.max_depth,
            remaining => d.remaining,
            max_children => d.max_children,
        }),
        memory => memory,
        outline => Some(outline(request.file, task)).filter(|s| !s.is_empty()),
    })?;
    Ok(rendered)
}

/// Discovery prompt for preflight.
pub fn render_discovery(
    task: &Task,
    file: &TaskFile,
    plan_path: &str,
    budget_tokens: usize,
) -> Result<String> {
    let env = engine()?;
    let rendered = env.get_template("discovery")?.render(context! {
        file_path => file.path.display().to_string(),
        task => TaskContext::from_task(task),
        plan_path => plan_path,
        outline => Some(outline(file, task)).filter(|s| !s.is_empty()),
    })?;
    let mut sections = parse_sections(&rendered);
    apply_budget_to_sections(&mut sections, budget_tokens * CHARS_PER_TOKEN);
    Ok(render_sections(&sections))
}

/// Requirements review prompt for preflight; `round` starts at 1.
pub fn render_requirements_review(
    task: &Task,
    plan_path: &str,
    plan: &str,
    round: u32,
) -> Result<String> {
    let env = engine()?;
    let rendered = env.get_template("requirements_review")?.render(context! {
        task => TaskContext::from_task(task),
        plan_path => plan_path,
        plan => plan.trim(),
        round => round,
    })?;
    Ok(render_sections(&parse_sections(&rendered)))
}

/// L2 code review prompt.
pub fn render_code_review(task_text: &str, diff: &str) -> Result<String> {
    let env = engine()?;
    let rendered = env.get_template("code_review")?.render(context! {
        task_text => task_text,
        diff => diff.trim_end(),
    })?;
    Ok(render_sections(&parse_sections(&rendered)))
}

async fn recall_memory(
    store: &dyn MemoryStore,
    task: &Task,
    config: &PromptConfig,
) -> Vec<MemoryExcerpt> {
    if config.memory_excerpts == 0 {
        return Vec::new();
    }
    let query = format!("{} {}", task.phase_label(), task.text);
    let limit = Duration::from_millis(config.memory_timeout_ms);
    match tokio::time::timeout(limit, store.recall(&query, config.memory_excerpts)).await {
        Ok(Ok(found)) => found,
        Ok(Err(err)) => {
            warn!(err = %err, "memory lookup failed, continuing without it");
            Vec::new()
        }
        Err(_) => {
            warn!(timeout_ms = config.memory_timeout_ms, "memory lookup timed out");
            Vec::new()
        }
    }
}

/// Truncate each excerpt, then drop the least relevant ones whole until the
/// block fits in `cap_chars`.
pub fn select_excerpts(
    excerpts: &[MemoryExcerpt],
    max_excerpt_chars: usize,
    cap_chars: usize,
) -> Vec<MemoryExcerpt> {
    let mut selected: Vec<MemoryExcerpt> = excerpts
        .iter()
        .map(|excerpt| MemoryExcerpt {
            text: truncate_excerpt(&excerpt.text, max_excerpt_chars),
            ..excerpt.clone()
        })
        .collect();
    selected.sort_by(|a, b| b.score.total_cmp(&a.score));

    let size = |items: &[MemoryExcerpt]| -> usize {
        items
            .iter()
            .map(|e| e.text.chars().count() + e.source.chars().count() + EXCERPT_OVERHEAD_CHARS)
            .sum()
    };
    while !selected.is_empty() && size(&selected) > cap_chars {
        if let Some(dropped) = selected.pop() {
            debug!(
                source = %dropped.source,
                score = dropped.score,
                "dropped memory excerpt for budget"
            );
        }
    }
    selected
}

fn truncate_excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{} [...]", text[..idx].trim_end()),
        None => text.to_string(),
    }
}

/// Compact view of the checklist around `current`, limited to its phase.
fn outline(file: &TaskFile, current: &Task) -> String {
    let mut lines = Vec::new();
    for task in file
        .tasks
        .iter()
        .filter(|t| t.phase_path == current.phase_path)
        .take(OUTLINE_MAX_TASKS)
    {
        let mark = if task.checked { "x" } else { " " };
        let indent = "  ".repeat(task.depth);
        let here = if task.key == current.key { "  <- current" } else { "" };
        lines.push(format!("{indent}- [{mark}] {}{here}", task.text));
    }
    if lines.len() <= 1 {
        return String::new();
    }
    lines.join("\n")
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let matches: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (i, caps) in matches.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = matches
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

/// Drop droppable sections whole, outline first, until the total fits.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget_chars: usize) {
    let total = |secs: &[ParsedSection]| -> usize {
        secs.iter().map(|s| s.content.chars().count()).sum()
    };
    for key in ["outline", "memory"] {
        if total(sections) <= budget_chars {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                chars = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }
    if total(sections) > budget_chars {
        warn!(
            chars = total(sections),
            budget_chars,
            "required prompt sections exceed context budget"
        );
    }
}

fn render_sections(sections: &[ParsedSection]) -> String {
    let mut out = sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    out.push('\n');
    out
}
