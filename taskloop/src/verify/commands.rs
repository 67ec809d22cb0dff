//! Build/test/lint command resolution.
//!
//! Each category is resolved independently, once per run, by probing the
//! project: explicit override → `package.json` script → language project file
//! → generic task-runner target.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::io::config::VerifyConfig;

static MAKE_TARGET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^([A-Za-z0-9_:-]+)\s*:([^=]|$)").expect("make target regex"));
static JUST_RECIPE_RE: LazyLock<Regex> =
    LazyLock::new(|| {
        Regex::new(r"(?m)^@?([A-Za-z0-9_-]+)[^:\n]*:([^=]|$)").expect("just recipe regex")
    });

const JS_EXTENSIONS: &[&str] = &["js", "jsx", "ts", "tsx", "mjs", "cjs", "vue", "svelte"];

/// Where a resolved command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    Override,
    PackageScript,
    ProjectFile,
    TaskRunner,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub command: String,
    pub source: CommandSource,
}

/// Autofix command for lint failures. `{files}` in `command` is replaced with
/// the changed files; without the placeholder the files are appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixCommand {
    pub command: String,
    /// File extensions the fixer understands; empty means any file.
    pub extensions: Vec<String>,
    /// Runner-level fix targets operate on the whole project and take no files.
    pub takes_files: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedCommands {
    pub build: Option<ResolvedCommand>,
    pub test: Option<ResolvedCommand>,
    pub lint: Option<ResolvedCommand>,
    pub lint_fix: Option<FixCommand>,
}

/// Probe `root` for verification commands, honouring the config toggles.
pub fn resolve_commands(root: &Path, config: &VerifyConfig) -> ResolvedCommands {
    let probe = Probe::scan(root);
    let build = config
        .build
        .then(|| pick(config.build_command.as_deref(), &probe, Category::Build))
        .flatten();
    let test = config
        .test
        .then(|| pick(config.test_command.as_deref(), &probe, Category::Test))
        .flatten();
    let lint = config
        .lint
        .then(|| pick(config.lint_command.as_deref(), &probe, Category::Lint))
        .flatten();
    let lint_fix = if config.lint && config.lint_autofix {
        match config.lint_fix_command.as_deref().map(str::trim) {
            Some(cmd) if !cmd.is_empty() => Some(FixCommand {
                command: cmd.to_string(),
                extensions: Vec::new(),
                takes_files: cmd.contains("{files}"),
            }),
            _ => probe.fix_command(),
        }
    } else {
        None
    };
    let resolved = ResolvedCommands {
        build,
        test,
        lint,
        lint_fix,
    };
    debug!(?resolved, "verification commands resolved");
    resolved
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Build,
    Test,
    Lint,
}

impl Category {
    fn name(self) -> &'static str {
        match self {
            Category::Build => "build",
            Category::Test => "test",
            Category::Lint => "lint",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Language {
    Rust,
    Go,
    Python,
}

#[derive(Debug, Default)]
struct Probe {
    package_manager: Option<&'static str>,
    scripts: Vec<(String, String)>,
    language: Option<Language>,
    make_targets: Vec<String>,
    just_recipes: Vec<String>,
}

impl Probe {
    fn scan(root: &Path) -> Self {
        let mut probe = Probe::default();
        if let Some(manifest) = read(root, "package.json")
            .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        {
            probe.package_manager = Some(package_manager(root));
            if let Some(scripts) = manifest.get("scripts").and_then(Value::as_object) {
                probe.scripts = scripts
                    .iter()
                    .filter_map(|(name, body)| body.as_str().map(|b| (name.clone(), b.to_string())))
                    .collect();
            }
        }
        probe.language = if root.join("Cargo.toml").is_file() {
            Some(Language::Rust)
        } else if root.join("go.mod").is_file() {
            Some(Language::Go)
        } else if root.join("pyproject.toml").is_file() {
            Some(Language::Python)
        } else {
            None
        };
        if let Some(makefile) = read(root, "Makefile").or_else(|| read(root, "makefile")) {
            probe.make_targets = MAKE_TARGET_RE
                .captures_iter(&makefile)
                .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
                .collect();
        }
        if let Some(justfile) = read(root, "justfile").or_else(|| read(root, "Justfile")) {
            probe.just_recipes = JUST_RECIPE_RE
                .captures_iter(&justfile)
                .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
                .collect();
        }
        probe
    }

    fn script(&self, name: &str) -> Option<&str> {
        self.scripts
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, body)| body.as_str())
    }

    fn package_script(&self, category: Category) -> Option<String> {
        let pm = self.package_manager?;
        let body = self.script(category.name())?;
        // npm's placeholder test script always fails.
        if category == Category::Test && body.contains("no test specified") {
            return None;
        }
        Some(format!("{pm} run {}", category.name()))
    }

    fn project_file(&self, category: Category) -> Option<String> {
        let cmd = match (self.language?, category) {
            (Language::Rust, Category::Build) => "cargo build --all-targets",
            (Language::Rust, Category::Test) => "cargo test",
            (Language::Rust, Category::Lint) => "cargo clippy --all-targets -- -D warnings",
            (Language::Go, Category::Build) => "go build ./...",
            (Language::Go, Category::Test) => "go test ./...",
            (Language::Go, Category::Lint) => "go vet ./...",
            (Language::Python, Category::Build) => return None,
            (Language::Python, Category::Test) => "python -m pytest -q",
            (Language::Python, Category::Lint) => "ruff check .",
        };
        Some(cmd.to_string())
    }

    fn task_runner(&self, category: Category) -> Option<String> {
        let name = category.name();
        if self.make_targets.iter().any(|t| t == name) {
            return Some(format!("make {name}"));
        }
        if self.just_recipes.iter().any(|r| r == name) {
            return Some(format!("just {name}"));
        }
        None
    }

    fn fix_command(&self) -> Option<FixCommand> {
        if let Some(pm) = self.package_manager {
            if self.script("lint:fix").is_some() {
                return Some(FixCommand {
                    command: format!("{pm} run lint:fix -- {{files}}"),
                    extensions: strings(JS_EXTENSIONS),
                    takes_files: true,
                });
            }
            if self.script("lint").is_some_and(|body| body.contains("eslint")) {
                return Some(FixCommand {
                    command: "npx eslint --fix {files}".to_string(),
                    extensions: strings(JS_EXTENSIONS),
                    takes_files: true,
                });
            }
        }
        let by_language = match self.language {
            Some(Language::Rust) => Some(("cargo fmt -- {files}", "rs")),
            Some(Language::Go) => Some(("gofmt -w {files}", "go")),
            Some(Language::Python) => Some(("ruff check --fix {files}", "py")),
            None => None,
        };
        if let Some((command, ext)) = by_language {
            return Some(FixCommand {
                command: command.to_string(),
                extensions: vec![ext.to_string()],
                takes_files: true,
            });
        }
        for target in ["lint-fix", "fix"] {
            if self.make_targets.iter().any(|t| t == target) {
                return Some(whole_project(format!("make {target}")));
            }
            if self.just_recipes.iter().any(|r| r == target) {
                return Some(whole_project(format!("just {target}")));
            }
        }
        None
    }
}

fn pick(explicit: Option<&str>, probe: &Probe, category: Category) -> Option<ResolvedCommand> {
    if let Some(cmd) = explicit.map(str::trim).filter(|c| !c.is_empty()) {
        return Some(ResolvedCommand {
            command: cmd.to_string(),
            source: CommandSource::Override,
        });
    }
    let candidates = [
        (probe.package_script(category), CommandSource::PackageScript),
        (probe.project_file(category), CommandSource::ProjectFile),
        (probe.task_runner(category), CommandSource::TaskRunner),
    ];
    candidates
        .into_iter()
        .find_map(|(cmd, source)| cmd.map(|command| ResolvedCommand { command, source }))
}

fn whole_project(command: String) -> FixCommand {
    FixCommand {
        command,
        extensions: Vec::new(),
        takes_files: false,
    }
}

fn package_manager(root: &Path) -> &'static str {
    if root.join("pnpm-lock.yaml").is_file() {
        "pnpm"
    } else if root.join("yarn.lock").is_file() {
        "yarn"
    } else if root.join("bun.lockb").is_file() || root.join("bun.lock").is_file() {
        "bun"
    } else {
        "npm"
    }
}

fn read(root: &Path, name: &str) -> Option<String> {
    fs::read_to_string(root.join(name)).ok()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}
