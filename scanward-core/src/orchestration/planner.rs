//! Decides which scanners must rerun for a set of changed files.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

/// File patterns that make a scanner relevant to a change.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRelevance {
    /// Every file is relevant.
    pub any: bool,
    /// Extensions without the leading dot, compared case-insensitively.
    pub extensions: Vec<String>,
    /// Exact file names, compared case-insensitively.
    pub file_names: Vec<String>,
    /// Substrings of the lower-cased file name.
    pub name_contains: Vec<String>,
}

impl FileRelevance {
    /// Matches every file.
    pub fn any() -> Self {
        Self {
            any: true,
            ..Self::default()
        }
    }

    /// Adds extensions (without the dot).
    pub fn extensions<I: IntoIterator<Item = &'static str>>(mut self, exts: I) -> Self {
        self.extensions.extend(exts.into_iter().map(str::to_string));
        self
    }

    /// Adds exact file names.
    pub fn file_names<I: IntoIterator<Item = &'static str>>(mut self, names: I) -> Self {
        self.file_names.extend(names.into_iter().map(str::to_string));
        self
    }

    /// Adds file-name substrings.
    pub fn name_contains<I: IntoIterator<Item = &'static str>>(mut self, needles: I) -> Self {
        self.name_contains
            .extend(needles.into_iter().map(str::to_string));
        self
    }

    /// Whether `path` is relevant.
    pub fn matches(&self, path: &Path) -> bool {
        if self.any {
            return true;
        }
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_lowercase()) else {
            return false;
        };
        if self.file_names.iter().any(|f| f.eq_ignore_ascii_case(&name)) {
            return true;
        }
        if self.name_contains.iter().any(|needle| name.contains(needle.as_str())) {
            return true;
        }
        path.extension()
            .map(|ext| ext.to_string_lossy())
            .is_some_and(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)))
    }
}

const MANIFESTS: [&str; 12] = [
    "requirements.txt",
    "pipfile",
    "pipfile.lock",
    "poetry.lock",
    "pyproject.toml",
    "setup.py",
    "package.json",
    "package-lock.json",
    "yarn.lock",
    "go.mod",
    "go.sum",
    "cargo.lock",
];

/// Files that mark a project as having declared dependencies.
const PACKAGE_FILES: [&str; 11] = [
    "requirements.txt",
    "setup.py",
    "pyproject.toml",
    "pipfile",
    "package.json",
    "yarn.lock",
    "pom.xml",
    "build.gradle",
    "go.mod",
    "cargo.toml",
    "composer.json",
];

const JS_EXTENSIONS: [&str; 5] = ["js", "jsx", "ts", "tsx", "vue"];

/// What a target is made of, as far as scanner selection cares.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectProfile {
    /// Python sources present.
    pub python: bool,
    /// JavaScript or TypeScript sources present.
    pub javascript: bool,
    /// A Dockerfile present.
    pub docker: bool,
    /// A package manifest present.
    pub packages: bool,
}

impl ProjectProfile {
    /// Walks `target`, skipping `.git`, until every trait has been seen or
    /// the tree is exhausted.
    pub fn detect(target: &Path) -> Self {
        let mut profile = Self::default();
        let walker = WalkDir::new(target)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| entry.file_name() != ".git");
        for entry in walker.filter_map(std::result::Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            profile.observe(entry.path());
            if profile.complete() {
                break;
            }
        }
        tracing::debug!(target = %target.display(), ?profile, "project profile detected");
        profile
    }

    fn observe(&mut self, path: &Path) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        self.python |= ext == "py";
        self.javascript |= JS_EXTENSIONS.contains(&ext.as_str());
        self.docker |= name == "dockerfile" || name.starts_with("dockerfile.");
        self.packages |= PACKAGE_FILES.contains(&name.as_str());
    }

    fn complete(&self) -> bool {
        self.python && self.javascript && self.docker && self.packages
    }
}

/// Scanners suggested for a detected project, most important first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    /// Always worth running for this kind of project.
    pub essential: Vec<String>,
    /// Useful additions.
    pub recommended: Vec<String>,
    /// Expected wall time when every suggested scanner runs in parallel.
    pub estimated_duration: Duration,
}

impl Recommendation {
    /// Secrets and dependencies are always essential; the rest follows the
    /// detected languages and packaging.
    pub fn for_project(project: &ProjectProfile) -> Self {
        let mut rec = Self {
            essential: vec!["secret".into(), "dependency".into()],
            recommended: Vec::new(),
            estimated_duration: Duration::ZERO,
        };
        if project.python {
            rec.essential.push("sast".into());
            rec.recommended
                .extend(["semgrep", "safety"].map(String::from));
        }
        if project.javascript {
            rec.recommended
                .extend(["npm_audit", "yarn_audit"].map(String::from));
        }
        if project.docker {
            rec.essential.push("trivy".into());
            rec.recommended.push("snyk".into());
        }
        if project.packages && !rec.recommended.iter().any(|s| s == "snyk") {
            rec.recommended.push("snyk".into());
        }
        rec
    }

    /// Essential scanners, then recommended ones, without repeats.
    pub fn scanners(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.essential
            .iter()
            .chain(&self.recommended)
            .filter(|name| seen.insert(name.as_str()))
            .cloned()
            .collect()
    }
}

/// Built-in relevance for the well-known scanners. Unknown scanners match
/// every file so they are never skipped by mistake.
pub fn default_relevance(scanner: &str) -> FileRelevance {
    match scanner {
        "secret" | "gitleaks" => FileRelevance::any(),
        "dependency" | "safety" => FileRelevance::default()
            .file_names(MANIFESTS)
            .name_contains(["requirements"]),
        "npm_audit" => FileRelevance::default()
            .file_names(["package.json", "package-lock.json"]),
        "yarn_audit" => FileRelevance::default().file_names(["package.json", "yarn.lock"]),
        "sast" | "bandit" => FileRelevance::default().extensions(["py"]),
        "semgrep" => FileRelevance::default().extensions([
            "py", "js", "jsx", "ts", "tsx", "java", "go", "rb", "php", "c", "cpp", "cs",
        ]),
        "trivy" | "snyk" => FileRelevance::default()
            .file_names(MANIFESTS)
            .file_names(["dockerfile", "docker-compose.yml", "docker-compose.yaml"])
            .name_contains(["dockerfile"])
            .extensions(["tf", "yaml", "yml"]),
        _ => FileRelevance::any(),
    }
}

/// Planner output for one job.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanPlan {
    /// Scanners touched by at least one changed file; they run fresh.
    pub must_run: BTreeSet<String>,
    /// Scanners that may be satisfied from the cache.
    pub cache_eligible: BTreeSet<String>,
}

impl ScanPlan {
    /// Whether `scanner` was touched by the change set.
    pub fn must_run(&self, scanner: &str) -> bool {
        self.must_run.contains(scanner)
    }
}

/// Classifies scanners as must-run or cache-eligible from changed files.
#[derive(Clone, Debug, Default)]
pub struct IncrementalPlanner;

impl IncrementalPlanner {
    /// The planner is stateless.
    pub fn new() -> Self {
        Self
    }

    /// `scanners` yields each selected scanner with its patterns. Only the changed
    /// files are inspected, never the whole target.
    pub fn plan<'a, I>(&self, target: &Path, scanners: I, changed_files: &[PathBuf]) -> ScanPlan
    where
        I: IntoIterator<Item = (&'a str, &'a FileRelevance)>,
    {
        let mut plan = ScanPlan::default();
        for (scanner, relevance) in scanners {
            let relevant = changed_files.iter().any(|file| {
                let file = file.strip_prefix(target).unwrap_or(file.as_path());
                relevance.matches(file)
            });
            if relevant {
                plan.must_run.insert(scanner.to_string());
            } else {
                plan.cache_eligible.insert(scanner.to_string());
            }
        }
        tracing::debug!(
            changed = changed_files.len(),
            must_run = plan.must_run.len(),
            cache_eligible = plan.cache_eligible.len(),
            "incremental plan computed"
        );
        plan
    }
}
