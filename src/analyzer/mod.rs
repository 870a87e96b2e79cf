//! Dependency Analyzer: combines a static source-parse pass with an instrumented
//! dynamic trace pass into one merged, classified, cycle-checked module graph.

pub mod dynamic_pass;
pub mod static_pass;

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use once_cell::sync::Lazy;

use self::dynamic_pass::{trace_imports, TraceError};
use self::static_pass::{capture_imports_regex, parse_imports, resolve_local_candidate, VisitedSet};

#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error("entry file not found: {0}")]
    InputNotFound(PathBuf),
}

/// How a [`DependencyNode`] was classified, per the data model's exhaustive set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    Builtin,
    ThirdParty,
    Local,
    Unresolved,
}

/// One node of the [`DependencyGraph`].
#[derive(Clone, Debug)]
pub struct DependencyNode {
    pub name: String,
    pub version: Option<String>,
    pub location: Option<PathBuf>,
    pub classification: Classification,
    pub size_estimate: u64,
    pub required_by: BTreeSet<String>,
    pub sub_dependencies: BTreeSet<String>,
}

/// Module name → node. `required_by` and `sub_dependencies` are inverse across the
/// whole graph; every name mentioned in either edge set exists as a key.
#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    pub nodes: BTreeMap<String, DependencyNode>,
    pub entry: String,
}

impl DependencyGraph {
    pub fn node(&self, name: &str) -> Option<&DependencyNode> {
        self.nodes.get(name)
    }
}

/// Interface to the host's module-spec resolver, kept separate from the graph-walk
/// logic so tests can substitute a [`ModuleResolver`] stub instead of depending on a
/// real interpreter's install layout.
pub trait ModuleResolver {
    fn resolve(&self, name: &str, from_dir: &Path) -> ResolvedModule;
}

#[derive(Clone, Debug, Default)]
pub struct ResolvedModule {
    pub classification: Classification,
    pub location: Option<PathBuf>,
    pub version: Option<String>,
}

impl Default for Classification {
    fn default() -> Self {
        Classification::Unresolved
    }
}

/// Default stdlib-layout-backed resolver. `site_packages_dirs` models the
/// "site-packages" heuristic from the component design: a resolved path under one of
/// these directories is third-party, anything else that resolves to a real file next
/// to the source tree is local.
pub struct StdModuleResolver {
    pub site_packages_dirs: Vec<PathBuf>,
}

static STDLIB_MODULES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "os", "sys", "json", "re", "io", "math", "time", "datetime", "collections", "itertools",
        "functools", "typing", "pathlib", "subprocess", "threading", "asyncio", "logging",
        "argparse", "shutil", "tempfile", "hashlib", "random", "copy", "enum", "abc", "struct",
        "socket", "sqlite3", "unittest", "string", "textwrap", "traceback", "warnings", "weakref",
        "contextlib", "dataclasses", "importlib", "inspect", "pickle", "base64", "uuid", "csv",
        "glob", "platform", "signal", "queue", "multiprocessing", "xml", "email", "http", "urllib",
        "ctypes", "array", "bisect", "heapq", "operator", "zlib", "gzip", "tarfile", "zipfile",
    ]
    .into_iter()
    .collect()
});

impl ModuleResolver for StdModuleResolver {
    fn resolve(&self, name: &str, from_dir: &Path) -> ResolvedModule {
        if STDLIB_MODULES.contains(name) {
            return ResolvedModule { classification: Classification::Builtin, location: None, version: None };
        }
        for site in &self.site_packages_dirs {
            let file = site.join(format!("{name}.py"));
            let pkg = site.join(name).join("__init__.py");
            if file.is_file() {
                return ResolvedModule {
                    classification: Classification::ThirdParty,
                    location: Some(file.clone()),
                    version: read_dist_info_version(site, name),
                };
            }
            if pkg.is_file() {
                return ResolvedModule {
                    classification: Classification::ThirdParty,
                    location: Some(pkg),
                    version: read_dist_info_version(site, name),
                };
            }
        }
        if let Some(local) = resolve_local_candidate(name, &from_dir.join("__entry__.py")) {
            return ResolvedModule { classification: Classification::Local, location: Some(local), version: None };
        }
        ResolvedModule::default()
    }
}

fn read_dist_info_version(site: &Path, name: &str) -> Option<String> {
    let entries = std::fs::read_dir(site).ok()?;
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if file_name.starts_with(&format!("{name}-")) && file_name.ends_with(".dist-info") {
            let version = file_name
                .trim_start_matches(&format!("{name}-"))
                .trim_end_matches(".dist-info")
                .to_string();
            return Some(version);
        }
    }
    None
}

const DEFAULT_EXCLUDES: &[&str] = &[
    "unittest", "tkinter", "turtledemo", "idlelib", "email", "xml", "pydoc", "doctest", "pdb",
];

const SIZE_DEFAULT_BUILTIN: u64 = 1024;
const SIZE_DEFAULT_THIRD_PARTY: u64 = 50 * 1024;
const SIZE_DEFAULT_LOCAL: u64 = 5 * 1024;
const SIZE_WALK_DEPTH_CAP: usize = 2;

/// Full analysis output for one run: the merged, classified graph plus any
/// non-fatal warnings collected along the way.
#[derive(Clone, Debug)]
pub struct AnalysisResult {
    pub graph: DependencyGraph,
    pub cycles: Vec<Vec<String>>,
    pub warnings: Vec<String>,
    pub analysis_time: Duration,
}

/// Derived view over an already-computed graph: modules worth excluding, the
/// largest dependencies, and their combined size. Supplements the distilled spec
/// with the original tool's `get_optimization_suggestions`/`export_requirements_txt`
/// pair — pure functions over a graph already in hand, no new I/O.
#[derive(Clone, Debug, Default)]
pub struct OptimizationSuggestions {
    pub excludable: Vec<String>,
    pub largest: Vec<(String, u64)>,
    pub total_excludable_bytes: u64,
}

pub fn optimization_suggestions(graph: &DependencyGraph) -> OptimizationSuggestions {
    let excludable: Vec<String> = graph
        .nodes
        .keys()
        .filter(|name| DEFAULT_EXCLUDES.contains(&name.as_str()))
        .cloned()
        .collect();

    let mut by_size: Vec<(String, u64)> =
        graph.nodes.values().map(|n| (n.name.clone(), n.size_estimate)).collect();
    by_size.sort_by(|a, b| b.1.cmp(&a.1));
    let largest: Vec<(String, u64)> =
        by_size.iter().filter(|(_, size)| *size > 100 * 1024).take(10).cloned().collect();

    let total_excludable_bytes =
        excludable.iter().filter_map(|name| graph.nodes.get(name)).map(|n| n.size_estimate).sum();

    OptimizationSuggestions { excludable, largest, total_excludable_bytes }
}

/// Builds a `requirements.txt`-style listing of resolved third-party modules.
pub fn export_requirements(graph: &DependencyGraph) -> String {
    let mut lines: Vec<String> = graph
        .nodes
        .values()
        .filter(|n| n.classification == Classification::ThirdParty)
        .map(|n| match &n.version {
            Some(v) => format!("{}=={}", n.name, v),
            None => n.name.clone(),
        })
        .collect();
    lines.sort();
    lines.join("\n")
}

/// Runs the static pass, the dynamic pass, merges them, classifies every node,
/// builds reverse edges, estimates sizes, and detects cycles.
pub async fn analyze(
    entry_file: &Path,
    resolver: &dyn ModuleResolver,
    python: &str,
) -> Result<AnalysisResult, AnalyzerError> {
    if !entry_file.is_file() {
        return Err(AnalyzerError::InputNotFound(entry_file.to_path_buf()));
    }
    let start = Instant::now();
    let mut warnings = Vec::new();

    let entry_name = entry_module_name(entry_file);
    let mut children: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut locations: BTreeMap<String, PathBuf> = BTreeMap::new();
    locations.insert(entry_name.clone(), entry_file.to_path_buf());

    let mut visited: VisitedSet = HashSet::new();
    static_walk(entry_file, &entry_name, &mut children, &mut locations, &mut visited, &mut warnings);

    match trace_imports(python, entry_file).await {
        Ok(roots) => {
            let entry_children = children.entry(entry_name.clone()).or_default();
            for root in roots {
                entry_children.insert(root);
            }
        }
        Err(TraceError::Timeout(_)) => {
            warnings.push("dynamic pass timed out; using static pass only".to_string());
        }
        Err(e) => {
            warnings.push(format!("dynamic pass failed: {e}; using static pass only"));
        }
    }

    let mut nodes: BTreeMap<String, DependencyNode> = BTreeMap::new();
    for (parent, kids) in &children {
        nodes.entry(parent.clone()).or_insert_with(|| empty_node(parent));
        for kid in kids {
            nodes.entry(kid.clone()).or_insert_with(|| empty_node(kid));
        }
    }
    nodes.entry(entry_name.clone()).or_insert_with(|| empty_node(&entry_name));

    for (parent, kids) in &children {
        if let Some(node) = nodes.get_mut(parent) {
            node.sub_dependencies.extend(kids.iter().cloned());
        }
    }

    let from_dir = entry_file.parent().unwrap_or_else(|| Path::new("."));
    for (name, node) in nodes.iter_mut() {
        if *name == entry_name {
            continue;
        }
        if let Some(loc) = locations.get(name) {
            node.classification = Classification::Local;
            node.location = Some(loc.clone());
            continue;
        }
        let resolved = resolver.resolve(name, from_dir);
        node.classification = resolved.classification;
        node.location = resolved.location;
        node.version = resolved.version;
    }
    nodes.get_mut(&entry_name).unwrap().classification = Classification::Local;

    let names: Vec<String> = nodes.keys().cloned().collect();
    for parent in &names {
        let kids = nodes[parent].sub_dependencies.clone();
        for kid in kids {
            nodes.get_mut(&kid).unwrap().required_by.insert(parent.clone());
        }
    }

    for name in &names {
        let size = estimate_size(&nodes[name]);
        nodes.get_mut(name).unwrap().size_estimate = size;
    }

    let graph = DependencyGraph { nodes, entry: entry_name };
    let cycles = detect_cycles(&graph);

    Ok(AnalysisResult { graph, cycles, warnings, analysis_time: start.elapsed() })
}

fn empty_node(name: &str) -> DependencyNode {
    DependencyNode {
        name: name.to_string(),
        version: None,
        location: None,
        classification: Classification::Unresolved,
        size_estimate: 0,
        required_by: BTreeSet::new(),
        sub_dependencies: BTreeSet::new(),
    }
}

/// The entry file's node key: its own module name, the same one any sibling file's
/// `import <name>` would resolve it by. Using a name no other file could ever import
/// it as (e.g. a synthetic prefix) would leave the entry unreachable from its own
/// imports, silently dropping any cycle that loops back through the entry file.
fn entry_module_name(entry_file: &Path) -> String {
    entry_file.file_stem().and_then(|s| s.to_str()).unwrap_or("main").to_string()
}

fn static_walk(
    file: &Path,
    node_name: &str,
    children: &mut BTreeMap<String, BTreeSet<String>>,
    locations: &mut BTreeMap<String, PathBuf>,
    visited: &mut VisitedSet,
    warnings: &mut Vec<String>,
) {
    if !visited.insert(file.to_path_buf()) {
        return;
    }
    let Ok(content) = std::fs::read_to_string(file) else {
        warnings.push(format!("could not read {}", file.display()));
        return;
    };

    let imports = match parse_imports(&content, file) {
        Ok(imports) => imports,
        Err(e) => {
            warnings.push(format!("parse error in {}: {e}", file.display()));
            capture_imports_regex(&content)
        }
    };

    let entry = children.entry(node_name.to_string()).or_default();
    for import in &imports {
        entry.insert(import.root.clone());
    }

    for import in &imports {
        if locations.contains_key(&import.root) {
            continue;
        }
        if let Some(candidate) = resolve_local_candidate(&import.root, file) {
            locations.insert(import.root.clone(), candidate.clone());
            static_walk(&candidate, &import.root, children, locations, visited, warnings);
        }
    }
}

fn estimate_size(node: &DependencyNode) -> u64 {
    let Some(location) = &node.location else {
        return match node.classification {
            Classification::Builtin => SIZE_DEFAULT_BUILTIN,
            Classification::ThirdParty => SIZE_DEFAULT_THIRD_PARTY,
            Classification::Local => SIZE_DEFAULT_LOCAL,
            Classification::Unresolved => 0,
        };
    };

    if location.file_name().and_then(|n| n.to_str()) == Some("__init__.py") {
        let dir = location.parent().unwrap_or(location);
        directory_size_capped(dir, SIZE_WALK_DEPTH_CAP)
    } else {
        std::fs::metadata(location).map(|m| m.len()).unwrap_or(0)
    }
}

/// Sums file sizes under `dir`, capped at `depth` levels of nesting deep, via the
/// same `walkdir` traversal the rest of the corpus reaches for over hand-rolled
/// recursion.
fn directory_size_capped(dir: &Path, depth: usize) -> u64 {
    walkdir::WalkDir::new(dir)
        .max_depth(depth + 1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Iterative depth-first cycle detection. Each node carries a `visiting`/`done`
/// mark; encountering a `visiting` node records the path segment back to it as one
/// cycle. Returns an empty vector when the graph is acyclic.
fn detect_cycles(graph: &DependencyGraph) -> Vec<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
    let mut cycles = Vec::new();

    for start in graph.nodes.keys() {
        if marks.contains_key(start.as_str()) {
            continue;
        }
        let mut stack: Vec<(&str, std::collections::btree_set::Iter<'_, String>)> =
            vec![(start.as_str(), graph.nodes[start].sub_dependencies.iter())];
        let mut path: Vec<&str> = vec![start.as_str()];
        marks.insert(start.as_str(), Mark::Visiting);

        while let Some((node, iter)) = stack.last_mut() {
            let node = *node;
            match iter.next() {
                Some(child) => match marks.get(child.as_str()) {
                    Some(Mark::Visiting) => {
                        let start_idx = path.iter().position(|n| *n == child.as_str()).unwrap();
                        let mut cycle: Vec<String> =
                            path[start_idx..].iter().map(|s| s.to_string()).collect();
                        cycle.push(child.clone());
                        cycles.push(cycle);
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(child.as_str(), Mark::Visiting);
                        path.push(child.as_str());
                        stack.push((child.as_str(), graph.nodes[child].sub_dependencies.iter()));
                    }
                },
                None => {
                    marks.insert(node, Mark::Done);
                    path.pop();
                    stack.pop();
                }
            }
        }
    }

    cycles
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct StubResolver;
    impl ModuleResolver for StubResolver {
        fn resolve(&self, name: &str, _from_dir: &Path) -> ResolvedModule {
            if STDLIB_MODULES.contains(name) {
                ResolvedModule { classification: Classification::Builtin, location: None, version: None }
            } else {
                ResolvedModule::default()
            }
        }
    }

    #[tokio::test]
    async fn classifies_builtin_modules_and_links_required_by() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("hello.py");
        std::fs::write(&entry, "import os\nimport sys\nimport json\nimport datetime\n").unwrap();

        let result = analyze(&entry, &StubResolver, "python3-does-not-exist").await.unwrap();
        let graph = result.graph;
        for name in ["os", "sys", "json", "datetime"] {
            let node = graph.node(name).expect("node present");
            assert_eq!(node.classification, Classification::Builtin);
            assert!(node.required_by.contains(&graph.entry));
        }
    }

    #[tokio::test]
    async fn detects_two_node_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.py");
        let b = dir.path().join("b.py");
        std::fs::File::create(&a).unwrap().write_all(b"from b import x\n").unwrap();
        std::fs::File::create(&b).unwrap().write_all(b"from a import y\n").unwrap();

        let result = analyze(&a, &StubResolver, "python3-does-not-exist").await.unwrap();
        assert_eq!(result.cycles.len(), 1);
        assert_eq!(result.cycles[0].len(), 3);
    }

    #[tokio::test]
    async fn missing_entry_file_fails() {
        let err = analyze(Path::new("/does/not/exist.py"), &StubResolver, "python3").await;
        assert!(matches!(err, Err(AnalyzerError::InputNotFound(_))));
    }
}
