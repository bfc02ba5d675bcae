use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::injectable::{
    DataType, FormatSpec, InjectableValue, LocaleMap, SourceType, SystemAssignment,
    effective_visibility,
};
use crate::resolver::context::InjectorContext;
use crate::{EngineError, Result};

/// Default per-injector resolution timeout.
pub const DEFAULT_INJECTOR_TIMEOUT: Duration = Duration::from_secs(30);

pub type ResolveFuture = Pin<Box<dyn Future<Output = Result<InjectableValue>> + Send>>;

/// Resolution capability of an INTERNAL injector. Receives the shared
/// context; dependency values are read through `ctx.resolved(code)`.
pub type ResolveFn = Arc<dyn Fn(Arc<InjectorContext>) -> ResolveFuture + Send + Sync>;

/// A declared system injector: a record of capabilities, not a type
/// hierarchy. EXTERNAL entries carry no resolve function; their values
/// arrive in the render request body.
#[derive(Clone)]
pub struct InjectorEntry {
    pub code: String,
    pub data_type: DataType,
    pub source_type: SourceType,
    pub dependencies: Vec<String>,
    pub is_critical: bool,
    pub timeout: Duration,
    pub default_value: Option<InjectableValue>,
    pub formats: Option<FormatSpec>,
    pub label: LocaleMap,
    pub description: LocaleMap,
    pub group: Option<String>,
    pub resolve: Option<ResolveFn>,
}

impl std::fmt::Debug for InjectorEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectorEntry")
            .field("code", &self.code)
            .field("data_type", &self.data_type)
            .field("source_type", &self.source_type)
            .field("dependencies", &self.dependencies)
            .field("is_critical", &self.is_critical)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl InjectorEntry {
    /// An injector computed in-process.
    pub fn internal<F>(code: impl Into<String>, data_type: DataType, resolve: F) -> Self
    where
        F: Fn(Arc<InjectorContext>) -> ResolveFuture + Send + Sync + 'static,
    {
        Self {
            code: code.into(),
            data_type,
            source_type: SourceType::Internal,
            dependencies: Vec::new(),
            is_critical: false,
            timeout: DEFAULT_INJECTOR_TIMEOUT,
            default_value: None,
            formats: None,
            label: LocaleMap::new(),
            description: LocaleMap::new(),
            group: None,
            resolve: Some(Arc::new(resolve)),
        }
    }

    /// An injector whose value the caller supplies at render time.
    pub fn external(code: impl Into<String>, data_type: DataType) -> Self {
        Self {
            code: code.into(),
            data_type,
            source_type: SourceType::External,
            dependencies: Vec::new(),
            is_critical: false,
            timeout: DEFAULT_INJECTOR_TIMEOUT,
            default_value: None,
            formats: None,
            label: LocaleMap::new(),
            description: LocaleMap::new(),
            group: None,
            resolve: None,
        }
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn critical(mut self) -> Self {
        self.is_critical = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_default(mut self, value: InjectableValue) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn with_formats(mut self, formats: FormatSpec) -> Self {
        self.formats = Some(formats);
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_label(mut self, locale: &str, label: &str) -> Self {
        self.label.insert(locale.to_string(), label.to_string());
        self
    }
}

/// Accumulates injector declarations during engine construction.
#[derive(Default, Debug)]
pub struct RegistryBuilder {
    entries: BTreeMap<String, InjectorEntry>,
}

impl RegistryBuilder {
    pub fn register(&mut self, entry: InjectorEntry) -> Result<&mut Self> {
        if self.entries.contains_key(&entry.code) {
            return Err(EngineError::DuplicateCode(entry.code));
        }
        self.entries.insert(entry.code.clone(), entry);
        Ok(self)
    }

    pub fn build(self) -> InjectorRegistry {
        InjectorRegistry {
            entries: self.entries,
        }
    }
}

/// The in-process injector catalog. Built once at startup and never
/// mutated afterwards.
pub struct InjectorRegistry {
    entries: BTreeMap<String, InjectorEntry>,
}

impl InjectorRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, code: &str) -> Option<&InjectorEntry> {
        self.entries.get(code)
    }

    pub fn contains(&self, code: &str) -> bool {
        self.entries.contains_key(code)
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = &InjectorEntry> {
        self.entries.values()
    }

    /// Critical injectors are always part of a render's working set.
    pub fn critical_codes(&self) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.is_critical)
            .map(|e| e.code.clone())
            .collect()
    }

    /// Computes the transitive closure of `codes` plus dependencies and
    /// partitions it into topological levels. Every entry of one level
    /// only depends on earlier levels, so a level may execute
    /// concurrently.
    pub fn resolve_order(&self, codes: &[String]) -> Result<Vec<Vec<String>>> {
        // Transitive closure.
        let mut closure: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = codes.iter().cloned().collect();
        while let Some(code) = queue.pop_front() {
            let entry = self
                .entries
                .get(&code)
                .ok_or_else(|| EngineError::InjectableNotFound(code.clone()))?;
            if closure.insert(code) {
                for dep in &entry.dependencies {
                    queue.push_back(dep.clone());
                }
            }
        }

        // Kahn leveling over the induced subgraph.
        let mut remaining: BTreeMap<&str, BTreeSet<&str>> = closure
            .iter()
            .map(|code| {
                let deps = self.entries[code.as_str()]
                    .dependencies
                    .iter()
                    .map(String::as_str)
                    .filter(|d| closure.contains(*d))
                    .collect();
                (code.as_str(), deps)
            })
            .collect();

        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut done: HashSet<&str> = HashSet::new();
        while !remaining.is_empty() {
            let ready: Vec<&str> = remaining
                .iter()
                .filter(|(_, deps)| deps.iter().all(|d| done.contains(d)))
                .map(|(code, _)| *code)
                .collect();
            if ready.is_empty() {
                return Err(EngineError::CircularDependency(self.find_cycle(&remaining)));
            }
            for code in &ready {
                remaining.remove(code);
                done.insert(code);
            }
            levels.push(ready.iter().map(|s| s.to_string()).collect());
        }
        Ok(levels)
    }

    /// Walks dependency edges from an unresolved node until one repeats,
    /// producing a `a -> b -> a` style path for diagnostics.
    fn find_cycle(&self, remaining: &BTreeMap<&str, BTreeSet<&str>>) -> Vec<String> {
        let start = match remaining.keys().next() {
            Some(s) => *s,
            None => return Vec::new(),
        };
        let mut path: Vec<&str> = vec![start];
        let mut seen: HashMap<&str, usize> = HashMap::from([(start, 0)]);
        let mut current = start;
        loop {
            let next = remaining
                .get(current)
                .and_then(|deps| deps.iter().find(|d| remaining.contains_key(**d)))
                .copied();
            match next {
                Some(next) => {
                    if let Some(&at) = seen.get(next) {
                        let mut cycle: Vec<String> =
                            path[at..].iter().map(|s| s.to_string()).collect();
                        cycle.push(next.to_string());
                        return cycle;
                    }
                    seen.insert(next, path.len());
                    path.push(next);
                    current = next;
                }
                None => return path.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    /// The registry codes visible to a workspace, derived from the
    /// system-injectable assignments in scope for it.
    pub fn visible_codes(&self, assignments: &[SystemAssignment]) -> BTreeSet<String> {
        effective_visibility(assignments)
            .into_iter()
            .filter(|(code, active)| *active && self.entries.contains_key(code))
            .map(|(code, _)| code)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::injectable::AssignmentScope;
    use chrono::Utc;
    use uuid::Uuid;

    fn noop(code: &str, deps: &[&str]) -> InjectorEntry {
        InjectorEntry::internal(code, DataType::Text, |_| {
            Box::pin(async { Ok(InjectableValue::Text(String::new())) })
        })
        .with_dependencies(deps)
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut builder = InjectorRegistry::builder();
        builder.register(noop("a", &[])).unwrap();
        let err = builder.register(noop("a", &[])).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateCode(code) if code == "a"));
    }

    #[test]
    fn levels_respect_dependencies() {
        let mut builder = InjectorRegistry::builder();
        builder.register(noop("a", &[])).unwrap();
        builder.register(noop("b", &["a"])).unwrap();
        builder.register(noop("c", &["a"])).unwrap();
        builder.register(noop("d", &["b", "c"])).unwrap();
        let registry = builder.build();

        let levels = registry.resolve_order(&["d".to_string()]).unwrap();
        assert_eq!(levels, vec![
            vec!["a".to_string()],
            vec!["b".to_string(), "c".to_string()],
            vec!["d".to_string()],
        ]);
    }

    #[test]
    fn closure_pulls_in_dependencies() {
        let mut builder = InjectorRegistry::builder();
        builder.register(noop("base", &[])).unwrap();
        builder.register(noop("derived", &["base"])).unwrap();
        let registry = builder.build();

        let levels = registry.resolve_order(&["derived".to_string()]).unwrap();
        let flat: Vec<String> = levels.into_iter().flatten().collect();
        assert_eq!(flat, vec!["base".to_string(), "derived".to_string()]);
    }

    #[test]
    fn cycle_reports_path() {
        let mut builder = InjectorRegistry::builder();
        builder.register(noop("a", &["b"])).unwrap();
        builder.register(noop("b", &["a"])).unwrap();
        let registry = builder.build();

        let err = registry.resolve_order(&["a".to_string()]).unwrap_err();
        match err {
            EngineError::CircularDependency(path) => {
                assert_eq!(path.first(), path.last());
                assert!(path.len() >= 3, "path {path:?} should close the loop");
            }
            other => panic!("expected CircularDependency, got {other:?}"),
        }
    }

    #[test]
    fn unknown_dependency_is_reported() {
        let mut builder = InjectorRegistry::builder();
        builder.register(noop("a", &["ghost"])).unwrap();
        let registry = builder.build();
        let err = registry.resolve_order(&["a".to_string()]).unwrap_err();
        assert!(matches!(err, EngineError::InjectableNotFound(code) if code == "ghost"));
    }

    #[test]
    fn visibility_requires_active_assignment() {
        let mut builder = InjectorRegistry::builder();
        builder.register(noop("date_now", &[])).unwrap();
        builder.register(noop("hidden", &[])).unwrap();
        let registry = builder.build();

        let assignment = |code: &str, scope, active| SystemAssignment {
            id: Uuid::new_v4(),
            injector_code: code.to_string(),
            scope,
            tenant_id: None,
            workspace_id: None,
            is_active: active,
            created_at: Utc::now(),
        };

        let visible = registry.visible_codes(&[
            assignment("date_now", AssignmentScope::Public, true),
            assignment("hidden", AssignmentScope::Public, true),
            assignment("hidden", AssignmentScope::Workspace, false),
            assignment("unregistered", AssignmentScope::Public, true),
        ]);
        assert!(visible.contains("date_now"));
        assert!(!visible.contains("hidden"));
        assert!(!visible.contains("unregistered"));
    }
}
