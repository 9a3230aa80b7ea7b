//! TOML blueprint parser.
//!
//! A blueprint is a `.toml` file or a directory of them. Each file may declare
//! `[[resource]]`, `[variable.<name>]`, `[output.<name>]`, and `[[module]]`
//! entries; modules include another blueprint directory under the id prefix
//! `module.<name>.`. The parser yields a [`Config`] in stable topological
//! order with `checksum.parsed` and `checksum.processed` filled in.

use crate::checksum::compute_checksum;
use crate::config::Config;
use crate::graph::DependencyGraph;
use crate::resource::{Resource, TYPE_IMAGE_CACHE, TYPE_MODULE, TYPE_OUTPUT, TYPE_VARIABLE};
use crate::types::{module_prefix, ResourceId};
use crate::variables::VariableSet;
use crate::SchemaError;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const MAX_MODULE_DEPTH: usize = 16;

/// Registered resource types, as seen by the parser.
pub trait TypeCatalog {
    fn contains(&self, kind: &str) -> bool;

    /// Post-parse normalization of a single resource. `committed` is the
    /// resource with the same id in the current state, if any.
    fn process(&self, resource: &mut Resource, committed: Option<&Resource>)
        -> Result<(), SchemaError>;
}

#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Variables from the environment; lowest precedence.
    pub env: VariableSet,
    /// Optional TOML variables file; overrides `env`.
    pub variables_file: Option<PathBuf>,
    /// Explicit variables; highest precedence.
    pub variables: VariableSet,
}

impl ParseOptions {
    pub fn from_env() -> Self {
        Self {
            env: VariableSet::from_env(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_variables(mut self, variables: VariableSet) -> Self {
        self.variables = variables;
        self
    }

    #[must_use]
    pub fn with_variables_file(mut self, path: Option<PathBuf>) -> Self {
        self.variables_file = path;
        self
    }
}

/// Parser result. `config` holds every resource that could be resolved even
/// when `error` is set.
#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub config: Config,
    pub error: Option<SchemaError>,
}

impl ParseOutcome {
    pub fn into_result(self) -> Result<Config, SchemaError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.config),
        }
    }

    fn failed(error: SchemaError) -> Self {
        Self {
            config: Config::new(),
            error: Some(error),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BlueprintFile {
    #[serde(default)]
    blueprint: Option<toml::Table>,
    #[serde(default)]
    variable: BTreeMap<String, VariableDecl>,
    #[serde(default)]
    resource: Vec<ResourceDecl>,
    #[serde(default)]
    module: Vec<ModuleDecl>,
    #[serde(default)]
    output: BTreeMap<String, OutputDecl>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VariableDecl {
    #[serde(default)]
    default: Option<toml::Value>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResourceDecl {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    disabled: bool,
    #[serde(flatten)]
    fields: toml::Table,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModuleDecl {
    name: String,
    source: String,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    variables: toml::Table,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OutputDecl {
    value: toml::Value,
    #[serde(default)]
    description: Option<String>,
}

/// A `depends_on` entry and the module it was written in.
#[derive(Debug, Clone)]
struct Reference {
    raw: String,
    module: String,
}

struct Loader {
    resources: Vec<Resource>,
    references: Vec<Vec<Reference>>,
    blueprint: Option<Value>,
    errors: Vec<SchemaError>,
}

/// Scope a module is loaded in.
struct Scope<'a> {
    module: &'a str,
    supplied: VariableSet,
    inherited: Vec<Reference>,
    disabled: bool,
    depth: usize,
}

/// Parse a blueprint file or directory.
///
/// `on_processed` is invoked once per resource, in topological order, after
/// `process()` succeeded for it.
pub fn parse_blueprint(
    path: &Path,
    options: &ParseOptions,
    catalog: &dyn TypeCatalog,
    committed: &Config,
    on_processed: &mut dyn FnMut(&Resource),
) -> ParseOutcome {
    let mut supplied = options.env.clone();
    if let Some(file) = &options.variables_file {
        match VariableSet::load_file(file) {
            Ok(v) => supplied.merge(&v),
            Err(e) => return ParseOutcome::failed(e),
        }
    }
    supplied.merge(&options.variables);

    let mut loader = Loader {
        resources: Vec::new(),
        references: Vec::new(),
        blueprint: None,
        errors: Vec::new(),
    };
    let root = Scope {
        module: "",
        supplied,
        inherited: Vec::new(),
        disabled: false,
        depth: 0,
    };
    if let Err(e) = loader.load(path, &root) {
        return ParseOutcome::failed(e);
    }

    let Loader {
        resources,
        references,
        blueprint,
        mut errors,
    } = loader;

    let mut declared = Config::new();
    declared.set_blueprint(blueprint);
    let mut resolved_refs = Vec::with_capacity(resources.len());
    for (r, refs) in resources.into_iter().zip(references) {
        match declared.append(r) {
            Ok(()) => resolved_refs.push(refs),
            Err(e) => errors.push(e),
        }
    }

    resolve_references(&mut declared, &resolved_refs, &mut errors);

    let graph = match DependencyGraph::build(&declared) {
        Ok(g) => g,
        Err(e) => {
            errors.push(e);
            return ParseOutcome {
                config: declared,
                error: SchemaError::collect(errors),
            };
        }
    };

    let mut config = Config::new();
    config.set_blueprint(declared.blueprint().cloned());
    for id in graph.topological_order() {
        let Some(declared_resource) = declared.get(id) else {
            continue;
        };
        let mut r = declared_resource.clone();

        if !catalog.contains(r.kind()) {
            errors.push(SchemaError::UnknownType {
                id: r.id().clone(),
                kind: r.kind().to_owned(),
            });
            continue;
        }

        r.meta.checksum.parsed = compute_checksum(&r);
        if let Err(e) = catalog.process(&mut r, committed.get(id)) {
            errors.push(e);
            continue;
        }
        r.meta.checksum.processed = compute_checksum(&r);

        on_processed(&r);
        config.upsert(r);
    }

    debug!(
        "parsed {} resources from {}",
        config.len(),
        path.display()
    );

    ParseOutcome {
        config,
        error: SchemaError::collect(errors),
    }
}

impl Loader {
    fn load(&mut self, path: &Path, scope: &Scope<'_>) -> Result<(), SchemaError> {
        if scope.depth > MAX_MODULE_DEPTH {
            return Err(SchemaError::InvalidResource {
                id: ResourceId::build(scope.module, TYPE_MODULE, ""),
                reason: format!("modules nested deeper than {MAX_MODULE_DEPTH} levels"),
            });
        }

        let files = blueprint_files(path)?;
        let mut parsed = Vec::with_capacity(files.len());
        for file in files {
            let content = fs::read_to_string(&file).map_err(|source| SchemaError::Io {
                path: file.clone(),
                source,
            })?;
            let bp: BlueprintFile =
                toml::from_str(&content).map_err(|source| SchemaError::ParseToml {
                    path: file.clone(),
                    source,
                })?;
            parsed.push((file, bp));
        }

        // Variables are module-scoped across all files of the module.
        let mut vars = VariableSet::new();
        for (_, bp) in &parsed {
            for (name, decl) in &bp.variable {
                if let Some(default) = &decl.default {
                    vars.set(name, serde_json::to_value(default)?);
                }
            }
        }
        vars.merge(&scope.supplied);

        for (file, bp) in parsed {
            let file_str = file.to_string_lossy().into_owned();

            if scope.module.is_empty() {
                if let Some(meta) = bp.blueprint {
                    self.blueprint = Some(serde_json::to_value(meta)?);
                }
            }

            for (name, decl) in &bp.variable {
                let mut r = Resource::new(scope.module, TYPE_VARIABLE, name);
                r.meta.file.clone_from(&file_str);
                r.fields.insert(
                    "value".to_owned(),
                    vars.get(name).cloned().unwrap_or(Value::Null),
                );
                if let Some(d) = &decl.description {
                    r.fields
                        .insert("description".to_owned(), Value::String(d.clone()));
                }
                self.push(r, Vec::new(), scope);
            }

            for decl in bp.resource {
                if let Err(e) = validate_name(&decl.name, scope.module, &decl.kind) {
                    self.errors.push(e);
                    continue;
                }
                let mut r = Resource::new(scope.module, &decl.kind, &decl.name);
                if decl.kind == TYPE_IMAGE_CACHE {
                    self.errors.push(SchemaError::InvalidResource {
                        id: r.id().clone(),
                        reason: "image_cache is managed by the engine and cannot be declared"
                            .to_owned(),
                    });
                    continue;
                }
                r.meta.file.clone_from(&file_str);
                r.meta.disabled = decl.disabled;
                let fields = serde_json::to_value(decl.fields)?;
                match vars.interpolate(&fields, r.id()) {
                    Ok(Value::Object(map)) => r.fields = map,
                    Ok(_) => {}
                    Err(e) => {
                        self.errors.push(e);
                        continue;
                    }
                }
                self.push(r, references(&decl.depends_on, scope.module), scope);
            }

            for (name, decl) in &bp.output {
                let mut r = Resource::new(scope.module, TYPE_OUTPUT, name);
                r.meta.file.clone_from(&file_str);
                match vars.interpolate(&serde_json::to_value(&decl.value)?, r.id()) {
                    Ok(v) => {
                        r.fields.insert("value".to_owned(), v);
                    }
                    Err(e) => {
                        self.errors.push(e);
                        continue;
                    }
                }
                if let Some(d) = &decl.description {
                    r.fields
                        .insert("description".to_owned(), Value::String(d.clone()));
                }
                self.push(r, Vec::new(), scope);
            }

            for decl in bp.module {
                self.load_module(&file, decl, &vars, scope)?;
            }
        }

        Ok(())
    }

    fn load_module(
        &mut self,
        file: &Path,
        decl: ModuleDecl,
        vars: &VariableSet,
        scope: &Scope<'_>,
    ) -> Result<(), SchemaError> {
        if let Err(e) = validate_name(&decl.name, scope.module, TYPE_MODULE) {
            self.errors.push(e);
            return Ok(());
        }
        let base = file.parent().unwrap_or(Path::new("."));
        let source = base.join(&decl.source);

        let mut r = Resource::new(scope.module, TYPE_MODULE, &decl.name);
        r.meta.file = file.to_string_lossy().into_owned();
        r.meta.disabled = scope.disabled || decl.disabled;
        r.fields.insert(
            "source".to_owned(),
            Value::String(source.to_string_lossy().into_owned()),
        );
        let module_refs = references(&decl.depends_on, scope.module);
        self.push(r.clone(), module_refs.clone(), scope);

        let mut supplied = VariableSet::new();
        for (k, v) in decl.variables {
            match vars.interpolate(&serde_json::to_value(v)?, r.id()) {
                Ok(value) => supplied.set(&k, value),
                Err(e) => self.errors.push(e),
            }
        }

        let child_module = if scope.module.is_empty() {
            decl.name.clone()
        } else {
            format!("{}.{}", scope.module, decl.name)
        };
        let mut inherited = scope.inherited.clone();
        inherited.extend(module_refs);

        let child = Scope {
            module: &child_module,
            supplied,
            inherited,
            disabled: r.meta.disabled,
            depth: scope.depth + 1,
        };
        self.load(&source, &child)
    }

    fn push(&mut self, mut resource: Resource, mut refs: Vec<Reference>, scope: &Scope<'_>) {
        if scope.disabled {
            resource.meta.disabled = true;
        }
        refs.extend(scope.inherited.iter().cloned());
        self.resources.push(resource);
        self.references.push(refs);
    }
}

fn references(raw: &[String], module: &str) -> Vec<Reference> {
    raw.iter()
        .map(|r| Reference {
            raw: r.trim().to_owned(),
            module: module.to_owned(),
        })
        .collect()
}

fn blueprint_files(path: &Path) -> Result<Vec<PathBuf>, SchemaError> {
    let io_err = |source: std::io::Error| SchemaError::Io {
        path: path.to_path_buf(),
        source,
    };
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().map_err(io_err)?.join(path)
    };

    if abs.is_file() {
        return Ok(vec![abs]);
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(&abs).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let p = entry.path();
        if p.is_file() && p.extension().is_some_and(|e| e == "toml") {
            files.push(p);
        }
    }
    files.sort();
    if files.is_empty() {
        return Err(SchemaError::EmptyBlueprint(abs));
    }
    Ok(files)
}

fn validate_name(name: &str, module: &str, kind: &str) -> Result<(), SchemaError> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(SchemaError::InvalidResource {
            id: ResourceId::build(module, kind, name),
            reason: "name must be 1-128 characters matching [a-zA-Z0-9_-]".to_owned(),
        })
    }
}

/// Expand `depends_on` entries into fully-qualified ids.
///
/// Accepted forms, relative to the module the entry was written in:
/// `<type>.<name>`, `resource.<type>.<name>`, `module.<name>` (every resource
/// of that module), and absolute `module.<m>...resource.<type>.<name>`.
fn resolve_references(
    config: &mut Config,
    references: &[Vec<Reference>],
    errors: &mut Vec<SchemaError>,
) {
    let mut members: HashMap<String, Vec<ResourceId>> = HashMap::new();
    for r in config.iter() {
        let module = &r.meta.module;
        if module.is_empty() {
            continue;
        }
        let segments: Vec<&str> = module.split('.').collect();
        for n in 1..=segments.len() {
            members
                .entry(segments[..n].join("."))
                .or_default()
                .push(r.id().clone());
        }
    }
    let known: HashSet<ResourceId> = config.ids().cloned().collect();

    for (r, refs) in config.iter_mut().zip(references) {
        let mut deps: Vec<ResourceId> = Vec::new();
        for reference in refs {
            match expand(reference, &members, &known) {
                Some(ids) => {
                    for id in ids {
                        if id != *r.id() && !deps.contains(&id) {
                            deps.push(id);
                        }
                    }
                }
                None => errors.push(SchemaError::UnresolvedReference {
                    id: r.id().clone(),
                    reference: reference.raw.clone(),
                }),
            }
        }
        r.meta.depends_on = deps;
    }
}

fn expand(
    reference: &Reference,
    members: &HashMap<String, Vec<ResourceId>>,
    known: &HashSet<ResourceId>,
) -> Option<Vec<ResourceId>> {
    let raw = reference.raw.as_str();
    let prefix = module_prefix(&reference.module);

    if raw.starts_with("module.") && raw.contains(".resource.") {
        let id = ResourceId::new(raw);
        return known.contains(&id).then(|| vec![id]);
    }

    if let Some(name) = raw.strip_prefix("module.") {
        let path = if reference.module.is_empty() {
            name.to_owned()
        } else {
            format!("{}.{name}", reference.module)
        };
        return members.get(&path).filter(|m| !m.is_empty()).cloned();
    }

    let local = raw.strip_prefix("resource.").unwrap_or(raw);
    let id = ResourceId::new(format!("{prefix}resource.{local}"));
    known.contains(&id).then(|| vec![id])
}
