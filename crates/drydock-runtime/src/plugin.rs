//! Plugin loading.
//!
//! In-process plugins implement [`Plugin`]. Out-of-process plugins are
//! executables in the plugins directory speaking a JSON protocol over stdio:
//!
//! * `<plugin> describe` prints `{"name": ..., "types": [{"type": ..., "path_fields": [...]}]}`
//! * `<plugin> <op>` for `create|destroy|refresh|changed|lookup` reads
//!   `{"resource": ..., "force": bool}` on stdin and prints
//!   `{"resource"?, "changed"?, "ids"?, "error"?: {"message", "retryable"}}`.
//!
//! The child sees `DRYDOCK_STATE_FILE` and `LOG_LEVEL` in its environment and
//! is killed if the operation is cancelled.

use crate::builtin::GenericType;
use crate::provider::{factory, Provider, ProviderFactory, ResourceType};
use crate::registry::Registry;
use crate::{PluginError, ProviderError};
use async_trait::async_trait;
use drydock_schema::{Config, Resource};
use drydock_store::StateStore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const STATE_FILE_ENV: &str = "DRYDOCK_STATE_FILE";

/// Handle given to a plugin while it registers its types.
pub struct PluginContext<'a> {
    plugin: String,
    registry: &'a mut Registry,
    state_file: PathBuf,
}

impl<'a> PluginContext<'a> {
    pub fn new(plugin: &str, registry: &'a mut Registry, state_file: PathBuf) -> Self {
        Self {
            plugin: plugin.to_owned(),
            registry,
            state_file,
        }
    }

    pub fn register(
        &mut self,
        kind: &str,
        prototype: Arc<dyn ResourceType>,
        factory: ProviderFactory,
    ) -> Result<(), PluginError> {
        self.registry
            .register(kind, prototype, factory)
            .map_err(|source| PluginError::Registration {
                plugin: self.plugin.clone(),
                source,
            })
    }

    /// The committed state, empty if none has been saved yet.
    pub fn load_state(&self) -> Config {
        StateStore::at(&self.state_file).load_or_empty()
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }
}

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn register(&self, ctx: &mut PluginContext<'_>) -> Result<(), PluginError>;
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct Description {
    name: String,
    #[serde(default)]
    types: Vec<TypeDescription>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct TypeDescription {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    path_fields: Vec<String>,
}

#[derive(Serialize)]
struct Request<'a> {
    resource: &'a Resource,
    force: bool,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    resource: Option<Resource>,
    #[serde(default)]
    changed: Option<bool>,
    #[serde(default)]
    ids: Option<Vec<String>>,
    #[serde(default)]
    error: Option<ResponseError>,
}

#[derive(Debug, Deserialize)]
struct ResponseError {
    message: String,
    #[serde(default)]
    retryable: bool,
}

/// An executable plugin, described but not yet registered.
#[derive(Debug, Clone)]
pub struct ExecPlugin {
    path: PathBuf,
    description: Description,
}

impl ExecPlugin {
    /// Run `<path> describe` and parse the answer.
    pub fn describe(path: &Path) -> Result<Self, PluginError> {
        let output = std::process::Command::new(path)
            .arg("describe")
            .stdin(Stdio::null())
            .output()
            .map_err(|source| PluginError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        if !output.status.success() {
            return Err(PluginError::Describe {
                path: path.to_path_buf(),
                reason: format!(
                    "exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        let description: Description =
            serde_json::from_slice(&output.stdout).map_err(|e| PluginError::Describe {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if description.types.is_empty() {
            return Err(PluginError::Describe {
                path: path.to_path_buf(),
                reason: "plugin declares no types".to_owned(),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            description,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn types(&self) -> Vec<&str> {
        self.description
            .types
            .iter()
            .map(|t| t.kind.as_str())
            .collect()
    }
}

impl Plugin for ExecPlugin {
    fn name(&self) -> &str {
        &self.description.name
    }

    fn register(&self, ctx: &mut PluginContext<'_>) -> Result<(), PluginError> {
        let program = Arc::new(self.path.clone());
        let state_file = Arc::new(ctx.state_file().to_path_buf());
        for t in &self.description.types {
            let program = Arc::clone(&program);
            let state_file = Arc::clone(&state_file);
            ctx.register(
                &t.kind,
                Arc::new(GenericType::new(&t.path_fields)),
                factory(move |_| {
                    Ok(Box::new(ExecProvider {
                        program: Arc::clone(&program),
                        state_file: Arc::clone(&state_file),
                    }))
                }),
            )?;
        }
        Ok(())
    }
}

struct ExecProvider {
    program: Arc<PathBuf>,
    state_file: Arc<PathBuf>,
}

impl ExecProvider {
    async fn invoke(
        &self,
        op: &str,
        resource: &Resource,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<Response, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        let request = serde_json::to_vec(&Request { resource, force })
            .map_err(|e| ProviderError::Fatal(format!("encode request: {e}")))?;

        let mut child = tokio::process::Command::new(self.program.as_path())
            .arg(op)
            .env(STATE_FILE_ENV, self.state_file.as_path())
            .env(
                "LOG_LEVEL",
                std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned()),
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProviderError::Fatal(format!("spawn {}: {e}", self.program.display()))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&request)
                .await
                .map_err(|e| ProviderError::Fatal(format!("write plugin stdin: {e}")))?;
        }

        let output = tokio::select! {
            out = child.wait_with_output() => out
                .map_err(|e| ProviderError::Fatal(format!("wait for plugin: {e}")))?,
            () = cancel.cancelled() => return Err(ProviderError::Cancelled),
        };

        let response: Option<Response> = serde_json::from_slice(&output.stdout).ok();
        match response {
            Some(Response {
                error: Some(err), ..
            }) => Err(if err.retryable {
                ProviderError::Retryable(err.message)
            } else {
                ProviderError::Fatal(err.message)
            }),
            Some(r) if output.status.success() => Ok(r),
            _ => Err(ProviderError::Fatal(format!(
                "plugin {} {op} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }

    fn apply_outputs(resource: &mut Resource, response: Response) {
        if let Some(updated) = response.resource {
            resource.fields = updated.fields;
            for (k, v) in updated.meta.properties {
                resource.meta.properties.insert(k, v);
            }
        }
    }
}

#[async_trait]
impl Provider for ExecProvider {
    async fn create(
        &self,
        resource: &mut Resource,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let response = self.invoke("create", resource, false, cancel).await?;
        Self::apply_outputs(resource, response);
        Ok(())
    }

    async fn destroy(
        &self,
        resource: &mut Resource,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let response = self.invoke("destroy", resource, force, cancel).await?;
        Self::apply_outputs(resource, response);
        Ok(())
    }

    async fn refresh(
        &self,
        resource: &mut Resource,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let response = self.invoke("refresh", resource, false, cancel).await?;
        Self::apply_outputs(resource, response);
        Ok(())
    }

    async fn changed(&self, resource: &Resource) -> Result<bool, ProviderError> {
        let cancel = CancellationToken::new();
        let response = self
            .invoke("changed", resource, false, &cancel)
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;
        Ok(response.changed.unwrap_or(false))
    }

    async fn lookup(&self, resource: &Resource) -> Result<Vec<String>, ProviderError> {
        let cancel = CancellationToken::new();
        let response = self
            .invoke("lookup", resource, false, &cancel)
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;
        Ok(response.ids.unwrap_or_default())
    }
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

/// Load every executable in `dir` as a plugin and register its types.
///
/// A missing directory means no plugins. Any plugin that fails to describe
/// itself or to register is a fatal error. Returns the loaded plugin names.
pub fn load_plugins(
    dir: &Path,
    registry: &mut Registry,
    state_file: &Path,
) -> Result<Vec<String>, PluginError> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("no plugins directory at {}", dir.display());
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(PluginError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| PluginError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden || !is_executable(&path) {
            debug!("skipping non-plugin entry {}", path.display());
            continue;
        }
        paths.push(path);
    }
    paths.sort();

    let mut loaded = Vec::with_capacity(paths.len());
    for path in paths {
        let plugin = ExecPlugin::describe(&path)?;
        register_plugin(&plugin, registry, state_file)?;
        loaded.push(plugin.name().to_owned());
    }
    Ok(loaded)
}

/// Register a single plugin against `registry`.
pub fn register_plugin(
    plugin: &dyn Plugin,
    registry: &mut Registry,
    state_file: &Path,
) -> Result<(), PluginError> {
    let mut ctx = PluginContext::new(plugin.name(), registry, state_file.to_path_buf());
    plugin.register(&mut ctx)?;
    info!("loaded plugin '{}'", plugin.name());
    Ok(())
}
