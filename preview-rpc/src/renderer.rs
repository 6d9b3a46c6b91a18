//! Render entry point abstraction.
//!
//! The worker never knows how frames are produced. Each classpath update hands
//! the new module roots to a [`RendererLoader`], which resolves a fresh
//! [`Renderer`] scoped to exactly those roots.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

/// Well-known name of the render entry executable.
pub const RENDER_ENTRY: &str = "preview-render";

/// Environment variable carrying the module roots to a render process.
pub const CLASSPATH_ENV: &str = "PREVIEW_CLASSPATH";

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("render entry point '{entry}' not found in {roots:?}")]
    EntryPointNotFound { entry: String, roots: Vec<PathBuf> },

    #[error("invalid classpath payload: {0}")]
    InvalidClasspath(String),

    #[error("failed to run render entry point: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("rendering '{target}' failed: {message}")]
    Failed { target: String, message: String },
}

/// Produces a pixel buffer for a render target.
///
/// Channel order and stride are agreed between the renderer and whoever
/// displays the frame; this crate treats the buffer as opaque bytes.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, target: &str, width: u32, height: u32) -> Result<Vec<u8>, RenderError>;
}

pub trait RendererLoader: Send + Sync {
    fn load(&self, roots: &[PathBuf]) -> Result<Arc<dyn Renderer>, RenderError>;
}

/// Splits a classpath payload on the platform path-list separator.
pub fn parse_classpath(payload: &[u8]) -> Result<Vec<PathBuf>, RenderError> {
    let classpath =
        std::str::from_utf8(payload).map_err(|e| RenderError::InvalidClasspath(e.to_string()))?;
    Ok(std::env::split_paths(classpath)
        .filter(|entry| !entry.as_os_str().is_empty())
        .collect())
}

/// Loads the render entry point as an executable found on the classpath.
#[derive(Debug, Clone)]
pub struct ExecutableLoader {
    entry: String,
}

impl Default for ExecutableLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutableLoader {
    pub fn new() -> Self {
        Self {
            entry: RENDER_ENTRY.to_string(),
        }
    }

    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = entry.into();
        self
    }

    fn find_entry(&self, root: &Path) -> Option<PathBuf> {
        if root.is_dir() {
            let candidate = root.join(&self.entry);
            return candidate.is_file().then_some(candidate);
        }
        let named_entry = root.file_name().is_some_and(|name| name == self.entry.as_str());
        (named_entry && root.is_file()).then(|| root.to_path_buf())
    }
}

impl RendererLoader for ExecutableLoader {
    fn load(&self, roots: &[PathBuf]) -> Result<Arc<dyn Renderer>, RenderError> {
        let roots = roots
            .iter()
            .map(std::path::absolute)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RenderError::InvalidClasspath(e.to_string()))?;

        let program = roots
            .iter()
            .find_map(|root| self.find_entry(root))
            .ok_or_else(|| RenderError::EntryPointNotFound {
                entry: self.entry.clone(),
                roots: roots.clone(),
            })?;

        let classpath = std::env::join_paths(&roots)
            .map_err(|e| RenderError::InvalidClasspath(e.to_string()))?;

        tracing::debug!(program = %program.display(), num_roots = roots.len(), "Loaded render entry point");
        Ok(Arc::new(ExecutableRenderer { program, classpath }))
    }
}

/// Runs `<entry> <target> <width> <height>` and takes stdout as the pixel buffer.
pub struct ExecutableRenderer {
    program: PathBuf,
    classpath: OsString,
}

impl fmt::Debug for ExecutableRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableRenderer")
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Renderer for ExecutableRenderer {
    async fn render(&self, target: &str, width: u32, height: u32) -> Result<Vec<u8>, RenderError> {
        tracing::trace!(
            program = %self.program.display(),
            preview = target,
            width,
            height,
            "Running render entry point"
        );
        let output = Command::new(&self.program)
            .arg(target)
            .arg(width.to_string())
            .arg(height.to_string())
            .env(CLASSPATH_ENV, &self.classpath)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(RenderError::Failed {
                target: target.to_string(),
                message: format!("render entry point exited with {}", output.status),
            });
        }
        Ok(output.stdout)
    }
}

/// Adapts a closure into a [`Renderer`].
pub struct FnRenderer<F>(pub F);

#[async_trait]
impl<F> Renderer for FnRenderer<F>
where
    F: Fn(&str, u32, u32) -> Result<Vec<u8>, RenderError> + Send + Sync,
{
    async fn render(&self, target: &str, width: u32, height: u32) -> Result<Vec<u8>, RenderError> {
        (self.0)(target, width, height)
    }
}

/// Hands out one explicitly registered renderer for every classpath.
#[derive(Clone)]
pub struct StaticLoader {
    renderer: Arc<dyn Renderer>,
}

impl StaticLoader {
    pub fn new(renderer: Arc<dyn Renderer>) -> Self {
        Self { renderer }
    }
}

impl RendererLoader for StaticLoader {
    fn load(&self, roots: &[PathBuf]) -> Result<Arc<dyn Renderer>, RenderError> {
        tracing::debug!(?roots, "Using registered renderer");
        Ok(Arc::clone(&self.renderer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_classpath_splits_on_platform_separator() {
        let joined = std::env::join_paths(["/a/lib.jar", "/b/classes"]).unwrap();
        let payload = joined.to_str().unwrap().as_bytes().to_vec();
        assert_eq!(
            parse_classpath(&payload).unwrap(),
            vec![PathBuf::from("/a/lib.jar"), PathBuf::from("/b/classes")]
        );
    }

    #[test]
    fn parse_classpath_drops_empty_entries() {
        assert!(parse_classpath(b"").unwrap().is_empty());
    }

    #[test]
    fn parse_classpath_rejects_invalid_utf8() {
        assert!(matches!(
            parse_classpath(&[0xff, 0xfe]),
            Err(RenderError::InvalidClasspath(_))
        ));
    }

    #[test]
    fn executable_loader_reports_missing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let Err(err) = ExecutableLoader::new().load(&[dir.path().to_path_buf()]) else {
            panic!("render entry point unexpectedly found");
        };
        match err {
            RenderError::EntryPointNotFound { entry, roots } => {
                assert_eq!(entry, RENDER_ENTRY);
                assert_eq!(roots, vec![dir.path().to_path_buf()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn static_loader_returns_registered_renderer() {
        let renderer = Arc::new(FnRenderer(
            |target: &str, width: u32, height: u32| -> Result<Vec<u8>, RenderError> {
                Ok(format!("{target}:{width}x{height}").into_bytes())
            },
        ));
        let loader = StaticLoader::new(renderer);

        let loaded = loader.load(&[]).unwrap();
        assert_eq!(loaded.render("com.Foo", 3, 4).await.unwrap(), b"com.Foo:3x4");
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn executable_renderer_returns_stdout() {
        let empty = tempfile::tempdir().unwrap();
        let plugin = tempfile::tempdir().unwrap();
        write_script(
            plugin.path(),
            RENDER_ENTRY,
            r#"printf '%s %s %s' "$1" "$2" "$3""#,
        );

        let loader = ExecutableLoader::new();
        let renderer = loader
            .load(&[empty.path().to_path_buf(), plugin.path().to_path_buf()])
            .unwrap();

        let pixels = renderer.render("com.Foo", 100, 50).await.unwrap();
        assert_eq!(pixels, b"com.Foo 100 50");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn executable_root_may_be_the_entry_itself() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "custom-render", r#"printf '%s' "$PREVIEW_CLASSPATH""#);

        let loader = ExecutableLoader::new().with_entry("custom-render");
        let renderer = loader.load(std::slice::from_ref(&script)).unwrap();

        let pixels = renderer.render("x", 1, 1).await.unwrap();
        assert_eq!(pixels, script.to_str().unwrap().as_bytes());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn executable_renderer_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), RENDER_ENTRY, "exit 3");

        let renderer = ExecutableLoader::new()
            .load(&[dir.path().to_path_buf()])
            .unwrap();
        assert!(matches!(
            renderer.render("com.Foo", 1, 1).await,
            Err(RenderError::Failed { .. })
        ));
    }
}
