use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::debug;
use uuid::Uuid;

use crate::{EngineError, Result};

/// How much captured stderr a typesetter failure carries.
const STDERR_CAP: usize = 4096;

/// An image staged into the typesetter working directory before the
/// subprocess starts.
#[derive(Debug, Clone)]
pub struct StagedAsset {
    /// Workdir-relative filename the compiled source references.
    pub file_name: String,
    /// Where the bytes currently live (image cache or placeholder).
    pub source_path: PathBuf,
}

/// Adapter around the external typesetter binary. Spawns one short-lived
/// subprocess per render, feeds the source through a temporary working
/// directory and captures the PDF from stdout. Never retries; retry
/// policy belongs to the caller.
pub struct Typesetter {
    bin_path: String,
    font_dirs: Vec<String>,
}

impl Typesetter {
    pub fn new(bin_path: impl Into<String>, font_dirs: Vec<String>) -> Self {
        Self {
            bin_path: bin_path.into(),
            font_dirs,
        }
    }

    /// Startup preflight: verifies the binary exists and answers
    /// `--version`. Failing this keeps the request path from ever
    /// reaching the adapter.
    pub fn probe(&self) -> Result<String> {
        let output = std::process::Command::new(&self.bin_path)
            .arg("--version")
            .output()
            .map_err(|e| {
                EngineError::TypesetterMissing(format!(
                    "`{} --version` could not run ({e}); install the typesetter or point \
                     typesetter.bin_path at it",
                    self.bin_path
                ))
            })?;
        if !output.status.success() {
            return Err(EngineError::TypesetterMissing(format!(
                "`{} --version` exited with {}",
                self.bin_path, output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Renders `source` to PDF bytes plus a page count. The subprocess
    /// is killed when `timeout` elapses; non-zero exits surface the
    /// first bytes of stderr.
    pub async fn render(
        &self,
        source: &str,
        assets: &[StagedAsset],
        timeout: Duration,
    ) -> Result<(Vec<u8>, usize)> {
        let workdir = Workdir::create()?;
        let main = workdir.path().join("main.typ");
        tokio::fs::write(&main, source).await?;
        for asset in assets {
            tokio::fs::copy(&asset.source_path, workdir.path().join(&asset.file_name)).await?;
        }

        let mut command = tokio::process::Command::new(&self.bin_path);
        command
            .arg("compile")
            .arg("main.typ")
            .arg("-")
            .current_dir(workdir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for dir in &self.font_dirs {
            command.arg("--font-path").arg(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            EngineError::TypesetterMissing(format!("failed to spawn `{}`: {e}", self.bin_path))
        })?;

        let mut stdout = child.stdout.take().ok_or_else(|| {
            EngineError::Internal("typesetter stdout not captured".to_string())
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| {
            EngineError::Internal("typesetter stderr not captured".to_string())
        })?;

        let run = async {
            let mut pdf = Vec::new();
            let mut err = Vec::new();
            let (out_read, err_read, status) = tokio::join!(
                stdout.read_to_end(&mut pdf),
                stderr.read_to_end(&mut err),
                child.wait(),
            );
            out_read?;
            err_read?;
            Ok::<_, std::io::Error>((pdf, err, status?))
        };

        let (pdf, err, status) = match tokio::time::timeout(timeout, run).await {
            Ok(done) => done?,
            Err(_) => {
                child.start_kill().ok();
                let _ = child.wait().await;
                return Err(EngineError::TypesetterTimeout);
            }
        };

        if !status.success() {
            let cap = err.len().min(STDERR_CAP);
            return Err(EngineError::Typesetter(
                String::from_utf8_lossy(&err[..cap]).to_string(),
            ));
        }
        let pages = page_count(&pdf)?;
        debug!(bytes = pdf.len(), pages, "typesetter produced pdf");
        Ok((pdf, pages))
    }
}

/// Counts pages of the produced PDF for the response metadata.
fn page_count(pdf: &[u8]) -> Result<usize> {
    let doc = lopdf::Document::load_mem(pdf)
        .map_err(|e| EngineError::Typesetter(format!("unparseable pdf output: {e}")))?;
    Ok(doc.get_pages().len())
}

/// Temporary working directory removed on every exit path.
struct Workdir {
    path: PathBuf,
}

impl Workdir {
    fn create() -> Result<Self> {
        let path = std::env::temp_dir().join(format!("docsmith-render-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Workdir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    /// Writes a stub typesetter script that emits a fixture PDF on
    /// stdout, mirroring the real binary's `compile main.typ -` contract.
    fn fake_typesetter(dir: &Path, behavior: &str) -> PathBuf {
        let pdf_path = dir.join("fixture.pdf");
        let mut doc = lopdf::Document::with_version("1.4");
        let pages_id = doc.new_object_id();
        let page_id = doc.add_object(lopdf::dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        });
        doc.objects.insert(
            pages_id,
            lopdf::Object::Dictionary(lopdf::dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
            }),
        );
        let catalog_id = doc.add_object(lopdf::dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc.save(&pdf_path).unwrap();

        let script = dir.join("typesetter.sh");
        let body = match behavior {
            "ok" => format!("#!/bin/sh\nif [ \"$1\" = --version ]; then echo stub 0.1; exit 0; fi\ncat {}\n", pdf_path.display()),
            "fail" => "#!/bin/sh\nif [ \"$1\" = --version ]; then echo stub 0.1; exit 0; fi\necho 'layout error: missing glyph' >&2\nexit 1\n".to_string(),
            "hang" => "#!/bin/sh\nif [ \"$1\" = --version ]; then echo stub 0.1; exit 0; fi\nsleep 30\n".to_string(),
            _ => unreachable!(),
        };
        let mut file = std::fs::File::create(&script).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();
        script
    }

    #[test]
    fn probe_reports_missing_binary() {
        let ts = Typesetter::new("definitely-not-a-typesetter-xyz", Vec::new());
        let err = ts.probe().unwrap_err();
        match err {
            EngineError::TypesetterMissing(msg) => assert!(msg.contains("bin_path")),
            other => panic!("expected TypesetterMissing, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn renders_pdf_and_counts_pages() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_typesetter(dir.path(), "ok");
        let ts = Typesetter::new(bin.to_string_lossy(), Vec::new());
        ts.probe().unwrap();

        let (pdf, pages) = ts
            .render("= Hello", &[], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(pdf.starts_with(b"%PDF"));
        assert_eq!(pages, 1);
    }

    #[tokio::test]
    async fn nonzero_exit_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_typesetter(dir.path(), "fail");
        let ts = Typesetter::new(bin.to_string_lossy(), Vec::new());
        let err = ts.render("= x", &[], Duration::from_secs(5)).await.unwrap_err();
        match err {
            EngineError::Typesetter(msg) => assert!(msg.contains("missing glyph")),
            other => panic!("expected Typesetter, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hanging_subprocess_is_killed_on_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_typesetter(dir.path(), "hang");
        let ts = Typesetter::new(bin.to_string_lossy(), Vec::new());
        let started = std::time::Instant::now();
        let err = ts
            .render("= x", &[], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TypesetterTimeout));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn assets_are_staged_into_the_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_typesetter(dir.path(), "ok");
        let asset_src = dir.path().join("logo.png");
        std::fs::write(&asset_src, crate::render::images::PLACEHOLDER_PNG).unwrap();

        let ts = Typesetter::new(bin.to_string_lossy(), Vec::new());
        let assets = vec![StagedAsset {
            file_name: "img-abc.png".to_string(),
            source_path: asset_src,
        }];
        ts.render("#image(\"img-abc.png\")", &assets, Duration::from_secs(5))
            .await
            .unwrap();
    }
}
