use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;

use crate::auth::Identity;
use crate::content::Node;
use crate::injectable::{InjectableValue, WorkspaceInjectable};
use crate::render::RenderOutput;
use crate::render::admission::AdmissionController;
use crate::render::cache::{CacheKey, CompiledTemplateCache};
use crate::render::compile::{build_prelude, compile_skeleton};
use crate::render::images::{ImageCache, PLACEHOLDER_FILE, staged_name};
use crate::render::typesetter::{StagedAsset, Typesetter};
use crate::resolver::context::RequestIdentifiers;
use crate::resolver::{InjectorResolver, ResolverInputs};
use crate::template::{Template, TemplateVersion};
use crate::{EngineError, Result};

/// One render request, already resolved to a template and version by the
/// HTTP layer.
pub struct RenderJob<'a> {
    pub template: &'a Template,
    pub version: &'a TemplateVersion,
    pub classification_code: Option<String>,
    pub locale: String,
    /// Preview renders accept DRAFT and SCHEDULED states.
    pub preview: bool,
    pub supplied: HashMap<String, serde_json::Value>,
    pub raw_body: Option<serde_json::Value>,
    pub headers: HashMap<String, String>,
    pub selected_formats: HashMap<String, String>,
    pub identity: Option<Identity>,
    pub tenant_code: Option<String>,
    pub workspace_code: Option<String>,
    pub workspace_definitions: Vec<WorkspaceInjectable>,
}

/// Orchestrates admission, resolution, compilation, image staging and
/// the typesetter into a PDF response.
pub struct RenderPipeline {
    admission: AdmissionController,
    resolver: Arc<InjectorResolver>,
    cache: CompiledTemplateCache,
    images: Arc<ImageCache>,
    typesetter: Arc<Typesetter>,
    acquire_timeout: Duration,
    typeset_timeout: Duration,
    request_timeout: Duration,
}

impl RenderPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        admission: AdmissionController,
        resolver: Arc<InjectorResolver>,
        cache: CompiledTemplateCache,
        images: Arc<ImageCache>,
        typesetter: Arc<Typesetter>,
        acquire_timeout: Duration,
        typeset_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            admission,
            resolver,
            cache,
            images,
            typesetter,
            acquire_timeout,
            typeset_timeout,
            request_timeout,
        }
    }

    /// Drops cached compiled sources of a republished version.
    pub fn invalidate_version(&self, version_id: Uuid) {
        self.cache.invalidate_version(version_id);
    }

    pub async fn render(&self, job: RenderJob<'_>) -> Result<RenderOutput> {
        // The slot is held for the whole render and released on every
        // exit path by RAII.
        let _slot = self.admission.acquire(self.acquire_timeout).await?;

        let renderable = if job.preview {
            job.version.state.renderable_in_preview()
        } else {
            job.version.state.renderable_in_production()
        };
        if !renderable {
            return Err(EngineError::Validation(format!(
                "version in state {} is not renderable here",
                job.version.state
            )));
        }
        let content = job
            .version
            .content
            .as_ref()
            .ok_or(EngineError::EmptyContent)?;

        let requested = content
            .injector_refs()
            .into_iter()
            .map(|r| r.code)
            .collect();
        let deadline = Instant::now() + self.request_timeout;
        let resolved = self
            .resolver
            .resolve(ResolverInputs {
                requested,
                supplied: job.supplied,
                raw_body: job.raw_body,
                headers: job.headers,
                selected_formats: job.selected_formats.clone(),
                identifiers: RequestIdentifiers {
                    external_id: None,
                    template_id: Some(job.template.id),
                    transactional_id: None,
                    operation: job.classification_code.clone(),
                },
                identity: job.identity,
                tenant_code: job.tenant_code,
                workspace_code: job.workspace_code,
                locale: job.locale.clone(),
                workspace_definitions: &job.workspace_definitions,
                deadline,
            })
            .await?;

        let key = CacheKey {
            version_id: job.version.id,
            content_hash: content.fingerprint(),
            schema_revision: content.schema_revision.clone(),
        };
        let skeleton = self
            .cache
            .get_or_compute(key, async || Ok(compile_skeleton(content)))
            .await?;

        let formats = self.effective_formats(content, &job.selected_formats, &resolved.values);

        // Stage every referenced image; failures already degraded to the
        // placeholder inside the cache.
        let mut assets: Vec<StagedAsset> = Vec::new();
        let mut image_files: HashMap<String, String> = HashMap::new();
        for image in &skeleton.images {
            let path = self.images.fetch(&image.url).await;
            assets.push(StagedAsset {
                file_name: image.file_name.clone(),
                source_path: path,
            });
        }
        for (code, value) in &resolved.values {
            if let InjectableValue::Image(img) = value {
                let file_name = if img.url.is_empty() {
                    PLACEHOLDER_FILE.to_string()
                } else {
                    staged_name(&img.url)
                };
                let path = self.images.fetch(&img.url).await;
                assets.push(StagedAsset {
                    file_name: file_name.clone(),
                    source_path: path,
                });
                image_files.insert(code.clone(), file_name);
            }
        }
        // The placeholder backs any custom image that failed to resolve.
        assets.push(StagedAsset {
            file_name: PLACEHOLDER_FILE.to_string(),
            source_path: self.images.placeholder_path(),
        });
        assets.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        assets.dedup_by(|a, b| a.file_name == b.file_name);

        let prelude = build_prelude(&resolved.values, &formats, &image_files);
        let source = format!("{prelude}\n{}", skeleton.source);
        let (pdf, page_count) = self
            .typesetter
            .render(&source, &assets, self.typeset_timeout)
            .await?;

        let filename = suggested_filename(job.template, job.classification_code.as_deref());
        info!(
            template = %job.template.id,
            version = %job.version.id,
            pages = page_count,
            "render complete"
        );
        Ok(RenderOutput {
            pdf,
            page_count,
            filename,
        })
    }

    /// Effective display format per resolved code: the request's
    /// selection when the injector allows it, else the format attribute
    /// stored on the content node, else the declared default.
    fn effective_formats(
        &self,
        content: &crate::content::ContentStructure,
        selected: &HashMap<String, String>,
        values: &HashMap<String, InjectableValue>,
    ) -> HashMap<String, Option<String>> {
        let mut node_formats: HashMap<String, String> = HashMap::new();
        content.doc.walk("doc", &mut |node, _| {
            if let Node::Injector { attrs } = node {
                if let Some(format) = &attrs.format {
                    node_formats
                        .entry(attrs.variable_id.clone())
                        .or_insert_with(|| format.clone());
                }
            }
        });

        values
            .keys()
            .map(|code| {
                let requested = selected
                    .get(code)
                    .or_else(|| node_formats.get(code))
                    .map(String::as_str);
                let effective = match self.resolver.registry().get(code) {
                    Some(entry) => match &entry.formats {
                        Some(spec) => spec.effective(requested).map(str::to_string),
                        None => None,
                    },
                    None => None,
                };
                (code.clone(), effective)
            })
            .collect()
    }
}

/// `<classification>-<yyyymmdd>.pdf`, falling back to the template slug.
fn suggested_filename(template: &Template, classification_code: Option<&str>) -> String {
    let stem = match classification_code {
        Some(code) => code.to_ascii_lowercase(),
        None => template.filename_slug(),
    };
    format!("{stem}-{}.pdf", Utc::now().format("%Y%m%d"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{ContentStructure, InjectorAttrs};
    use crate::injectable::DataType;
    use crate::registry::{InjectorEntry, InjectorRegistry};
    use crate::template::VersionState;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn fake_typesetter(dir: &Path) -> std::path::PathBuf {
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
        let mut file = std::fs::File::create(&script).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "if [ \"$1\" = --version ]; then echo stub; exit 0; fi").unwrap();
        writeln!(file, "cat {}", pdf_path.display()).unwrap();
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();
        script
    }

    fn registry() -> InjectorRegistry {
        let mut builder = InjectorRegistry::builder();
        builder
            .register(InjectorEntry::external("customer_name", DataType::Text))
            .unwrap();
        builder
            .register(InjectorEntry::internal("date_now", DataType::Time, |_| {
                Box::pin(async { Ok(InjectableValue::Time(Utc::now())) })
            }))
            .unwrap();
        builder.build()
    }

    fn pipeline(dir: &Path, registry: InjectorRegistry) -> RenderPipeline {
        let settings = crate::config::TypesetterSettings {
            image_cache_dir: dir.join("images").to_string_lossy().to_string(),
            ..Default::default()
        };
        RenderPipeline::new(
            AdmissionController::new(2),
            Arc::new(InjectorResolver::new(Arc::new(registry), None, None, None)),
            CompiledTemplateCache::new(16, Duration::from_secs(60)),
            Arc::new(ImageCache::new(&settings).unwrap()),
            Arc::new(Typesetter::new(
                fake_typesetter(dir).to_string_lossy(),
                Vec::new(),
            )),
            Duration::from_secs(1),
            Duration::from_secs(10),
            Duration::from_secs(30),
        )
    }

    fn template_and_version(state: VersionState) -> (Template, TemplateVersion) {
        let template = Template {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            folder_id: None,
            classification_id: None,
            name: "Invoice".to_string(),
            description: String::new(),
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let mut version = TemplateVersion::new_draft(template.id, 1, None);
        version.state = state;
        version.content = Some(ContentStructure::new(Node::Doc {
            content: vec![Node::Paragraph {
                content: vec![
                    Node::text("Dear "),
                    Node::Injector {
                        attrs: InjectorAttrs {
                            variable_id: "customer_name".to_string(),
                            format: None,
                        },
                    },
                    Node::Injector {
                        attrs: InjectorAttrs {
                            variable_id: "date_now".to_string(),
                            format: None,
                        },
                    },
                ],
            }],
        }));
        (template, version)
    }

    fn job<'a>(
        template: &'a Template,
        version: &'a TemplateVersion,
        supplied: &[(&str, serde_json::Value)],
        preview: bool,
    ) -> RenderJob<'a> {
        RenderJob {
            template,
            version,
            classification_code: Some("INVOICE".to_string()),
            locale: "en".to_string(),
            preview,
            supplied: supplied
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            raw_body: None,
            headers: HashMap::new(),
            selected_formats: HashMap::new(),
            identity: None,
            tenant_code: None,
            workspace_code: None,
            workspace_definitions: Vec::new(),
        }
    }

    #[tokio::test]
    async fn happy_path_produces_pdf_with_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path(), registry());
        let (template, version) = template_and_version(VersionState::Published);

        let output = pipeline
            .render(job(
                &template,
                &version,
                &[("customer_name", serde_json::json!("Acme"))],
                false,
            ))
            .await
            .unwrap();
        assert!(output.pdf.starts_with(b"%PDF"));
        assert_eq!(output.page_count, 1);
        assert!(output.filename.starts_with("invoice-"));
        assert!(output.filename.ends_with(".pdf"));
    }

    #[tokio::test]
    async fn missing_external_fails_before_typesetting() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path(), registry());
        let (template, version) = template_and_version(VersionState::Published);

        let err = pipeline
            .render(job(&template, &version, &[], false))
            .await
            .unwrap_err();
        assert!(
            matches!(err, EngineError::MissingInjectables(codes) if codes == vec!["customer_name"])
        );
    }

    #[tokio::test]
    async fn draft_renders_only_in_preview() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path(), registry());
        let (template, version) = template_and_version(VersionState::Draft);

        let err = pipeline
            .render(job(
                &template,
                &version,
                &[("customer_name", serde_json::json!("Acme"))],
                false,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        pipeline
            .render(job(
                &template,
                &version,
                &[("customer_name", serde_json::json!("Acme"))],
                true,
            ))
            .await
            .unwrap();
    }
}
