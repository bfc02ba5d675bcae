use chrono::Utc;
use lopdf::dictionary;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use docsmith::config::Settings;
use docsmith::engine::Engine;
use docsmith::injectable::{AssignmentScope, DataType, InjectableValue, SystemAssignment};
use docsmith::registry::InjectorEntry;
use docsmith::store::{AssignmentStore, ClassificationStore};
use docsmith::template::DocumentClassification;

/// Writes a stub typesetter honoring the `compile main.typ -` contract:
/// answers `--version`, optionally sleeps, then emits a fixture PDF.
fn fake_typesetter(dir: &Path, delay_ms: u64) -> PathBuf {
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
    writeln!(file, "if [ \"$1\" = --version ]; then echo stub 0.1; exit 0; fi").unwrap();
    if delay_ms > 0 {
        writeln!(file, "sleep {}", delay_ms as f64 / 1000.0).unwrap();
    }
    writeln!(file, "cat {}", pdf_path.display()).unwrap();
    let mut perms = file.metadata().unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script, perms).unwrap();
    script
}

struct TestService {
    base: String,
    engine: Arc<Engine>,
    client: reqwest::Client,
    _dir: tempfile::TempDir,
}

async fn start_service(max_concurrent: usize, delay_ms: u64) -> TestService {
    let dir = tempfile::tempdir().unwrap();
    let bin = fake_typesetter(dir.path(), delay_ms);

    let mut settings = Settings::default();
    settings.typesetter.bin_path = bin.to_string_lossy().to_string();
    settings.typesetter.max_concurrent = max_concurrent;
    settings.typesetter.acquire_timeout_seconds = 0;
    settings.typesetter.image_cache_dir = dir.path().join("images").to_string_lossy().to_string();

    let mut builder = Engine::ephemeral(settings)
        .register_injector(InjectorEntry::external("customer_name", DataType::Text))
        .unwrap();
    builder = builder
        .register_injector(InjectorEntry::internal("date_now", DataType::Time, |_| {
            Box::pin(async { Ok(InjectableValue::Time(Utc::now())) })
        }))
        .unwrap();
    let engine = Arc::new(builder.build().await.unwrap());

    // Make the system injectors visible everywhere.
    for code in ["customer_name", "date_now"] {
        engine
            .stores()
            .assignments
            .insert(&SystemAssignment {
                id: Uuid::new_v4(),
                injector_code: code.to_string(),
                scope: AssignmentScope::Public,
                tenant_id: None,
                workspace_id: None,
                is_active: true,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    let app = docsmith::http::router(Arc::clone(&engine));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestService {
        base: format!("http://{addr}"),
        engine,
        client: reqwest::Client::new(),
        _dir: dir,
    }
}

async fn seed_published_template(service: &TestService) -> (Uuid, Uuid, Uuid) {
    let client = &service.client;
    let base = &service.base;

    let tenant: serde_json::Value = client
        .post(format!("{base}/api/v1/tenants"))
        .json(&serde_json::json!({"code": "ACME", "name": "Acme Corp"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let tenant_id: Uuid = serde_json::from_value(tenant["id"].clone()).unwrap();

    let workspace: serde_json::Value = client
        .post(format!("{base}/api/v1/tenants/{tenant_id}/workspaces"))
        .json(&serde_json::json!({"code": "MAIN", "name": "Main"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let workspace_id: Uuid = serde_json::from_value(workspace["id"].clone()).unwrap();

    // Classification CRUD is not part of the HTTP surface; seed directly.
    service
        .engine
        .stores()
        .classifications
        .insert(&DocumentClassification {
            id: Uuid::new_v4(),
            tenant_id,
            code: "INVOICE".to_string(),
            name: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

    let template: serde_json::Value = client
        .post(format!("{base}/api/v1/workspaces/{workspace_id}/templates"))
        .json(&serde_json::json!({
            "name": "Invoice",
            "classification_code": "INVOICE",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let template_id: Uuid = serde_json::from_value(template["id"].clone()).unwrap();

    let version: serde_json::Value = client
        .post(format!("{base}/api/v1/templates/{template_id}/versions"))
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let version_id: Uuid = serde_json::from_value(version["id"].clone()).unwrap();

    let content = serde_json::json!({
        "schema_revision": "pd-1",
        "doc": {"type": "doc", "content": [
            {"type": "paragraph", "content": [
                {"type": "text", "text": "Dear "},
                {"type": "injector", "attrs": {"variableId": "customer_name"}},
            ]},
            {"type": "paragraph", "content": [
                {"type": "text", "text": "Date: "},
                {"type": "injector", "attrs": {"variableId": "date_now"}},
            ]},
        ]}
    });
    let edited = client
        .put(format!(
            "{base}/api/v1/templates/{template_id}/versions/{version_id}"
        ))
        .json(&serde_json::json!({"content": content}))
        .send()
        .await
        .unwrap();
    assert!(edited.status().is_success(), "{}", edited.text().await.unwrap());

    let published = client
        .post(format!(
            "{base}/api/v1/templates/{template_id}/versions/{version_id}/publish"
        ))
        .send()
        .await
        .unwrap();
    assert!(
        published.status().is_success(),
        "{}",
        published.text().await.unwrap()
    );

    (workspace_id, template_id, version_id)
}

#[tokio::test]
async fn happy_path_render_produces_pdf() {
    let service = start_service(4, 0).await;
    seed_published_template(&service).await;

    let response = service
        .client
        .post(format!(
            "{}/api/v1/workspace/document-types/INVOICE/render",
            service.base
        ))
        .header("X-Tenant-Code", "ACME")
        .header("X-Workspace-Code", "MAIN")
        .json(&serde_json::json!({"injectables": {"customer_name": "Acme"}}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/pdf"
    );
    let pages: usize = response
        .headers()
        .get("x-page-count")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(pages >= 1);
    let disposition = response
        .headers()
        .get("content-disposition")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains("invoice-"));
    let body = response.bytes().await.unwrap();
    assert!(body.starts_with(b"%PDF"));
}

#[tokio::test]
async fn missing_external_injectable_is_422_with_codes() {
    let service = start_service(4, 0).await;
    seed_published_template(&service).await;

    let response = service
        .client
        .post(format!(
            "{}/api/v1/workspace/document-types/INVOICE/render",
            service.base
        ))
        .header("X-Tenant-Code", "ACME")
        .header("X-Workspace-Code", "MAIN")
        .json(&serde_json::json!({"injectables": {}}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 422);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "missing required injectables");
    assert_eq!(body["codes"], serde_json::json!(["customer_name"]));
}

#[tokio::test]
async fn publish_swap_archives_previous_version() {
    let service = start_service(4, 0).await;
    let (_, template_id, v1) = seed_published_template(&service).await;

    let draft: serde_json::Value = service
        .client
        .post(format!(
            "{}/api/v1/templates/{template_id}/versions",
            service.base
        ))
        .json(&serde_json::json!({"base_version_id": v1}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let v2: Uuid = serde_json::from_value(draft["id"].clone()).unwrap();

    let outcome: serde_json::Value = service
        .client
        .post(format!(
            "{}/api/v1/templates/{template_id}/versions/{v2}/publish",
            service.base
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(outcome["published"]["state"], "PUBLISHED");
    assert_eq!(outcome["archived"]["id"], serde_json::json!(v1));
    assert_eq!(outcome["archived"]["state"], "ARCHIVED");

    // Second publish of the same version conflicts.
    let again = service
        .client
        .post(format!(
            "{}/api/v1/templates/{template_id}/versions/{v2}/publish",
            service.base
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 409);
}

#[tokio::test]
async fn draft_preview_renders_without_publishing() {
    let service = start_service(4, 0).await;
    let (_, template_id, _) = seed_published_template(&service).await;

    let draft: serde_json::Value = service
        .client
        .post(format!(
            "{}/api/v1/templates/{template_id}/versions",
            service.base
        ))
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let vid: Uuid = serde_json::from_value(draft["id"].clone()).unwrap();

    service
        .client
        .put(format!(
            "{}/api/v1/templates/{template_id}/versions/{vid}",
            service.base
        ))
        .json(&serde_json::json!({"content": {
            "schema_revision": "pd-1",
            "doc": {"type": "doc", "content": [
                {"type": "paragraph", "content": [{"type": "text", "text": "Preview body"}]}
            ]}
        }}))
        .send()
        .await
        .unwrap();

    let response = service
        .client
        .post(format!(
            "{}/api/v1/templates/{template_id}/versions/{vid}/preview",
            service.base
        ))
        .json(&serde_json::json!({"injectables": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.bytes().await.unwrap().starts_with(b"%PDF"));
}

#[tokio::test]
async fn saturated_renderer_returns_busy() {
    let service = start_service(2, 500).await;
    seed_published_template(&service).await;

    let render = |service: &TestService| {
        service
            .client
            .post(format!(
                "{}/api/v1/workspace/document-types/INVOICE/render",
                service.base
            ))
            .header("X-Tenant-Code", "ACME")
            .header("X-Workspace-Code", "MAIN")
            .json(&serde_json::json!({"injectables": {"customer_name": "Acme"}}))
            .send()
    };

    let (a, b, c) = tokio::join!(render(&service), render(&service), render(&service));
    let mut statuses: Vec<u16> = [a.unwrap(), b.unwrap(), c.unwrap()]
        .iter()
        .map(|r| r.status().as_u16())
        .collect();
    statuses.sort_unstable();
    assert_eq!(statuses, vec![200, 200, 503]);
}

#[tokio::test]
async fn injectable_listing_merges_catalog_and_workspace_definitions() {
    let service = start_service(4, 0).await;
    let (workspace_id, _, _) = seed_published_template(&service).await;

    service
        .client
        .post(format!(
            "{}/api/v1/workspaces/{workspace_id}/injectables",
            service.base
        ))
        .json(&serde_json::json!({
            "key": "footer_note",
            "default_value": "Thanks for your business",
        }))
        .send()
        .await
        .unwrap();

    let listing: serde_json::Value = service
        .client
        .get(format!(
            "{}/api/v1/workspaces/{workspace_id}/injectables",
            service.base
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let codes: Vec<&str> = listing["codes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["code"].as_str().unwrap())
        .collect();
    assert!(codes.contains(&"customer_name"));
    assert!(codes.contains(&"date_now"));
    assert!(codes.contains(&"footer_note"));
}

#[tokio::test]
async fn me_roles_reports_bootstrap_superadmin() {
    let service = start_service(4, 0).await;

    let roles: serde_json::Value = service
        .client
        .get(format!("{}/api/v1/me/roles", service.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    // Dummy mode + empty user table: the first login bootstraps SUPERADMIN.
    assert_eq!(roles["system_role"], "SUPERADMIN");
}

#[tokio::test]
async fn health_and_ready_endpoints() {
    let service = start_service(4, 0).await;
    let health = service
        .client
        .get(format!("{}/health", service.base))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);

    let ready = service
        .client
        .get(format!("{}/ready", service.base))
        .send()
        .await
        .unwrap();
    assert_eq!(ready.status(), 200);
}
