use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use crate::auth::Identity;
use crate::injectable::InjectableValue;

/// Caller-supplied identifiers describing the business operation a
/// render belongs to.
#[derive(Debug, Clone, Default)]
pub struct RequestIdentifiers {
    pub external_id: Option<String>,
    pub template_id: Option<Uuid>,
    pub transactional_id: Option<String>,
    pub operation: Option<String>,
}

/// The shared message bag handed to every injector during one render.
///
/// Keeps a concurrency-safe value map plus typed getters rather than a
/// deep context hierarchy. Header lookup is case-insensitive; resolved
/// values are committed per level, so an injector always observes its
/// dependencies' final values.
pub struct InjectorContext {
    identifiers: RequestIdentifiers,
    headers: HashMap<String, String>,
    identity: Option<Identity>,
    tenant_code: Option<String>,
    workspace_code: Option<String>,
    locale: String,
    selected_formats: HashMap<String, String>,
    request_payload: RwLock<Option<serde_json::Value>>,
    init_data: RwLock<Option<serde_json::Value>>,
    resolved: RwLock<HashMap<String, InjectableValue>>,
}

impl InjectorContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identifiers: RequestIdentifiers,
        headers: HashMap<String, String>,
        identity: Option<Identity>,
        tenant_code: Option<String>,
        workspace_code: Option<String>,
        locale: String,
        selected_formats: HashMap<String, String>,
    ) -> Self {
        let headers = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        Self {
            identifiers,
            headers,
            identity,
            tenant_code,
            workspace_code,
            locale,
            selected_formats,
            request_payload: RwLock::new(None),
            init_data: RwLock::new(None),
            resolved: RwLock::new(HashMap::new()),
        }
    }

    pub fn identifiers(&self) -> &RequestIdentifiers {
        &self.identifiers
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn tenant_code(&self) -> Option<&str> {
        self.tenant_code.as_deref()
    }

    pub fn workspace_code(&self) -> Option<&str> {
        self.workspace_code.as_deref()
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    /// The mapper's product, available from phase B onwards.
    pub fn request_payload(&self) -> Option<serde_json::Value> {
        self.request_payload.read().clone()
    }

    /// The init function's product, available during execution.
    pub fn init_data(&self) -> Option<serde_json::Value> {
        self.init_data.read().clone()
    }

    /// Committed value of an already-resolved injector. Returns `None`
    /// when the code has not committed yet.
    pub fn resolved(&self, code: &str) -> Option<InjectableValue> {
        self.resolved.read().get(code).cloned()
    }

    /// The format key the caller selected for a code, if any.
    pub fn selected_format(&self, code: &str) -> Option<&str> {
        self.selected_formats.get(code).map(String::as_str)
    }

    pub(crate) fn set_request_payload(&self, payload: serde_json::Value) {
        *self.request_payload.write() = Some(payload);
    }

    pub(crate) fn set_init_data(&self, data: serde_json::Value) {
        *self.init_data.write() = Some(data);
    }

    pub(crate) fn commit(&self, code: String, value: InjectableValue) {
        self.resolved.write().insert(code, value);
    }

    /// A copy of every committed value.
    pub fn snapshot(&self) -> HashMap<String, InjectableValue> {
        self.resolved.read().clone()
    }
}
