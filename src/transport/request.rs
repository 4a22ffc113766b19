//! Interaction payloads and outbound request construction

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::error::TransportError;

/// Event type of navigation interactions.
pub const EVENT_NAVIGATE: &str = "navigate";
/// Event type of the implicit first interaction of a session.
pub const EVENT_INITIALIZE: &str = "initialize";
/// Component id used for interactions raised by the host rather than a node.
pub const BROWSER_NAVIGATION_ID: &str = "browser-navigation";

/// Header carrying the previous URL on navigation requests.
pub const REFERER_HEADER: &str = "X-Referer";

/// A file attached to an interaction. Sent as a `files` multipart part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl FileUpload {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: None,
            bytes: bytes.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// An interaction as reported by the rendering layer.
///
/// `id` is the originating node's key; everything besides `id`, `type` and
/// `formId` is free-form event data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiEventPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(rename = "formId", default, skip_serializing_if = "Option::is_none")]
    pub form_id: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
    #[serde(skip)]
    pub files: Vec<FileUpload>,
}

impl UiEventPayload {
    pub fn new(id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            form_id: None,
            data: Map::new(),
            files: Vec::new(),
        }
    }

    /// A `navigate` interaction towards `href`.
    pub fn navigate(id: impl Into<String>, href: impl Into<String>) -> Self {
        Self::new(id, EVENT_NAVIGATE).with_data("href", href.into())
    }

    /// The implicit interaction that fetches the initial tree.
    pub fn initialize() -> Self {
        Self::new(BROWSER_NAVIGATION_ID, EVENT_INITIALIZE)
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_form(mut self, form_id: impl Into<String>) -> Self {
        self.form_id = Some(form_id.into());
        self
    }

    pub fn with_file(mut self, file: FileUpload) -> Self {
        self.files.push(file);
        self
    }

    pub fn is_navigation(&self) -> bool {
        self.event_type == EVENT_NAVIGATE
    }

    pub fn href(&self) -> Option<&str> {
        self.data.get("href").and_then(Value::as_str)
    }

    /// `lastURL` supplied by the dispatcher, if any.
    pub fn last_url(&self) -> Option<&str> {
        self.data.get("lastURL").and_then(Value::as_str)
    }

    /// Whether a navigation replaces the current history entry.
    pub fn replace(&self) -> bool {
        self.data
            .get("replace")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiEvent {
    pub component_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_id: Option<String>,
    pub data: Map<String, Value>,
}

/// JSON body of every interaction request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBody {
    pub ui_event: UiEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment_id: Option<String>,
}

/// History update to perform once a navigation response has drained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationIntent {
    pub url: Url,
    pub replace: bool,
}

/// Everything a [`super::Transport`] needs to perform one interaction.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: Url,
    pub body: RequestBody,
    /// Value of the `X-Referer` header.
    pub referer: Option<String>,
    pub files: Vec<FileUpload>,
    pub navigation: Option<NavigationIntent>,
}

impl OutboundRequest {
    pub fn is_multipart(&self) -> bool {
        !self.files.is_empty()
    }
}

/// Build the request for `payload`.
///
/// Ordinary interactions go to the current `location`. Navigation goes to
/// `href` (resolved against `location`), carries `referer` unless the payload
/// brings its own `lastURL`, and never names a fragment.
pub fn build_request(
    payload: UiEventPayload,
    fragment_id: Option<&str>,
    location: &Url,
    referer: Option<&str>,
) -> Result<OutboundRequest, TransportError> {
    let UiEventPayload {
        id,
        event_type,
        form_id,
        mut data,
        files,
    } = payload;

    if event_type != EVENT_NAVIGATE {
        return Ok(OutboundRequest {
            url: location.clone(),
            body: RequestBody {
                ui_event: UiEvent {
                    component_id: id,
                    event_type,
                    form_id,
                    data,
                },
                fragment_id: fragment_id.map(str::to_string),
            },
            referer: None,
            files,
            navigation: None,
        });
    }

    let href = data
        .get("href")
        .and_then(Value::as_str)
        .ok_or_else(|| TransportError::InvalidUrl("navigate event without href".to_string()))?;
    let url = location.join(href)?;
    let last_url = match data.remove("lastURL") {
        Some(Value::String(s)) => Some(s),
        _ => None,
    };
    let replace = data
        .get("replace")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Ok(OutboundRequest {
        url: url.clone(),
        body: RequestBody {
            ui_event: UiEvent {
                component_id: id,
                event_type,
                form_id: None,
                data,
            },
            fragment_id: None,
        },
        referer: last_url.or_else(|| referer.map(str::to_string)),
        files,
        navigation: Some(NavigationIntent { url, replace }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn page() -> Url {
        Url::parse("http://localhost:8000/app").unwrap()
    }

    #[test]
    fn test_payload_collects_extra_fields_as_data() {
        let payload: UiEventPayload = serde_json::from_value(json!({
            "id": "input1",
            "type": "change",
            "formId": "form1",
            "value": "hello"
        }))
        .unwrap();
        assert_eq!(payload.event_type, "change");
        assert_eq!(payload.form_id.as_deref(), Some("form1"));
        assert_eq!(payload.data, json!({"value": "hello"}).as_object().cloned().unwrap());
    }

    #[test]
    fn test_ui_event_request_body_shape() {
        let payload = UiEventPayload::new("btn1", "click")
            .with_form("form1")
            .with_data("clicked", true);
        let request = build_request(payload, Some("f1"), &page(), Some("http://x/")).unwrap();
        assert_eq!(request.url, page());
        assert!(request.referer.is_none());
        assert!(request.navigation.is_none());
        assert_eq!(
            serde_json::to_value(&request.body).unwrap(),
            json!({
                "uiEvent": {
                    "componentId": "btn1",
                    "type": "click",
                    "formId": "form1",
                    "data": {"clicked": true}
                },
                "fragmentId": "f1"
            })
        );
    }

    #[test]
    fn test_fragment_and_form_are_omitted_when_absent() {
        let request =
            build_request(UiEventPayload::new("btn1", "click"), None, &page(), None).unwrap();
        assert_eq!(
            serde_json::to_value(&request.body).unwrap(),
            json!({"uiEvent": {"componentId": "btn1", "type": "click", "data": {}}})
        );
    }

    #[test]
    fn test_navigation_targets_href_with_referer() {
        let payload = UiEventPayload::navigate("link1", "/other?x=1")
            .with_data("replace", true)
            .with_form("ignored");
        let request = build_request(
            payload,
            Some("f1"),
            &page(),
            Some("http://localhost:8000/app"),
        )
        .unwrap();
        assert_eq!(request.url.as_str(), "http://localhost:8000/other?x=1");
        assert_eq!(request.referer.as_deref(), Some("http://localhost:8000/app"));
        assert_eq!(
            request.navigation,
            Some(NavigationIntent {
                url: Url::parse("http://localhost:8000/other?x=1").unwrap(),
                replace: true
            })
        );
        assert_eq!(
            serde_json::to_value(&request.body).unwrap(),
            json!({
                "uiEvent": {
                    "componentId": "link1",
                    "type": "navigate",
                    "data": {"href": "/other?x=1", "replace": true}
                }
            })
        );
    }

    #[test]
    fn test_navigation_prefers_payload_last_url() {
        let payload = UiEventPayload::navigate("link1", "http://elsewhere/")
            .with_data("lastURL", "http://localhost:8000/previous");
        let request = build_request(payload, None, &page(), Some("http://ignored/")).unwrap();
        assert_eq!(request.referer.as_deref(), Some("http://localhost:8000/previous"));
        assert!(!request.body.ui_event.data.contains_key("lastURL"));
    }

    #[test]
    fn test_navigation_without_href_fails() {
        let payload = UiEventPayload::new("link1", EVENT_NAVIGATE);
        let err = build_request(payload, None, &page(), None).unwrap_err();
        assert!(matches!(err, TransportError::InvalidUrl(_)));
    }

    #[test]
    fn test_files_switch_to_multipart() {
        let payload = UiEventPayload::new("upload", "change")
            .with_file(FileUpload::new("a.txt", b"hello".to_vec()).with_content_type("text/plain"));
        let request = build_request(payload, None, &page(), None).unwrap();
        assert!(request.is_multipart());
        assert_eq!(request.files[0].file_name, "a.txt");
    }
}
