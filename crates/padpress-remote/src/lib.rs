use std::path::Path;

use padpress_core::{CoreError, EditParams, RemoteEditor, RemoteResponse};
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, USER_AGENT};
use tracing::debug;

pub const DEFAULT_API_URL: &str = "https://image-api.photoroom.com/v2/edit";
pub const DEFAULT_API_KEY_ENV: &str = "PHOTOROOM_API_KEY";

const API_KEY_HEADER: &str = "x-api-key";
const IMAGE_FIELD: &str = "imageFile";

/// Blocking client for the Photoroom v2 edit endpoint. One attempt per call,
/// no retries and no timeout beyond the transport defaults.
pub struct PhotoroomClient {
    endpoint: String,
    client: Client,
}

impl PhotoroomClient {
    pub fn new(endpoint: impl Into<String>, api_key: &str) -> Result<Self, CoreError> {
        Ok(Self {
            endpoint: endpoint.into(),
            client: api_client(api_key)?,
        })
    }

    /// Reads the API key from the environment variable named `key_env`.
    pub fn from_env(key_env: &str, endpoint: Option<String>) -> Result<Self, CoreError> {
        Self::from_lookup(key_env, endpoint, |name| std::env::var(name).ok())
    }

    fn from_lookup(
        key_env: &str,
        endpoint: Option<String>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, CoreError> {
        let api_key = lookup(key_env)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| CoreError::MissingApiKey(key_env.to_string()))?;
        Self::new(endpoint.unwrap_or_else(|| DEFAULT_API_URL.to_string()), api_key.trim())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn api_headers(api_key: &str) -> Result<HeaderMap, CoreError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static(concat!("padpress/", env!("CARGO_PKG_VERSION"))),
    );
    headers.insert(ACCEPT, HeaderValue::from_static("image/png, application/json"));
    let mut key = HeaderValue::from_str(api_key)
        .map_err(|e| CoreError::InvalidParameters(format!("invalid api key header value: {}", e)))?;
    key.set_sensitive(true);
    headers.insert(HeaderName::from_static(API_KEY_HEADER), key);
    Ok(headers)
}

fn api_client(api_key: &str) -> Result<Client, CoreError> {
    Client::builder()
        .default_headers(api_headers(api_key)?)
        .build()
        .map_err(|e| CoreError::Transport(e.to_string()))
}

fn mime_for(file_name: &str) -> &'static str {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

fn build_form(image: &[u8], file_name: &str, params: &EditParams) -> Result<Form, CoreError> {
    let part = Part::bytes(image.to_vec())
        .file_name(file_name.to_string())
        .mime_str(mime_for(file_name))
        .map_err(|e| CoreError::InvalidParameters(e.to_string()))?;
    let mut form = Form::new().part(IMAGE_FIELD, part);
    for (name, value) in params.form_fields() {
        form = form.text(name, value);
    }
    Ok(form)
}

impl RemoteEditor for PhotoroomClient {
    fn edit(&self, image: &[u8], file_name: &str, params: &EditParams) -> Result<RemoteResponse, CoreError> {
        let form = build_form(image, file_name, params)?;
        debug!(endpoint = %self.endpoint, file_name, bytes = image.len(), "sending edit request");
        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .map_err(|e| CoreError::Transport(e.to_string()))?
            .to_vec();
        debug!(status, bytes = body.len(), "edit response received");
        Ok(RemoteResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_carry_key_and_accept() {
        let headers = api_headers("secret-key").expect("headers");
        assert_eq!(headers.get(API_KEY_HEADER).expect("key header"), "secret-key");
        assert!(headers.get(API_KEY_HEADER).expect("key header").is_sensitive());
        assert_eq!(headers.get(ACCEPT).expect("accept header"), "image/png, application/json");
    }

    #[test]
    fn missing_or_blank_key_is_reported_with_variable_name() {
        let err = PhotoroomClient::from_lookup("MY_KEY", None, |_| None)
            .err()
            .expect("missing key should fail");
        assert!(matches!(err, CoreError::MissingApiKey(ref name) if name == "MY_KEY"));
        assert!(PhotoroomClient::from_lookup("MY_KEY", None, |_| Some("   ".to_string())).is_err());
    }

    #[test]
    fn endpoint_defaults_to_photoroom() {
        let client = PhotoroomClient::from_lookup("MY_KEY", None, |_| Some("k".to_string())).expect("client");
        assert_eq!(client.endpoint(), DEFAULT_API_URL);
        let custom = PhotoroomClient::from_lookup("MY_KEY", Some("http://localhost:9/edit".to_string()), |_| {
            Some("k".to_string())
        })
        .expect("client");
        assert_eq!(custom.endpoint(), "http://localhost:9/edit");
    }

    #[test]
    fn upload_mime_follows_extension() {
        assert_eq!(mime_for("a.PNG"), "image/png");
        assert_eq!(mime_for("a.jpg"), "image/jpeg");
        assert_eq!(mime_for("a.webp"), "image/webp");
        assert_eq!(mime_for("noext"), "application/octet-stream");
    }

    #[test]
    fn control_characters_in_key_are_rejected() {
        assert!(matches!(api_headers("bad\nkey"), Err(CoreError::InvalidParameters(_))));
    }
}
