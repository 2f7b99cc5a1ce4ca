//! ONVIF snapshot camera.
//!
//! The driver speaks just enough SOAP to find a snapshot URI: `GetProfiles`
//! against the Media2 service, falling back to Media1, then `GetSnapshotUri`
//! for the first profile token. The URI is cached; any request error
//! invalidates the cache and the whole discovery runs once more before the
//! capture is reported failed.

use super::http::{fetch_snapshot, CameraAuth, HTTP};
use super::{Camera, CameraKind};
use crate::errors::CameraError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const MEDIA2_NS: &str = "http://www.onvif.org/ver20/media/wsdl";
const MEDIA1_NS: &str = "http://www.onvif.org/ver10/media/wsdl";

/// ONVIF device configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnvifConfig {
    /// Camera id; also the spool directory name.
    pub id: String,
    /// Media service endpoint, e.g. `http://cam.local/onvif/media_service`.
    pub service_url: String,
    /// Account name; ONVIF snapshot paths are authenticated with basic auth.
    pub username: String,
    /// Account password.
    pub password: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

fn default_request_timeout_seconds() -> u64 {
    30
}

/// Camera whose snapshot URI is discovered over ONVIF SOAP.
#[derive(Debug)]
pub struct OnvifCamera {
    config: OnvifConfig,
    snapshot_uri: Mutex<Option<String>>,
}

impl OnvifCamera {
    /// Wrap an ONVIF media service endpoint.
    pub fn new(config: OnvifConfig) -> Self {
        Self {
            config,
            snapshot_uri: Mutex::new(None),
        }
    }

    fn auth(&self) -> CameraAuth {
        CameraAuth::Basic {
            username: self.config.username.clone(),
            password: self.config.password.clone(),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_seconds)
    }

    async fn soap_request(&self, body: String) -> Result<String, CameraError> {
        let response = HTTP
            .post(&self.config.service_url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .header(reqwest::header::CONTENT_TYPE, "application/soap+xml; charset=utf-8")
            .timeout(self.timeout())
            .body(body)
            .send()
            .await
            .map_err(|error| CameraError::Capture {
                camera_id: self.config.id.clone(),
                message: "SOAP request failed".to_owned(),
                cause: Some(Box::new(error)),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(CameraError::Auth {
                camera_id: self.config.id.clone(),
                message: format!("media service returned {status}"),
            });
        }
        if !status.is_success() {
            return Err(CameraError::capture(
                self.config.id.as_str(),
                format!("media service returned {status}"),
            ));
        }
        response.text().await.map_err(|error| CameraError::Capture {
            camera_id: self.config.id.clone(),
            message: "SOAP body read failed".to_owned(),
            cause: Some(Box::new(error)),
        })
    }

    async fn first_profile_token(&self) -> Result<String, CameraError> {
        // Media2 first; older firmwares only answer the ver10 namespace.
        for namespace in [MEDIA2_NS, MEDIA1_NS] {
            let envelope = soap_envelope(&format!(r#"<GetProfiles xmlns="{namespace}"/>"#));
            match self.soap_request(envelope).await {
                Ok(xml) => {
                    if let Some(token) = extract_attribute(&xml, "token") {
                        return Ok(token);
                    }
                    tracing::debug!(
                        camera = %self.config.id,
                        namespace,
                        "GetProfiles answered without a profile token"
                    );
                }
                Err(error @ CameraError::Auth { .. }) => return Err(error),
                Err(error) => {
                    tracing::debug!(camera = %self.config.id, namespace, %error, "GetProfiles failed");
                }
            }
        }
        Err(CameraError::capture(
            self.config.id.as_str(),
            "no media profile discovered on either Media2 or Media1",
        ))
    }

    async fn cached_or_discovered_uri(&self) -> Result<String, CameraError> {
        let mut cached = self.snapshot_uri.lock().await;
        match cached.as_ref() {
            Some(uri) => Ok(uri.clone()),
            None => {
                let uri = self.discover_snapshot_uri().await?;
                *cached = Some(uri.clone());
                Ok(uri)
            }
        }
    }

    async fn discover_snapshot_uri(&self) -> Result<String, CameraError> {
        let token = self.first_profile_token().await?;
        for namespace in [MEDIA2_NS, MEDIA1_NS] {
            let envelope = soap_envelope(&format!(
                r#"<GetSnapshotUri xmlns="{namespace}"><ProfileToken>{token}</ProfileToken></GetSnapshotUri>"#
            ));
            match self.soap_request(envelope).await {
                Ok(xml) => {
                    if let Some(uri) = extract_tag_text(&xml, "Uri") {
                        tracing::info!(camera = %self.config.id, %uri, "snapshot URI discovered");
                        return Ok(uri);
                    }
                }
                Err(error @ CameraError::Auth { .. }) => return Err(error),
                Err(error) => {
                    tracing::debug!(camera = %self.config.id, namespace, %error, "GetSnapshotUri failed");
                }
            }
        }
        Err(CameraError::capture(
            self.config.id.as_str(),
            "device answered GetProfiles but never produced a snapshot URI",
        ))
    }
}

#[async_trait]
impl Camera for OnvifCamera {
    #[tracing::instrument(skip_all, fields(camera = %self.config.id))]
    async fn capture(&self, cancel: &CancellationToken) -> Result<Bytes, CameraError> {
        let uri = self.cached_or_discovered_uri().await?;
        match fetch_snapshot(&self.config.id, &uri, &self.auth(), self.timeout(), cancel).await {
            Ok(bytes) => Ok(bytes),
            Err(error) => {
                // A stale cached URI earns one rediscovery before the
                // capture counts as failed.
                tracing::debug!(
                    camera = %self.config.id,
                    %error,
                    "snapshot fetch failed; invalidating the cached URI"
                );
                *self.snapshot_uri.lock().await = None;
                let uri = self.cached_or_discovered_uri().await?;
                fetch_snapshot(&self.config.id, &uri, &self.auth(), self.timeout(), cancel).await
            }
        }
    }

    fn id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> CameraKind {
        CameraKind::Onvif
    }
}

fn soap_envelope(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body>{body}</s:Body></s:Envelope>"#
    )
}

/// First `name="value"` attribute value anywhere in the document.
fn extract_attribute(xml: &str, name: &str) -> Option<String> {
    let needle = format!("{name}=\"");
    let start = xml.find(&needle)? + needle.len();
    let end = xml[start..].find('"')?;
    let value = &xml[start..start + end];
    if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    }
}

/// Text content of the first `<[prefix:]name>` element.
fn extract_tag_text(xml: &str, name: &str) -> Option<String> {
    // Match both `<tt:Uri>` and `<Uri>`.
    let open_end = {
        let prefixed = format!(":{name}>");
        let bare = format!("<{name}>");
        match (xml.find(&prefixed), xml.find(&bare)) {
            (Some(p), Some(b)) => Some(p.min(b) + if p < b { prefixed.len() } else { bare.len() }),
            (Some(p), None) => Some(p + prefixed.len()),
            (None, Some(b)) => Some(b + bare.len()),
            (None, None) => None,
        }
    }?;
    let rest = &xml[open_end..];
    let close = rest.find('<')?;
    let value = rest[..close].trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILES_RESPONSE: &str = r#"<?xml version="1.0"?>
<SOAP-ENV:Envelope xmlns:SOAP-ENV="http://www.w3.org/2003/05/soap-envelope">
  <SOAP-ENV:Body>
    <trt:GetProfilesResponse xmlns:trt="http://www.onvif.org/ver10/media/wsdl">
      <trt:Profiles token="Profile_1" fixed="true"><tt:Name>mainStream</tt:Name></trt:Profiles>
      <trt:Profiles token="Profile_2" fixed="true"><tt:Name>subStream</tt:Name></trt:Profiles>
    </trt:GetProfilesResponse>
  </SOAP-ENV:Body>
</SOAP-ENV:Envelope>"#;

    const SNAPSHOT_RESPONSE: &str = r#"<?xml version="1.0"?>
<SOAP-ENV:Envelope xmlns:SOAP-ENV="http://www.w3.org/2003/05/soap-envelope">
  <SOAP-ENV:Body>
    <trt:GetSnapshotUriResponse xmlns:trt="http://www.onvif.org/ver10/media/wsdl">
      <trt:MediaUri><tt:Uri xmlns:tt="http://www.onvif.org/ver10/schema">http://cam.local/onvif/snapshot?channel=1</tt:Uri></trt:MediaUri>
    </trt:GetSnapshotUriResponse>
  </SOAP-ENV:Body>
</SOAP-ENV:Envelope>"#;

    #[test]
    fn profile_token_is_extracted_from_the_attribute() {
        assert_eq!(
            extract_attribute(PROFILES_RESPONSE, "token").as_deref(),
            Some("Profile_1")
        );
    }

    #[test]
    fn snapshot_uri_is_extracted_from_the_tag_text() {
        assert_eq!(
            extract_tag_text(SNAPSHOT_RESPONSE, "Uri").as_deref(),
            Some("http://cam.local/onvif/snapshot?channel=1")
        );
    }

    #[test]
    fn extraction_is_none_on_foreign_documents() {
        assert_eq!(extract_attribute("<a b=\"\"/>", "token"), None);
        assert_eq!(extract_tag_text("<Empty></Empty>", "Uri"), None);
        assert_eq!(extract_tag_text("plain text", "Uri"), None);
    }

    #[test]
    fn envelopes_are_soap12() {
        let envelope = soap_envelope(r#"<GetProfiles xmlns="ns"/>"#);
        assert!(envelope.contains("http://www.w3.org/2003/05/soap-envelope"));
        assert!(envelope.contains(r#"<GetProfiles xmlns="ns"/>"#));
    }
}
