use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::StreamExt;
use quick_xml::Reader;
use quick_xml::events::Event;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::gateway::{
    CreatedFolder, DavEntry, DavError, Depth, ManifestMethod, ProgressFn, RemoteGateway,
    UploadReceipt, UploadRequest,
};

pub const DEFAULT_WEBDAV_ROOT: &str = "remote.php/webdav";
pub const E2E_TOKEN_HEADER: &str = "e2e-token";
const E2EE_API_ROOT: &str = "ocs/v2.php/apps/end_to_end_encryption/api/v1";
const DIRECTORY_CONTENT_TYPE: &str = "httpd/unix-directory";

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<d:propfind xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns" xmlns:nc="http://nextcloud.org/ns">
  <d:prop>
    <d:getlastmodified/>
    <d:getetag/>
    <d:getcontenttype/>
    <d:getcontentlength/>
    <d:resourcetype/>
    <oc:id/>
    <oc:fileid/>
    <oc:permissions/>
    <oc:favorite/>
    <oc:size/>
    <nc:is-encrypted/>
    <nc:rich-workspace/>
  </d:prop>
</d:propfind>"#;

/// Thin `RemoteGateway` adapter over WebDAV and the end-to-end encryption OCS API.
#[derive(Clone)]
pub struct DavClient {
    http: Client,
    base_url: Url,
    webdav_root: String,
    user: String,
    password: String,
}

impl DavClient {
    pub fn new(
        base_url: &str,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, DavError> {
        Self::with_webdav_root(base_url, DEFAULT_WEBDAV_ROOT, user, password)
    }

    pub fn with_webdav_root(
        base_url: &str,
        webdav_root: &str,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, DavError> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            webdav_root: webdav_root.trim_matches('/').to_string(),
            user: user.into(),
            password: password.into(),
        })
    }

    /// WebDAV URL of the account root, without a trailing slash.
    pub fn home(&self) -> String {
        format!("{}{}", self.base_url.as_str(), self.webdav_root)
    }

    fn origin(&self) -> String {
        self.base_url.origin().ascii_serialization()
    }

    /// Turns a stored server URL, which carries decoded names, into a request URL
    /// with every path segment percent-encoded.
    fn resource_url(&self, server_url: &str) -> Result<Url, DavError> {
        let foreign = || DavError::ForeignUrl(server_url.to_string());
        let origin = self.origin();
        let path = server_url
            .strip_prefix(origin.as_str())
            .filter(|rest| rest.is_empty() || rest.starts_with('/'))
            .ok_or_else(foreign)?;
        let mut url = self.base_url.clone();
        url.set_query(None);
        url.set_fragment(None);
        url.path_segments_mut()
            .map_err(|()| foreign())?
            .clear()
            .extend(path.split('/').filter(|segment| !segment.is_empty()));
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(&self.user, Some(&self.password))
    }

    fn ocs(&self, method: Method, path: &str) -> Result<RequestBuilder, DavError> {
        let mut url = self.base_url.join(&format!("{E2EE_API_ROOT}/{path}"))?;
        url.query_pairs_mut().append_pair("format", "json");
        Ok(self.request(method, url).header("OCS-APIRequest", "true"))
    }

    async fn check(response: Response) -> Result<Response, DavError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DavError::Api { status, body })
        }
    }

    async fn handle_ocs<T: serde::de::DeserializeOwned>(
        response: Response,
    ) -> Result<T, DavError> {
        let response = Self::check(response).await?;
        let envelope: OcsEnvelope<T> = response.json().await?;
        Ok(envelope.ocs.data)
    }
}

#[async_trait]
impl RemoteGateway for DavClient {
    async fn list(
        &self,
        server_url: &str,
        depth: Depth,
        show_hidden: bool,
    ) -> Result<Vec<DavEntry>, DavError> {
        let url = self.resource_url(server_url)?;
        let response = self
            .request(method("PROPFIND"), url)
            .header("Depth", depth.as_header())
            .header(CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(PROPFIND_BODY)
            .send()
            .await?;
        let body = Self::check(response).await?.text().await?;
        let mut entries = parse_multistatus(&body, &self.origin())?;
        if !show_hidden {
            let mut index = 0usize;
            entries.retain(|entry| {
                let keep = index == 0 || !entry.file_name.starts_with('.');
                index += 1;
                keep
            });
        }
        Ok(entries)
    }

    async fn create_folder(
        &self,
        server_url_file_name: &str,
        headers: &[(&str, &str)],
    ) -> Result<CreatedFolder, DavError> {
        let url = self.resource_url(server_url_file_name)?;
        let mut builder = self.request(method("MKCOL"), url);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let response = Self::check(builder.send().await?).await?;
        Ok(CreatedFolder {
            oc_id: header_string(response.headers(), "oc-fileid"),
            date: header_date(response.headers()),
        })
    }

    async fn delete(
        &self,
        server_url_file_name: &str,
        headers: &[(&str, &str)],
    ) -> Result<(), DavError> {
        let url = self.resource_url(server_url_file_name)?;
        let mut builder = self.request(Method::DELETE, url);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        Self::check(builder.send().await?).await?;
        Ok(())
    }

    async fn move_item(
        &self,
        source: &str,
        destination: &str,
        overwrite: bool,
    ) -> Result<(), DavError> {
        let response = self
            .request(method("MOVE"), self.resource_url(source)?)
            .header("Destination", self.resource_url(destination)?.as_str())
            .header("Overwrite", if overwrite { "T" } else { "F" })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn copy_item(
        &self,
        source: &str,
        destination: &str,
        overwrite: bool,
    ) -> Result<(), DavError> {
        let response = self
            .request(method("COPY"), self.resource_url(source)?)
            .header("Destination", self.resource_url(destination)?.as_str())
            .header("Overwrite", if overwrite { "T" } else { "F" })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn set_favorite(&self, file_path: &str, favorite: bool) -> Result<(), DavError> {
        let url = self.resource_url(&format!(
            "{}/{}",
            self.home(),
            file_path.trim_start_matches('/')
        ))?;
        let body = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<d:propertyupdate xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">
  <d:set><d:prop><oc:favorite>{}</oc:favorite></d:prop></d:set>
</d:propertyupdate>"#,
            if favorite { 1 } else { 0 }
        );
        let response = self
            .request(method("PROPPATCH"), url)
            .header(CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn lock_folder(
        &self,
        file_id: &str,
        token: Option<&str>,
        delete: bool,
    ) -> Result<Option<String>, DavError> {
        let verb = if delete { Method::DELETE } else { Method::POST };
        let mut builder = self.ocs(verb, &format!("lock/{file_id}"))?;
        if let Some(token) = token {
            builder = builder.header(E2E_TOKEN_HEADER, token);
        }
        let response = builder.send().await?;
        if delete {
            Self::check(response).await?;
            return Ok(None);
        }
        let data: LockData = Self::handle_ocs(response).await?;
        Ok(Some(data.e2e_token))
    }

    async fn get_manifest(&self, file_id: &str, token: &str) -> Result<Option<String>, DavError> {
        let response = self
            .ocs(Method::GET, &format!("meta-data/{file_id}"))?
            .header(E2E_TOKEN_HEADER, token)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let data: ManifestData = Self::handle_ocs(response).await?;
        Ok(Some(data.meta_data))
    }

    async fn put_manifest(
        &self,
        file_id: &str,
        token: &str,
        manifest: &str,
        method: ManifestMethod,
    ) -> Result<(), DavError> {
        let verb = match method {
            ManifestMethod::Post => Method::POST,
            ManifestMethod::Put => Method::PUT,
        };
        let response = self
            .ocs(verb, &format!("meta-data/{file_id}"))?
            .header(E2E_TOKEN_HEADER, token)
            .form(&[("metaData", manifest), (E2E_TOKEN_HEADER, token)])
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn mark_encrypted(&self, file_id: &str, encrypted: bool) -> Result<(), DavError> {
        let verb = if encrypted { Method::PUT } else { Method::DELETE };
        let response = self.ocs(verb, &format!("encrypted/{file_id}"))?.send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn upload(
        &self,
        request: UploadRequest<'_>,
        progress: ProgressFn<'_>,
    ) -> Result<UploadReceipt, DavError> {
        let url = self.resource_url(request.server_url_file_name)?;
        let file = tokio::fs::File::open(request.local_path).await?;
        let total = file.metadata().await?.len();

        let (sent_tx, mut sent_rx) = tokio::sync::mpsc::unbounded_channel::<u64>();
        let stream = ReaderStream::new(file).inspect(move |chunk| {
            if let Ok(bytes) = chunk {
                let _ = sent_tx.send(bytes.len() as u64);
            }
        });

        let mut builder = self
            .request(Method::PUT, url)
            .header(CONTENT_LENGTH, total)
            .body(reqwest::Body::wrap_stream(stream));
        if let Some(modified) = request.modified {
            builder = builder.header("X-OC-MTime", modified.to_string());
        }
        for (name, value) in request.headers {
            builder = builder.header(*name, *value);
        }

        let idle = CancellationToken::new();
        let cancel = request.cancel.unwrap_or(&idle);
        let send = builder.send();
        tokio::pin!(send);
        let mut sent = 0u64;
        let response = loop {
            tokio::select! {
                result = &mut send => break result?,
                Some(len) = sent_rx.recv() => {
                    sent = sent.saturating_add(len);
                    progress(sent.min(total), total);
                }
                _ = cancel.cancelled() => return Err(DavError::Cancelled),
            }
        };
        while let Ok(len) = sent_rx.try_recv() {
            sent = sent.saturating_add(len);
            progress(sent.min(total), total);
        }

        let response = Self::check(response).await?;
        let headers = response.headers();
        let oc_id = header_string(headers, "oc-fileid").ok_or(DavError::MissingField("OC-FileId"))?;
        let etag = header_string(headers, "oc-etag")
            .or_else(|| header_string(headers, "etag"))
            .ok_or(DavError::MissingField("ETag"))?;
        Ok(UploadReceipt {
            oc_id,
            etag,
            date: header_date(headers),
            size: total,
        })
    }
}

fn method(name: &'static str) -> Method {
    Method::from_bytes(name.as_bytes()).unwrap_or(Method::GET)
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

fn header_date(headers: &HeaderMap) -> Option<i64> {
    header_string(headers, "date").and_then(|value| parse_http_date(&value))
}

fn parse_http_date(value: &str) -> Option<i64> {
    let time = httpdate::parse_http_date(value).ok()?;
    unix_seconds(time)
}

fn unix_seconds(time: SystemTime) -> Option<i64> {
    time.duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|duration| i64::try_from(duration.as_secs()).ok())
}

pub(crate) fn parse_multistatus(xml: &str, origin: &str) -> Result<Vec<DavEntry>, DavError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<DavEntry> = None;
    let mut element = String::new();
    let mut in_resourcetype = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match name.as_str() {
                    "response" => current = Some(DavEntry::default()),
                    "resourcetype" => in_resourcetype = true,
                    "collection" if in_resourcetype => {
                        if let Some(entry) = current.as_mut() {
                            entry.directory = true;
                        }
                    }
                    _ => {}
                }
                element = name;
            }
            Ok(Event::Empty(e)) => {
                if in_resourcetype && e.local_name().as_ref() == b"collection" {
                    if let Some(entry) = current.as_mut() {
                        entry.directory = true;
                    }
                }
            }
            Ok(Event::Text(e)) => {
                if let Some(entry) = current.as_mut() {
                    let text = String::from_utf8_lossy(e.as_ref()).into_owned();
                    apply_property(entry, &element, text.trim(), origin)?;
                }
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"response" => {
                        if let Some(mut entry) = current.take() {
                            if entry.directory && entry.content_type.is_empty() {
                                entry.content_type = DIRECTORY_CONTENT_TYPE.to_string();
                            }
                            entries.push(entry);
                        }
                    }
                    b"resourcetype" => in_resourcetype = false,
                    _ => {}
                }
                element.clear();
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(DavError::Xml(err.to_string())),
            _ => {}
        }
    }

    Ok(entries)
}

fn apply_property(
    entry: &mut DavEntry,
    element: &str,
    text: &str,
    origin: &str,
) -> Result<(), DavError> {
    match element {
        "href" => {
            let decoded = urlencoding::decode(text).map_err(|err| DavError::Xml(err.to_string()))?;
            let path = decoded.trim_end_matches('/');
            let full = if path.starts_with("http://") || path.starts_with("https://") {
                path.to_string()
            } else {
                format!("{origin}{path}")
            };
            let (parent, name) = full
                .rsplit_once('/')
                .ok_or_else(|| DavError::Xml(format!("unexpected href {text}")))?;
            entry.server_url = parent.to_string();
            entry.file_name = name.to_string();
        }
        "getlastmodified" => entry.date = parse_http_date(text),
        "getetag" => entry.etag = text.trim_matches('"').to_string(),
        "getcontenttype" => entry.content_type = text.to_string(),
        "getcontentlength" | "size" => entry.size = text.parse().unwrap_or(entry.size),
        "id" => entry.oc_id = text.to_string(),
        "fileid" => entry.file_id = text.to_string(),
        "permissions" => entry.permissions = text.to_string(),
        "favorite" => entry.favorite = text == "1",
        "is-encrypted" => entry.e2e_encrypted = text == "1",
        "rich-workspace" => entry.rich_workspace = Some(text.to_string()),
        _ => {}
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct OcsEnvelope<T> {
    ocs: OcsBody<T>,
}

#[derive(Debug, Deserialize)]
struct OcsBody<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct LockData {
    #[serde(rename = "e2e-token")]
    e2e_token: String,
}

#[derive(Debug, Deserialize)]
struct ManifestData {
    #[serde(rename = "meta-data")]
    meta_data: String,
}
