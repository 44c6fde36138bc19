use ncsync_core::DEFAULT_WEBDAV_ROOT;

const DEFAULT_E2EE_API_VERSION: i64 = 1;

/// The signed-in account every engine operation runs against.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub user: String,
    pub base_url: String,
    pub webdav_root: String,
    /// Private key material used to seal folder metadata keys. `None` disables E2EE.
    pub private_key: Option<Vec<u8>>,
    pub e2ee_api_version: i64,
}

impl Account {
    pub fn new(user: impl Into<String>, base_url: impl Into<String>) -> Self {
        let user = user.into();
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            id: format!("{user} {base_url}"),
            user,
            base_url,
            webdav_root: DEFAULT_WEBDAV_ROOT.to_string(),
            private_key: None,
            e2ee_api_version: DEFAULT_E2EE_API_VERSION,
        }
    }

    pub fn with_webdav_root(mut self, webdav_root: &str) -> Self {
        self.webdav_root = webdav_root.trim_matches('/').to_string();
        self
    }

    pub fn with_private_key(mut self, private_key: impl Into<Vec<u8>>) -> Self {
        self.private_key = Some(private_key.into());
        self
    }

    pub fn with_e2ee_api_version(mut self, version: i64) -> Self {
        self.e2ee_api_version = version;
        self
    }

    pub fn home(&self) -> String {
        format!("{}/{}", self.base_url, self.webdav_root)
    }

    /// Path of `server_url` relative to the WebDAV home, with a leading slash.
    /// URLs outside the home are returned unchanged.
    pub fn relative_path(&self, server_url: &str) -> String {
        let home = self.home();
        match server_url.strip_prefix(&home) {
            Some("") => "/".to_string(),
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            _ => server_url.to_string(),
        }
    }
}
