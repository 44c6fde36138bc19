mod client;
mod gateway;

pub use reqwest::StatusCode;

pub use client::{DEFAULT_WEBDAV_ROOT, DavClient, E2E_TOKEN_HEADER};
pub use gateway::{
    ApiErrorClass, CreatedFolder, DavEntry, DavError, Depth, ManifestMethod, ProgressFn,
    RemoteGateway, UploadReceipt, UploadRequest, codes,
};
