use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::crypto::{CryptoError, CryptoProvider, SealedFragment};
use crate::sync::index::EncryptionEntry;

const FRAGMENT_SEPARATOR: char = '|';

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("malformed manifest: {0}")]
    Malformed(String),
    #[error("manifest crypto failed: {0}")]
    Crypto(#[from] CryptoError),
}

impl From<serde_json::Error> for ManifestError {
    fn from(err: serde_json::Error) -> Self {
        ManifestError::Malformed(err.to_string())
    }
}

/// A folder's metadata key generation in plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestKey {
    pub key: String,
    pub index: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedManifest {
    /// Highest generation present; new entries reuse it.
    pub folder_key: ManifestKey,
    pub version: i64,
    pub entries: Vec<EncryptionEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestDocument {
    metadata: ManifestHeader,
    #[serde(default)]
    files: BTreeMap<String, ManifestFile>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestHeader {
    #[serde(rename = "metadataKeys")]
    metadata_keys: BTreeMap<String, String>,
    version: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestFile {
    encrypted: String,
    #[serde(rename = "initializationVector")]
    initialization_vector: String,
    #[serde(rename = "authenticationTag", default)]
    authentication_tag: String,
    #[serde(rename = "metadataKey")]
    metadata_key: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct EncryptedPayload {
    key: String,
    filename: String,
    mimetype: String,
    version: i64,
}

pub fn encode(
    crypto: &dyn CryptoProvider,
    private_key: &[u8],
    folder_key: &ManifestKey,
    version: i64,
    entries: &[EncryptionEntry],
) -> Result<String, ManifestError> {
    let mut plain_keys: BTreeMap<i64, String> = BTreeMap::new();
    plain_keys.insert(folder_key.index, folder_key.key.clone());
    for entry in entries {
        plain_keys
            .entry(entry.metadata_key_index)
            .or_insert_with(|| entry.metadata_key.clone());
    }

    let mut files = BTreeMap::new();
    for entry in entries {
        let metadata_key = plain_keys
            .get(&entry.metadata_key_index)
            .ok_or_else(|| ManifestError::Malformed("missing metadata key".into()))?;
        let payload = serde_json::to_vec(&EncryptedPayload {
            key: entry.key.clone(),
            filename: entry.file_name.clone(),
            mimetype: entry.mime_type.clone(),
            version: entry.version,
        })?;
        let fragment = crypto.encrypt_fragment(&payload, metadata_key)?;
        files.insert(
            entry.file_name_identifier.clone(),
            ManifestFile {
                encrypted: join_fragment(&fragment),
                initialization_vector: entry.initialization_vector.clone(),
                authentication_tag: entry.authentication_tag.clone().unwrap_or_default(),
                metadata_key: entry.metadata_key_index,
            },
        );
    }

    let mut metadata_keys = BTreeMap::new();
    for (index, key) in &plain_keys {
        metadata_keys.insert(index.to_string(), crypto.seal_metadata_key(key, private_key)?);
    }

    let document = ManifestDocument {
        metadata: ManifestHeader {
            metadata_keys,
            version,
        },
        files,
    };
    Ok(serde_json::to_string(&document)?)
}

pub fn decode(
    crypto: &dyn CryptoProvider,
    private_key: &[u8],
    blob: &str,
    account: &str,
    server_url: &str,
) -> Result<DecodedManifest, ManifestError> {
    let document: ManifestDocument = serde_json::from_str(blob)?;

    let mut plain_keys: BTreeMap<i64, String> = BTreeMap::new();
    for (index, sealed) in &document.metadata.metadata_keys {
        let index: i64 = index
            .parse()
            .map_err(|_| ManifestError::Malformed(format!("metadata key index {index}")))?;
        plain_keys.insert(index, crypto.open_metadata_key(sealed, private_key)?);
    }
    let (index, key) = plain_keys
        .iter()
        .next_back()
        .ok_or_else(|| ManifestError::Malformed("no metadata keys".into()))?;
    let folder_key = ManifestKey {
        key: key.clone(),
        index: *index,
    };

    let mut entries = Vec::with_capacity(document.files.len());
    for (identifier, file) in &document.files {
        let metadata_key = plain_keys.get(&file.metadata_key).ok_or_else(|| {
            ManifestError::Malformed(format!("unknown metadata key {}", file.metadata_key))
        })?;
        let fragment = split_fragment(&file.encrypted)?;
        let plain = crypto.decrypt_fragment(&fragment, metadata_key)?;
        let payload: EncryptedPayload = serde_json::from_slice(&plain)?;
        entries.push(EncryptionEntry {
            account: account.to_string(),
            server_url: server_url.to_string(),
            file_name_identifier: identifier.clone(),
            file_name: payload.filename,
            file_name_path: String::new(),
            key: payload.key,
            initialization_vector: file.initialization_vector.clone(),
            authentication_tag: Some(file.authentication_tag.clone())
                .filter(|tag| !tag.is_empty()),
            metadata_key: metadata_key.clone(),
            metadata_key_index: file.metadata_key,
            mime_type: payload.mimetype,
            version: payload.version,
        });
    }

    Ok(DecodedManifest {
        folder_key,
        version: document.metadata.version,
        entries,
    })
}

fn join_fragment(fragment: &SealedFragment) -> String {
    format!(
        "{}{FRAGMENT_SEPARATOR}{}{FRAGMENT_SEPARATOR}{}",
        fragment.ciphertext, fragment.initialization_vector, fragment.authentication_tag
    )
}

fn split_fragment(value: &str) -> Result<SealedFragment, ManifestError> {
    let mut parts = value.split(FRAGMENT_SEPARATOR);
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(ciphertext), Some(iv), Some(tag), None) => Ok(SealedFragment {
            ciphertext: ciphertext.to_string(),
            initialization_vector: iv.to_string(),
            authentication_tag: tag.to_string(),
        }),
        _ => Err(ManifestError::Malformed("encrypted fragment layout".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::e2ee::crypto::ChaChaCrypto;

    const PRIVATE_KEY: &[u8] = b"account-private-key";

    fn entry(identifier: &str, name: &str, key: &ManifestKey) -> EncryptionEntry {
        let crypto = ChaChaCrypto;
        let (file_key, iv) = crypto.generate_file_key();
        EncryptionEntry {
            account: "acc".into(),
            server_url: "https://h/remote.php/webdav/Secret".into(),
            file_name_identifier: identifier.into(),
            file_name: name.into(),
            file_name_path: String::new(),
            key: file_key,
            initialization_vector: iv,
            authentication_tag: Some("dGFn".into()),
            metadata_key: key.key.clone(),
            metadata_key_index: key.index,
            mime_type: "image/jpeg".into(),
            version: 1,
        }
    }

    #[test]
    fn decode_restores_encoded_entries() {
        let crypto = ChaChaCrypto;
        let key = ManifestKey {
            key: crypto.generate_metadata_key(),
            index: 0,
        };
        let entries = vec![entry("id-a", "a.jpg", &key), entry("id-b", "a.mov", &key)];

        let blob = encode(&crypto, PRIVATE_KEY, &key, 1, &entries).unwrap();
        let decoded = decode(
            &crypto,
            PRIVATE_KEY,
            &blob,
            "acc",
            "https://h/remote.php/webdav/Secret",
        )
        .unwrap();

        assert_eq!(decoded.folder_key, key);
        assert_eq!(decoded.version, 1);
        assert_eq!(decoded.entries, entries);
    }

    #[test]
    fn empty_manifest_still_carries_folder_key() {
        let crypto = ChaChaCrypto;
        let key = ManifestKey {
            key: crypto.generate_metadata_key(),
            index: 0,
        };
        let blob = encode(&crypto, PRIVATE_KEY, &key, 1, &[]).unwrap();
        let decoded = decode(&crypto, PRIVATE_KEY, &blob, "acc", "s").unwrap();

        assert!(decoded.entries.is_empty());
        assert_eq!(decoded.folder_key, key);
    }

    #[test]
    fn wrong_private_key_fails_to_decode() {
        let crypto = ChaChaCrypto;
        let key = ManifestKey {
            key: crypto.generate_metadata_key(),
            index: 0,
        };
        let blob = encode(&crypto, PRIVATE_KEY, &key, 1, &[entry("id", "a", &key)]).unwrap();

        let err = decode(&crypto, b"someone-else", &blob, "acc", "s").unwrap_err();
        assert!(matches!(err, ManifestError::Crypto(_)));
        assert!(matches!(
            decode(&crypto, PRIVATE_KEY, "not json", "acc", "s"),
            Err(ManifestError::Malformed(_))
        ));
    }
}
