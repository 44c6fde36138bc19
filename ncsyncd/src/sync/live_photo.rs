use super::index::{FileRecord, MetadataStore, StoreError};

const TWIN_EXTENSIONS: [&str; 2] = ["mov", "MOV"];

fn is_image(record: &FileRecord) -> bool {
    if record.directory {
        return false;
    }
    if record.content_type.starts_with("image/") {
        return true;
    }
    mime_guess::from_path(&record.file_name_view)
        .first()
        .is_some_and(|mime| mime.type_() == mime_guess::mime::IMAGE)
}

fn stem(file_name: &str) -> &str {
    match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file_name,
    }
}

/// Finds the `.mov` twin stored next to an image, if any.
pub async fn find_twin(
    store: &MetadataStore,
    record: &FileRecord,
) -> Result<Option<FileRecord>, StoreError> {
    if !is_image(record) {
        return Ok(None);
    }
    let stem = stem(&record.file_name_view);
    for extension in TWIN_EXTENSIONS {
        let name = format!("{stem}.{extension}");
        if let Some(twin) = store
            .get_file_by_view_name(&record.account, &record.server_url, &name)
            .await?
        {
            if twin.oc_id != record.oc_id {
                return Ok(Some(twin));
            }
        }
    }
    Ok(None)
}

/// Name the twin takes when its image is renamed to `new_image_name`.
pub fn twin_name_for(twin: &FileRecord, new_image_name: &str) -> String {
    let extension = twin
        .file_name_view
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .unwrap_or(TWIN_EXTENSIONS[0]);
    format!("{}.{extension}", stem(new_image_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;

    fn record(oc_id: &str, name: &str, content_type: &str) -> FileRecord {
        FileRecord {
            oc_id: oc_id.into(),
            account: "acc".into(),
            server_url: "https://h/remote.php/webdav".into(),
            file_name: name.into(),
            file_name_view: name.into(),
            content_type: content_type.into(),
            ..FileRecord::default()
        }
    }

    #[tokio::test]
    async fn image_finds_its_mov_twin() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = MetadataStore::from_pool(pool);
        store.init().await.unwrap();
        let image = record("img", "IMG_1.HEIC", "image/heic");
        let video = record("vid", "IMG_1.MOV", "video/quicktime");
        store.upsert_file(&image).await.unwrap();
        store.upsert_file(&video).await.unwrap();

        let twin = find_twin(&store, &image).await.unwrap();
        assert_eq!(twin.map(|t| t.oc_id), Some("vid".to_string()));
        assert!(find_twin(&store, &video).await.unwrap().is_none());
    }

    #[test]
    fn twin_follows_new_image_stem() {
        let twin = record("vid", "a.mov", "video/quicktime");
        assert_eq!(twin_name_for(&twin, "b.jpg"), "b.mov");
    }

    #[test]
    fn image_detection_falls_back_to_extension() {
        assert!(is_image(&record("x", "a.jpg", "")));
        assert!(!is_image(&record("y", "a.txt", "")));
    }
}
