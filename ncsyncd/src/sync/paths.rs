use std::path::{Component, Path, PathBuf};

use thiserror::Error;

const FORBIDDEN_CHARACTERS: [char; 2] = ['/', '\\'];
const ICON_SUFFIX: &str = ".small.ico";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path component is empty")]
    Empty,
    #[error("path component is not a plain name: {0}")]
    UnsupportedComponent(String),
}

/// Per-item cache directory. Every cached artifact of a record lives under its ocId.
pub fn cache_dir_for(cache_root: &Path, oc_id: &str) -> Result<PathBuf, PathError> {
    Ok(cache_root.join(plain_component(oc_id)?))
}

pub fn cached_file_path(
    cache_root: &Path,
    oc_id: &str,
    file_name: &str,
) -> Result<PathBuf, PathError> {
    Ok(cache_dir_for(cache_root, oc_id)?.join(plain_component(file_name)?))
}

pub fn icon_path(cache_root: &Path, oc_id: &str, file_name: &str) -> Result<PathBuf, PathError> {
    let name = format!("{}{ICON_SUFFIX}", plain_component(file_name)?);
    Ok(cache_dir_for(cache_root, oc_id)?.join(name))
}

fn plain_component(value: &str) -> Result<&str, PathError> {
    if value.is_empty() {
        return Err(PathError::Empty);
    }
    let mut components = Path::new(value).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(value),
        _ => Err(PathError::UnsupportedComponent(value.to_string())),
    }
}

/// Drops characters the server refuses in names and trims surrounding whitespace.
pub fn strip_forbidden_characters(name: &str) -> String {
    name.chars()
        .filter(|c| !FORBIDDEN_CHARACTERS.contains(c))
        .collect::<String>()
        .trim()
        .to_string()
}

/// `"a.txt"` with `n = 2` becomes `"a (2).txt"`.
pub fn numbered_name(name: &str, n: u32) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({n}).{ext}"),
        _ => format!("{name} ({n})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_records_under_cache_root() {
        let root = PathBuf::from("/cache");
        assert_eq!(
            cached_file_path(&root, "oc1", "A.txt").unwrap(),
            PathBuf::from("/cache/oc1/A.txt")
        );
        assert_eq!(
            icon_path(&root, "oc1", "A.txt").unwrap(),
            PathBuf::from("/cache/oc1/A.txt.small.ico")
        );
    }

    #[test]
    fn rejects_nested_or_parent_components() {
        let root = PathBuf::from("/cache");
        assert!(matches!(
            cache_dir_for(&root, "../secret"),
            Err(PathError::UnsupportedComponent(_))
        ));
        assert!(matches!(
            cached_file_path(&root, "oc1", "a/b"),
            Err(PathError::UnsupportedComponent(_))
        ));
        assert!(matches!(cache_dir_for(&root, ""), Err(PathError::Empty)));
    }

    #[test]
    fn sanitizes_and_numbers_names() {
        assert_eq!(strip_forbidden_characters(" a/b\\c "), "abc");
        assert_eq!(numbered_name("photo.jpg", 2), "photo (2).jpg");
        assert_eq!(numbered_name("Folder", 3), "Folder (3)");
        assert_eq!(numbered_name(".hidden", 2), ".hidden (2)");
    }
}
