//! Moving attachment payloads between the component and the cache directory.
//!
//! Components in the cache reference attachments as `file://` URIs; on the
//! wire they carry the bytes inline. Each instance of a series gets its own
//! directory; files are named by the attachment's position among the
//! component's ATTACH properties plus its filename, so storing the same
//! component twice overwrites rather than duplicates.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::trace;
use url::Url;

use crate::cache::encode_path_segment;
use crate::component::{Component, Property};
use crate::error::{BackendError, BackendResult};

const DEFAULT_FILENAME: &str = "attachment.dat";

/// Directory of the master; encoded recurrence ids are base64 of UTF-8
/// text and never spell this.
const MASTER_DIR: &str = "master";

/// Replace every `file://` attachment with its inline, base64-encoded
/// content. The filename is kept in the FILENAME parameter.
pub fn inline_attachments(component: &mut Component) -> BackendResult<()> {
    for property in component.properties.iter_mut().filter(|p| p.is("ATTACH")) {
        if is_inline(property) || !property.value.starts_with("file://") {
            continue;
        }

        let url = Url::parse(&property.value)
            .map_err(|e| BackendError::InvalidObject(format!("Bad attachment URI: {e}")))?;
        let path = url.to_file_path().map_err(|_| {
            BackendError::InvalidObject(format!("Not a local attachment: {}", property.value))
        })?;
        let bytes = std::fs::read(&path)?;

        let filename = property
            .param("FILENAME")
            .map(str::to_string)
            .unwrap_or_else(|| sanitize_filename(&path.to_string_lossy()));

        property.value = BASE64.encode(&bytes);
        property.set_param("VALUE", "BINARY");
        property.set_param("ENCODING", "BASE64");
        property.set_param("FILENAME", filename);
        trace!(path = %path.display(), len = bytes.len(), "inlined attachment");
    }
    Ok(())
}

/// Write every inline attachment to
/// `<cache_dir>/attachments/<uid>/<rid or master>/attachment-<index>-<filename>`
/// and point the property at the written file.
pub fn store_attachments(cache_dir: &Path, component: &mut Component) -> BackendResult<()> {
    if !component.has_attachments() {
        return Ok(());
    }
    let uid = component
        .uid()
        .ok_or_else(|| BackendError::InvalidObject("Component has no UID".into()))?
        .to_string();
    let instance_dir = match component.rid() {
        Some(rid) => encode_path_segment(rid),
        None => MASTER_DIR.to_string(),
    };
    let dir = cache_dir
        .join("attachments")
        .join(encode_path_segment(&uid))
        .join(instance_dir);

    for (index, property) in component
        .properties
        .iter_mut()
        .filter(|p| p.is("ATTACH"))
        .enumerate()
    {
        if !is_inline(property) {
            continue;
        }

        let bytes = BASE64
            .decode(property.value.trim())
            .map_err(|e| BackendError::InvalidObject(format!("Bad inline attachment: {e}")))?;
        let filename = sanitize_filename(property.param("FILENAME").unwrap_or_default());
        let path = dir.join(format!("attachment-{index}-{filename}"));

        std::fs::create_dir_all(&dir)?;
        std::fs::write(&path, &bytes)?;

        property.value = file_uri(&path)?;
        property.remove_param("VALUE");
        property.remove_param("ENCODING");
        property.set_param("FILENAME", filename);
        trace!(path = %path.display(), len = bytes.len(), "stored attachment");
    }
    Ok(())
}

/// Delete the stored attachment files of `uid`, every instance included.
pub fn remove_attachments(cache_dir: &Path, uid: &str) -> BackendResult<()> {
    let dir = cache_dir.join("attachments").join(encode_path_segment(uid));
    match std::fs::remove_dir_all(&dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn is_inline(property: &Property) -> bool {
    property
        .param("ENCODING")
        .is_some_and(|e| e.eq_ignore_ascii_case("BASE64"))
}

/// Keep only the final path component; never empty.
fn sanitize_filename(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if base.is_empty() || base == "." || base == ".." {
        DEFAULT_FILENAME.to_string()
    } else {
        base
    }
}

fn file_uri(path: &Path) -> BackendResult<String> {
    let absolute: PathBuf = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Url::from_file_path(&absolute)
        .map(String::from)
        .map_err(|_| BackendError::Io(format!("Cannot build URI for {}", absolute.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentKind;

    fn with_inline(uid: &str, bytes: &[u8], filename: Option<&str>) -> Component {
        let mut c = Component::new(ComponentKind::Event);
        c.set_uid(uid);
        let mut attach = Property::new("ATTACH", BASE64.encode(bytes))
            .with_param("VALUE", "BINARY")
            .with_param("ENCODING", "BASE64");
        if let Some(name) = filename {
            attach.set_param("FILENAME", name);
        }
        c.add_property(attach);
        c
    }

    #[test]
    fn test_store_then_inline_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..=255).collect();
        let original = with_inline("meeting@example.com", &payload, Some("agenda.pdf"));

        let mut stored = original.clone();
        store_attachments(dir.path(), &mut stored).unwrap();
        let attach = stored.property("ATTACH").unwrap();
        assert!(attach.value.starts_with("file://"));
        assert!(attach.value.ends_with("/attachment-0-agenda.pdf"));
        assert_eq!(attach.param("ENCODING"), None);

        let mut inlined = stored.clone();
        inline_attachments(&mut inlined).unwrap();
        let attach = inlined.property("ATTACH").unwrap();
        assert_eq!(BASE64.decode(&attach.value).unwrap(), payload);
        assert_eq!(attach.param("FILENAME"), Some("agenda.pdf"));
        assert_eq!(attach.param("ENCODING"), Some("BASE64"));
    }

    #[test]
    fn test_hostile_filename_stays_inside_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = with_inline("x", b"data", Some("../../escape.sh"));
        store_attachments(dir.path(), &mut c).unwrap();

        let value = &c.property("ATTACH").unwrap().value;
        let path = Url::parse(value).unwrap().to_file_path().unwrap();
        assert!(path.starts_with(dir.path().join("attachments")));
        assert!(path.ends_with("attachment-0-escape.sh"));
    }

    #[test]
    fn test_missing_filename_uses_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = with_inline("x", b"data", None);
        store_attachments(dir.path(), &mut c).unwrap();
        assert!(
            c.property("ATTACH")
                .unwrap()
                .value
                .ends_with("attachment-0-attachment.dat")
        );
    }

    #[test]
    fn test_remote_uris_are_left_alone() {
        let mut c = Component::new(ComponentKind::Event);
        c.set_uid("x");
        c.add_property(Property::new("ATTACH", "https://example.com/a.pdf"));
        let before = c.clone();

        inline_attachments(&mut c).unwrap();
        assert_eq!(c, before);
    }

    #[test]
    fn test_remove_attachments() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = with_inline("x", b"data", Some("a.txt"));
        store_attachments(dir.path(), &mut c).unwrap();

        remove_attachments(dir.path(), "x").unwrap();
        assert!(!dir.path().join("attachments").join(encode_path_segment("x")).exists());
        remove_attachments(dir.path(), "x").unwrap();
    }

    #[test]
    fn test_instances_of_a_series_keep_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut master = with_inline("series", b"master bytes", Some("notes.txt"));
        let mut instance = with_inline("series", b"instance bytes", Some("notes.txt"));
        instance.set_property("RECURRENCE-ID", "20250113T090000Z");

        store_attachments(dir.path(), &mut master).unwrap();
        store_attachments(dir.path(), &mut instance).unwrap();
        assert_ne!(
            master.property("ATTACH").unwrap().value,
            instance.property("ATTACH").unwrap().value
        );

        inline_attachments(&mut master).unwrap();
        inline_attachments(&mut instance).unwrap();
        let decoded = |c: &Component| BASE64.decode(&c.property("ATTACH").unwrap().value).unwrap();
        assert_eq!(decoded(&master), b"master bytes");
        assert_eq!(decoded(&instance), b"instance bytes");

        remove_attachments(dir.path(), "series").unwrap();
        assert!(!dir.path().join("attachments").join(encode_path_segment("series")).exists());
    }

    #[test]
    fn test_local_file_inline_then_store_is_byte_identical() {
        let source_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..=255).rev().chain(0..=255).collect();
        let original = source_dir.path().join("scan.png");
        std::fs::write(&original, &payload).unwrap();

        let mut c = Component::new(ComponentKind::Event);
        c.set_uid("scan");
        c.add_property(Property::new(
            "ATTACH",
            String::from(Url::from_file_path(&original).unwrap()),
        ));

        inline_attachments(&mut c).unwrap();
        let attach = c.property("ATTACH").unwrap();
        assert_eq!(attach.param("FILENAME"), Some("scan.png"));
        assert_eq!(attach.param("ENCODING"), Some("BASE64"));

        store_attachments(cache_dir.path(), &mut c).unwrap();
        let attach = c.property("ATTACH").unwrap();
        assert_eq!(attach.param("FILENAME"), Some("scan.png"));
        let stored = Url::parse(&attach.value).unwrap().to_file_path().unwrap();
        assert!(stored.ends_with("attachment-0-scan.png"));
        assert_eq!(std::fs::read(stored).unwrap(), payload);
    }
}
