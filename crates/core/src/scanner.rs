use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

const UNKNOWN: &str = "Unknown";
const NAME_SUFFIX: &str = "-spec-sheet";

/// A datasheet found under the corpus root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentDescriptor {
    pub absolute_path: PathBuf,
    pub relative_path: PathBuf,
    pub directory: PathBuf,
}

/// Catalog metadata derived purely from where a datasheet sits in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentMetadata {
    pub company: String,
    pub product_type: String,
    pub name: String,
}

impl DocumentDescriptor {
    pub fn datasheet_path(&self) -> String {
        self.absolute_path.to_string_lossy().to_string()
    }

    pub fn directory_label(&self) -> String {
        self.directory.to_string_lossy().to_string()
    }

    pub fn metadata(&self) -> DocumentMetadata {
        derive_metadata(&self.relative_path)
    }
}

/// Lazily walks `root` and yields every PDF beneath it.
///
/// The iterator borrows nothing from the caller, so calling this again restarts
/// the walk. Entries that disappear mid-walk are logged and skipped.
pub fn scan_documents(root: &Path) -> impl Iterator<Item = DocumentDescriptor> {
    let root = root.to_path_buf();

    WalkDir::new(root.clone())
        .sort_by_file_name()
        .into_iter()
        .filter_map(|item| match item {
            Ok(entry) => Some(entry),
            Err(error) => {
                warn!(error = %error, "skipping unreadable entry during scan");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && is_pdf(entry.path()))
        .filter_map(move |entry| {
            let path = entry.path();
            if !path.exists() {
                warn!(path = %path.display(), "datasheet vanished during scan");
                return None;
            }
            describe(&root, path)
        })
}

/// Collects the scan, logging the total like a full directory pass.
pub fn discover_documents(root: &Path) -> Vec<DocumentDescriptor> {
    let documents = scan_documents(root).collect::<Vec<_>>();
    info!(root = %root.display(), found = documents.len(), "scanned datasheet directory");
    documents
}

fn describe(root: &Path, path: &Path) -> Option<DocumentDescriptor> {
    let relative_path = match path.strip_prefix(root) {
        Ok(relative) => relative.to_path_buf(),
        Err(_) => {
            warn!(path = %path.display(), root = %root.display(), "path escaped scan root");
            return None;
        }
    };
    let directory = relative_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    Some(DocumentDescriptor {
        absolute_path: path.to_path_buf(),
        relative_path,
        directory,
    })
}

fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

/// Company is the first segment, product type the second-to-last when the
/// path is deeper than `Company/File.pdf`, and the name is the file stem.
pub fn derive_metadata(relative_path: &Path) -> DocumentMetadata {
    let segments = relative_path
        .components()
        .filter_map(|component| match component {
            Component::Normal(segment) => Some(segment.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>();

    let company = segments
        .first()
        .filter(|segment| !segment.is_empty())
        .cloned()
        .unwrap_or_else(|| UNKNOWN.to_string());

    let product_type = if segments.len() > 2 {
        segments[segments.len() - 2].clone()
    } else {
        UNKNOWN.to_string()
    };

    let name = relative_path
        .file_stem()
        .map(|stem| product_name_from_stem(&stem.to_string_lossy()))
        .unwrap_or_default();

    DocumentMetadata {
        company,
        product_type,
        name,
    }
}

pub fn product_name_from_stem(stem: &str) -> String {
    stem.replace(NAME_SUFFIX, "")
}
