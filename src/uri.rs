//! File-path ↔ URI conversion helpers.

use lsp_types::Uri;
use std::path::Path;

/// Build a `file://` URI for an absolute path.
pub fn file_uri(path: &Path) -> Option<Uri> {
    let url = url::Url::from_file_path(path).ok()?;
    url.as_str().parse::<Uri>().ok()
}

/// Lowercased extension of a path, without the dot.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

/// Map a file extension to the protocol's language identifier.
///
/// Falls back to the extension itself, which is correct for most languages
/// whose identifier matches their extension (lua, go, json, ...).
pub fn language_id_for(extension: &str) -> String {
    match extension {
        "rs" => "rust",
        "py" => "python",
        "ts" => "typescript",
        "tsx" => "typescriptreact",
        "js" => "javascript",
        "jsx" => "javascriptreact",
        "cc" | "cpp" | "cxx" | "hpp" => "cpp",
        "cs" => "csharp",
        "md" => "markdown",
        "sh" => "shellscript",
        "yml" => "yaml",
        other => other,
    }
    .to_string()
}
