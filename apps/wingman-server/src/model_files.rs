//! Reversible on-disk naming for model artifacts.
//!
//! A `(modelRepo, filePath)` pair maps to a single flat filename inside the
//! managed `models/` directory: slashes in the repo become `[-]` and the repo
//! is joined to the file with `[=]`, e.g.
//! `TheBloke[-]Xwin-LM-13B-V0.1-GGUF[=]xwin-lm-13b-v0.1.Q2_K.gguf`.
//! Orphan cleanup depends on the mapping being reversible.

use std::path::{Path, PathBuf};

const REPO_SLASH: &str = "[-]";
const REPO_FILE_SEP: &str = "[=]";
const PARTIAL_SUFFIX: &str = ".part";

pub fn safe_file_name(model_repo: &str, file_path: &str) -> String {
    format!(
        "{}{}{}",
        model_repo.replace('/', REPO_SLASH),
        REPO_FILE_SEP,
        file_path
    )
}

/// Inverse of [`safe_file_name`]. Returns `None` for names this process did
/// not produce (missing separator, empty halves, partial-transfer suffix).
pub fn parse_safe_file_name(name: &str) -> Option<(String, String)> {
    if name.ends_with(PARTIAL_SUFFIX) {
        return None;
    }
    let (repo_part, file_part) = name.split_once(REPO_FILE_SEP)?;
    if repo_part.is_empty() || file_part.is_empty() || file_part.contains(REPO_FILE_SEP) {
        return None;
    }
    Some((repo_part.replace(REPO_SLASH, "/"), file_part.to_string()))
}

pub fn artifact_path(models_dir: &Path, model_repo: &str, file_path: &str) -> PathBuf {
    models_dir.join(safe_file_name(model_repo, file_path))
}

pub fn partial_path(models_dir: &Path, model_repo: &str, file_path: &str) -> PathBuf {
    models_dir.join(format!(
        "{}{}",
        safe_file_name(model_repo, file_path),
        PARTIAL_SUFFIX
    ))
}

/// Registry source for an artifact. `WINGMAN_REGISTRY_BASE` points the
/// resolver at a different registry host.
pub fn download_url(model_repo: &str, file_path: &str) -> String {
    let base = std::env::var("WINGMAN_REGISTRY_BASE")
        .unwrap_or_else(|_| "https://huggingface.co".to_string());
    format!("{base}/{model_repo}/resolve/main/{file_path}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips() {
        let repo = "TheBloke/Xwin-LM-13B-V0.1-GGUF";
        let file = "xwin-lm-13b-v0.1.Q2_K.gguf";
        let name = safe_file_name(repo, file);
        assert_eq!(
            name,
            "TheBloke[-]Xwin-LM-13B-V0.1-GGUF[=]xwin-lm-13b-v0.1.Q2_K.gguf"
        );
        let (r, f) = parse_safe_file_name(&name).unwrap();
        assert_eq!(r, repo);
        assert_eq!(f, file);
    }

    #[test]
    fn parse_rejects_foreign_names() {
        assert!(parse_safe_file_name("plain-file.gguf").is_none());
        assert!(parse_safe_file_name("[=]no-repo.gguf").is_none());
        assert!(parse_safe_file_name("repo[=]").is_none());
        assert!(parse_safe_file_name("repo[=]file.gguf.part").is_none());
    }

    #[test]
    fn nested_repo_paths_survive() {
        let (r, f) = parse_safe_file_name(&safe_file_name("a/b/c", "m.gguf")).unwrap();
        assert_eq!(r, "a/b/c");
        assert_eq!(f, "m.gguf");
    }

    #[test]
    fn url_resolves_to_registry() {
        std::env::remove_var("WINGMAN_REGISTRY_BASE");
        assert_eq!(
            download_url("X", "y.bin"),
            "https://huggingface.co/X/resolve/main/y.bin"
        );
    }
}
