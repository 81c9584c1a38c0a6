//! Property synthesizer: derives SVN properties and a file's filter chain
//! from `.gitattributes` and `.gitignore` inherited along a path, as they
//! exist at a given revision's tree.
//!
//! Grounded on the source's glob-based [`FilePolicy`] matcher (same
//! `glob_match` crate), generalized from a flat ignore/LFS-threshold policy
//! into the full `.gitattributes` rule table the filesystem needs.

use tracing::trace;

use crate::errors::{GitError, PropsError};
use crate::filters::FilterChain;
use crate::git::GitStore;
use crate::models::{NodeKind, PropertyMap};

#[derive(Debug, Clone, Default)]
struct AttrState {
    eol_style: Option<String>,
    mime_type: Option<String>,
    filter: Option<String>,
}

#[derive(Debug, Clone)]
struct AttrRule {
    pattern: String,
    text: Option<bool>,
    eol: Option<String>,
    binary: bool,
    filter: Option<String>,
}

fn normalize_eol_alias(raw: &str) -> &str {
    match raw {
        "lf" => "LF",
        "cr" => "CR",
        "crlf" => "CRLF",
        other => other,
    }
}

fn parse_gitattributes(content: &str) -> Vec<AttrRule> {
    let mut rules = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let Some(pattern) = tokens.next() else {
            continue;
        };
        let mut rule = AttrRule {
            pattern: pattern.to_string(),
            text: None,
            eol: None,
            binary: false,
            filter: None,
        };
        for attr in tokens {
            if let Some(v) = attr.strip_prefix("eol=") {
                rule.eol = Some(normalize_eol_alias(v).to_string());
            } else if let Some(v) = attr.strip_prefix("filter=") {
                rule.filter = Some(v.to_string());
            } else if attr == "text" {
                rule.text = Some(true);
            } else if attr == "-text" {
                rule.text = Some(false);
            } else if attr == "binary" {
                rule.binary = true;
            }
        }
        rules.push(rule);
    }
    rules
}

/// Ancestor directories of `path` (root-to-parent, excluding `path` itself),
/// as slash-joined strings with no leading/trailing slash (root is `""`).
fn ancestor_dirs(path: &str) -> Vec<String> {
    let trimmed = path.trim_start_matches('/');
    let parts: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
    let mut dirs = vec![String::new()];
    let mut acc = String::new();
    for part in parts.iter().take(parts.len().saturating_sub(1)) {
        if !acc.is_empty() {
            acc.push('/');
        }
        acc.push_str(part);
        dirs.push(acc.clone());
    }
    dirs
}

fn relative_to(dir: &str, full_path: &str) -> String {
    let trimmed = full_path.trim_start_matches('/');
    if dir.is_empty() {
        trimmed.to_string()
    } else {
        trimmed
            .strip_prefix(dir)
            .and_then(|s| s.strip_prefix('/'))
            .unwrap_or(trimmed)
            .to_string()
    }
}

fn rule_matches(rule: &AttrRule, relative_path: &str) -> bool {
    if rule.pattern.contains('/') {
        let pattern = rule.pattern.trim_start_matches('/');
        glob_match::glob_match(pattern, relative_path)
    } else {
        let basename = relative_path.rsplit('/').next().unwrap_or(relative_path);
        glob_match::glob_match(&rule.pattern, basename)
    }
}

fn is_recursive_ignore_pattern(pattern: &str) -> bool {
    pattern.starts_with("**/") || pattern.ends_with("/**") || pattern.contains("**")
}

/// Derives properties and filter chains from Git tree content.
pub struct PropertySynthesizer<'a> {
    git: &'a GitStore,
}

/// The synthesized result for a single `(R, path)`.
#[derive(Debug, Clone)]
pub struct SynthesizedProps {
    pub properties: PropertyMap,
    pub filter_chain: FilterChain,
}

impl<'a> PropertySynthesizer<'a> {
    pub fn new(git: &'a GitStore) -> Self {
        Self { git }
    }

    fn read_text_file(&self, tree_sha: &str, path: &str) -> Result<Option<String>, PropsError> {
        let resolved = self.git.resolve_path(tree_sha, path).map_err(|e| {
            PropsError::ReadFailed {
                file: "blob",
                path: path.to_string(),
                detail: e.to_string(),
            }
        })?;
        let Some((oid, is_dir, _mode)) = resolved else {
            return Ok(None);
        };
        if is_dir {
            return Ok(None);
        }
        let bytes = self.git.read_blob(&oid).map_err(|e: GitError| PropsError::ReadFailed {
            file: "blob",
            path: path.to_string(),
            detail: e.to_string(),
        })?;
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Synthesize properties (and, for files, the filter chain) for
    /// `(treeSha, path, kind)`.
    pub fn synthesize(
        &self,
        tree_sha: &str,
        path: &str,
        kind: NodeKind,
    ) -> Result<SynthesizedProps, PropsError> {
        let mut state = AttrState::default();
        for dir in ancestor_dirs(path) {
            let attrs_path = if dir.is_empty() {
                ".gitattributes".to_string()
            } else {
                format!("{dir}/.gitattributes")
            };
            let Some(content) = self.read_text_file(tree_sha, &attrs_path)? else {
                continue;
            };
            let relative = relative_to(&dir, path);
            for rule in parse_gitattributes(&content) {
                if !rule_matches(&rule, &relative) {
                    continue;
                }
                if rule.binary {
                    state.mime_type = Some("application/octet-stream".to_string());
                    state.eol_style = None;
                } else if let Some(eol) = &rule.eol {
                    state.eol_style = Some(eol.clone());
                } else if rule.text == Some(true) {
                    state.eol_style.get_or_insert_with(|| "native".to_string());
                } else if rule.text == Some(false) {
                    state.eol_style = None;
                }
                if let Some(filter) = &rule.filter {
                    state.filter = Some(filter.clone());
                }
                trace!(pattern = %rule.pattern, dir = %dir, "gitattributes rule applied");
            }
        }

        let mut properties = PropertyMap::new();
        if let Some(eol) = &state.eol_style {
            properties.insert("svn:eol-style", eol.as_bytes().to_vec());
        }
        if let Some(mime) = &state.mime_type {
            properties.insert("svn:mime-type", mime.as_bytes().to_vec());
        }

        let filter_chain = match &state.filter {
            Some(name) => FilterChain::from_names(vec![name.clone()]),
            None => FilterChain::identity(),
        };

        if kind == NodeKind::Dir {
            self.synthesize_dir_ignores(tree_sha, path, &mut properties)?;
        }

        Ok(SynthesizedProps {
            properties,
            filter_chain,
        })
    }

    fn synthesize_dir_ignores(
        &self,
        tree_sha: &str,
        path: &str,
        properties: &mut PropertyMap,
    ) -> Result<(), PropsError> {
        let trimmed = path.trim_start_matches('/');
        let ignore_path = if trimmed.is_empty() {
            ".gitignore".to_string()
        } else {
            format!("{trimmed}/.gitignore")
        };
        let Some(content) = self.read_text_file(tree_sha, &ignore_path)? else {
            return Ok(());
        };

        let mut direct = Vec::new();
        let mut recursive = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if is_recursive_ignore_pattern(line) {
                recursive.push(line.to_string());
            } else {
                direct.push(line.to_string());
            }
        }
        if !direct.is_empty() {
            properties.insert("svn:ignore", format!("{}\n", direct.join("\n")).into_bytes());
        }
        if !recursive.is_empty() {
            properties.insert(
                "svn:inheritable-ignores",
                format!("{}\n", recursive.join("\n")).into_bytes(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn build_tree(store: &GitStore, files: &[(&str, &str)]) -> String {
        let mut map = BTreeMap::new();
        for (path, content) in files {
            let oid = store.write_blob(content.as_bytes()).unwrap();
            map.insert(path.to_string(), (oid, false));
        }
        store.write_tree(&map).unwrap()
    }

    fn init_store() -> (tempfile::TempDir, GitStore) {
        let dir = tempfile::tempdir().unwrap();
        git2::Repository::init(dir.path()).unwrap();
        let store = GitStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_text_attribute_sets_eol_style_native() {
        let (_dir, store) = init_store();
        let tree = build_tree(
            &store,
            &[(".gitattributes", "*.txt text\n"), ("a.txt", "hi")],
        );
        let synth = PropertySynthesizer::new(&store);
        let result = synth.synthesize(&tree, "/a.txt", NodeKind::File).unwrap();
        assert_eq!(result.properties.get("svn:eol-style"), Some(b"native".as_slice()));
    }

    #[test]
    fn test_explicit_eol_overrides_generic_text() {
        let (_dir, store) = init_store();
        let tree = build_tree(
            &store,
            &[(".gitattributes", "*.txt text eol=crlf\n"), ("a.txt", "hi")],
        );
        let synth = PropertySynthesizer::new(&store);
        let result = synth.synthesize(&tree, "/a.txt", NodeKind::File).unwrap();
        assert_eq!(result.properties.get("svn:eol-style"), Some(b"CRLF".as_slice()));
    }

    #[test]
    fn test_binary_sets_mime_type_and_clears_eol() {
        let (_dir, store) = init_store();
        let tree = build_tree(
            &store,
            &[(".gitattributes", "*.png binary\n"), ("a.png", "bytes")],
        );
        let synth = PropertySynthesizer::new(&store);
        let result = synth.synthesize(&tree, "/a.png", NodeKind::File).unwrap();
        assert_eq!(
            result.properties.get("svn:mime-type"),
            Some(b"application/octet-stream".as_slice())
        );
        assert!(result.properties.get("svn:eol-style").is_none());
    }

    #[test]
    fn test_deeper_directory_overrides_shallower() {
        let (_dir, store) = init_store();
        let tree = build_tree(
            &store,
            &[
                (".gitattributes", "*.txt text\n"),
                ("sub/.gitattributes", "*.txt binary\n"),
                ("sub/a.txt", "hi"),
            ],
        );
        let synth = PropertySynthesizer::new(&store);
        let result = synth
            .synthesize(&tree, "/sub/a.txt", NodeKind::File)
            .unwrap();
        assert_eq!(
            result.properties.get("svn:mime-type"),
            Some(b"application/octet-stream".as_slice())
        );
    }

    #[test]
    fn test_filter_attribute_produces_filter_chain() {
        let (_dir, store) = init_store();
        let tree = build_tree(
            &store,
            &[(".gitattributes", "*.bin filter=lfs\n"), ("a.bin", "x")],
        );
        let synth = PropertySynthesizer::new(&store);
        let result = synth.synthesize(&tree, "/a.bin", NodeKind::File).unwrap();
        assert_eq!(result.filter_chain.names(), &["lfs".to_string()]);
    }

    #[test]
    fn test_gitignore_splits_direct_and_recursive() {
        let (_dir, store) = init_store();
        let tree = build_tree(&store, &[(".gitignore", "*.tmp\nbuild/**\n")]);
        let synth = PropertySynthesizer::new(&store);
        let result = synth.synthesize(&tree, "/", NodeKind::Dir).unwrap();
        assert_eq!(result.properties.get("svn:ignore"), Some(b"*.tmp\n".as_slice()));
        assert_eq!(
            result.properties.get("svn:inheritable-ignores"),
            Some(b"build/**\n".as_slice())
        );
    }

    #[test]
    fn test_no_gitattributes_yields_identity_chain_and_no_properties() {
        let (_dir, store) = init_store();
        let tree = build_tree(&store, &[("a.txt", "hi")]);
        let synth = PropertySynthesizer::new(&store);
        let result = synth.synthesize(&tree, "/a.txt", NodeKind::File).unwrap();
        assert!(result.filter_chain.is_identity());
        assert!(result.properties.is_empty());
    }
}
