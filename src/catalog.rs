//! Catalog loader: turns a directory of catalog files into [`Document`]s.
//!
//! Walks `catalog.root`, keeping files that match `include_globs` and do not
//! match `exclude_globs` (plus `.git`, `target` and `node_modules`).
//!
//! | Extension | Documents produced |
//! |-----------|--------------------|
//! | `.txt`, `.md` | one per file; title = first non-empty line without leading `#` |
//! | `.json` | one per element of a top-level array, or one for an object |
//! | `.jsonl`, `.ndjson` | one per non-empty line |
//! | `.yaml`, `.yml` | like `.json` |
//!
//! Structured records take their text from `content`, `text` or `body`
//! (else the record serialized as JSON) and may set `id`, `title`,
//! `category`, and `tables`. Each table (a list of rows) becomes an extra
//! [`ChunkKind::Table`] document `{id}_table_{i}` rendered as Markdown.
//! Other scalar fields are carried as metadata.
//!
//! The category defaults to the name of the directory holding the file.
//! Empty documents are skipped; unreadable files and unparseable records are
//! skipped with a warning. Output is sorted by source path for determinism.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;
use tracing::{debug, warn};
use walkdir::WalkDir;

use catalog_rag_core::models::{ChunkKind, Document};

use crate::config::CatalogConfig;

const TEXT_FIELDS: [&str; 3] = ["content", "text", "body"];
const RESERVED_FIELDS: [&str; 7] = ["content", "text", "body", "id", "title", "category", "tables"];

/// Load every catalog document under `config.root`.
pub fn load_catalog(config: &CatalogConfig) -> Result<Vec<Document>> {
    let root = &config.root;
    if !root.exists() {
        bail!("Catalog root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    excludes.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");
        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }
        files.push((path.to_path_buf(), rel_str));
    }
    files.sort_by(|a, b| a.1.cmp(&b.1));

    let mut documents = Vec::new();
    let mut seen_ids = HashSet::new();
    for (path, rel) in files {
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable catalog file");
                continue;
            }
        };
        for mut doc in parse_file(&rel, &content) {
            if doc.text.trim().is_empty() {
                continue;
            }
            if !seen_ids.insert(doc.id.clone()) {
                let unique = format!("{}:{}", rel, doc.id);
                warn!(id = %doc.id, renamed = %unique, "duplicate document id");
                doc.id = unique;
                seen_ids.insert(doc.id.clone());
            }
            documents.push(doc);
        }
    }

    debug!(count = documents.len(), root = %root.display(), "catalog loaded");
    Ok(documents)
}

/// Parse one catalog file (by its path relative to the catalog root).
pub fn parse_file(relative_path: &str, content: &str) -> Vec<Document> {
    let path = Path::new(relative_path);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| relative_path.to_string());
    let category = path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string());
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let records: Vec<Value> = match extension.as_str() {
        "json" => match serde_json::from_str::<Value>(content) {
            Ok(v) => flatten(v),
            Err(e) => {
                warn!(path = relative_path, error = %e, "could not parse JSON");
                Vec::new()
            }
        },
        "jsonl" | "ndjson" => content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .filter_map(|line| match serde_json::from_str::<Value>(line) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(path = relative_path, error = %e, "could not parse JSON line");
                    None
                }
            })
            .collect(),
        "yaml" | "yml" => match serde_yaml::from_str::<Value>(content) {
            Ok(v) => flatten(v),
            Err(e) => {
                warn!(path = relative_path, error = %e, "could not parse YAML");
                Vec::new()
            }
        },
        _ => {
            let text = content.trim();
            let mut doc = Document::new(stem, relative_path, text);
            if let Some(title) = first_line_title(text) {
                doc = doc.with_title(title);
            }
            if let Some(category) = category {
                doc = doc.with_category(category);
            }
            return vec![doc];
        }
    };

    let mut docs = Vec::new();
    for (i, record) in records.into_iter().enumerate() {
        let fallback_id = if i == 0 {
            stem.clone()
        } else {
            format!("{}_{}", stem, i)
        };
        docs.extend(record_documents(
            &record,
            relative_path,
            &fallback_id,
            category.as_deref(),
        ));
    }
    docs
}

fn flatten(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Object(_) => vec![value],
        _ => Vec::new(),
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn record_documents(
    record: &Value,
    source: &str,
    fallback_id: &str,
    dir_category: Option<&str>,
) -> Vec<Document> {
    let Some(obj) = record.as_object() else {
        warn!(path = source, "skipping structured record that is not an object");
        return Vec::new();
    };

    let text = TEXT_FIELDS
        .iter()
        .filter_map(|f| obj.get(*f).and_then(Value::as_str))
        .find(|s| !s.trim().is_empty())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| record.to_string());
    let id = obj
        .get("id")
        .and_then(scalar_string)
        .unwrap_or_else(|| fallback_id.to_string());
    let title = obj
        .get("title")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    let category = obj
        .get("category")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .or_else(|| dir_category.map(str::to_string));

    let mut doc = Document::new(id.clone(), source, text);
    if let Some(t) = &title {
        doc = doc.with_title(t.clone());
    }
    if let Some(c) = &category {
        doc = doc.with_category(c.clone());
    }
    for (key, value) in obj {
        if RESERVED_FIELDS.contains(&key.as_str()) {
            continue;
        }
        if let Some(v) = scalar_string(value) {
            doc = doc.with_metadata(key.clone(), v);
        }
    }

    let mut docs = vec![doc];
    if let Some(tables) = obj.get("tables").and_then(Value::as_array) {
        for (ti, table) in tables.iter().enumerate() {
            let markdown = table_to_markdown(table);
            if markdown.is_empty() {
                continue;
            }
            let table_title = format!("{} table {}", title.as_deref().unwrap_or(&id), ti);
            let mut table_doc = Document::new(format!("{}_table_{}", id, ti), source, markdown)
                .with_kind(ChunkKind::Table)
                .with_title(table_title)
                .with_metadata("source_doc", id.clone());
            if let Some(c) = &category {
                table_doc = table_doc.with_category(c.clone());
            }
            docs.push(table_doc);
        }
    }
    docs
}

/// First non-empty line, with any leading Markdown `#` removed.
pub fn first_line_title(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| l.trim_start_matches('#').trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Render a list of rows as a Markdown table; the first row is the header.
pub fn table_to_markdown(table: &Value) -> String {
    let Some(rows) = table.as_array() else {
        return String::new();
    };
    let rows: Vec<Vec<String>> = rows
        .iter()
        .filter_map(Value::as_array)
        .map(|row| {
            row.iter()
                .map(|cell| match cell {
                    Value::Null => String::new(),
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .collect();
    let Some(header) = rows.first() else {
        return String::new();
    };

    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(format!("| {} |", header.join(" | ")));
    lines.push(format!("| {} |", vec!["---"; header.len()].join(" | ")));
    for row in &rows[1..] {
        lines.push(format!("| {} |", row.join(" | ")));
    }
    lines.join("\n")
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_markdown_file() {
        let docs = parse_file("cs/cs101.md", "\n# Intro to Systems\n\nprereq: Math 101\n");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "cs101");
        assert_eq!(docs[0].title.as_deref(), Some("Intro to Systems"));
        assert_eq!(docs[0].category.as_deref(), Some("cs"));
        assert!(docs[0].text.starts_with("# Intro"));
    }

    #[test]
    fn test_json_list_with_tables() {
        let json = r#"[
            {"id": "cs200", "title": "Data Structures", "content": "Trees and graphs.",
             "credits": 4,
             "tables": [[["Course", "Prereq"], ["CS 200", "CS 101"], ["CS 210", null]]]},
            {"text": "Second record"}
        ]"#;
        let docs = parse_file("cs/courses.json", json);
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0].id, "cs200");
        assert_eq!(docs[0].metadata.get("credits").map(String::as_str), Some("4"));
        assert_eq!(docs[1].id, "cs200_table_0");
        assert_eq!(docs[1].kind, ChunkKind::Table);
        assert_eq!(
            docs[1].text,
            "| Course | Prereq |\n| --- | --- |\n| CS 200 | CS 101 |\n| CS 210 |  |"
        );
        assert_eq!(docs[1].metadata.get("source_doc").map(String::as_str), Some("cs200"));
        assert_eq!(docs[2].id, "courses_1");
        assert_eq!(docs[2].text, "Second record");
    }

    #[test]
    fn test_jsonl_skips_bad_lines() {
        let jsonl = "{\"id\": \"a\", \"body\": \"alpha\"}\nnot json\n\n{\"id\": \"b\", \"content\": \"beta\", \"category\": \"math\"}\n";
        let docs = parse_file("x/records.jsonl", jsonl);
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].category.as_deref(), Some("math"));
        assert_eq!(docs[0].category.as_deref(), Some("x"));
    }

    #[test]
    fn test_yaml_record_without_text_uses_json() {
        let yaml = "id: lab\nroom: B12\n";
        let docs = parse_file("labs.yaml", yaml);
        assert_eq!(docs.len(), 1);
        assert!(docs[0].text.contains("B12"));
        assert_eq!(docs[0].category, None);
    }

    #[test]
    fn test_load_catalog_filters_and_sorts() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("cs")).unwrap();
        std::fs::create_dir_all(root.join("math")).unwrap();
        std::fs::write(root.join("cs/cs101.md"), "# Intro to Systems\nprereq: Math 101").unwrap();
        std::fs::write(root.join("math/math101.txt"), "Calculus I").unwrap();
        std::fs::write(root.join("math/empty.txt"), "   ").unwrap();
        std::fs::write(root.join("notes.rs"), "fn main() {}").unwrap();

        let config = CatalogConfig {
            root: root.to_path_buf(),
            ..Default::default()
        };
        let docs = load_catalog(&config).unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["cs101", "math101"]);
    }

    #[test]
    fn test_duplicate_ids_renamed() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("cs")).unwrap();
        std::fs::create_dir_all(root.join("math")).unwrap();
        std::fs::write(root.join("cs/intro.md"), "Intro to CS").unwrap();
        std::fs::write(root.join("math/intro.md"), "Intro to Math").unwrap();
        let config = CatalogConfig {
            root: root.to_path_buf(),
            ..Default::default()
        };
        let docs = load_catalog(&config).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id, "intro");
        assert_eq!(docs[1].id, "math/intro.md:intro");
    }

    #[test]
    fn test_missing_root() {
        let config = CatalogConfig {
            root: "/definitely/not/here".into(),
            ..Default::default()
        };
        assert!(load_catalog(&config).is_err());
    }
}
