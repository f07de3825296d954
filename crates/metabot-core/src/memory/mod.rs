//! Thin client for the external memory service.
//!
//! The document store lives in a separate process; the bridge only needs
//! three read endpoints to back the `/memory` chat command.

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryDoc {
    pub path: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySearchHit {
    pub path: String,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryHealth {
    pub status: String,
    #[serde(default)]
    pub documents: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct ListResponse {
    #[serde(default)]
    documents: Vec<MemoryDoc>,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<MemorySearchHit>,
}

#[derive(Clone)]
pub struct MemoryClient {
    http: reqwest::Client,
    base_url: String,
}

impl MemoryClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn list(&self) -> anyhow::Result<Vec<MemoryDoc>> {
        let resp: ListResponse = self
            .http
            .get(format!("{}/api/memory/list", self.base_url))
            .send()
            .await
            .context("memory list request failed")?
            .json()
            .await
            .context("memory list response was not json")?;
        Ok(resp.documents)
    }

    pub async fn search(&self, query: &str) -> anyhow::Result<Vec<MemorySearchHit>> {
        let resp: SearchResponse = self
            .http
            .get(format!("{}/api/memory/search", self.base_url))
            .query(&[("q", query)])
            .send()
            .await
            .context("memory search request failed")?
            .json()
            .await
            .context("memory search response was not json")?;
        Ok(resp.results)
    }

    pub async fn health(&self) -> anyhow::Result<MemoryHealth> {
        self.http
            .get(format!("{}/api/memory/health", self.base_url))
            .send()
            .await
            .context("memory health request failed")?
            .json()
            .await
            .context("memory health response was not json")
    }
}

/// Render a document listing as an indented folder tree.
pub fn format_folder_tree(docs: &[MemoryDoc]) -> String {
    if docs.is_empty() {
        return "No memory documents.".to_string();
    }

    let mut sorted: Vec<&MemoryDoc> = docs.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let mut out = String::new();
    let mut last_dir = "";
    for doc in sorted {
        let (dir, name) = doc.path.rsplit_once('/').unwrap_or(("", doc.path.as_str()));
        if dir != last_dir {
            out.push_str(&format!("📁 {}/\n", if dir.is_empty() { "." } else { dir }));
            last_dir = dir;
        }
        out.push_str(&format!("  📄 {name}\n"));
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_tree_groups_by_directory() {
        let docs = vec![
            MemoryDoc { path: "notes/a.md".into(), title: None, updated_at: None },
            MemoryDoc { path: "notes/b.md".into(), title: None, updated_at: None },
            MemoryDoc { path: "todo.md".into(), title: None, updated_at: None },
        ];
        let tree = format_folder_tree(&docs);
        assert!(tree.contains("📁 notes/"));
        assert!(tree.contains("  📄 a.md"));
        assert!(tree.contains("📁 ./"));
        assert!(tree.contains("  📄 todo.md"));
    }

    #[test]
    fn empty_listing_has_placeholder() {
        assert_eq!(format_folder_tree(&[]), "No memory documents.");
    }
}
