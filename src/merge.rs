use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SamplingParams;
use crate::error::{EngineError, Result};
use crate::file_store::FileStore;
use crate::models::{ModelGateway, Purpose};
use crate::protocol::ChatMessage;

const MERGE_SYSTEM_PROMPT: &str = "You merge code changes into existing files. \
Return the complete updated file and nothing else: no explanations, no markdown fences.";

const PREPARE_SYSTEM_PROMPT: &str = "You prepare new source files. Fix formatting and add any \
missing imports. Do not make major functional changes. Return only the file content, without \
markdown fences.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// New file tidied by the model.
    Prepared,
    /// New file, model unavailable: content used as-is.
    Unprepared,
    /// Existing file merged by the model.
    Merged,
    /// Model unavailable, incoming content was a whole file and replaces it.
    Replaced,
    /// Model unavailable, incoming fragment appended under a marker comment.
    Appended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub content: String,
    pub strategy: MergeStrategy,
}

/// Combines proposed content with what is on disk. Never writes; the result
/// becomes a pending diff.
pub struct MergeEngine {
    gateway: Arc<ModelGateway>,
    store: Arc<dyn FileStore>,
    max_project_listing: usize,
}

impl MergeEngine {
    pub fn new(gateway: Arc<ModelGateway>, store: Arc<dyn FileStore>, max_project_listing: usize) -> Self {
        Self {
            gateway,
            store,
            max_project_listing,
        }
    }

    pub async fn merge(&self, path: &str, existing: Option<&str>, incoming: &str) -> MergeOutcome {
        match existing {
            None => self.prepare_new_file(path, incoming).await,
            Some(existing) => self.merge_existing(path, existing, incoming).await,
        }
    }

    async fn prepare_new_file(&self, path: &str, incoming: &str) -> MergeOutcome {
        let messages = [
            ChatMessage::system(PREPARE_SYSTEM_PROMPT),
            ChatMessage::user(format!("File: {path}\n\n{incoming}")),
        ];
        match self.ask(Purpose::Insert, &messages).await {
            Ok(content) => MergeOutcome {
                content,
                strategy: MergeStrategy::Prepared,
            },
            Err(e) => {
                warn!(path, error = %e, "prepare failed, using content unchanged");
                MergeOutcome {
                    content: incoming.to_string(),
                    strategy: MergeStrategy::Unprepared,
                }
            }
        }
    }

    async fn merge_existing(&self, path: &str, existing: &str, incoming: &str) -> MergeOutcome {
        let complete = looks_like_complete_file(incoming);
        let listing = self.project_listing().await;
        let kind = if complete {
            "a complete replacement for the file"
        } else {
            "a fragment to integrate into the file"
        };
        let messages = [
            ChatMessage::system(MERGE_SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Project files:\n{listing}\n\nCurrent content of {path}:\n{existing}\n\n\
                 Proposed change ({kind}):\n{incoming}\n\n\
                 Return the whole updated content of {path}."
            )),
        ];

        match self.ask(Purpose::Insert, &messages).await {
            Ok(content) => MergeOutcome {
                content,
                strategy: MergeStrategy::Merged,
            },
            Err(e) if complete => {
                warn!(path, error = %e, "merge failed, replacing with complete file");
                MergeOutcome {
                    content: incoming.to_string(),
                    strategy: MergeStrategy::Replaced,
                }
            }
            Err(e) => {
                warn!(path, error = %e, "merge failed, appending fragment");
                MergeOutcome {
                    content: append_fragment(path, existing, incoming),
                    strategy: MergeStrategy::Appended,
                }
            }
        }
    }

    async fn ask(&self, purpose: Purpose, messages: &[ChatMessage]) -> Result<String> {
        let params = SamplingParams::default().with_temperature(0.2);
        let answer = self.gateway.complete_text(purpose, messages, &params).await?;
        let content = strip_code_fences(&answer);
        if content.trim().is_empty() {
            return Err(EngineError::Parse("model returned an empty file".to_string()));
        }
        Ok(content)
    }

    async fn project_listing(&self) -> String {
        match self.store.list_project_files(".").await {
            Ok(files) => {
                let mut listing: Vec<&str> = files
                    .iter()
                    .take(self.max_project_listing)
                    .map(|f| f.path.as_str())
                    .collect();
                if files.len() > self.max_project_listing {
                    listing.push("...");
                }
                listing.join("\n")
            }
            Err(e) => {
                debug!(error = %e, "project listing unavailable");
                String::new()
            }
        }
    }
}

/// Heuristic: top-level imports, an export, or at least two top-level
/// declarations mean the model sent a whole file.
pub fn looks_like_complete_file(content: &str) -> bool {
    const IMPORTS: &[&str] = &["import ", "from ", "use ", "#include", "require(", "package ", "using "];
    const DECLARATIONS: &[&str] = &[
        "fn ", "pub fn ", "async fn ", "pub async fn ", "def ", "async def ", "class ", "function ",
        "async function ", "struct ", "pub struct ", "enum ", "pub enum ", "impl ", "trait ",
        "pub trait ", "interface ", "type ", "const ", "let ", "var ", "func ", "mod ", "pub mod ",
    ];

    let mut declarations = 0;
    for line in content.lines() {
        if line.starts_with(char::is_whitespace) {
            continue;
        }
        if line.starts_with("export ") || IMPORTS.iter().any(|p| line.starts_with(p)) {
            return true;
        }
        if DECLARATIONS.iter().any(|p| line.starts_with(p)) {
            declarations += 1;
        }
    }
    declarations >= 2
}

fn comment_delimiters(path: &str) -> (&'static str, &'static str) {
    let ext = path.rsplit_once('.').map(|(_, e)| e.to_lowercase()).unwrap_or_default();
    match ext.as_str() {
        "py" | "rb" | "sh" | "yml" | "yaml" | "toml" | "r" | "ps1" | "ex" | "pl" => ("#", ""),
        "sql" | "lua" | "hs" => ("--", ""),
        "html" | "xml" | "vue" | "svelte" | "md" => ("<!--", " -->"),
        "css" | "scss" => ("/*", " */"),
        _ => ("//", ""),
    }
}

pub fn addition_marker(path: &str) -> String {
    let (open, close) = comment_delimiters(path);
    format!("{open} Added by Pointer{close}\n")
}

fn append_fragment(path: &str, existing: &str, incoming: &str) -> String {
    format!("{existing}\n\n{}{incoming}", addition_marker(path))
}

/// Drop a leading ```` ```lang ```` line and a trailing ```` ``` ```` line.
pub fn strip_code_fences(answer: &str) -> String {
    let mut text = answer.trim();
    if text.starts_with("```") {
        text = match text.find('\n') {
            Some(idx) => &text[idx + 1..],
            None => "",
        };
    }
    let trimmed_end = text.trim_end();
    if let Some(body) = trimmed_end.strip_suffix("```") {
        text = body;
    }
    text.trim_end_matches(['\n', '\r']).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::file_store::MemoryFileStore;
    use crate::models::endpoint::testing::{Reply, ScriptedEndpoint};

    fn engine(replies: Vec<Reply>) -> (MergeEngine, Arc<ScriptedEndpoint>) {
        let endpoint = Arc::new(ScriptedEndpoint::new(replies));
        let gateway = Arc::new(ModelGateway::new(EngineConfig::default(), endpoint.clone()));
        let store = Arc::new(MemoryFileStore::with_files([("src/lib.rs", ""), ("src/util.rs", "")]));
        (MergeEngine::new(gateway, store, 1), endpoint)
    }

    #[test]
    fn test_complete_file_heuristic() {
        assert!(looks_like_complete_file("import os\n\nprint(1)"));
        assert!(looks_like_complete_file("fn a() {}\n\nfn b() {}\n"));
        assert!(looks_like_complete_file("export default {}"));
        assert!(!looks_like_complete_file("fn a() {\n    let x = 1;\n}"));
        assert!(!looks_like_complete_file("    return total"));
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```rust\nfn a() {}\n```"), "fn a() {}");
        assert_eq!(strip_code_fences("plain\n"), "plain");
    }

    #[test]
    fn test_marker_comment_style() {
        assert_eq!(addition_marker("a.py"), "# Added by Pointer\n");
        assert_eq!(addition_marker("a.html"), "<!-- Added by Pointer -->\n");
        assert_eq!(addition_marker("a.rs"), "// Added by Pointer\n");
    }

    #[tokio::test]
    async fn test_fragment_appended_when_model_fails() {
        let (engine, _) = engine(vec![Reply::Status(500)]);
        let existing = "def a():\n    return 1\n";
        let incoming = "    print('extra')";
        let outcome = engine.merge("app.py", Some(existing), incoming).await;
        assert_eq!(outcome.strategy, MergeStrategy::Appended);
        assert_eq!(
            outcome.content,
            format!("{existing}\n\n# Added by Pointer\n{incoming}")
        );
        assert!(outcome.content.starts_with(existing));
    }

    #[tokio::test]
    async fn test_complete_file_replaces_when_model_fails() {
        let (engine, _) = engine(vec![Reply::Status(502)]);
        let incoming = "use std::fs;\n\nfn main() {}\n";
        let outcome = engine.merge("src/main.rs", Some("fn old() {}"), incoming).await;
        assert_eq!(outcome.strategy, MergeStrategy::Replaced);
        assert_eq!(outcome.content, incoming);
    }

    #[tokio::test]
    async fn test_empty_answer_counts_as_failure() {
        let (engine, _) = engine(vec![Reply::text("```\n```")]);
        let outcome = engine.merge("a.rs", Some("fn a() {}"), "    b();").await;
        assert_eq!(outcome.strategy, MergeStrategy::Appended);
    }

    #[tokio::test]
    async fn test_model_merge_sends_context_and_strips_fences() {
        let (engine, endpoint) = engine(vec![Reply::chunks(&["```rust\nfn a() {}\n", "fn b() {}\n```"])]);
        let outcome = engine.merge("src/lib.rs", Some("fn a() {}"), "fn b() {}").await;
        assert_eq!(outcome.strategy, MergeStrategy::Merged);
        assert_eq!(outcome.content, "fn a() {}\nfn b() {}");

        let requests = endpoint.requests();
        let prompt = &requests[0].1.messages[1].content;
        assert!(prompt.contains("Current content of src/lib.rs:\nfn a() {}"));
        assert!(prompt.contains("Project files:\nsrc/lib.rs\n..."));
    }

    #[tokio::test]
    async fn test_new_file_prepare_falls_back_to_incoming() {
        let (engine, _) = engine(vec![Reply::Status(500)]);
        let outcome = engine.merge("new.py", None, "print(1)").await;
        assert_eq!(outcome.strategy, MergeStrategy::Unprepared);
        assert_eq!(outcome.content, "print(1)");
    }
}
