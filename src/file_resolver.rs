//! Decide which file a code block belongs to.
//!
//! Precedence: explicit filename from the marker, a filename comment on the
//! first line of the block, a project-wide identifier match, and finally a
//! synthesized `new_file.<ext>`.

use std::collections::BTreeSet;
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ResolverConfig, SamplingParams};
use crate::error::{EngineError, Result};
use crate::file_store::{normalize_path, FileStore};
use crate::markers::FileOperation;
use crate::models::{ModelGateway, Purpose};
use crate::protocol::ChatMessage;

pub const NEW_FILE_STEM: &str = "new_file";
const CLASSIFIER_SAMPLE_CHARS: usize = 2000;

/// Extensions a classifier answer may name.
pub const EXTENSION_WHITELIST: &[&str] = &[
    "rs", "py", "js", "ts", "jsx", "tsx", "html", "css", "scss", "json", "go", "java", "kt",
    "swift", "c", "h", "cpp", "hpp", "cs", "rb", "php", "sh", "ps1", "sql", "md", "yml", "yaml",
    "toml", "xml", "lua", "dart", "scala", "r", "vue", "svelte", "ex", "hs", "ml", "zig", "txt",
];

lazy_static! {
    static ref HINT_LINE: Regex =
        Regex::new(r"^\s*(?://+|#+|--|%+|;+)\s*(?:(?i:file(?:name)?|path)\s*:\s*)?([\w./\\-]+\.[A-Za-z0-9]+)\s*$").unwrap();
    static ref HINT_HTML: Regex =
        Regex::new(r"^\s*<!--\s*(?:(?i:file(?:name)?|path)\s*:\s*)?([\w./\\-]+\.[A-Za-z0-9]+)\s*-->\s*$").unwrap();
    static ref HINT_BLOCK: Regex =
        Regex::new(r"^\s*/\*+\s*(?:(?i:file(?:name)?|path)\s*:\s*)?([\w./\\-]+\.[A-Za-z0-9]+)\s*\*+/\s*$").unwrap();

    static ref TYPE_DECL: Regex =
        Regex::new(r"\b(?:class|struct|enum|trait|interface|type)\s+([A-Za-z_]\w*)").unwrap();
    static ref FUNCTION_DECL: Regex =
        Regex::new(r"\b(?:function|def|fn|func)\s+([A-Za-z_]\w*)").unwrap();
    static ref VARIABLE_DECL: Regex =
        Regex::new(r"(?m)^(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][\w$]*)").unwrap();
    static ref NAMED_IMPORT: Regex = Regex::new(r"import\s*\{([^}]*)\}").unwrap();
    static ref NAMED_EXPORT: Regex =
        Regex::new(r"export\s+(?:default\s+)?(?:async\s+)?(?:function|class|const|let|var)\s+([A-Za-z_$][\w$]*)").unwrap();
}

const STOP_IDENTIFIERS: &[&str] = &["main", "self", "new", "init", "test", "app", "index", "default"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolutionSource {
    Explicit,
    InlineHint,
    ProjectMatch { ambiguous: bool },
    Synthesized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub path: String,
    pub source: ResolutionSource,
    /// Content to merge; an inline hint line is removed.
    pub content: String,
    /// Every file that cleared the match threshold, in scan order.
    pub candidates: Vec<String>,
}

impl Resolution {
    fn new(path: String, source: ResolutionSource, content: String) -> Self {
        Self {
            path,
            source,
            content,
            candidates: Vec::new(),
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self.source, ResolutionSource::ProjectMatch { ambiguous: true })
    }

    /// Describes an ambiguous pick so it can be shown next to the diff.
    pub fn ambiguity(&self) -> Option<EngineError> {
        self.is_ambiguous().then(|| {
            EngineError::ResolutionAmbiguity(format!(
                "chose {} among {}",
                self.path,
                self.candidates.join(", ")
            ))
        })
    }
}

pub struct FileResolver {
    store: Arc<dyn FileStore>,
    gateway: Arc<ModelGateway>,
    config: ResolverConfig,
}

impl FileResolver {
    pub fn new(store: Arc<dyn FileStore>, gateway: Arc<ModelGateway>, config: ResolverConfig) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    pub async fn resolve(&self, operation: &FileOperation) -> Result<Resolution> {
        if let Some(path) = operation.path.as_deref().map(normalize_path).filter(|p| !p.is_empty()) {
            debug!(path = %path, "explicit target");
            return Ok(Resolution::new(path, ResolutionSource::Explicit, operation.content.clone()));
        }

        if let Some((path, content)) = inline_hint(&operation.content) {
            debug!(path = %path, "inline filename hint");
            return Ok(Resolution::new(path, ResolutionSource::InlineHint, content));
        }

        if let Some(resolution) = self.match_project(operation).await? {
            return Ok(resolution);
        }

        let extension = self.fallback_extension(operation).await;
        let path = self.unused_new_file_name(&extension).await?;
        info!(path = %path, "no existing target, synthesizing file name");
        Ok(Resolution::new(path, ResolutionSource::Synthesized, operation.content.clone()))
    }

    async fn match_project(&self, operation: &FileOperation) -> Result<Option<Resolution>> {
        let identifiers = extract_identifiers(&operation.content);
        if identifiers.is_empty() {
            return Ok(None);
        }

        let mut files = match self.store.list_project_files(".").await {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "project listing failed, skipping identifier match");
                return Ok(None);
            }
        };
        // Same-language files are tried first.
        if let Some(ext) = operation.language.as_deref().and_then(extension_for_language) {
            files.sort_by_key(|f| !f.path.ends_with(&format!(".{ext}")));
        }

        let mut candidates = Vec::new();
        for file in files {
            let Ok(Some(content)) = self.store.read_file(&file.path).await else {
                continue;
            };
            if content.len() > self.config.max_scan_bytes {
                continue;
            }
            let score = score_file(&content, &identifiers);
            if score.declares || score.matches >= self.config.min_identifier_matches {
                debug!(path = %file.path, matches = score.matches, declares = score.declares, "project match");
                candidates.push(file.path);
            }
        }

        let Some(first) = candidates.first().cloned() else {
            return Ok(None);
        };
        let ambiguous = candidates.len() > 1;
        if ambiguous {
            warn!(chosen = %first, candidates = ?candidates, "ambiguous project match, using first candidate");
        }
        Ok(Some(Resolution {
            path: first,
            source: ResolutionSource::ProjectMatch { ambiguous },
            content: operation.content.clone(),
            candidates,
        }))
    }

    async fn fallback_extension(&self, operation: &FileOperation) -> String {
        if let Some(ext) = operation.language.as_deref().and_then(extension_for_language) {
            return ext.to_string();
        }
        self.classify_extension(&operation.content).await
    }

    /// Ask the cheap model for an extension. Anything outside the whitelist,
    /// and any failure, becomes `txt`.
    async fn classify_extension(&self, content: &str) -> String {
        let sample: String = content.chars().take(CLASSIFIER_SAMPLE_CHARS).collect();
        let messages = [
            ChatMessage::system(
                "Identify the programming language of the code. Reply with only the file \
                 extension (for example: py, rs, ts), nothing else.",
            ),
            ChatMessage::user(sample),
        ];
        let params = SamplingParams::default().with_temperature(0.1).with_max_tokens(10);

        match self.gateway.complete_text(Purpose::Summary, &messages, &params).await {
            Ok(answer) => {
                let ext = parse_extension_answer(&answer);
                if EXTENSION_WHITELIST.contains(&ext.as_str()) {
                    ext
                } else {
                    debug!(answer = %answer, "classifier answer not whitelisted");
                    "txt".to_string()
                }
            }
            Err(e) => {
                warn!(error = %e, "file type detection failed");
                "txt".to_string()
            }
        }
    }

    async fn unused_new_file_name(&self, extension: &str) -> Result<String> {
        let mut candidate = format!("{NEW_FILE_STEM}.{extension}");
        let mut counter = 1;
        while self.store.exists(&candidate).await? {
            candidate = format!("{NEW_FILE_STEM}_{counter}.{extension}");
            counter += 1;
        }
        Ok(candidate)
    }
}

/// A filename comment on the first meaningful line. Returns the path and the
/// content with that line removed.
pub fn inline_hint(content: &str) -> Option<(String, String)> {
    let mut lines: Vec<&str> = content.lines().collect();
    let mut index = lines.iter().position(|l| !l.trim().is_empty())?;
    if lines[index].trim_start().starts_with("#!") {
        index = index + 1 + lines[index + 1..].iter().position(|l| !l.trim().is_empty())?;
    }

    let line = lines[index];
    let path = [&*HINT_LINE, &*HINT_HTML, &*HINT_BLOCK]
        .iter()
        .find_map(|re| re.captures(line))
        .map(|c| normalize_path(&c[1]))?;

    lines.remove(index);
    Some((path, lines.join("\n")))
}

pub fn extract_identifiers(content: &str) -> BTreeSet<String> {
    let mut identifiers = BTreeSet::new();
    for re in [&*TYPE_DECL, &*FUNCTION_DECL, &*VARIABLE_DECL, &*NAMED_EXPORT] {
        for caps in re.captures_iter(content) {
            identifiers.insert(caps[1].to_string());
        }
    }
    for caps in NAMED_IMPORT.captures_iter(content) {
        for symbol in caps[1].split(',') {
            // `a as b` binds `b`
            let name = symbol.split_whitespace().last().unwrap_or("");
            if !name.is_empty() {
                identifiers.insert(name.to_string());
            }
        }
    }
    identifiers.retain(|id| id.len() >= 3 && !STOP_IDENTIFIERS.contains(&id.to_lowercase().as_str()));
    identifiers
}

struct FileScore {
    matches: usize,
    declares: bool,
}

fn score_file(content: &str, identifiers: &BTreeSet<String>) -> FileScore {
    let mut matches = 0;
    let mut declares = false;
    for id in identifiers {
        let escaped = regex::escape(id);
        let Ok(word) = Regex::new(&format!(r"\b{escaped}\b")) else {
            continue;
        };
        if word.is_match(content) {
            matches += 1;
        }
        if !declares {
            let pattern = format!(
                r"\b(?:class|struct|enum|trait|interface|type|function|def|fn|func|const|let|var)\s+{escaped}\b"
            );
            declares = Regex::new(&pattern).is_ok_and(|re| re.is_match(content));
        }
    }
    FileScore { matches, declares }
}

pub fn extension_for_language(language: &str) -> Option<&'static str> {
    let language = language.trim().to_lowercase();
    let ext = match language.as_str() {
        "rust" => "rs",
        "python" | "python3" => "py",
        "javascript" | "node" => "js",
        "typescript" => "ts",
        "golang" => "go",
        "kotlin" => "kt",
        "c++" | "cxx" => "cpp",
        "csharp" | "c#" => "cs",
        "ruby" => "rb",
        "shell" | "bash" | "zsh" => "sh",
        "powershell" => "ps1",
        "markdown" => "md",
        "haskell" => "hs",
        "ocaml" => "ml",
        "elixir" => "ex",
        "text" | "plaintext" => "txt",
        other => return EXTENSION_WHITELIST.iter().copied().find(|ext| *ext == other),
    };
    Some(ext)
}

fn parse_extension_answer(answer: &str) -> String {
    answer
        .trim()
        .trim_start_matches('.')
        .split(|c: char| !c.is_ascii_alphanumeric())
        .next()
        .unwrap_or("")
        .to_lowercase()
}
