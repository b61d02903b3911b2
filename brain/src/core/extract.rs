//! Command extraction from free-form model responses.
//!
//! Three tiers are tried in order and the first tier that yields anything wins:
//! fenced blocks with a shell tag, untagged fenced blocks (after dropping fences
//! tagged with a known non-shell language), then a heuristic line scan. An
//! empty result is a valid outcome for explanatory answers.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::CommandBlock;

const SHELL_TAGS: &[&str] = &[
    "shell",
    "bash",
    "sh",
    "zsh",
    "powershell",
    "pwsh",
    "ps1",
    "ps",
    "cmd",
    "bat",
    "batch",
    "terminal",
    "console",
];

const NON_SHELL_TAGS: &[&str] = &[
    "python",
    "py",
    "javascript",
    "js",
    "jsx",
    "typescript",
    "ts",
    "tsx",
    "json",
    "jsonc",
    "yaml",
    "yml",
    "toml",
    "ini",
    "sql",
    "html",
    "css",
    "scss",
    "xml",
    "rust",
    "rs",
    "go",
    "java",
    "kotlin",
    "c",
    "cpp",
    "csharp",
    "cs",
    "ruby",
    "rb",
    "php",
    "swift",
    "markdown",
    "md",
    "diff",
    "dockerfile",
    "text",
    "txt",
    "plaintext",
    "env",
];

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)^[ \t]*```[ \t]*([A-Za-z0-9_+.#-]*)[^\n]*\n(.*?)^[ \t]*```[ \t]*$")
        .expect("fence regex should compile")
});

static PROMPT_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:PS(?: [A-Za-z]:[^>]*)?>|\$|>)\s+").expect("prompt marker regex should compile")
});

static HEURISTIC_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^\$\s+\S",
        r"^(?:>|PS(?: [A-Za-z]:[^>]*)?>)\s+(?:mkdir|cd|git|npm|npx|yarn|pnpm|pip3?|cargo|curl|wget|ls|cat|echo|touch|cp|mv|rm|docker|kubectl|node|python3?|dotnet|deno|bun|brew|apt(?:-get)?|chmod|tar|(?:Get|Set|New|Remove|Invoke|Copy|Move|Test|Start|Stop)-[A-Za-z]+)\b",
        r"^(?:mkdir|cd|git|npm|npx|yarn|pnpm|pip3?|cargo|curl|wget|ls|cat|echo|touch|cp|mv|rm|docker|kubectl|node|python3?|dotnet|deno|bun|brew|apt(?:-get)?|chmod|chown|tar|unzip|pwd)(?:\s|$)",
        r"^(?:Get|Set|New|Remove|Invoke|Copy|Move|Test|Start|Stop)-[A-Z][A-Za-z]*\b",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("heuristic regex should compile"))
    .collect()
});

#[derive(Debug)]
struct Fence<'a> {
    tag: String,
    body: &'a str,
    start: usize,
    end: usize,
}

/// Extract ordered command blocks from `text`. Never fails.
pub fn extract(text: &str) -> Vec<CommandBlock> {
    let text = normalize_newlines(text);
    let fences = find_fences(&text);

    let tagged: Vec<CommandBlock> = fences
        .iter()
        .filter(|fence| SHELL_TAGS.contains(&fence.tag.as_str()))
        .filter_map(|fence| block_from_body(fence.body))
        .collect();
    if !tagged.is_empty() {
        return tagged;
    }

    let untagged: Vec<CommandBlock> = fences
        .iter()
        .filter(|fence| fence.tag.is_empty())
        .filter_map(|fence| block_from_body(fence.body))
        .collect();
    if !untagged.is_empty() {
        return untagged;
    }

    let stripped = strip_non_shell_fences(&text, &fences);
    heuristic_scan(&stripped).into_iter().collect()
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

fn find_fences(text: &str) -> Vec<Fence<'_>> {
    FENCE_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some(Fence {
                tag: caps.get(1).map_or("", |m| m.as_str()).to_lowercase(),
                body: caps.get(2).map_or("", |m| m.as_str()),
                start: whole.start(),
                end: whole.end(),
            })
        })
        .collect()
}

fn strip_non_shell_fences(text: &str, fences: &[Fence<'_>]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for fence in fences
        .iter()
        .filter(|fence| NON_SHELL_TAGS.contains(&fence.tag.as_str()))
    {
        out.push_str(&text[cursor..fence.start]);
        cursor = fence.end;
    }
    out.push_str(&text[cursor..]);
    out
}

/// Fence bodies are kept verbatim apart from trailing whitespace and the
/// blank lines around them, so heredocs and indentation survive. Prompt
/// markers are stripped only when every line carries one.
fn block_from_body(body: &str) -> Option<CommandBlock> {
    let mut lines: Vec<&str> = body.lines().map(str::trim_end).collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    let first = lines.iter().position(|line| !line.is_empty())?;
    let lines = &lines[first..];
    if lines.iter().all(|line| line.is_empty() || line.trim_start().starts_with('#')) {
        return None;
    }

    let transcript = lines
        .iter()
        .filter(|line| !line.is_empty())
        .all(|line| PROMPT_MARKER_RE.is_match(line));
    let lines = lines
        .iter()
        .map(|line| {
            if transcript {
                strip_prompt_marker(line)
            } else {
                line.to_string()
            }
        })
        .collect();
    Some(CommandBlock::new(lines))
}

fn heuristic_scan(text: &str) -> Option<CommandBlock> {
    let lines: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("```"))
        .filter(|line| HEURISTIC_RES.iter().any(|re| re.is_match(line)))
        .map(strip_prompt_marker)
        .filter(|line| !line.is_empty())
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(CommandBlock::new(lines))
    }
}

fn strip_prompt_marker(line: &str) -> String {
    PROMPT_MARKER_RE.replace(line, "").trim().to_string()
}
