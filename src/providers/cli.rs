//! Subprocess CLI provider.
//!
//! Drives a local agent CLI (claude / copilot / codex / kimi) as a chat
//! backend. Messages are flattened into a single role-prefixed prompt;
//! the reply is read from stdout or from a temp output file when the
//! argument template asks for one. CLI backends cannot join tool-call
//! loops ([`Provider::supports_tools`] is `false`).

use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use super::{ChatMessage, ChatOptions, ChatResponse, Provider};
use crate::config::ProviderEntry;

const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CHAT_TIMEOUT: Duration = Duration::from_secs(300);

/// Kill-switch: when set, `--allow-all-tools` is stripped from CLI
/// argument templates.
const TOOLS_KILL_SWITCH: &str = "ANT_DISABLE_PROVIDER_TOOLS";

// ---------------------------------------------------------------------------
// CliKind – variant table
// ---------------------------------------------------------------------------

/// Supported CLI flavors. Output parsing and default flags are
/// per-variant; adding a flavor means extending this enum, not the
/// provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliKind {
    Claude,
    Copilot,
    Codex,
    Kimi,
}

impl CliKind {
    /// Executable name used when the config omits `command`.
    pub fn default_command(&self) -> &'static str {
        match self {
            CliKind::Claude => "claude",
            CliKind::Copilot => "copilot",
            CliKind::Codex => "codex",
            CliKind::Kimi => "kimi",
        }
    }

    /// Flags appended when the argument template has no `{prompt}`
    /// placeholder. Codex with a `-` argument reads the prompt from
    /// stdin instead.
    fn default_prompt_args(&self, prompt: &str) -> Vec<String> {
        match self {
            CliKind::Claude => vec!["--print".into(), prompt.into()],
            CliKind::Copilot => vec!["-p".into(), prompt.into()],
            CliKind::Codex => vec!["exec".into(), prompt.into()],
            CliKind::Kimi => vec![prompt.into()],
        }
    }

    /// Variant-specific output parsing.
    fn parse_output(&self, raw: &str) -> anyhow::Result<String> {
        match self {
            CliKind::Kimi => parse_kimi_frames(raw),
            _ => Ok(raw.trim().to_string()),
        }
    }
}

impl FromStr for CliKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "claude" => Ok(CliKind::Claude),
            "copilot" => Ok(CliKind::Copilot),
            "codex" => Ok(CliKind::Codex),
            "kimi" => Ok(CliKind::Kimi),
            other => anyhow::bail!("invalid_config: unknown cli provider {other}"),
        }
    }
}

// ---------------------------------------------------------------------------
// CliProvider
// ---------------------------------------------------------------------------

/// Provider that spawns a CLI subprocess per chat call.
#[derive(Debug)]
pub struct CliProvider {
    id: String,
    kind: CliKind,
    command: String,
    args: Vec<String>,
    model: String,
}

impl CliProvider {
    pub fn new(id: &str, entry: &ProviderEntry) -> anyhow::Result<Self> {
        let kind = match entry.cli_provider.as_deref() {
            Some(name) => name.parse::<CliKind>()?,
            None => CliKind::Claude,
        };
        let command = match entry.command.as_deref().filter(|c| !c.is_empty()) {
            Some(c) => c.to_string(),
            None if entry.cli_provider.is_some() => kind.default_command().to_string(),
            None => {
                anyhow::bail!("invalid_config: cli provider {id} requires command or cli_provider")
            }
        };
        Ok(Self {
            id: id.to_string(),
            kind,
            command,
            args: entry.args.clone(),
            model: entry.model.clone(),
        })
    }

    /// Flatten chat messages into one role-prefixed prompt, optionally
    /// preceded by a thinking-level line.
    fn flatten_prompt(messages: &[ChatMessage], thinking: Option<&str>) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(level) = thinking.filter(|l| *l != "off") {
            parts.push(format!("Thinking level: {level}"));
        }
        for m in messages {
            let prefix = match m.role.as_str() {
                "system" => "System:",
                "assistant" => "Assistant:",
                "tool" => "Tool result:",
                _ => "User:",
            };
            parts.push(format!("{prefix} {}", m.content));
        }
        parts.join("\n\n")
    }

    /// Build the final argv. Returns `(args, output_file, stdin_payload)`.
    fn build_args(&self, prompt: &str) -> (Vec<String>, Option<PathBuf>, Option<String>) {
        let mut output_file: Option<PathBuf> = None;
        let mut substituted_prompt = false;

        let mut args: Vec<String> = Vec::with_capacity(self.args.len() + 2);
        for arg in &self.args {
            let mut value = arg.clone();
            if value.contains("{prompt}") {
                value = value.replace("{prompt}", prompt);
                substituted_prompt = true;
            }
            if value.contains("{output}") {
                let path = std::env::temp_dir()
                    .join(format!("antd-cli-{}.out", crate::utils::generate_nonce()));
                value = value.replace("{output}", &path.to_string_lossy());
                output_file = Some(path);
            }
            args.push(value);
        }

        if crate::utils::env_flag(TOOLS_KILL_SWITCH) {
            args.retain(|a| a != "--allow-all-tools");
        }

        let stdin_payload = if self.kind == CliKind::Codex && args.iter().any(|a| a == "-") {
            Some(prompt.to_string())
        } else {
            None
        };

        if !substituted_prompt && stdin_payload.is_none() {
            args.extend(self.kind.default_prompt_args(prompt));
        }

        (args, output_file, stdin_payload)
    }

    async fn run_subprocess(
        &self,
        args: &[String],
        stdin_payload: Option<&str>,
        timeout: Duration,
    ) -> anyhow::Result<(bool, String, String)> {
        let mut cmd = Command::new(&self.command);
        cmd.args(args)
            .stdin(if stdin_payload.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {}", self.command))?;

        if let Some(payload) = stdin_payload {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(payload.as_bytes()).await?;
                drop(stdin);
            }
        }

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let collect = async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            let stdout_read = async {
                if let Some(ref mut p) = stdout_pipe {
                    let _ = p.read_to_end(&mut out).await;
                }
            };
            let stderr_read = async {
                if let Some(ref mut p) = stderr_pipe {
                    let _ = p.read_to_end(&mut err).await;
                }
            };
            tokio::join!(stdout_read, stderr_read);
            let status = child.wait().await;
            (status, out, err)
        };

        match tokio::time::timeout(timeout, collect).await {
            Ok((status, out, err)) => {
                let status = status.context("wait for cli subprocess")?;
                Ok((
                    status.success(),
                    String::from_utf8_lossy(&out).into_owned(),
                    String::from_utf8_lossy(&err).into_owned(),
                ))
            }
            Err(_) => {
                // kill_on_drop delivers SIGKILL when the collect future
                // is dropped above.
                anyhow::bail!(
                    "provider {} timed out after {}ms",
                    self.id,
                    timeout.as_millis()
                )
            }
        }
    }
}

#[async_trait]
impl Provider for CliProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn supports_tools(&self) -> bool {
        false
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> anyhow::Result<ChatResponse> {
        let prompt = Self::flatten_prompt(messages, options.thinking.as_deref());
        let (args, output_file, stdin_payload) = self.build_args(&prompt);
        let timeout = options.timeout.unwrap_or(DEFAULT_CHAT_TIMEOUT);

        let result = self
            .run_subprocess(&args, stdin_payload.as_deref(), timeout)
            .await;

        // The temp output file must not leak even on failure.
        let file_output = match &output_file {
            Some(path) => {
                let content = tokio::fs::read_to_string(path).await.ok();
                let _ = tokio::fs::remove_file(path).await;
                content
            }
            None => None,
        };

        let (ok, stdout, stderr) = result?;
        let raw = match file_output.filter(|c| !c.trim().is_empty()) {
            Some(content) => content,
            None => stdout,
        };

        // Kimi interleaves throttling notices with frames; for other
        // variants only a failing exit is trusted as a throttle signal.
        if (self.kind == CliKind::Kimi && sniff_rate_limit(&raw))
            || (!ok && (sniff_rate_limit(&stderr) || sniff_rate_limit(&raw)))
        {
            anyhow::bail!(
                "provider {}: cli reported rate limit: {}",
                self.id,
                crate::utils::truncate_str(&stderr, 200)
            );
        }
        if !ok {
            anyhow::bail!(
                "provider {}: cli exited non-zero: {}",
                self.id,
                crate::utils::truncate_str(&stderr, 500)
            );
        }

        Ok(ChatResponse {
            content: self.kind.parse_output(&raw)?,
            tool_calls: Vec::new(),
            raw_tool_calls: None,
            model: Some(self.model.clone()),
            usage: None,
        })
    }

    async fn health(&self) -> bool {
        let probe = Command::new(&self.command)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(DEFAULT_HEALTH_TIMEOUT, probe).await {
            Ok(Ok(status)) => status.success(),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Rate-limit sniffing
// ---------------------------------------------------------------------------

/// CLI backends report throttling as free text; map the telltales to a
/// retriable failure so upper layers fail over instead of giving up.
fn sniff_rate_limit(raw: &str) -> bool {
    let lower = raw.to_lowercase();
    lower.contains("429") || (lower.contains("rate") && lower.contains("limit"))
}

// ---------------------------------------------------------------------------
// Kimi protocol-frame parsing
// ---------------------------------------------------------------------------

/// Markers identifying loop-control turns that carry no user-visible
/// text.
const LOOP_CONTROL_MARKERS: [&str; 2] = ["LoopControl", "loop_control"];

/// Parse kimi's protocol-frame output.
///
/// The CLI prints a transcript of `TurnBegin(...)` frames. Text before
/// the first frame is preamble and dropped; turns containing
/// loop-control markers are dropped; the remaining turns contribute
/// their `TextPart(... text='...')` payloads. Fragments that echo the
/// prompt (`System:` / `User:` prefixes) are discarded.
fn parse_kimi_frames(raw: &str) -> anyhow::Result<String> {
    let Some(start) = raw.find("TurnBegin(") else {
        return Ok(raw.trim().to_string());
    };

    let mut fragments: Vec<String> = Vec::new();
    for turn in raw[start..].split("TurnBegin(").filter(|t| !t.is_empty()) {
        if LOOP_CONTROL_MARKERS.iter().any(|m| turn.contains(m)) {
            continue;
        }
        for text in extract_text_parts(turn) {
            let trimmed = text.trim();
            if trimmed.is_empty()
                || trimmed.starts_with("System:")
                || trimmed.starts_with("User:")
            {
                continue;
            }
            fragments.push(trimmed.to_string());
        }
    }

    Ok(fragments.join("\n"))
}

/// Extract every `TextPart(... text='...')` payload from a turn,
/// unescaping `\'`, `\\`, `\n`, and `\t`. Hand-rolled scanning; the
/// frame syntax is too loose for a fixed pattern.
fn extract_text_parts(turn: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = turn;
    while let Some(part_at) = rest.find("TextPart(") {
        rest = &rest[part_at + "TextPart(".len()..];
        let Some(text_at) = rest.find("text='") else {
            continue;
        };
        rest = &rest[text_at + "text='".len()..];

        let mut value = String::new();
        let mut chars = rest.char_indices();
        let mut consumed = rest.len();
        while let Some((i, c)) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, 't')) => value.push('\t'),
                    Some((_, '\'')) => value.push('\''),
                    Some((_, '\\')) => value.push('\\'),
                    Some((_, other)) => {
                        value.push('\\');
                        value.push(other);
                    }
                    None => break,
                }
            } else if c == '\'' {
                consumed = i + 1;
                break;
            } else {
                value.push(c);
            }
        }
        out.push(value);
        rest = &rest[consumed.min(rest.len())..];
    }
    out
}
