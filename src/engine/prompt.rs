//! Prompt patterns and shell-family detection for the bootstrap handshake.

use once_cell::sync::Lazy;
use regex::Regex;

/// Default prompt of a freshly logged-in shell (`$` for users, `#` for root).
pub static INITIAL_PROMPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$|#").expect("valid initial prompt pattern"));

/// Literal prompt installed by the engine once the shell is configured.
pub const ENGINE_PROMPT_TEXT: &str = "~deploy-engine~> ";

/// Pattern matching [`ENGINE_PROMPT_TEXT`].
pub static ENGINE_PROMPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&regex::escape(ENGINE_PROMPT_TEXT)).expect("valid engine prompt pattern")
});

/// Turns off terminal echo so sent commands do not come back as output.
pub const ECHO_OFF: &str = "stty -echo";

/// Prints the name of the running shell process.
pub const SHELL_QUERY: &str = "ps -p $$ -o comm=";

// Split across two quoted words so the command line itself never contains
// the prompt text.
const ENGINE_PROMPT_QUOTED: &str = "'~deploy''-engine~> '";

/// Marker echoed to find the end of output left behind by a timed-out wait.
pub const SYNC_MARKER_TEXT: &str = "~deploy-sync~";

/// Command printing [`SYNC_MARKER_TEXT`] followed by `token`.
pub fn sync_command(token: &str) -> String {
    format!("echo '~deploy''-sync~ {}'", token)
}

/// Login shells the prompt protocol knows how to configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellFamily {
    Bash,
    Zsh,
}

impl ShellFamily {
    /// Identify the shell family from the output of [`SHELL_QUERY`].
    ///
    /// The first non-empty line is used. A login-shell `-` marker and any
    /// path prefix are ignored, so `-bash` and `/usr/bin/zsh` are accepted.
    pub fn detect(raw: &str) -> Option<Self> {
        let name = shell_name(raw);
        match name {
            "bash" => Some(ShellFamily::Bash),
            "zsh" => Some(ShellFamily::Zsh),
            _ => None,
        }
    }

    /// Command that installs the engine prompt and clears every other prompt.
    pub fn prompt_command(&self) -> String {
        match self {
            ShellFamily::Bash => format!(
                "unset PROMPT_COMMAND; PS1={}; PS2=''",
                ENGINE_PROMPT_QUOTED
            ),
            ShellFamily::Zsh => format!(
                "unset precmd_functions; PROMPT={}; RPROMPT=''; PROMPT2=''",
                ENGINE_PROMPT_QUOTED
            ),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ShellFamily::Bash => "bash",
            ShellFamily::Zsh => "zsh",
        }
    }
}

/// Normalized shell name from raw query output, for error reporting.
pub fn shell_name(raw: &str) -> &str {
    let line = raw
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("");
    let line = line.trim_start_matches('-');
    line.rsplit('/').next().unwrap_or(line)
}

/// Quote `text` as a single POSIX shell word.
pub fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// Escape `text` so a POSIX extended regex (`pkill`, `grep -E`) matches it
/// literally.
pub fn extended_regex_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(
            c,
            '.' | '[' | ']' | '(' | ')' | '*' | '+' | '?' | '{' | '}' | '|' | '^' | '$' | '\\'
        ) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
