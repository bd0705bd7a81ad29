//! Rule line format
//!
//! Every rule this system writes is a single line of the form
//!
//! ```text
//! SUBSYSTEM=="tty", DEVPATH=="<port path>", SYMLINK+="<name>"
//! ```
//!
//! stored in `99-<name>.rules`.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use portbind_detect::PortPath;
use regex::Regex;

/// Priority prefix of every managed rule file
pub const RULE_FILE_PREFIX: &str = "99-";

/// Extension udev looks for
pub const RULE_FILE_EXTENSION: &str = "rules";

/// Subsystem every managed rule matches on
pub const TTY_SUBSYSTEM: &str = "tty";

fn subsystem_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"SUBSYSTEM=="([^"]*)""#).expect("static regex"))
}

fn devpath_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"DEVPATH=="([^"]*)""#).expect("static regex"))
}

fn symlink_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"SYMLINK\+=["']*([^"']+)["']"#).expect("static regex"))
}

/// Keep only `[A-Za-z0-9_-]`; `None` if nothing is left
pub fn sanitize_symlink_name(name: &str) -> Option<String> {
    let clean: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    (!clean.is_empty()).then_some(clean)
}

/// `99-<name>.rules`
pub fn rule_file_name(name: &str) -> String {
    format!("{RULE_FILE_PREFIX}{name}.{RULE_FILE_EXTENSION}")
}

/// Render the rule binding `port_path` to `name`
pub fn render_rule(port_path: &PortPath, name: &str) -> String {
    format!(
        r#"SUBSYSTEM=="{TTY_SUBSYSTEM}", DEVPATH=="{}", SYMLINK+="{}""#,
        port_path, name
    )
}

/// Fields of interest extracted from one rule line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleFields {
    pub subsystem: Option<String>,
    pub devpath: Option<String>,
    pub symlink: Option<String>,
}

impl RuleFields {
    pub fn parse(line: &str) -> Self {
        let capture = |re: &Regex| re.captures(line).map(|caps| caps[1].to_string());
        Self {
            subsystem: capture(subsystem_regex()),
            devpath: capture(devpath_regex()),
            symlink: capture(symlink_regex()),
        }
    }

    /// Whether this line has exactly the shape [`render_rule`] produces
    pub fn is_template(&self) -> bool {
        self.subsystem.as_deref() == Some(TTY_SUBSYSTEM)
            && self.devpath.is_some()
            && self
                .symlink
                .as_deref()
                .is_some_and(|s| sanitize_symlink_name(s).as_deref() == Some(s))
    }
}

/// Lines worth parsing: not blank, not a comment
pub fn rule_lines(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

/// Whether a file name follows the `99-<name>.rules` convention
pub fn is_managed_file_name(path: &Path) -> bool {
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let Some(stem) = file_name
        .strip_prefix(RULE_FILE_PREFIX)
        .and_then(|rest| rest.strip_suffix(&format!(".{RULE_FILE_EXTENSION}")))
    else {
        return false;
    };
    sanitize_symlink_name(stem).as_deref() == Some(stem)
}

/// Whether `content` consists solely of rules this system writes
pub fn is_managed_content(content: &str) -> bool {
    let mut lines = rule_lines(content).peekable();
    lines.peek().is_some() && lines.all(|line| RuleFields::parse(line).is_template())
}

/// A persisted rule line matching some port path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingRule {
    /// File the line lives in
    pub file: PathBuf,
    /// The line as found (trimmed)
    pub line: String,
    /// Port path from the line's `DEVPATH` match
    pub port_path: PortPath,
    /// Symlink the line binds, if it has one
    pub symlink: Option<String>,
}
