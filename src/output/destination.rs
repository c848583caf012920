use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::recipe::OutputTarget;

/// Where a caller wants an outcome delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Stdout,
    Clipboard,
    /// `file` or `file:<path>`; no path means `<recipe>.json` in the output dir
    File(Option<PathBuf>),
    /// Anything else; never supported, reported by name
    Named(String),
}

impl Destination {
    /// The default destination for a declared target
    pub fn from_target(target: OutputTarget) -> Self {
        match target {
            OutputTarget::Stdout => Destination::Stdout,
            OutputTarget::Clipboard => Destination::Clipboard,
            OutputTarget::File => Destination::File(None),
        }
    }

    /// The declarable target this destination needs, if any
    pub fn target(&self) -> Option<OutputTarget> {
        match self {
            Destination::Stdout => Some(OutputTarget::Stdout),
            Destination::Clipboard => Some(OutputTarget::Clipboard),
            Destination::File(_) => Some(OutputTarget::File),
            Destination::Named(_) => None,
        }
    }
}

impl FromStr for Destination {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Ok(match s {
            "stdout" => Destination::Stdout,
            "clipboard" => Destination::Clipboard,
            "file" => Destination::File(None),
            _ => match s.strip_prefix("file:") {
                Some("") => Destination::File(None),
                Some(path) => Destination::File(Some(PathBuf::from(path))),
                None => Destination::Named(s.to_string()),
            },
        })
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Stdout => f.write_str("stdout"),
            Destination::Clipboard => f.write_str("clipboard"),
            Destination::File(None) => f.write_str("file"),
            Destination::File(Some(path)) => write!(f, "file:{}", path.display()),
            Destination::Named(name) => f.write_str(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Destination {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_destinations() {
        assert_eq!(parse("stdout"), Destination::Stdout);
        assert_eq!(parse(" clipboard "), Destination::Clipboard);
        assert_eq!(parse("file"), Destination::File(None));
        assert_eq!(parse("file:"), Destination::File(None));
        assert_eq!(
            parse("file:out/result.json"),
            Destination::File(Some(PathBuf::from("out/result.json")))
        );
        assert_eq!(parse("slack"), Destination::Named("slack".into()));
    }

    #[test]
    fn test_display_round_trips() {
        for text in ["stdout", "clipboard", "file", "file:/tmp/x.json", "webhook"] {
            assert_eq!(parse(text).to_string(), text);
        }
        assert_eq!(parse("webhook").target(), None);
        assert_eq!(parse("file:a").target(), Some(OutputTarget::File));
    }
}
