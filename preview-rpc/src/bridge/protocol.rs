//! Command vocabulary for host-worker communication.
//!
//! A command is a single line of text: the kind name followed by positional
//! arguments, separated by single spaces. Arguments are neither quoted nor
//! escaped, so an argument containing a space does not survive a round trip.
//!
//! - **ATTACH**: worker -> host, first message on a fresh connection
//! - **PREVIEW_CLASSPATH**: host -> worker, followed by a data frame with the classpath
//! - **FRAME_REQUEST** `<name> <width> <height>`: host -> worker
//! - **FRAME** `<width> <height>`: worker -> host, followed by a data frame with pixels

use std::fmt;

const SEPARATOR: char = ' ';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Attach,
    PreviewClasspath,
    FrameRequest,
    Frame,
}

impl CommandKind {
    pub const ALL: [CommandKind; 4] = [
        Self::Attach,
        Self::PreviewClasspath,
        Self::FrameRequest,
        Self::Frame,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attach => "ATTACH",
            Self::PreviewClasspath => "PREVIEW_CLASSPATH",
            Self::FrameRequest => "FRAME_REQUEST",
            Self::Frame => "FRAME",
        }
    }

    /// Exact, case-sensitive lookup.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised when a well-formed command carries arguments its receiver
/// cannot use.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("expected {expected} command, got {actual}")]
    UnexpectedKind {
        expected: CommandKind,
        actual: CommandKind,
    },

    #[error("{kind} is missing argument #{index}")]
    MissingArgument { kind: CommandKind, index: usize },

    #[error("{kind} argument #{index} is not a valid dimension: '{value}'")]
    InvalidDimension {
        kind: CommandKind,
        index: usize,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    kind: CommandKind,
    args: Vec<String>,
}

impl Command {
    pub fn new(kind: CommandKind, args: Vec<String>) -> Self {
        Self { kind, args }
    }

    pub fn attach() -> Self {
        Self::new(CommandKind::Attach, Vec::new())
    }

    pub fn preview_classpath() -> Self {
        Self::new(CommandKind::PreviewClasspath, Vec::new())
    }

    pub fn frame_request(target: &str, width: u32, height: u32) -> Self {
        Self::new(
            CommandKind::FrameRequest,
            vec![target.to_string(), width.to_string(), height.to_string()],
        )
    }

    pub fn frame(width: u32, height: u32) -> Self {
        Self::new(
            CommandKind::Frame,
            vec![width.to_string(), height.to_string()],
        )
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Joins the kind name and the arguments with single spaces.
    pub fn encode(&self) -> String {
        let mut line = String::from(self.kind.as_str());
        for arg in &self.args {
            line.push(SEPARATOR);
            line.push_str(arg);
        }
        line
    }

    /// Parses a command line. Returns `None` when the first token is not a
    /// known kind name; remaining tokens become arguments verbatim.
    pub fn decode(line: &str) -> Option<Self> {
        let mut words = line.split(SEPARATOR);
        let kind = CommandKind::from_name(words.next()?)?;
        let args = words.map(str::to_string).collect();
        Some(Self { kind, args })
    }

    /// Arguments of a FRAME_REQUEST: target name, width, height.
    pub fn frame_request_args(&self) -> Result<(&str, u32, u32), ProtocolError> {
        self.expect_kind(CommandKind::FrameRequest)?;
        let target = self.arg(0)?;
        Ok((target, self.dimension(1)?, self.dimension(2)?))
    }

    /// Width and height reported by a FRAME.
    pub fn frame_size(&self) -> Result<(u32, u32), ProtocolError> {
        self.expect_kind(CommandKind::Frame)?;
        Ok((self.dimension(0)?, self.dimension(1)?))
    }

    fn expect_kind(&self, expected: CommandKind) -> Result<(), ProtocolError> {
        if self.kind == expected {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedKind {
                expected,
                actual: self.kind,
            })
        }
    }

    fn arg(&self, index: usize) -> Result<&str, ProtocolError> {
        self.args
            .get(index)
            .map(String::as_str)
            .ok_or(ProtocolError::MissingArgument {
                kind: self.kind,
                index,
            })
    }

    fn dimension(&self, index: usize) -> Result<u32, ProtocolError> {
        let value = self.arg(index)?;
        value.parse().map_err(|_| ProtocolError::InvalidDimension {
            kind: self.kind,
            index,
            value: value.to_string(),
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_kind_and_args() {
        insta::assert_snapshot!(Command::attach().encode(), @"ATTACH");
        insta::assert_snapshot!(
            Command::frame_request("com.Foo", 100, 50).encode(),
            @"FRAME_REQUEST com.Foo 100 50"
        );
        insta::assert_snapshot!(Command::frame(640, 480).to_string(), @"FRAME 640 480");
    }

    #[test]
    fn decode_roundtrips_space_free_args() {
        let commands = [
            Command::attach(),
            Command::preview_classpath(),
            Command::frame_request("androidx.compose.Preview", 1920, 1080),
            Command::frame(0, 0),
            Command::new(CommandKind::Frame, vec![String::new(), "x".to_string()]),
        ];
        for command in commands {
            assert_eq!(Command::decode(&command.encode()), Some(command));
        }
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        assert_eq!(Command::decode(""), None);
        assert_eq!(Command::decode("HELLO 1 2"), None);
        assert_eq!(Command::decode("attach"), None);
        assert_eq!(Command::decode(" ATTACH"), None);
    }

    #[test]
    fn decode_keeps_empty_tokens_verbatim() {
        let command = Command::decode("FRAME  7").unwrap();
        assert_eq!(command.kind(), CommandKind::Frame);
        assert_eq!(command.args(), ["", "7"]);
    }

    #[test]
    fn args_with_spaces_are_lossy() {
        let command = Command::new(CommandKind::FrameRequest, vec!["a b".to_string()]);
        let decoded = Command::decode(&command.encode()).unwrap();
        assert_eq!(decoded.args(), ["a", "b"]);
    }

    #[test]
    fn frame_request_args_parse() {
        let command = Command::decode("FRAME_REQUEST com.Foo 100 50").unwrap();
        assert_eq!(command.frame_request_args(), Ok(("com.Foo", 100, 50)));
    }

    #[test]
    fn frame_size_rejects_bad_arguments() {
        assert_eq!(
            Command::decode("FRAME 100").unwrap().frame_size(),
            Err(ProtocolError::MissingArgument {
                kind: CommandKind::Frame,
                index: 1
            })
        );
        assert_eq!(
            Command::decode("FRAME 100 -5").unwrap().frame_size(),
            Err(ProtocolError::InvalidDimension {
                kind: CommandKind::Frame,
                index: 1,
                value: "-5".to_string()
            })
        );
        assert_eq!(
            Command::attach().frame_size(),
            Err(ProtocolError::UnexpectedKind {
                expected: CommandKind::Frame,
                actual: CommandKind::Attach
            })
        );
    }

    #[test]
    fn kind_lookup_is_exact() {
        for kind in CommandKind::ALL {
            assert_eq!(CommandKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(CommandKind::from_name("Frame"), None);
    }
}
