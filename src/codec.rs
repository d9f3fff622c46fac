//! Line-framed wire codec: parsing, typed commands, numeric replies.

use nom::{
    IResult,
    bytes::complete::{take_till, take_while1},
    character::complete::{char, space0, space1},
    combinator::{opt, rest},
    multi::many0,
};

use crate::error::CodecError;

pub const MAX_LINE_LEN: usize = 4096;

/// Server/system prefix used for all server-originated messages.
pub const SERVER_NAME: &str = "server";
pub const SYSTEM_NAME: &str = "system";

fn is_nospcrlfcl(c: char) -> bool {
    !matches!(c, ' ' | '\r' | '\n' | '\0' | ':')
}

fn middle_parser(input: &str) -> IResult<&str, &str> {
    take_while1(is_nospcrlfcl)(input)
}

fn trailing_parser(input: &str) -> IResult<&str, &str> {
    let (input, _) = char(':')(input)?;
    rest(input)
}

fn prefix_parser(input: &str) -> IResult<&str, &str> {
    let (input, _) = char(':')(input)?;
    let (input, prefix) = take_till(|c| c == ' ')(input)?;
    let (input, _) = space1(input)?;
    Ok((input, prefix))
}

fn command_word_parser(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric())(input)
}

fn params_parser(input: &str) -> IResult<&str, (Vec<&str>, Option<&str>)> {
    let (input, middles) = many0(|i| {
        let (i, _) = space1(i)?;
        middle_parser(i)
    })(input)?;
    let (input, _) = space0(input)?;
    let (input, trailing) = opt(trailing_parser)(input)?;
    Ok((input, (middles, trailing)))
}

/// A parsed message, prior to semantic interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    /// Parses a single line (without its trailing `\n`).
    pub fn parse(line: &str) -> Result<Self, CodecError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (input, prefix) =
            opt(prefix_parser)(line).map_err(|_| CodecError::MissingPrefixSpace)?;
        let (input, command) =
            command_word_parser(input).map_err(|_| CodecError::EmptyCommand)?;
        if command.is_empty() {
            return Err(CodecError::EmptyCommand);
        }
        let (_, (middles, trailing)) = params_parser(input)
            .map_err(|_| CodecError::UnknownCommand(command.to_string()))?;

        let is_numeric = command.len() == 3 && command.chars().all(|c| c.is_ascii_digit());
        if command.len() == 3 && !is_numeric && command.chars().any(|c| c.is_ascii_digit()) {
            return Err(CodecError::MalformedNumeric(command.to_string()));
        }
        if !is_numeric && KNOWN_COMMANDS.iter().all(|k| !k.eq_ignore_ascii_case(command)) {
            return Err(CodecError::UnknownCommand(command.to_string()));
        }

        let mut params: Vec<String> = middles.into_iter().map(str::to_string).collect();
        if let Some(t) = trailing {
            params.push(t.to_string());
        }

        Ok(Message {
            prefix: prefix.map(str::to_string),
            command: command.to_string(),
            params,
        })
    }

    /// Serializes back to wire form, without the trailing `\n`.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        if let Some(p) = &self.prefix {
            out.push(':');
            out.push_str(p);
            out.push(' ');
        }
        out.push_str(&self.command);
        if let Some((last, head)) = self.params.split_last() {
            for p in head {
                out.push(' ');
                out.push_str(p);
            }
            out.push(' ');
            if last.contains(' ') || last.is_empty() || last.starts_with(':') {
                out.push(':');
            }
            out.push_str(last);
        }
        out
    }
}

const KNOWN_COMMANDS: &[&str] = &[
    "NICK", "USER", "JOIN", "PRIVMSG", "MODE", "WHOIS", "KICK", "PING", "PONG", "QUIT",
];

/// The special target meaning "the caller's currently joined channel".
pub const CURRENT_CHANNEL_TARGET: &str = "---";

/// Numeric replies used by this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Numeric {
    RplWhoisUser = 311,
    ErrNoSuchNick = 401,
    ErrNoSuchChannel = 403,
    ErrCannotSendToChan = 404,
    ErrErroneusNickname = 432,
    ErrNicknameInUse = 433,
    ErrNotOnChannel = 442,
    ErrNeedMoreParams = 461,
    ErrAlreadyRegistered = 462,
    ErrChanOprivsNeeded = 482,
}

impl Numeric {
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// Formats a numeric reply line as `:{SERVER_NAME} {code:03} {rest}`.
pub fn format_numeric(numeric: Numeric, rest: &str) -> String {
    format!(":{SERVER_NAME} {:03} {rest}", numeric.code())
}

/// Formats a system-originated PRIVMSG to a channel.
pub fn format_system_privmsg(channel: &str, text: &str) -> String {
    format!(":{SYSTEM_NAME} PRIVMSG {channel} :{text}")
}

/// Formats a user-originated PRIVMSG to a channel.
pub fn format_user_privmsg(nick: &str, channel: &str, text: &str) -> String {
    format!(":{nick} PRIVMSG {channel} :{text}")
}

/// Splits an outbound message (already newline-terminated or not) into
/// chunks of at most `MAX_LINE_LEN` bytes, each newline-terminated.
pub fn chunk_message(msg: &str) -> Vec<String> {
    let line = if msg.ends_with('\n') {
        msg.to_string()
    } else {
        format!("{msg}\n")
    };
    let bytes = line.as_bytes();
    if bytes.len() <= MAX_LINE_LEN {
        return vec![line];
    }
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < bytes.len() {
        let mut end = (start + MAX_LINE_LEN).min(bytes.len());
        while end > start && !line.is_char_boundary(end) {
            end -= 1;
        }
        chunks.push(line[start..end].to_string());
        start = end;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_command() {
        let m = Message::parse("NICK alice\n").unwrap();
        assert_eq!(m.command, "NICK");
        assert_eq!(m.params, vec!["alice"]);
    }

    #[test]
    fn parses_command_with_trailing() {
        let m = Message::parse("PRIVMSG #room :hello there\n").unwrap();
        assert_eq!(m.command, "PRIVMSG");
        assert_eq!(m.params, vec!["#room", "hello there"]);
    }

    #[test]
    fn parses_prefixed_message() {
        let m = Message::parse(":alice PRIVMSG #room :hi\n").unwrap();
        assert_eq!(m.prefix.as_deref(), Some("alice"));
        assert_eq!(m.command, "PRIVMSG");
    }

    #[test]
    fn rejects_unknown_command() {
        let err = Message::parse("FROBNICATE foo\n").unwrap_err();
        assert_eq!(err, CodecError::UnknownCommand("FROBNICATE".to_string()));
    }

    #[test]
    fn rejects_empty_command() {
        let err = Message::parse("\n").unwrap_err();
        assert_eq!(err, CodecError::EmptyCommand);
    }

    #[test]
    fn accepts_three_digit_numeric() {
        let m = Message::parse("311 bob 1.2.3.4\n").unwrap();
        assert_eq!(m.command, "311");
    }

    #[test]
    fn rejects_malformed_numeric() {
        let err = Message::parse("31X bob\n").unwrap_err();
        assert!(matches!(err, CodecError::MalformedNumeric(_)));
    }

    #[test]
    fn round_trips_params_with_trailing() {
        let m = Message {
            prefix: Some("alice".to_string()),
            command: "PRIVMSG".to_string(),
            params: vec!["#room".to_string(), "hello there".to_string()],
        };
        let serialized = m.serialize();
        let reparsed = Message::parse(&serialized).unwrap();
        assert_eq!(m, reparsed);
    }

    #[test]
    fn chunk_message_splits_at_max_line_len() {
        let body = "a".repeat(MAX_LINE_LEN + 10);
        let chunks = chunk_message(&body);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].len() <= MAX_LINE_LEN);
    }

    #[test]
    fn chunk_message_single_chunk_under_limit() {
        let chunks = chunk_message("short line");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], "short line\n");
    }

    #[test]
    fn numeric_format_matches_expected_shape() {
        let line = format_numeric(Numeric::ErrNicknameInUse, ":Nickname is already in use");
        assert_eq!(line, ":server 433 :Nickname is already in use");
    }
}
