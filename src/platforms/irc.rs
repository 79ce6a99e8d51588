//! Line-oriented IRC (IRCv3 tagged) message parsing.
//!
//! Grammar, each part optional: `@tags :prefix COMMAND params :trailing`.
//! Parsing never fails; a line with nothing usable comes back with an empty
//! command, which callers treat as "no event".

use std::collections::HashMap;

/// One parsed protocol line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IrcMessage {
    pub tags: HashMap<String, String>,
    pub prefix: Option<String>,
    pub command: String,
    /// Middle parameters, rejoined with single spaces
    pub params: String,
    pub trailing: Option<String>,
}

/// Result of parsing a line: a bare server keepalive, or a general message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrcLine {
    Ping { payload: Option<String> },
    Message(IrcMessage),
}

impl IrcMessage {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Nick portion of the prefix (`nick!user@host` or a bare nick)
    pub fn nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        let nick = match prefix.find('!') {
            Some(bang) => &prefix[..bang],
            None => prefix,
        };
        if nick.is_empty() {
            None
        } else {
            Some(nick)
        }
    }

    /// First middle parameter, e.g. the target channel of a PRIVMSG
    pub fn target(&self) -> Option<&str> {
        self.params.split(' ').find(|p| !p.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.command.is_empty()
    }
}

/// Parse one protocol line (without its CRLF terminator).
///
/// A line starting with `PING` is recognised before the general grammar so
/// the keepalive is answered even when nothing else on the line parses.
pub fn parse_line(line: &str) -> IrcLine {
    if let Some(rest) = line.strip_prefix("PING") {
        if rest.is_empty() || rest.starts_with(' ') {
            let payload = rest.trim_start();
            let payload = payload.strip_prefix(':').unwrap_or(payload);
            return IrcLine::Ping {
                payload: (!payload.is_empty()).then(|| payload.to_string()),
            };
        }
    }
    IrcLine::Message(parse_message(line))
}

/// Apply the general grammar to a line
pub fn parse_message(line: &str) -> IrcMessage {
    let mut message = IrcMessage::default();
    let mut rest = line;

    if let Some(after_at) = rest.strip_prefix('@') {
        match after_at.find(' ') {
            Some(space) => {
                message.tags = parse_tags(&after_at[..space]);
                rest = &after_at[space + 1..];
            }
            // Only tags, nothing after them
            None => {
                message.tags = parse_tags(after_at);
                return message;
            }
        }
    }

    if let Some(after_colon) = rest.strip_prefix(':') {
        match after_colon.find(' ') {
            Some(space) => {
                message.prefix = Some(after_colon[..space].to_string());
                rest = &after_colon[space + 1..];
            }
            None => {
                message.prefix = Some(after_colon.to_string());
                return message;
            }
        }
    }

    let command_and_params = match rest.find(" :") {
        Some(idx) => {
            message.trailing = Some(rest[idx + 2..].to_string());
            rest[..idx].trim()
        }
        None => rest.trim(),
    };

    let mut tokens = command_and_params.split(' ').filter(|t| !t.is_empty());
    if let Some(command) = tokens.next() {
        message.command = command.to_string();
        message.params = tokens.collect::<Vec<_>>().join(" ");
    }

    message
}

/// Split `key=value;key2=value2`. Tokens without `=` get an empty value;
/// a repeated key keeps its last value.
fn parse_tags(segment: &str) -> HashMap<String, String> {
    segment
        .split(';')
        .filter(|token| !token.is_empty())
        .map(|token| match token.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (token.to_string(), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(line: &str) -> IrcMessage {
        match parse_line(line) {
            IrcLine::Message(message) => message,
            other => panic!("expected a message, got {:?}", other),
        }
    }

    #[test]
    fn test_full_privmsg_line() {
        let msg = message(
            "@display-name=CoolUser;badge-info= :cooluser!cooluser@cooluser.tmi.twitch.tv PRIVMSG #chan :Hello world",
        );

        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.prefix.as_deref(), Some("cooluser!cooluser@cooluser.tmi.twitch.tv"));
        assert_eq!(msg.nick(), Some("cooluser"));
        assert_eq!(msg.tag("display-name"), Some("CoolUser"));
        assert_eq!(msg.tag("badge-info"), Some(""));
        assert_eq!(msg.params, "#chan");
        assert_eq!(msg.target(), Some("#chan"));
        assert_eq!(msg.trailing.as_deref(), Some("Hello world"));
    }

    #[test]
    fn test_server_ping_is_special_cased() {
        assert_eq!(
            parse_line("PING :tmi.twitch.tv"),
            IrcLine::Ping { payload: Some("tmi.twitch.tv".to_string()) }
        );
        assert_eq!(parse_line("PING"), IrcLine::Ping { payload: None });
    }

    #[test]
    fn test_pingpong_like_command_is_not_a_ping() {
        let msg = message("PINGALL something");
        assert_eq!(msg.command, "PINGALL");
    }

    #[test]
    fn test_line_without_tags_or_trailing() {
        let msg = message(":tmi.twitch.tv CAP * ACK");
        assert!(msg.tags.is_empty());
        assert_eq!(msg.prefix.as_deref(), Some("tmi.twitch.tv"));
        assert_eq!(msg.command, "CAP");
        assert_eq!(msg.params, "* ACK");
        assert_eq!(msg.trailing, None);
    }

    #[test]
    fn test_params_collapse_repeated_spaces() {
        let msg = message("JOIN    #one   #two  ");
        assert_eq!(msg.command, "JOIN");
        assert_eq!(msg.params, "#one #two");
    }

    #[test]
    fn test_trailing_keeps_inner_colons_and_spaces() {
        let msg = message(":a!a@a PRIVMSG #c :see you at 10:30 :)");
        assert_eq!(msg.trailing.as_deref(), Some("see you at 10:30 :)"));
    }

    #[test]
    fn test_empty_trailing_is_present_but_empty() {
        let msg = message(":a!a@a PRIVMSG #c :");
        assert_eq!(msg.trailing.as_deref(), Some(""));
    }

    #[test]
    fn test_tag_edge_cases() {
        let msg = message("@flag;color=;id=1;id=2;url=a=b :x PRIVMSG #c :hi");
        assert_eq!(msg.tag("flag"), Some(""));
        assert_eq!(msg.tag("color"), Some(""));
        assert_eq!(msg.tag("id"), Some("2"));
        assert_eq!(msg.tag("url"), Some("a=b"));
    }

    #[test]
    fn test_malformed_lines_have_empty_command() {
        assert!(message("").is_empty());
        assert!(message("   ").is_empty());
        assert!(message("@display-name=Only").is_empty());
        assert!(message(":prefix.only").is_empty());
        assert!(message("@a=b :prefix").is_empty());
    }

    #[test]
    fn test_bare_nick_prefix() {
        let msg = message(":justnick PRIVMSG #c :yo");
        assert_eq!(msg.nick(), Some("justnick"));
    }
}
