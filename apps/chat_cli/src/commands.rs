//! Commands typed at the prompt.

use shared::domain::ConversationId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    ListConversations,
    Open { conversation_id: ConversationId },
    Typing,
    Send { text: String },
    Visibility { visible: bool },
    Reconnect,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(pub String);

pub const HELP: &str = "\
/list            refresh the conversation list
/open <id>       switch to a conversation
/typing          signal typing without sending
/hide, /show     toggle page visibility (notifications)
/reconnect       reset the realtime connection
/quit            leave
anything else is sent as a message";

pub fn parse(line: &str) -> Result<Option<CliCommand>, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(CliCommand::Send {
            text: line.to_string(),
        }));
    };

    let mut parts = rest.split_whitespace();
    let command = match parts.next().unwrap_or_default() {
        "list" | "ls" => CliCommand::ListConversations,
        "open" => {
            let raw = parts
                .next()
                .ok_or_else(|| ParseError("usage: /open <conversation id>".into()))?;
            let id = raw
                .parse::<i64>()
                .map_err(|_| ParseError(format!("not a conversation id: {raw}")))?;
            CliCommand::Open {
                conversation_id: ConversationId(id),
            }
        }
        "typing" => CliCommand::Typing,
        "hide" => CliCommand::Visibility { visible: false },
        "show" => CliCommand::Visibility { visible: true },
        "reconnect" => CliCommand::Reconnect,
        "help" | "?" => CliCommand::Help,
        "quit" | "exit" => CliCommand::Quit,
        other => return Err(ParseError(format!("unknown command /{other}; try /help"))),
    };
    Ok(Some(command))
}
