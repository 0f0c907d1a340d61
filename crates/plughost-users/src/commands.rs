//! Command parsing

use plughost_kernel::{PluginError, PluginResult};

pub const INSERT_USAGE: &str = "Invalid insert command! Usage: insert name last_name email";
pub const UPDATE_USAGE: &str = "Invalid update command! Usage: update id name last_name email";
pub const DELETE_USAGE: &str = "Invalid delete command! Usage: delete id";
pub const GET_USAGE: &str = "Invalid get command! Usage: get id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand<'a> {
    Insert {
        name: &'a str,
        last_name: &'a str,
        email: &'a str,
    },
    Update {
        id: i64,
        name: &'a str,
        last_name: &'a str,
        email: &'a str,
    },
    Delete {
        id: i64,
    },
    List,
    Get {
        id: i64,
    },
    /// Recognised keyword, wrong number of arguments
    Usage(&'static str),
    Unknown,
}

/// Parse one console line.
///
/// Keywords match as case-insensitive prefixes (`getall 3` is a `get`),
/// except `list`, which must match exactly. Extra arguments are ignored.
pub fn parse(command: &str) -> PluginResult<UserCommand<'_>> {
    let command = command.trim();
    let parts: Vec<&str> = command.split_whitespace().collect();

    let parsed = if starts_with_ignore_case(command, "insert") {
        match parts[..] {
            [_, name, last_name, email, ..] => UserCommand::Insert {
                name,
                last_name,
                email,
            },
            _ => UserCommand::Usage(INSERT_USAGE),
        }
    } else if starts_with_ignore_case(command, "update") {
        match parts[..] {
            [_, id, name, last_name, email, ..] => UserCommand::Update {
                id: parse_id(id)?,
                name,
                last_name,
                email,
            },
            _ => UserCommand::Usage(UPDATE_USAGE),
        }
    } else if starts_with_ignore_case(command, "delete") {
        match parts[..] {
            [_, id, ..] => UserCommand::Delete { id: parse_id(id)? },
            _ => UserCommand::Usage(DELETE_USAGE),
        }
    } else if command.eq_ignore_ascii_case("list") {
        UserCommand::List
    } else if starts_with_ignore_case(command, "get") {
        match parts[..] {
            [_, id, ..] => UserCommand::Get { id: parse_id(id)? },
            _ => UserCommand::Usage(GET_USAGE),
        }
    } else {
        UserCommand::Unknown
    };
    Ok(parsed)
}

fn starts_with_ignore_case(text: &str, prefix: &str) -> bool {
    text.get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

fn parse_id(raw: &str) -> PluginResult<i64> {
    raw.parse()
        .map_err(|_| PluginError::InvalidArgument(format!("'{raw}' is not a valid id")))
}
