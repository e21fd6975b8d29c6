//! User command lines.
//!
//! A line is `[cmdID [n]] body`: an optional command id (with an ignored
//! second number), then the command body, which must start with a letter
//! or `_`. A line holding only a header has an empty body.

use std::sync::OnceLock;

use regex::Regex;

use hubactor_core::{Command, CommandError};

const HEADER_BODY_PATTERN: &str = r"^(?:(?P<cmd_id>\d+)(?:\s+\d+)?\s+)?(?P<body>[A-Za-z_].*)?$";

fn header_body_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(HEADER_BODY_PATTERN).expect("header pattern is a valid regex"))
}

/// Parse one line from user `user_id` into a Ready command.
pub fn parse_user_line(user_id: u32, line: &str) -> Result<Command, CommandError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let parse_error = || CommandError::Parse(format!("could not parse command {line:?}"));

    let caps = header_body_re().captures(line).ok_or_else(parse_error)?;
    let cmd_id = match caps.name("cmd_id") {
        Some(id) => id.as_str().parse::<u32>().map_err(|_| parse_error())?,
        None => 0,
    };
    let body = caps.name("body").map_or("", |body| body.as_str().trim_end());

    Ok(Command::builder(line)
        .with_ids(user_id, cmd_id)
        .with_body(body)
        .build())
}
