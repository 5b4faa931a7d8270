//! Line-oriented parser for `.job` scripts and the client REPL.
//!
//! Job scripts are sequences of commands, one per line:
//!
//! ```text
//! WRITE [(k,v)(k2,v2)]
//! READ [k,k2]
//! DELETE [k]
//! SHOW
//! WAIT 100
//! BACKUP
//! HELP
//! ```
//!
//! Malformed lines are surfaced as [`Command::Invalid`] so the runner can
//! report them without aborting the job.

use std::io::BufRead;

use crate::common::{MAX_STRING_SIZE, MAX_WRITE_SIZE};

/// One parsed job-script command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `WRITE [(k,v)...]`: store the given pairs.
    Write(Vec<(String, String)>),
    /// `READ [k,...]`: look up the given keys.
    Read(Vec<String>),
    /// `DELETE [k,...]`: remove the given keys.
    Delete(Vec<String>),
    /// `SHOW`: dump the whole store.
    Show,
    /// `WAIT <ms>`: pause this job.
    Wait(u64),
    /// `BACKUP`: snapshot the store to the job's next backup file.
    Backup,
    /// `HELP`: print usage.
    Help,
    /// A line that did not parse.
    Invalid,
    /// A blank or comment line.
    Empty,
}

/// Iterator of [`Command`]s read from a job script.
///
/// Ends (`None`) at EOF, the end-of-commands condition.
pub struct CommandStream<R> {
    reader: R,
}

impl<R: BufRead> CommandStream<R> {
    /// Wraps a buffered reader positioned at the start of a script.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: BufRead> Iterator for CommandStream<R> {
    type Item = Command;

    fn next(&mut self) -> Option<Command> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => Some(parse_line(&line)),
            // An unreadable script line ends the job like EOF would.
            Err(_) => None,
        }
    }
}

/// Parses one job-script line.
pub fn parse_line(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Command::Empty;
    }

    let (word, rest) = split_word(line);
    match word {
        "WRITE" => parse_pairs(rest).map_or(Command::Invalid, Command::Write),
        "READ" => parse_key_list(rest).map_or(Command::Invalid, Command::Read),
        "DELETE" => parse_key_list(rest).map_or(Command::Invalid, Command::Delete),
        "SHOW" if rest.is_empty() => Command::Show,
        "WAIT" => rest
            .parse::<u64>()
            .map_or(Command::Invalid, Command::Wait),
        "BACKUP" if rest.is_empty() => Command::Backup,
        "HELP" if rest.is_empty() => Command::Help,
        _ => Command::Invalid,
    }
}

/// One parsed client REPL command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// `SUBSCRIBE [k]`: ask for notifications on a key.
    Subscribe(String),
    /// `UNSUBSCRIBE [k]`: stop notifications on a key.
    Unsubscribe(String),
    /// `DISCONNECT`: end the session.
    Disconnect,
    /// `DELAY <ms>`: pause the REPL.
    Delay(u64),
    /// A line that did not parse.
    Invalid,
    /// A blank or comment line.
    Empty,
}

/// Parses one client REPL line.
pub fn parse_client_line(line: &str) -> ClientCommand {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return ClientCommand::Empty;
    }

    let (word, rest) = split_word(line);
    match word {
        "SUBSCRIBE" => single_key(rest).map_or(ClientCommand::Invalid, ClientCommand::Subscribe),
        "UNSUBSCRIBE" => {
            single_key(rest).map_or(ClientCommand::Invalid, ClientCommand::Unsubscribe)
        }
        "DISCONNECT" if rest.is_empty() => ClientCommand::Disconnect,
        "DELAY" => rest
            .parse::<u64>()
            .map_or(ClientCommand::Invalid, ClientCommand::Delay),
        _ => ClientCommand::Invalid,
    }
}

fn split_word(line: &str) -> (&str, &str) {
    match line.find(char::is_whitespace) {
        Some(pos) => (&line[..pos], line[pos..].trim_start()),
        None => (line, ""),
    }
}

fn valid_string(s: &str) -> bool {
    !s.is_empty() && s.len() <= MAX_STRING_SIZE && !s.contains(char::is_whitespace)
}

/// Strips the surrounding `[` `]` of a list argument.
fn bracketed(rest: &str) -> Option<&str> {
    rest.strip_prefix('[')?.strip_suffix(']')
}

/// Parses `[(k,v)(k2,v2)...]`.
fn parse_pairs(rest: &str) -> Option<Vec<(String, String)>> {
    let mut body = bracketed(rest)?;
    let mut pairs = Vec::new();

    while !body.is_empty() {
        body = body.trim_start().strip_prefix('(')?;
        let comma = body.find(',')?;
        let close = body[comma..].find(')')? + comma;
        let key = &body[..comma];
        let value = &body[comma + 1..close];
        if !valid_string(key) || !valid_string(value) {
            return None;
        }
        pairs.push((key.to_owned(), value.to_owned()));
        body = &body[close + 1..];
    }

    if pairs.is_empty() || pairs.len() > MAX_WRITE_SIZE {
        return None;
    }
    Some(pairs)
}

/// Parses `[k,k2,...]`.
fn parse_key_list(rest: &str) -> Option<Vec<String>> {
    let body = bracketed(rest)?;
    let mut keys = Vec::new();
    for part in body.split(',') {
        let key = part.trim();
        if !valid_string(key) {
            return None;
        }
        keys.push(key.to_owned());
    }
    if keys.is_empty() || keys.len() > MAX_WRITE_SIZE {
        return None;
    }
    Some(keys)
}

/// Parses `[k]`: a list of exactly one key.
fn single_key(rest: &str) -> Option<String> {
    let mut keys = parse_key_list(rest)?;
    if keys.len() != 1 {
        return None;
    }
    Some(keys.remove(0))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn parses_write_pairs() {
        assert_eq!(
            parse_line("WRITE [(a,1)(b,2)]"),
            Command::Write(vec![
                ("a".to_owned(), "1".to_owned()),
                ("b".to_owned(), "2".to_owned()),
            ])
        );
    }

    #[test]
    fn parses_read_and_delete_lists() {
        assert_eq!(
            parse_line("READ [a,b,c]"),
            Command::Read(vec!["a".to_owned(), "b".to_owned(), "c".to_owned()])
        );
        assert_eq!(
            parse_line("DELETE [x]"),
            Command::Delete(vec!["x".to_owned()])
        );
    }

    #[test]
    fn parses_bare_commands() {
        assert_eq!(parse_line("SHOW"), Command::Show);
        assert_eq!(parse_line("BACKUP"), Command::Backup);
        assert_eq!(parse_line("HELP"), Command::Help);
        assert_eq!(parse_line("WAIT 250"), Command::Wait(250));
    }

    #[test]
    fn blank_and_comment_lines_are_empty() {
        assert_eq!(parse_line(""), Command::Empty);
        assert_eq!(parse_line("   "), Command::Empty);
        assert_eq!(parse_line("# a comment"), Command::Empty);
    }

    #[test]
    fn malformed_lines_are_invalid() {
        assert_eq!(parse_line("WRITE [(a,1"), Command::Invalid);
        assert_eq!(parse_line("WRITE []"), Command::Invalid);
        assert_eq!(parse_line("READ a,b"), Command::Invalid);
        assert_eq!(parse_line("WAIT soon"), Command::Invalid);
        assert_eq!(parse_line("write [(a,1)]"), Command::Invalid);
        assert_eq!(parse_line("FROB [a]"), Command::Invalid);
        assert_eq!(parse_line("SHOW ME"), Command::Invalid);
    }

    #[test]
    fn oversized_strings_are_invalid() {
        let long = "k".repeat(MAX_STRING_SIZE + 1);
        assert_eq!(parse_line(&format!("READ [{long}]")), Command::Invalid);
        assert_eq!(
            parse_line(&format!("WRITE [(a,{long})]")),
            Command::Invalid
        );
    }

    #[test]
    fn streams_until_eof() {
        let script = "WRITE [(a,1)]\nREAD [a]\n\nSHOW\n";
        let commands: Vec<Command> = CommandStream::new(Cursor::new(script)).collect();
        assert_eq!(
            commands,
            vec![
                Command::Write(vec![("a".to_owned(), "1".to_owned())]),
                Command::Read(vec!["a".to_owned()]),
                Command::Empty,
                Command::Show,
            ]
        );
    }

    #[test]
    fn client_lines_parse() {
        assert_eq!(
            parse_client_line("SUBSCRIBE [k]"),
            ClientCommand::Subscribe("k".to_owned())
        );
        assert_eq!(
            parse_client_line("UNSUBSCRIBE [k]"),
            ClientCommand::Unsubscribe("k".to_owned())
        );
        assert_eq!(parse_client_line("DISCONNECT"), ClientCommand::Disconnect);
        assert_eq!(parse_client_line("DELAY 50"), ClientCommand::Delay(50));
        assert_eq!(
            parse_client_line("SUBSCRIBE [a,b]"),
            ClientCommand::Invalid
        );
    }
}
