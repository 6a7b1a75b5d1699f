//! Line input parsing.
//!
//! ```text
//!  :lang <tag>   switch the session language
//!  :show         print the document
//!  :clear        empty the document
//!  :quit         leave the session
//!  <text>        append a line to the document
//! ```

use std::str::FromStr;

use codecollab_session::{Language, ProtocolError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Language(Language),
    Show,
    Clear,
    Quit,
    Append(String),
}

/// Parse one line of terminal input.
pub fn parse(line: &str) -> Result<Input, ProtocolError> {
    let mut words = line.split_whitespace();
    let command = words.next().unwrap_or_default();
    match command {
        ":show" => Ok(Input::Show),
        ":clear" => Ok(Input::Clear),
        ":quit" | ":q" => Ok(Input::Quit),
        ":lang" => {
            let rest: Vec<&str> = words.collect();
            match rest.as_slice() {
                [tag] => Language::from_str(tag).map(Input::Language),
                _ => Err(ProtocolError::UnsupportedLanguage(rest.join(" "))),
            }
        }
        _ => Ok(Input::Append(line.to_string())),
    }
}

/// Document content after appending `line`.
pub fn append(content: &str, line: &str) -> String {
    let mut next = String::with_capacity(content.len() + line.len() + 1);
    next.push_str(content);
    if !next.is_empty() && !next.ends_with('\n') {
        next.push('\n');
    }
    next.push_str(line);
    next.push('\n');
    next
}

/// Comma-separated language tags, for help output.
pub fn language_tags() -> String {
    Language::ALL
        .iter()
        .map(|lang| lang.tag())
        .collect::<Vec<_>>()
        .join(", ")
}
