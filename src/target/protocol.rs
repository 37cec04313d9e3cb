//! Line-level IMAP response parsing and command formatting. Responses are
//! modeled as a small tagged-variant enum; anything the migration does not
//! consume passes through as `Other`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    No,
    Bad,
}

impl ResponseStatus {
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "OK" => Some(ResponseStatus::Ok),
            "NO" => Some(ResponseStatus::No),
            "BAD" => Some(ResponseStatus::Bad),
            _ => None,
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, ResponseStatus::Ok)
    }
}

impl std::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseStatus::Ok => write!(f, "OK"),
            ResponseStatus::No => write!(f, "NO"),
            ResponseStatus::Bad => write!(f, "BAD"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImapResponse {
    UntaggedList {
        delimiter: Option<char>,
        name: String,
    },
    UntaggedSearch(Vec<u32>),
    UntaggedExists(u32),
    Tagged {
        tag: String,
        status: ResponseStatus,
        text: String,
    },
    Continuation(String),
    Other(String),
}

pub fn parse_line(raw: &str) -> ImapResponse {
    let line = raw.trim_end_matches(['\r', '\n']);

    if let Some(rest) = line.strip_prefix('+') {
        return ImapResponse::Continuation(rest.trim_start().to_string());
    }

    if let Some(rest) = line.strip_prefix("* ") {
        if let Some(list) = rest.strip_prefix("LIST ") {
            if let Some(parsed) = parse_list_payload(list) {
                return parsed;
            }
            return ImapResponse::Other(line.to_string());
        }
        if rest == "SEARCH" || rest.starts_with("SEARCH ") {
            let ids = rest
                .split_whitespace()
                .skip(1)
                .filter_map(|token| token.parse::<u32>().ok())
                .collect();
            return ImapResponse::UntaggedSearch(ids);
        }
        let mut tokens = rest.split_whitespace();
        if let (Some(first), Some("EXISTS")) = (tokens.next(), tokens.next()) {
            if let Ok(n) = first.parse::<u32>() {
                return ImapResponse::UntaggedExists(n);
            }
        }
        return ImapResponse::Other(line.to_string());
    }

    // Tagged completion: "<tag> OK|NO|BAD <text>".
    let mut tokens = line.splitn(3, ' ');
    if let (Some(tag), Some(status_token)) = (tokens.next(), tokens.next()) {
        if let Some(status) = ResponseStatus::from_token(status_token) {
            return ImapResponse::Tagged {
                tag: tag.to_string(),
                status,
                text: tokens.next().unwrap_or("").to_string(),
            };
        }
    }

    ImapResponse::Other(line.to_string())
}

/// Payload after `* LIST `: `(\Attrs) "<delim>" <name>`. Literal-continued
/// folder names are not produced by the servers this talks to and parse as
/// `None`.
fn parse_list_payload(payload: &str) -> Option<ImapResponse> {
    let close = payload.find(") ")?;
    let rest = payload[close + 2..].trim_start();

    let (delim_token, name_token) = rest.split_once(' ')?;
    let delimiter = if delim_token.eq_ignore_ascii_case("NIL") {
        None
    } else {
        delim_token.trim_matches('"').chars().next()
    };
    let name = unquote(name_token.trim());
    if name.is_empty() {
        return None;
    }

    Some(ImapResponse::UntaggedList { delimiter, name })
}

fn unquote(token: &str) -> String {
    let inner = token
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(token);
    inner.replace("\\\"", "\"").replace("\\\\", "\\")
}

/// Quote a string for use as an IMAP astring argument.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

pub fn format_login(username: &str, password: &str) -> String {
    format!("LOGIN {} {}", quote(username), quote(password))
}

pub fn format_list(reference: &str, pattern: &str) -> String {
    format!("LIST {} {}", quote(reference), quote(pattern))
}

pub fn format_select(folder: &str) -> String {
    format!("SELECT {}", quote(folder))
}

pub fn format_create(folder: &str) -> String {
    format!("CREATE {}", quote(folder))
}

pub fn format_search_message_id(message_id: &str) -> String {
    format!("SEARCH HEADER \"Message-ID\" {}", quote(message_id))
}

pub fn format_append(folder: &str, size: usize) -> String {
    format!("APPEND {} (\\Seen) {{{size}}}", quote(folder))
}

/// True when any `* SEARCH` reply carries at least one nonzero id.
pub fn search_hit(untagged: &[ImapResponse]) -> bool {
    untagged.iter().any(|response| match response {
        ImapResponse::UntaggedSearch(ids) => ids.iter().any(|id| *id > 0),
        _ => false,
    })
}

/// Folder names echoed by LIST replies.
pub fn list_names(untagged: &[ImapResponse]) -> Vec<String> {
    untagged
        .iter()
        .filter_map(|response| match response {
            ImapResponse::UntaggedList { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect()
}
