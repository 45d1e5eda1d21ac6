//! MOVED/ASK redirection handling.
//!
//! Redirect errors are scanned with an Aho-Corasick pattern finder over the
//! raw error payload. A redirected command is replayed on a fresh,
//! short-lived connection to the named endpoint; the replacement reply is
//! substituted for the redirect before the client sees it.

use aho_corasick::AhoCorasick;
use lazy_static::lazy_static;

use crate::cluster::topology::Dispatcher;
use crate::core::connection::Connector;
use crate::error::ProxyResult;
use crate::proto::command::CMD_ASKING;
use crate::proto::{Command, RespValue};

const BYTE_SPACE: u8 = b' ';
const PATTERNS: &[&str] = &["ASK", "MOVED"];

lazy_static! {
    static ref FINDER: AhoCorasick =
        AhoCorasick::new(PATTERNS).expect("redirect pattern finder");
}

/// A parsed cluster redirection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// The slot has permanently moved
    Moved { slot: u16, endpoint: String },
    /// The key is migrating; retry on the named endpoint after ASKING
    Ask { slot: u16, endpoint: String },
}

/// Parse a redirect out of an error payload such as
/// `MOVED 3999 127.0.0.1:6381` (the leading `-` already stripped by the
/// RESP layer). Returns `None` for ordinary errors and for malformed
/// redirect payloads, which the caller then passes through to the client.
pub fn parse_redirect(msg: &[u8]) -> Option<Redirect> {
    let mat = FINDER.find(msg)?;
    if mat.start() != 0 {
        return None;
    }
    let end = mat.end();
    if end >= msg.len() || msg[end] != BYTE_SPACE {
        return None;
    }
    let rest = &msg[end + 1..];
    let sep = rest.iter().position(|&b| b == BYTE_SPACE)?;
    let slot = btoi::btoi::<u16>(&rest[..sep]).ok()?;
    let endpoint = std::str::from_utf8(&rest[sep + 1..])
        .ok()?
        .trim_end()
        .to_string();
    if endpoint.is_empty() {
        return None;
    }
    if mat.pattern().as_u32() == 0 {
        Some(Redirect::Ask { slot, endpoint })
    } else {
        Some(Redirect::Moved { slot, endpoint })
    }
}

/// Resend a command to the endpoint named by a redirect.
///
/// Uses a fresh connection which is dropped after the single exchange. For
/// ASK redirects the ASKING command is sent first and its reply discarded.
pub async fn replay(
    connector: &Connector,
    endpoint: &str,
    cmd: &Command,
    ask: bool,
) -> ProxyResult<RespValue> {
    let mut stream = connector.connect(endpoint).await?;
    if ask {
        stream.exchange(&CMD_ASKING).await?;
    }
    stream.exchange(cmd).await
}

/// Apply redirection handling to a backend reply.
///
/// MOVED triggers a slot reload and replays the command on the new
/// endpoint; ASK replays without reloading. Replay failures surface as a
/// client-visible error reply. Non-redirect replies pass through untouched.
pub async fn resolve(dispatcher: &Dispatcher, cmd: &Command, rsp: RespValue) -> RespValue {
    let redirect = match &rsp {
        RespValue::Error(msg) => match parse_redirect(msg.as_bytes()) {
            Some(redirect) => redirect,
            None => return rsp,
        },
        _ => return rsp,
    };
    let (endpoint, ask) = match redirect {
        Redirect::Moved { slot, endpoint } => {
            log::info!("slot {} moved to {}", slot, endpoint);
            dispatcher.trigger_reload_slots();
            (endpoint, false)
        }
        Redirect::Ask { slot, endpoint } => {
            log::debug!("slot {} asks redirect to {}", slot, endpoint);
            (endpoint, true)
        }
    };
    match replay(dispatcher.connector(), &endpoint, cmd, ask).await {
        Ok(replayed) => replayed,
        Err(err) => {
            log::error!("redirect to {} failed: {}", endpoint, err);
            RespValue::error(format!("ERR {}", err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_moved() {
        let redirect = parse_redirect(b"MOVED 3999 127.0.0.1:6381").unwrap();
        assert_eq!(
            redirect,
            Redirect::Moved {
                slot: 3999,
                endpoint: "127.0.0.1:6381".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_ask() {
        let redirect = parse_redirect(b"ASK 12345 192.168.1.100:6380").unwrap();
        assert_eq!(
            redirect,
            Redirect::Ask {
                slot: 12345,
                endpoint: "192.168.1.100:6380".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_trailing_crlf() {
        let redirect = parse_redirect(b"MOVED 0 10.0.0.2:6379\r\n").unwrap();
        assert_eq!(
            redirect,
            Redirect::Moved {
                slot: 0,
                endpoint: "10.0.0.2:6379".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_boundary_slots() {
        assert!(matches!(
            parse_redirect(b"MOVED 16383 a:1"),
            Some(Redirect::Moved { slot: 16383, .. })
        ));
        assert!(matches!(
            parse_redirect(b"ASK 0 a:1"),
            Some(Redirect::Ask { slot: 0, .. })
        ));
    }

    #[test]
    fn test_parse_rejects_non_redirects() {
        assert_eq!(parse_redirect(b"ERR unknown command"), None);
        assert_eq!(parse_redirect(b""), None);
        // pattern not at the start of the payload
        assert_eq!(parse_redirect(b"ERR MOVED 1 a:1"), None);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(parse_redirect(b"MOVED3999 a:1"), None);
        assert_eq!(parse_redirect(b"MOVED 3999"), None);
        assert_eq!(parse_redirect(b"MOVED abc a:1"), None);
        assert_eq!(parse_redirect(b"MOVED 99999 a:1"), None);
        assert_eq!(parse_redirect(b"ASK 1 "), None);
    }
}
