//! Best-effort RFC 3164 (traditional BSD syslog) parsing.
//!
//! The wire format predates any strict grammar, so every part is
//! optional: a missing priority defaults to 13 (user.notice), a missing
//! or unparseable timestamp becomes "now", and the hostname and
//! `TAG[pid]:` prefix are recognized heuristically.

use chrono::{Datelike, NaiveDateTime, TimeZone, Utc};

use crate::event::Event;
use crate::format::ParseError;

const DEFAULT_PRI: u8 = 13;

pub fn parse(text: &str) -> Result<Event, ParseError> {
    let mut event = Event::default();
    event.version = 0;
    event.time_generated = Utc::now();

    let mut rest = text.trim();

    // <PRI>
    if let Some(after) = rest.strip_prefix('<') {
        let end = after.find('>').ok_or(ParseError::InvalidPriority)?;
        let pri: u8 = after[..end]
            .parse()
            .map_err(|_| ParseError::InvalidPriority)?;
        event.set_priority(pri);
        rest = after[end + 1..].trim_start();
    } else {
        event.set_priority(DEFAULT_PRI);
    }

    // Mmm dd hh:mm:ss
    if let Some((ts, remainder)) = take_bsd_timestamp(rest) {
        event.time_reported = ts;
        rest = remainder;

        // the token after a valid timestamp is the hostname, unless it
        // already looks like a TAG
        if let Some((token, remainder)) = split_token(rest) {
            if !looks_like_tag(token) {
                event.hostname = token.to_string();
                rest = remainder;
            }
        }
    } else {
        event.time_reported = event.time_generated;
    }

    // TAG: "appname:" or "appname[pid]:"
    if let Some((token, remainder)) = split_token(rest) {
        if let Some((appname, procid)) = parse_tag(token) {
            event.appname = appname.to_string();
            event.procid = procid.unwrap_or("").to_string();
            rest = remainder;
        }
    }

    event.message = rest.trim().to_string();
    if event.message.is_empty() && event.hostname.is_empty() && event.appname.is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(event)
}

/// Parses a leading `Mmm dd hh:mm:ss` timestamp, returning it with the
/// remaining input. The year is taken from the current date.
fn take_bsd_timestamp(input: &str) -> Option<(chrono::DateTime<Utc>, &str)> {
    // fixed width: 3 for the month, space, 2 for the (possibly
    // space-padded) day, space, 8 for the time
    if input.len() < 15 {
        return None;
    }
    let (candidate, rest) = input.split_at(15);
    let with_year = format!("{} {candidate}", Utc::now().year());
    let naive = NaiveDateTime::parse_from_str(&with_year, "%Y %b %e %H:%M:%S").ok()?;
    let ts = Utc.from_utc_datetime(&naive);
    Some((ts, rest.trim_start()))
}

fn split_token(input: &str) -> Option<(&str, &str)> {
    if input.is_empty() {
        return None;
    }
    match input.find(' ') {
        Some(i) => Some((&input[..i], input[i + 1..].trim_start())),
        None => Some((input, "")),
    }
}

fn looks_like_tag(token: &str) -> bool {
    token.ends_with(':') || token.contains('[')
}

/// Splits `appname[pid]:` / `appname:` into its parts. Returns `None`
/// when the token is not a TAG.
fn parse_tag(token: &str) -> Option<(&str, Option<&str>)> {
    let token = token.strip_suffix(':')?;
    match (token.find('['), token.ends_with(']')) {
        (Some(open), true) => Some((&token[..open], Some(&token[open + 1..token.len() - 1]))),
        (None, _) => Some((token, None)),
        _ => None,
    }
}
