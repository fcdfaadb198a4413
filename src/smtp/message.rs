use std::error::Error as StdError;
use std::sync::OnceLock;

use lettre::message::header::{Header, HeaderName, HeaderValue};
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::Message;
use regex::Regex;
use uuid::Uuid;

use crate::error::Error;

fn angle_address() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<([^<>]+)>").expect("angle address pattern"))
}

fn style_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<style[^>]*>.*?</style\s*>").expect("style pattern"))
}

fn any_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("tag pattern"))
}

fn whitespace() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace pattern"))
}

/// The bare address out of `"Display Name <addr>"`, or the input as-is
pub fn extract_address(sender: &str) -> String {
    match angle_address().captures(sender) {
        Some(caps) => caps[1].trim().to_owned(),
        None => sender.trim().to_owned(),
    }
}

/// Plain-text alternative for an HTML body: style blocks go first, then
/// every other tag, then runs of whitespace collapse to one space.
pub fn html_to_text(html: &str) -> String {
    let text = style_block().replace_all(html, "");
    let text = any_tag().replace_all(&text, "");
    whitespace().replace_all(&text, " ").trim().to_owned()
}

#[derive(Debug, Clone)]
struct ReturnPath(String);

impl Header for ReturnPath {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("Return-Path")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        Ok(ReturnPath(
            s.trim().trim_start_matches('<').trim_end_matches('>').to_owned(),
        ))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), format!("<{}>", self.0))
    }
}

fn mailbox(address: &str) -> Result<Mailbox, Error> {
    address
        .parse()
        .map_err(|e| Error::Address(format!("{}: {}", address, e)))
}

/// Build the MIME message for one recipient.
///
/// `From` carries the configured sender string; `Reply-To` and
/// `Return-Path` carry just its address.
pub fn build_message(
    sender: &str,
    helo_name: &str,
    to: &str,
    subject: &str,
    body: &str,
    is_html: bool,
) -> Result<Message, Error> {
    let address = extract_address(sender);
    let reply_to = mailbox(&address)?;
    let from = match sender.parse::<Mailbox>() {
        Ok(mb) => mb,
        Err(_) => reply_to.clone(),
    };

    let builder = Message::builder()
        .from(from)
        .reply_to(reply_to)
        .to(mailbox(to)?)
        .subject(subject)
        .message_id(Some(format!("<{}@{}>", Uuid::new_v4(), helo_name)))
        .header(ReturnPath(address));

    let message = if is_html {
        builder.multipart(MultiPart::alternative_plain_html(
            html_to_text(body),
            body.to_owned(),
        ))
    } else {
        builder.singlepart(SinglePart::plain(body.to_owned()))
    };

    message.map_err(|e| Error::Message(e.to_string()))
}
