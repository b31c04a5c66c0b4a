//! Turns bytes read from the main channel into typed protocol events.
//!
//! The session only depends on the [`StreamDecoder`] trait; [`XmlStreamDecoder`]
//! is the implementation used for real coqtop connections.

use std::collections::BTreeMap;

use crate::protocol::CoqValue;
use crate::types::{
    EditId, ErrorMessage, Failure, FileLoaded, Location, Message, MessageLevel, SentenceStatus,
    StateId, WorkerStatus,
};
use crate::xml::{Element, XmlReader};

/// The answer to a call: either a success payload or a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueResponse {
    Good(CoqValue),
    Fail(Failure),
}

/// Sentence status change, with the worker that produced it when known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentenceFeedback {
    pub status: SentenceStatus,
    pub worker: Option<String>,
}

/// Out-of-band feedback about a state.
///
/// Several payloads may be present on one event; each is dispatched
/// independently.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateFeedback {
    pub state_id: StateId,
    /// Worker/process lane that produced the feedback.
    pub route: i64,
    pub sentence: Option<SentenceFeedback>,
    pub error: Option<ErrorMessage>,
    pub worker_status: Option<Vec<WorkerStatus>>,
    pub file_dependencies: Option<BTreeMap<String, Vec<String>>>,
    pub file_loaded: Option<FileLoaded>,
}

/// Out-of-band feedback about an edit (keyed by the caller's edit id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditFeedback {
    pub edit_id: EditId,
    pub route: i64,
    pub error: Option<ErrorMessage>,
}

/// A decoded event from the main channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    Value(ValueResponse),
    StateFeedback(StateFeedback),
    EditFeedback(EditFeedback),
    Message(Message),
    /// Well-formed but not part of the protocol subset understood here.
    Unknown(String),
    ParseError(String),
}

/// Incremental decoder fed with raw chunks from the main channel.
pub trait StreamDecoder: Send {
    /// Consume a chunk and return every event it completes, in wire order.
    fn feed(&mut self, bytes: &[u8]) -> Vec<ProtocolEvent>;
}

/// [`StreamDecoder`] for coqtop's XML protocol.
#[derive(Debug, Default)]
pub struct XmlStreamDecoder {
    /// Trailing bytes of a UTF-8 sequence split across chunks.
    utf8_tail: Vec<u8>,
    reader: XmlReader,
}

impl XmlStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        let mut data = std::mem::take(&mut self.utf8_tail);
        data.extend_from_slice(bytes);
        match std::str::from_utf8(&data) {
            Ok(text) => self.reader.push(text),
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                self.reader.push(&String::from_utf8_lossy(&data[..valid]));
                self.utf8_tail = data[valid..].to_vec();
            }
            Err(_) => self.reader.push(&String::from_utf8_lossy(&data)),
        }
    }
}

impl StreamDecoder for XmlStreamDecoder {
    fn feed(&mut self, bytes: &[u8]) -> Vec<ProtocolEvent> {
        self.push_bytes(bytes);
        let mut events = Vec::new();
        while let Some(next) = self.reader.next_element() {
            events.push(match next {
                Ok(element) => decode_element(&element),
                Err(msg) => ProtocolEvent::ParseError(msg),
            });
        }
        events
    }
}

/// Map one top-level element to an event.
pub fn decode_element(e: &Element) -> ProtocolEvent {
    let decoded = match e.name.as_str() {
        "value" => decode_value(e).map(ProtocolEvent::Value),
        "feedback" => decode_feedback(e),
        "message" => decode_message(e).map(ProtocolEvent::Message),
        other => Ok(ProtocolEvent::Unknown(format!("<{other}>"))),
    };
    decoded.unwrap_or_else(ProtocolEvent::ParseError)
}

fn decode_value(e: &Element) -> Result<ValueResponse, String> {
    match e.attr("val") {
        Some("good") => {
            let value = match e.elements().next() {
                Some(child) => CoqValue::from_element(child)?,
                None => CoqValue::Unit,
            };
            Ok(ValueResponse::Good(value))
        }
        Some("fail") => {
            let location = match (attr_num(e, "loc_s"), attr_num(e, "loc_e")) {
                (Some(start), Some(stop)) => Some(Location { start, stop }),
                _ => None,
            };
            let state_id = e
                .elements()
                .find(|c| c.name == "state_id")
                .and_then(|c| c.attr("val"))
                .and_then(|v| v.parse().ok());
            let message = e
                .elements()
                .find(|c| c.name == "richpp" || c.name == "string")
                .map(Element::text)
                .unwrap_or_else(|| e.text());
            Ok(ValueResponse::Fail(Failure {
                state_id,
                message: message.trim().to_string(),
                location,
            }))
        }
        other => Err(format!("value with val={other:?}")),
    }
}

fn attr_num<T: std::str::FromStr>(e: &Element, key: &str) -> Option<T> {
    e.attr(key).and_then(|v| v.trim().parse().ok())
}

/// `<message><message_level val=".."/>[<option/>]<string|richpp>text</..></message>`
fn decode_message(e: &Element) -> Result<Message, String> {
    let level = e
        .elements()
        .find(|c| c.name == "message_level")
        .and_then(|c| c.attr("val"))
        .and_then(MessageLevel::from_wire)
        .ok_or("message without a known level")?;
    let message = e
        .elements()
        .find(|c| c.name == "string" || c.name == "richpp")
        .map(Element::text)
        .unwrap_or_default();
    Ok(Message { level, message })
}

fn decode_error(content: &Element) -> ErrorMessage {
    let location = content.elements().find(|c| c.name == "loc").and_then(|loc| {
        Some(Location {
            start: attr_num(loc, "start")?,
            stop: attr_num(loc, "stop")?,
        })
    });
    let message = content
        .elements()
        .find(|c| c.name == "string" || c.name == "richpp")
        .map(Element::text)
        .unwrap_or_default();
    ErrorMessage { message, location }
}

fn strings(e: &Element) -> Vec<String> {
    e.elements()
        .filter(|c| c.name == "string")
        .map(Element::text)
        .collect()
}

fn decode_feedback(e: &Element) -> Result<ProtocolEvent, String> {
    let route = attr_num(e, "route").unwrap_or(0);
    let content = e
        .elements()
        .find(|c| c.name == "feedback_content")
        .ok_or("feedback without content")?;
    let kind = content.attr("val").unwrap_or_default();

    // Message feedback is reported as a plain message event.
    if kind == "message" {
        let message = content
            .elements()
            .find(|c| c.name == "message")
            .ok_or("message feedback without <message>")?;
        return decode_message(message).map(ProtocolEvent::Message);
    }

    if e.attr("object") == Some("edit") {
        let edit_id = e
            .elements()
            .find(|c| c.name == "edit_id")
            .and_then(|c| attr_num(c, "val"))
            .ok_or("edit feedback without edit_id")?;
        let error = (kind == "errormsg").then(|| decode_error(content));
        return Ok(ProtocolEvent::EditFeedback(EditFeedback {
            edit_id,
            route,
            error,
        }));
    }

    let state_id = e
        .elements()
        .find(|c| c.name == "state_id")
        .and_then(|c| attr_num(c, "val"))
        .ok_or("state feedback without state_id")?;
    let mut feedback = StateFeedback {
        state_id,
        route,
        ..StateFeedback::default()
    };
    let status = |status| {
        Some(SentenceFeedback {
            status,
            worker: None,
        })
    };

    match kind {
        "addedaxiom" => feedback.sentence = status(SentenceStatus::AddedAxiom),
        "processed" => feedback.sentence = status(SentenceStatus::Processed),
        "incomplete" => feedback.sentence = status(SentenceStatus::Incomplete),
        "complete" => feedback.sentence = status(SentenceStatus::Complete),
        "inprogress" => feedback.sentence = status(SentenceStatus::InProgress),
        "processingin" => {
            feedback.sentence = Some(SentenceFeedback {
                status: SentenceStatus::ProcessingIn,
                worker: strings(content).into_iter().next(),
            })
        }
        "workerstatus" => {
            let pair = content
                .elements()
                .find(|c| c.name == "pair")
                .ok_or("workerstatus without pair")?;
            match strings(pair).as_slice() {
                [id, status] => {
                    feedback.worker_status = Some(vec![WorkerStatus::from_wire(id, status)])
                }
                _ => return Err("workerstatus pair must hold two strings".into()),
            }
        }
        "errormsg" => feedback.error = Some(decode_error(content)),
        "filedependency" => {
            let from = content
                .elements()
                .find(|c| c.name == "option")
                .map(Element::text)
                .unwrap_or_default();
            let deps = strings(content);
            let mut map = BTreeMap::new();
            map.insert(from, deps);
            feedback.file_dependencies = Some(map);
        }
        "fileloaded" => match strings(content).as_slice() {
            [module, file_path] => {
                feedback.file_loaded = Some(FileLoaded {
                    module: module.clone(),
                    file_path: file_path.clone(),
                })
            }
            _ => return Err("fileloaded must hold two strings".into()),
        },
        other => return Ok(ProtocolEvent::Unknown(format!("feedback {other}"))),
    }
    Ok(ProtocolEvent::StateFeedback(feedback))
}
