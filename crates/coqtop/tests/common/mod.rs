//! In-process stand-in for coqtop speaking the XML protocol over a duplex pipe.
//!
//! Sentences are interpreted just enough to exercise the session:
//! - `Theorem`/`Lemma name : T.` opens a proof with goal `T`
//! - `exact ...` closes the goal, `Qed.` closes the proof
//! - text containing `error` fails, `loop` hangs until interrupted (the
//!   interrupt is answered only through the hung call),
//!   `crash` drops the connection
//! - `Check t.` answers `t : Prop`

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use coqtop::protocol::{escape_xml, CoqValue};
use coqtop::xml::XmlReader;
use coqtop::{CoqTop, StateId};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

/// What the mock saw, for assertions.
#[derive(Debug, Default)]
pub struct MockLog {
    pub calls: Vec<String>,
    pub widths: Vec<i64>,
}

pub struct MockProver {
    pub log: Arc<Mutex<MockLog>>,
    pub task: JoinHandle<()>,
}

impl MockProver {
    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().calls.clone()
    }

    pub fn widths(&self) -> Vec<i64> {
        self.log.lock().unwrap().widths.clone()
    }
}

/// Attach a fresh mock prover to `coq`.
pub async fn attach_mock(coq: &CoqTop) -> MockProver {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (reader, writer) = tokio::io::split(client);
    coq.attach(reader, writer).await;
    let log = Arc::new(Mutex::new(MockLog::default()));
    let task = tokio::spawn(serve(server, Arc::clone(&log)));
    MockProver { log, task }
}

#[derive(Debug, Clone, Default)]
struct StateInfo {
    goal: Option<String>,
    /// State that opened the enclosing proof.
    proof: Option<StateId>,
}

#[derive(Default)]
struct Doc {
    next_id: StateId,
    tip: StateId,
    states: HashMap<StateId, StateInfo>,
    /// Proof-opening state -> its Qed state.
    qeds: HashMap<StateId, StateId>,
    /// Response owed to a hung `Add`.
    hung: Option<StateId>,
}

enum Reply {
    Send(String),
    Hang,
    Crash,
}

async fn serve(mut stream: DuplexStream, log: Arc<Mutex<MockLog>>) {
    let mut reader = XmlReader::new();
    let mut doc = Doc::default();
    let mut buf = vec![0u8; 8192];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        reader.push(&String::from_utf8_lossy(&buf[..n]));
        while let Some(Ok(call)) = reader.next_element() {
            let name = call.attr("val").unwrap_or_default().to_string();
            let arg = call
                .elements()
                .next()
                .map(|e| CoqValue::from_element(e).unwrap())
                .unwrap_or(CoqValue::Unit);
            log.lock().unwrap().calls.push(name.clone());
            match handle(&mut doc, &log, &name, &arg) {
                Reply::Send(xml) => {
                    if stream.write_all(xml.as_bytes()).await.is_err() {
                        return;
                    }
                }
                Reply::Hang => {}
                Reply::Crash => return,
            }
        }
    }
}

fn good(value: &str) -> String {
    format!(r#"<value val="good">{value}</value>"#)
}

fn fail(state_id: StateId, message: &str, start: usize, stop: usize) -> String {
    format!(
        r#"<value val="fail" loc_s="{start}" loc_e="{stop}"><state_id val="{state_id}"/><richpp>{}</richpp></value>"#,
        escape_xml(message)
    )
}

fn processed(state_id: StateId) -> String {
    format!(
        r#"<feedback object="state" route="0"><state_id val="{state_id}"/><feedback_content val="processed"/></feedback>"#
    )
}

fn handle(doc: &mut Doc, log: &Mutex<MockLog>, name: &str, arg: &CoqValue) -> Reply {
    match name {
        "Init" => {
            doc.next_id = 2;
            doc.tip = 1;
            doc.states.insert(1, StateInfo::default());
            let workers = concat!(
                r#"<feedback object="state" route="0"><state_id val="1"/><feedback_content val="workerstatus">"#,
                r#"<pair><string>proofworker:0</string><string>Idle</string></pair></feedback_content></feedback>"#
            );
            Reply::Send(format!("{workers}{}", good(r#"<state_id val="1"/>"#)))
        }
        "Add" => add(doc, arg),
        "Edit_at" => {
            let Some(target) = arg.as_state_id() else {
                return Reply::Send(fail(doc.tip, "bad Edit_at", 0, 0));
            };
            let Some(info) = doc.states.get(&target).cloned() else {
                return Reply::Send(fail(doc.tip, "Invalid state", 0, 0));
            };
            let old_tip = doc.tip;
            doc.tip = target;
            let qed = info.proof.and_then(|p| doc.qeds.get(&p).copied());
            match qed {
                Some(qed) if target < qed && old_tip >= qed => Reply::Send(good(&format!(
                    r#"<union val="in_r"><pair><state_id val="{target}"/><pair><state_id val="{qed}"/><state_id val="{old_tip}"/></pair></pair></union>"#
                ))),
                _ => Reply::Send(good(r#"<union val="in_l"><unit/></union>"#)),
            }
        }
        "Goal" => {
            let info = doc.states.get(&doc.tip).cloned().unwrap_or_default();
            let body = match (info.goal, info.proof) {
                (Some(goal), _) => format!(
                    r#"<option val="some"><goals><list><goal><string>1</string><list/><richpp>{}</richpp></goal></list><list/><list/><list/></goals></option>"#,
                    escape_xml(&goal)
                ),
                (None, Some(_)) => {
                    r#"<option val="some"><goals><list/><list/><list/><list/></goals></option>"#
                        .to_string()
                }
                (None, None) => r#"<option val="none"/>"#.to_string(),
            };
            Reply::Send(good(&body))
        }
        "Query" => {
            let CoqValue::Pair(text, state) = arg else {
                return Reply::Send(fail(doc.tip, "bad Query", 0, 0));
            };
            let text = text.as_str().unwrap_or_default();
            let state_id = state.as_state_id().unwrap_or(doc.tip);
            let answer = match text.strip_prefix("Check ") {
                Some(term) => format!("{} : Prop", term.trim_end_matches('.').trim()),
                None => text.to_string(),
            };
            let message = format!(
                r#"<feedback object="state" route="0"><state_id val="{state_id}"/><feedback_content val="message"><message><message_level val="notice"/><option val="none"/><richpp>{}</richpp></message></feedback_content></feedback>"#,
                escape_xml(&answer)
            );
            Reply::Send(format!("{message}{}", good("<string></string>")))
        }
        "SetOptions" => {
            if let CoqValue::List(options) = arg {
                for option in options {
                    if let CoqValue::Pair(_, value) = option {
                        if let CoqValue::Other(e) = value.as_ref() {
                            if let Ok(width) = e.text().trim().parse() {
                                log.lock().unwrap().widths.push(width);
                            }
                        }
                    }
                }
            }
            Reply::Send(good("<unit/>"))
        }
        "LtacProfSet" => Reply::Send(good("<unit/>")),
        "LtacProfResults" => Reply::Send(good(concat!(
            r#"<list><pair><string>auto</string><ltacprof_tree total="1.5" local="0.5" ncalls="3" max_total="0.75"><list>"#,
            r#"<pair><string>intro</string><ltacprof_tree total="1" local="1" ncalls="2" max_total="0.5"><list/></ltacprof_tree></pair>"#,
            r#"</list></ltacprof_tree></pair></list>"#
        ))),
        // Like coqtop, answer only the interrupted call; the interrupt itself
        // gets no value.
        "Interrupt" => match doc.hung.take() {
            Some(parent) => Reply::Send(fail(parent, "User interrupt.", 0, 0)),
            None => Reply::Hang,
        },
        "Quit" => Reply::Send(good("<unit/>")),
        other => Reply::Send(fail(doc.tip, &format!("unknown call {other}"), 0, 0)),
    }
}

fn add(doc: &mut Doc, arg: &CoqValue) -> Reply {
    let CoqValue::Pair(left, right) = arg else {
        return Reply::Send(fail(doc.tip, "bad Add", 0, 0));
    };
    let (CoqValue::Pair(text, _edit_id), CoqValue::Pair(parent, _verbose)) =
        (left.as_ref(), right.as_ref())
    else {
        return Reply::Send(fail(doc.tip, "bad Add", 0, 0));
    };
    let text = text.as_str().unwrap_or_default().trim().to_string();
    let parent = parent.as_state_id().unwrap_or(doc.tip);

    if text.contains("crash") {
        return Reply::Crash;
    }
    if text.contains("loop") {
        doc.hung = Some(parent);
        return Reply::Hang;
    }
    if text.contains("error") {
        return Reply::Send(fail(parent, "Syntax error: illegal begin of vernac.", 0, text.len()));
    }

    let inherited = doc.states.get(&parent).cloned().unwrap_or_default();
    let id = doc.next_id;
    doc.next_id += 1;
    let info = if text.starts_with("Theorem") || text.starts_with("Lemma") {
        let goal = text
            .split_once(':')
            .map(|(_, t)| t.trim().trim_end_matches('.').trim().to_string());
        StateInfo {
            goal,
            proof: Some(id),
        }
    } else if text.starts_with("Qed") {
        if let Some(proof) = inherited.proof {
            doc.qeds.insert(proof, id);
        }
        StateInfo::default()
    } else if text.starts_with("exact") {
        StateInfo {
            goal: None,
            proof: inherited.proof,
        }
    } else {
        inherited
    };
    doc.states.insert(id, info);
    doc.tip = id;

    Reply::Send(format!(
        "{}{}",
        processed(id),
        good(&format!(
            r#"<pair><state_id val="{id}"/><pair><union val="in_l"><unit/></union><string></string></pair></pair>"#
        ))
    ))
}
