use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::types::{
    AddResult, CoqError, EditAtResult, EditId, Goal, GoalResult, Hypothesis, LtacProfEntry,
    LtacProfResults, LtacProfTree, NewFocus, StateId,
};
use crate::xml::{Element, Node};

/// Which side of a `union` a value sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// Typed value for a `SetOptions` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Int(Option<i64>),
    Bool(bool),
    Str(String),
    StrOpt(Option<String>),
}

/// A value in coqtop's XML grammar, used for both call arguments and results.
///
/// Elements outside the core grammar (`goals`, `ltacprof_tree`, ...) are kept
/// as raw [`Element`]s and interpreted by the response parsers below.
#[derive(Debug, Clone, PartialEq)]
pub enum CoqValue {
    Unit,
    Bool(bool),
    Int(i64),
    Str(String),
    StateId(StateId),
    Pair(Box<CoqValue>, Box<CoqValue>),
    List(Vec<CoqValue>),
    Option(Option<Box<CoqValue>>),
    OptionValue(OptionValue),
    Union(Side, Box<CoqValue>),
    Other(Element),
}

impl CoqValue {
    pub fn pair(a: CoqValue, b: CoqValue) -> Self {
        CoqValue::Pair(Box::new(a), Box::new(b))
    }

    pub fn some(v: CoqValue) -> Self {
        CoqValue::Option(Some(Box::new(v)))
    }

    pub fn str(s: impl Into<String>) -> Self {
        CoqValue::Str(s.into())
    }

    /// Render this value as XML, escaping all free text.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) {
        match self {
            CoqValue::Unit => out.push_str("<unit/>"),
            CoqValue::Bool(b) => {
                let _ = write!(out, r#"<bool val="{b}"/>"#);
            }
            CoqValue::Int(n) => {
                let _ = write!(out, "<int>{n}</int>");
            }
            CoqValue::Str(s) => {
                let _ = write!(out, "<string>{}</string>", escape_xml(s));
            }
            CoqValue::StateId(id) => {
                let _ = write!(out, r#"<state_id val="{id}"/>"#);
            }
            CoqValue::Pair(a, b) => {
                out.push_str("<pair>");
                a.write_xml(out);
                b.write_xml(out);
                out.push_str("</pair>");
            }
            CoqValue::List(items) => {
                out.push_str("<list>");
                for item in items {
                    item.write_xml(out);
                }
                out.push_str("</list>");
            }
            CoqValue::Option(None) => out.push_str(r#"<option val="none"/>"#),
            CoqValue::Option(Some(v)) => {
                out.push_str(r#"<option val="some">"#);
                v.write_xml(out);
                out.push_str("</option>");
            }
            CoqValue::OptionValue(ov) => {
                let (tag, inner) = match ov {
                    OptionValue::Int(n) => (
                        "intvalue",
                        CoqValue::Option(n.map(|n| Box::new(CoqValue::Int(n)))),
                    ),
                    OptionValue::Bool(b) => ("boolvalue", CoqValue::Bool(*b)),
                    OptionValue::Str(s) => ("stringvalue", CoqValue::Str(s.clone())),
                    OptionValue::StrOpt(s) => (
                        "stringoptvalue",
                        CoqValue::Option(s.clone().map(|s| Box::new(CoqValue::Str(s)))),
                    ),
                };
                let _ = write!(out, r#"<option_value val="{tag}">"#);
                inner.write_xml(out);
                out.push_str("</option_value>");
            }
            CoqValue::Union(side, v) => {
                let tag = match side {
                    Side::Left => "in_l",
                    Side::Right => "in_r",
                };
                let _ = write!(out, r#"<union val="{tag}">"#);
                v.write_xml(out);
                out.push_str("</union>");
            }
            CoqValue::Other(e) => write_element(e, out),
        }
    }

    /// Interpret an XML element in the value grammar.
    pub fn from_element(e: &Element) -> Result<Self, String> {
        let children: Vec<&Element> = e.elements().collect();
        let value = match e.name.as_str() {
            "unit" => CoqValue::Unit,
            "bool" => match e.attr("val") {
                Some("true") => CoqValue::Bool(true),
                Some("false") => CoqValue::Bool(false),
                other => return Err(format!("bad bool value {other:?}")),
            },
            "int" => CoqValue::Int(
                e.text()
                    .trim()
                    .parse()
                    .map_err(|err| format!("bad int {:?}: {err}", e.text()))?,
            ),
            "string" | "richpp" => CoqValue::Str(e.text()),
            "state_id" => CoqValue::StateId(parse_id_attr(e)?),
            "pair" => match children.as_slice() {
                [a, b] => CoqValue::pair(Self::from_element(a)?, Self::from_element(b)?),
                _ => return Err(format!("pair with {} children", children.len())),
            },
            "list" => CoqValue::List(
                children
                    .iter()
                    .map(|c| Self::from_element(c))
                    .collect::<Result<_, _>>()?,
            ),
            "option" => match (e.attr("val"), children.first()) {
                (Some("none"), _) => CoqValue::Option(None),
                (Some("some"), Some(c)) => CoqValue::some(Self::from_element(c)?),
                other => return Err(format!("bad option {other:?}")),
            },
            "union" => {
                let side = match e.attr("val") {
                    Some("in_l") => Side::Left,
                    Some("in_r") => Side::Right,
                    other => return Err(format!("bad union side {other:?}")),
                };
                let inner = match children.first() {
                    Some(c) => Self::from_element(c)?,
                    None => CoqValue::Unit,
                };
                CoqValue::Union(side, Box::new(inner))
            }
            _ => CoqValue::Other(e.clone()),
        };
        Ok(value)
    }

    pub fn as_state_id(&self) -> Option<StateId> {
        match self {
            CoqValue::StateId(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CoqValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

fn parse_id_attr(e: &Element) -> Result<StateId, String> {
    e.attr("val")
        .ok_or_else(|| format!("<{}> without val", e.name))?
        .parse()
        .map_err(|err| format!("bad <{}> value: {err}", e.name))
}

fn write_element(e: &Element, out: &mut String) {
    let _ = write!(out, "<{}", e.name);
    for (k, v) in &e.attrs {
        let _ = write!(out, r#" {k}="{}""#, escape_xml(v));
    }
    if e.children.is_empty() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    for child in &e.children {
        match child {
            Node::Element(c) => write_element(c, out),
            Node::Text(t) => out.push_str(&escape_xml(t)),
        }
    }
    let _ = write!(out, "</{}>", e.name);
}

/// Escape text for embedding in an element or attribute.
pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// A call to send to coqtop on the main channel.
#[derive(Debug, Clone, PartialEq)]
pub enum CoqRequest {
    /// Initialize the document, optionally naming the script file.
    Init { script: Option<String> },
    /// Add a sentence on top of `state_id`.
    Add {
        text: String,
        edit_id: EditId,
        state_id: StateId,
        verbose: bool,
    },
    /// Move the tip to `state_id`.
    EditAt { state_id: StateId },
    Goal,
    /// Run a query (`Check`, `Search`, ...) in the context of `state_id`.
    Query { text: String, state_id: StateId },
    SetOptions(Vec<(Vec<String>, OptionValue)>),
    LtacProfSet { enabled: bool },
    LtacProfResults,
    Interrupt,
    Quit,
}

impl CoqRequest {
    /// `SetOptions` call for `Printing Width`.
    pub fn resize_window(columns: u32) -> Self {
        CoqRequest::SetOptions(vec![(
            vec!["Printing".to_string(), "Width".to_string()],
            OptionValue::Int(Some(i64::from(columns))),
        )])
    }

    /// Protocol name of the call (the `val` attribute).
    pub fn name(&self) -> &'static str {
        match self {
            CoqRequest::Init { .. } => "Init",
            CoqRequest::Add { .. } => "Add",
            CoqRequest::EditAt { .. } => "Edit_at",
            CoqRequest::Goal => "Goal",
            CoqRequest::Query { .. } => "Query",
            CoqRequest::SetOptions(_) => "SetOptions",
            CoqRequest::LtacProfSet { .. } => "LtacProfSet",
            CoqRequest::LtacProfResults => "LtacProfResults",
            CoqRequest::Interrupt => "Interrupt",
            CoqRequest::Quit => "Quit",
        }
    }

    /// The argument tree of the call.
    pub fn argument(&self) -> CoqValue {
        match self {
            CoqRequest::Init { script } => {
                CoqValue::Option(script.clone().map(|s| Box::new(CoqValue::Str(s))))
            }
            CoqRequest::Add {
                text,
                edit_id,
                state_id,
                verbose,
            } => CoqValue::pair(
                CoqValue::pair(CoqValue::str(text.clone()), CoqValue::Int(*edit_id)),
                CoqValue::pair(CoqValue::StateId(*state_id), CoqValue::Bool(*verbose)),
            ),
            CoqRequest::EditAt { state_id } => CoqValue::StateId(*state_id),
            CoqRequest::Query { text, state_id } => {
                CoqValue::pair(CoqValue::str(text.clone()), CoqValue::StateId(*state_id))
            }
            CoqRequest::SetOptions(options) => CoqValue::List(
                options
                    .iter()
                    .map(|(path, value)| {
                        CoqValue::pair(
                            CoqValue::List(path.iter().map(|p| CoqValue::str(p.clone())).collect()),
                            CoqValue::OptionValue(value.clone()),
                        )
                    })
                    .collect(),
            ),
            CoqRequest::LtacProfSet { enabled } => CoqValue::Bool(*enabled),
            CoqRequest::Goal
            | CoqRequest::LtacProfResults
            | CoqRequest::Interrupt
            | CoqRequest::Quit => CoqValue::Unit,
        }
    }

    /// Serialize this request as a wire call.
    ///
    /// Format: `<call val="Name">ARG</call>`
    pub fn to_xml(&self) -> String {
        format!(r#"<call val="{}">{}</call>"#, self.name(), self.argument().to_xml())
    }
}

// --- Response interpretation ---

fn unexpected(call: &str, value: &CoqValue) -> CoqError {
    CoqError::Protocol(format!("Unexpected {call} response: {value:?}"))
}

/// Interpret the result of `Init`: the initial state id.
pub fn parse_init(value: &CoqValue) -> Result<StateId, CoqError> {
    value.as_state_id().ok_or_else(|| unexpected("Init", value))
}

/// Interpret the result of `Add`.
///
/// Wire shape: `pair(state_id, pair(union(unit | state_id), string))`.
pub fn parse_add(value: &CoqValue) -> Result<AddResult, CoqError> {
    let CoqValue::Pair(state, rest) = value else {
        return Err(unexpected("Add", value));
    };
    let state_id = state.as_state_id().ok_or_else(|| unexpected("Add", value))?;
    let CoqValue::Pair(focus, message) = rest.as_ref() else {
        return Err(unexpected("Add", value));
    };
    let unfocused_state_id = match focus.as_ref() {
        CoqValue::Union(Side::Right, id) => id.as_state_id(),
        _ => None,
    };
    Ok(AddResult {
        state_id,
        unfocused_state_id,
        message: message.as_str().unwrap_or_default().to_string(),
    })
}

/// Interpret the result of `Edit_at`.
///
/// `in_l` means a simple rewind; `in_r` carries
/// `pair(new_tip, pair(qed_state, old_tip))`.
pub fn parse_edit_at(value: &CoqValue) -> Result<EditAtResult, CoqError> {
    match value {
        CoqValue::Union(Side::Left, _) | CoqValue::Unit => Ok(EditAtResult::default()),
        CoqValue::Union(Side::Right, focus) => {
            let CoqValue::Pair(tip, rest) = focus.as_ref() else {
                return Err(unexpected("Edit_at", value));
            };
            let CoqValue::Pair(qed, old) = rest.as_ref() else {
                return Err(unexpected("Edit_at", value));
            };
            match (tip.as_state_id(), qed.as_state_id(), old.as_state_id()) {
                (Some(state_id), Some(qed_state_id), Some(old_tip)) => Ok(EditAtResult {
                    new_focus: Some(NewFocus {
                        state_id,
                        qed_state_id,
                        old_tip,
                    }),
                }),
                _ => Err(unexpected("Edit_at", value)),
            }
        }
        _ => Err(unexpected("Edit_at", value)),
    }
}

/// Interpret the result of `Goal`.
///
/// `option(none)` means no proof is open. Otherwise a `<goals>` element holds
/// the focused goals, the background stack (a list of `pair(before, after)`
/// goal lists, flattened here), and optionally shelved and abandoned goals.
pub fn parse_goal(value: &CoqValue) -> Result<GoalResult, CoqError> {
    let goals = match value {
        CoqValue::Option(None) | CoqValue::Unit => return Ok(GoalResult::default()),
        CoqValue::Option(Some(inner)) => match inner.as_ref() {
            CoqValue::Other(e) if e.name == "goals" => e,
            _ => return Err(unexpected("Goal", value)),
        },
        _ => return Err(unexpected("Goal", value)),
    };

    let lists: Vec<&Element> = goals.elements().collect();
    let goal_list = |e: &Element| -> Result<Vec<Goal>, CoqError> {
        e.elements().map(parse_goal_element).collect()
    };

    let mut result = GoalResult::default();
    if let Some(&focused) = lists.first() {
        result.goals = Some(goal_list(focused)?);
    }
    if let Some(&background) = lists.get(1) {
        let mut flattened = Vec::new();
        for pair in background.elements() {
            for side in pair.elements() {
                flattened.extend(goal_list(side)?);
            }
        }
        result.background_goals = Some(flattened);
    }
    if let Some(&shelved) = lists.get(2) {
        result.shelved_goals = Some(goal_list(shelved)?);
    }
    if let Some(&abandoned) = lists.get(3) {
        result.abandoned_goals = Some(goal_list(abandoned)?);
    }
    Ok(result)
}

/// `<goal><string>id</string><list>hyps</list><string>conclusion</string></goal>`
fn parse_goal_element(e: &Element) -> Result<Goal, CoqError> {
    let parts: Vec<&Element> = e.elements().collect();
    match parts.as_slice() {
        [id, hyps, conclusion] if e.name == "goal" => Ok(Goal {
            id: id.text().trim().parse().unwrap_or_default(),
            hypotheses: hyps
                .elements()
                .map(|h| Hypothesis::parse(&h.text()))
                .collect(),
            goal: conclusion.text(),
        }),
        _ => Err(CoqError::Protocol(format!("Malformed goal element: {e:?}"))),
    }
}

/// Interpret the result of `LtacProfResults`.
///
/// Wire shape: a list of `pair(string name, ltacprof_tree)` where each
/// `<ltacprof_tree total= local= ncalls= max_total=>` holds a list of child
/// pairs in the same shape.
pub fn parse_ltacprof_results(value: &CoqValue) -> Result<LtacProfResults, CoqError> {
    Ok(LtacProfResults {
        results: parse_ltacprof_children(value)?,
    })
}

fn parse_ltacprof_children(value: &CoqValue) -> Result<BTreeMap<String, LtacProfTree>, CoqError> {
    let CoqValue::List(items) = value else {
        return Err(unexpected("LtacProfResults", value));
    };
    let mut children = BTreeMap::new();
    for item in items {
        let CoqValue::Pair(name, tree) = item else {
            return Err(unexpected("LtacProfResults", item));
        };
        let (Some(name), CoqValue::Other(tree)) = (name.as_str(), tree.as_ref()) else {
            return Err(unexpected("LtacProfResults", item));
        };
        children.insert(name.to_string(), parse_ltacprof_tree(tree)?);
    }
    Ok(children)
}

fn parse_ltacprof_tree(e: &Element) -> Result<LtacProfTree, CoqError> {
    if e.name != "ltacprof_tree" {
        return Err(CoqError::Protocol(format!("Expected <ltacprof_tree>, got <{}>", e.name)));
    }
    let float = |key: &str| -> f64 {
        e.attr(key).and_then(|v| v.parse().ok()).unwrap_or_default()
    };
    let entry = LtacProfEntry {
        total: float("total"),
        local: float("local"),
        ncalls: e.attr("ncalls").and_then(|v| v.parse().ok()).unwrap_or_default(),
        max_total: float("max_total"),
    };
    let children = match e.elements().next() {
        Some(list) => {
            let value = CoqValue::from_element(list).map_err(CoqError::Protocol)?;
            parse_ltacprof_children(&value)?
        }
        None => BTreeMap::new(),
    };
    Ok(LtacProfTree { entry, children })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::XmlReader;

    fn decode(xml: &str) -> CoqValue {
        let mut reader = XmlReader::new();
        reader.push(xml);
        let element = reader.next_element().unwrap().unwrap();
        CoqValue::from_element(&element).unwrap()
    }

    #[test]
    fn serialize_init() {
        let req = CoqRequest::Init { script: None };
        assert_eq!(req.to_xml(), r#"<call val="Init"><option val="none"/></call>"#);
    }

    #[test]
    fn serialize_add() {
        let req = CoqRequest::Add {
            text: "Theorem foo: True.".into(),
            edit_id: 1,
            state_id: 1,
            verbose: true,
        };
        assert_eq!(
            req.to_xml(),
            concat!(
                r#"<call val="Add"><pair><pair><string>Theorem foo: True.</string><int>1</int></pair>"#,
                r#"<pair><state_id val="1"/><bool val="true"/></pair></pair></call>"#
            )
        );
    }

    #[test]
    fn serialize_edit_at_and_query() {
        assert_eq!(
            CoqRequest::EditAt { state_id: 7 }.to_xml(),
            r#"<call val="Edit_at"><state_id val="7"/></call>"#
        );
        assert_eq!(
            CoqRequest::Query {
                text: "Check nat.".into(),
                state_id: 0
            }
            .to_xml(),
            r#"<call val="Query"><pair><string>Check nat.</string><state_id val="0"/></pair></call>"#
        );
    }

    #[test]
    fn serialize_resize_window() {
        assert_eq!(
            CoqRequest::resize_window(80).to_xml(),
            concat!(
                r#"<call val="SetOptions"><list><pair><list><string>Printing</string><string>Width</string></list>"#,
                r#"<option_value val="intvalue"><option val="some"><int>80</int></option></option_value></pair></list></call>"#
            )
        );
    }

    #[test]
    fn serialize_unit_calls() {
        assert_eq!(CoqRequest::Goal.to_xml(), r#"<call val="Goal"><unit/></call>"#);
        assert_eq!(CoqRequest::Interrupt.to_xml(), r#"<call val="Interrupt"><unit/></call>"#);
        assert_eq!(CoqRequest::Quit.to_xml(), r#"<call val="Quit"><unit/></call>"#);
        assert_eq!(
            CoqRequest::LtacProfSet { enabled: false }.to_xml(),
            r#"<call val="LtacProfSet"><bool val="false"/></call>"#
        );
    }

    #[test]
    fn special_characters_survive_escaping() {
        let text = r#"Notation "x <& y" := (x && y) 'q'."#;
        let req = CoqRequest::Add {
            text: text.into(),
            edit_id: 2,
            state_id: 3,
            verbose: false,
        };
        let xml = req.to_xml();
        assert!(!xml.contains("<&"));

        let mut reader = XmlReader::new();
        reader.push(&xml);
        let call = reader.next_element().unwrap().unwrap();
        let arg = CoqValue::from_element(call.elements().next().unwrap()).unwrap();
        assert_eq!(arg, req.argument());
    }

    #[test]
    fn parse_add_with_unfocus() {
        let value = decode(concat!(
            r#"<pair><state_id val="5"/><pair><union val="in_r"><state_id val="3"/></union>"#,
            r#"<string>done</string></pair></pair>"#
        ));
        let result = parse_add(&value).unwrap();
        assert_eq!(result.state_id, 5);
        assert_eq!(result.unfocused_state_id, Some(3));
        assert_eq!(result.message, "done");
    }

    #[test]
    fn parse_edit_at_both_outcomes() {
        let rewind = decode(r#"<union val="in_l"><unit/></union>"#);
        assert!(parse_edit_at(&rewind).unwrap().new_focus.is_none());

        let focus = decode(concat!(
            r#"<union val="in_r"><pair><state_id val="4"/>"#,
            r#"<pair><state_id val="9"/><state_id val="12"/></pair></pair></union>"#
        ));
        let nf = parse_edit_at(&focus).unwrap().new_focus.unwrap();
        assert_eq!((nf.state_id, nf.qed_state_id, nf.old_tip), (4, 9, 12));
    }

    #[test]
    fn parse_goal_none_and_some() {
        let none = decode(r#"<option val="none"/>"#);
        assert_eq!(parse_goal(&none).unwrap(), GoalResult::default());

        let some = decode(concat!(
            r#"<option val="some"><goals>"#,
            r#"<list><goal><string>3</string><list><string>n : nat</string></list><string>n = n</string></goal></list>"#,
            r#"<list><pair><list/><list><goal><string>4</string><list/><string>True</string></goal></list></pair></list>"#,
            r#"<list/><list/>"#,
            r#"</goals></option>"#
        ));
        let result = parse_goal(&some).unwrap();
        let goals = result.goals.unwrap();
        assert_eq!(goals.len(), 1);
        assert_eq!(goals[0].id, 3);
        assert_eq!(goals[0].goal, "n = n");
        assert_eq!(goals[0].hypotheses[0].identifier, "n");
        let background = result.background_goals.unwrap();
        assert_eq!(background.len(), 1);
        assert_eq!(background[0].goal, "True");
        assert_eq!(result.shelved_goals, Some(vec![]));
    }

    #[test]
    fn parse_ltacprof_tree_recursively() {
        let value = decode(concat!(
            r#"<list><pair><string>auto</string>"#,
            r#"<ltacprof_tree total="10.5" local="2" ncalls="3" max_total="4.5"><list>"#,
            r#"<pair><string>intro</string><ltacprof_tree total="8.5" local="8.5" ncalls="6" max_total="1"/></pair>"#,
            r#"</list></ltacprof_tree></pair></list>"#
        ));
        let results = parse_ltacprof_results(&value).unwrap().results;
        let auto = &results["auto"];
        assert_eq!(auto.entry.ncalls, 3);
        assert!((auto.entry.total - 10.5).abs() < 1e-9);
        let intro = &auto.children["intro"];
        assert_eq!(intro.entry.ncalls, 6);
        assert!(intro.children.is_empty());
    }

    #[test]
    fn unexpected_shape_is_protocol_error() {
        let err = parse_init(&CoqValue::Unit).unwrap_err();
        assert!(matches!(err, CoqError::Protocol(_)));
    }
}
