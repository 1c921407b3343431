//! Message rendering.
//!
//! Emergency content comes from named templates with a deliberately small
//! syntax:
//!
//! * `{{name}}` substitutes a variable (dotted paths reach into objects),
//! * `{{#if name}}...{{/if}}` keeps its body when the variable is truthy,
//! * `{{#each list}}...{{/each}}` repeats its body per element, with the
//!   element available as `{{this}}` (or its fields by name).
//!
//! Unknown variables render as the empty string.

use crate::emergency::types::{Channel, EmergencyType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("unterminated tag starting at byte {0}")]
    UnterminatedTag(usize),
    #[error("block '{0}' is never closed")]
    UnclosedBlock(String),
    #[error("unexpected closing tag '{0}'")]
    UnexpectedClose(String),
    #[error("block tag '{0}' is missing its variable")]
    MissingBlockVariable(String),
}

/// Rendered, channel-ready content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RenderedMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
}

pub trait MessageRenderer: Send + Sync {
    fn render(
        &self,
        emergency_type: EmergencyType,
        channel: Channel,
        variables: &Value,
    ) -> Result<RenderedMessage, RenderError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Text(String),
    Var(String),
    If(String, Vec<Node>),
    Each(String, Vec<Node>),
}

#[derive(Debug)]
enum Token<'a> {
    Text(&'a str),
    Tag(&'a str),
}

fn tokenize(source: &str) -> Result<Vec<Token<'_>>, RenderError> {
    let mut tokens = Vec::new();
    let mut rest = source;
    let mut offset = 0;
    while let Some(open) = rest.find("{{") {
        if open > 0 {
            tokens.push(Token::Text(&rest[..open]));
        }
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or(RenderError::UnterminatedTag(offset + open))?;
        tokens.push(Token::Tag(after[..close].trim()));
        let consumed = open + 2 + close + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }
    if !rest.is_empty() {
        tokens.push(Token::Text(rest));
    }
    Ok(tokens)
}

/// Parse until the closing tag of `block` (or end of input when `block` is None).
fn parse_nodes<'a, I>(tokens: &mut I, block: Option<&str>) -> Result<Vec<Node>, RenderError>
where
    I: Iterator<Item = Token<'a>>,
{
    let mut nodes = Vec::new();
    while let Some(token) = tokens.next() {
        match token {
            Token::Text(text) => nodes.push(Node::Text(text.to_string())),
            Token::Tag(tag) => {
                if let Some(closing) = tag.strip_prefix('/') {
                    let closing = closing.trim();
                    return match block {
                        Some(open) if open == closing => Ok(nodes),
                        _ => Err(RenderError::UnexpectedClose(closing.to_string())),
                    };
                }
                if let Some(opening) = tag.strip_prefix('#') {
                    let mut parts = opening.split_whitespace();
                    let kind = parts.next().unwrap_or_default();
                    let name = parts
                        .next()
                        .ok_or_else(|| RenderError::MissingBlockVariable(kind.to_string()))?
                        .to_string();
                    let body = parse_nodes(tokens, Some(kind))?;
                    match kind {
                        "if" => nodes.push(Node::If(name, body)),
                        "each" => nodes.push(Node::Each(name, body)),
                        other => return Err(RenderError::UnexpectedClose(other.to_string())),
                    }
                    continue;
                }
                nodes.push(Node::Var(tag.to_string()));
            }
        }
    }
    match block {
        Some(open) => Err(RenderError::UnclosedBlock(open.to_string())),
        None => Ok(nodes),
    }
}

fn parse(source: &str) -> Result<Vec<Node>, RenderError> {
    let mut tokens = tokenize(source)?.into_iter();
    parse_nodes(&mut tokens, None)
}

fn lookup<'a>(name: &str, scope: &'a Value, root: &'a Value) -> Option<&'a Value> {
    if name == "this" {
        return Some(scope);
    }
    let walk = |start: &'a Value| {
        name.split('.')
            .try_fold(start, |value, segment| value.get(segment))
    };
    walk(scope).or_else(|| walk(root))
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

fn write_value(out: &mut String, value: Option<&Value>) {
    match value {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) => out.push_str(s),
        Some(other) => out.push_str(&other.to_string()),
    }
}

fn evaluate(nodes: &[Node], scope: &Value, root: &Value, out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Var(name) => write_value(out, lookup(name, scope, root)),
            Node::If(name, body) => {
                if truthy(lookup(name, scope, root)) {
                    evaluate(body, scope, root, out);
                }
            }
            Node::Each(name, body) => {
                if let Some(Value::Array(items)) = lookup(name, scope, root) {
                    for item in items {
                        evaluate(body, item, root, out);
                    }
                }
            }
        }
    }
}

/// Render a single template string against `variables`.
pub fn render_template(source: &str, variables: &Value) -> Result<String, RenderError> {
    let nodes = parse(source)?;
    let mut out = String::with_capacity(source.len());
    evaluate(&nodes, variables, variables, &mut out);
    Ok(out)
}

#[derive(Clone, Debug)]
struct Template {
    subject: &'static str,
    body: &'static str,
}

fn builtin_template(emergency_type: EmergencyType) -> Template {
    match emergency_type {
        EmergencyType::SafetyIncident => Template {
            subject: "URGENT: {{title}}",
            body: "SAFETY ALERT from {{school_name}}: {{title}}. {{description}}{{#if instructions}} What to do: {{instructions}}{{/if}} Reply OK to confirm you received this.",
        },
        EmergencyType::SchoolClosure => Template {
            subject: "School closure: {{title}}",
            body: "{{school_name}} closure notice: {{title}}. {{description}}{{#if instructions}} {{instructions}}{{/if}}{{#if affected_students}} Students: {{#each affected_students}}{{this}} {{/each}}{{/if}}Reply OK to confirm.",
        },
        EmergencyType::WeatherDisruption => Template {
            subject: "Weather update: {{title}}",
            body: "Weather update from {{school_name}}: {{title}}. {{description}}{{#if instructions}} {{instructions}}{{/if}}",
        },
        EmergencyType::InfrastructureFailure => Template {
            subject: "Service disruption: {{title}}",
            body: "{{school_name}} service disruption: {{title}}. {{description}}{{#if instructions}} {{instructions}}{{/if}} Reply OK to confirm.",
        },
    }
}

/// Renderer backed by the built-in templates of each emergency type.
/// SMS and WhatsApp carry the body only; email keeps the subject.
#[derive(Clone, Debug, Default)]
pub struct TemplateRenderer;

impl TemplateRenderer {
    pub fn new() -> Self {
        Self
    }
}

impl MessageRenderer for TemplateRenderer {
    fn render(
        &self,
        emergency_type: EmergencyType,
        channel: Channel,
        variables: &Value,
    ) -> Result<RenderedMessage, RenderError> {
        let template = builtin_template(emergency_type);
        let body = render_template(template.body, variables)?;
        let subject = match channel {
            Channel::Email => Some(render_template(template.subject, variables)?),
            Channel::Sms | Channel::WhatsApp => None,
        };
        Ok(RenderedMessage { subject, body })
    }
}
