//! Template rendering for builder documents.
//!
//! A builder template is a YAML document whose string scalars are templates
//! (see [`parse`] for the syntax). Rendering walks the document and replaces
//! every string:
//!
//! - a string that is exactly one `{{ ... }}` expression becomes the raw
//!   value, so lists, maps, booleans and numbers survive (null becomes the
//!   empty string)
//! - any other string is rendered to text
//! - mapping entries that render to the empty string are dropped, which lets
//!   optional fields such as `source_ami` disappear for root images
//!
//! There is no code execution: paths, three filters and `if` blocks are the
//! whole language.

mod builtin;
mod parse;
mod request;

use std::path::PathBuf;

use serde_json::{Map, Value};
use thiserror::Error;

pub use builtin::{ARCHIVE_TEMPLATE, BARE_TEMPLATE};
pub use parse::{Condition, Expr, Filter, Node, parse};
pub use request::{BuildRequest, RuntimeContext, context, load_template, render};

/// Errors from parsing or rendering a template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
  #[error("unclosed tag at position {0}")]
  Unclosed(usize),

  #[error("unclosed if block starting at position {0}")]
  UnclosedBlock(usize),

  #[error("unexpected tag '{0}' at position {1}")]
  UnexpectedTag(String, usize),

  #[error("unknown filter: {0}")]
  UnknownFilter(String),

  #[error("syntax error: {0}")]
  Syntax(String),

  #[error("missing variable: {0}")]
  MissingVariable(String),

  #[error("cannot join '{0}': not a list")]
  NotAList(String),

  #[error("failed to read template {path}: {message}")]
  TemplateRead { path: PathBuf, message: String },

  #[error("invalid template {path}: {message}")]
  TemplateParse { path: PathBuf, message: String },

  #[error("template has no builders")]
  MissingBuilders,

  #[error("cannot merge builder_opts into builder: conflict at '{0}'")]
  BuilderOpts(String),

  #[error("{field}: {source}")]
  Field {
    field: String,
    #[source]
    source: Box<RenderError>,
  },
}

impl RenderError {
  /// Prefix the error with the document location it occurred at.
  fn at(self, key: &str) -> Self {
    match self {
      RenderError::Field { field, source } => {
        let sep = if field.starts_with('[') { "" } else { "." };
        RenderError::Field {
          field: format!("{key}{sep}{field}"),
          source,
        }
      }
      other => RenderError::Field {
        field: key.to_string(),
        source: Box::new(other),
      },
    }
  }

  /// The error without location context.
  pub fn root_cause(&self) -> &RenderError {
    match self {
      RenderError::Field { source, .. } => source.root_cause(),
      other => other,
    }
  }
}

/// Variable lookup for rendering.
pub trait Scope {
  /// Look up a dotted path. Traversing through a present `null` yields
  /// `null` rather than a missing value.
  fn lookup(&self, path: &str) -> Option<&Value>;
}

static NULL: Value = Value::Null;

impl Scope for Value {
  fn lookup(&self, path: &str) -> Option<&Value> {
    let mut current = self;
    for segment in path.split('.') {
      current = match current {
        Value::Null => return Some(&NULL),
        Value::Object(map) => map.get(segment)?,
        Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
        _ => return None,
      };
    }
    Some(current)
  }
}

/// Evaluate an expression to a value.
pub fn eval(expr: &Expr, scope: &impl Scope) -> Result<Value, RenderError> {
  let mut value = scope.lookup(&expr.path).cloned();

  for filter in &expr.filters {
    value = match (filter, value) {
      (Filter::Default(text), None | Some(Value::Null)) => Some(Value::String(text.clone())),
      (Filter::Default(_), value) => value,
      (Filter::Join(sep), Some(Value::Array(items))) => {
        let parts: Vec<String> = items.iter().map(to_text).collect();
        Some(Value::String(parts.join(sep)))
      }
      (Filter::Join(_), Some(Value::Null)) => Some(Value::String(String::new())),
      (Filter::Join(_), None) => None,
      (Filter::Join(_), Some(_)) => return Err(RenderError::NotAList(expr.path.clone())),
      (Filter::Quote, Some(value)) => Some(Value::String(shell_quote(&to_text(&value)))),
      (Filter::Quote, None) => None,
    };
  }

  value.ok_or_else(|| RenderError::MissingVariable(expr.path.clone()))
}

/// POSIX single-quoted form of `text`; embedded quotes become `'\''`.
fn shell_quote(text: &str) -> String {
  format!("'{}'", text.replace('\'', r"'\''"))
}

/// Truthiness of a condition. Missing variables are false.
pub fn is_truthy(value: Option<&Value>) -> bool {
  match value {
    None | Some(Value::Null) => false,
    Some(Value::Bool(b)) => *b,
    Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
    Some(Value::String(s)) => !s.is_empty(),
    Some(Value::Array(items)) => !items.is_empty(),
    Some(Value::Object(map)) => !map.is_empty(),
  }
}

/// Text form of a value when interpolated into a larger string.
pub fn to_text(value: &Value) -> String {
  match value {
    Value::Null => String::new(),
    Value::String(s) => s.clone(),
    _ => value.to_string(),
  }
}

fn render_nodes(nodes: &[Node], scope: &impl Scope, out: &mut String) -> Result<(), RenderError> {
  for node in nodes {
    match node {
      Node::Text(text) => out.push_str(text),
      Node::Expr(expr) => out.push_str(&to_text(&eval(expr, scope)?)),
      Node::If { cond, then, otherwise } => {
        let truthy = is_truthy(scope.lookup(&cond.path)) != cond.negated;
        render_nodes(if truthy { then } else { otherwise }, scope, out)?;
      }
    }
  }
  Ok(())
}

/// Render one template string.
pub fn render_str(input: &str, scope: &impl Scope) -> Result<Value, RenderError> {
  let nodes = parse(input)?;
  if let [Node::Expr(expr)] = nodes.as_slice() {
    return match eval(expr, scope)? {
      Value::Null => Ok(Value::String(String::new())),
      value => Ok(value),
    };
  }
  let mut out = String::with_capacity(input.len());
  render_nodes(&nodes, scope, &mut out)?;
  Ok(Value::String(out))
}

/// Render every string in a document.
pub fn render_value(value: &Value, scope: &impl Scope) -> Result<Value, RenderError> {
  match value {
    Value::String(s) => render_str(s, scope),
    Value::Array(items) => items
      .iter()
      .enumerate()
      .map(|(i, item)| render_value(item, scope).map_err(|e| e.at(&format!("[{i}]"))))
      .collect::<Result<Vec<_>, _>>()
      .map(Value::Array),
    Value::Object(map) => {
      let mut rendered = Map::new();
      for (key, item) in map {
        let item = render_value(item, scope).map_err(|e| e.at(key))?;
        if item.as_str() == Some("") {
          continue;
        }
        rendered.insert(key.clone(), item);
      }
      Ok(Value::Object(rendered))
    }
    other => Ok(other.clone()),
  }
}
